use log::{info, warn};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::callback::CallbackLoop;
use crate::error::MxError;
use crate::registry::{RecordHandle, Registry};

/// A trait for long-running processes that can succeed, fail, or timeout
pub trait Job {
    /// The type returned on successful completion
    type Output;

    /// Run the job with a timeout
    ///
    /// Returns:
    /// - `Ok(output)` if the job completes successfully
    /// - `Err(MxError)` if the job fails or times out
    fn run(&mut self, timeout: Duration) -> Result<Self::Output, MxError>;
}

/// How a pulse train run ended
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TrainSummary {
    pub pulser: String,
    pub elapsed_s: f64,
    /// Stopped by the shutdown flag rather than running to completion
    pub interrupted: bool,
}

/// Start one pulser and service it until the train is over
///
/// With a callback loop the loop is polled between busy checks; without
/// one the busy checks themselves advance the train.
pub struct PulseTrainJob<'a> {
    registry: &'a mut Registry,
    handle: RecordHandle,
    callbacks: Option<&'a CallbackLoop>,
    shutdown: Option<Arc<AtomicBool>>,
    poll_interval: Duration,
}

impl<'a> PulseTrainJob<'a> {
    pub fn new(registry: &'a mut Registry, name: &str) -> Result<Self, MxError> {
        let handle = registry
            .find(name)
            .ok_or_else(|| MxError::NotFound(format!("No record named '{name}'")))?;
        Ok(Self {
            registry,
            handle,
            callbacks: None,
            shutdown: None,
            poll_interval: Duration::from_millis(10),
        })
    }

    pub fn with_callbacks(mut self, callbacks: &'a CallbackLoop) -> Self {
        self.callbacks = Some(callbacks);
        self
    }

    pub fn with_shutdown(mut self, shutdown: Arc<AtomicBool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn shutdown_requested(&self) -> bool {
        self.shutdown
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::SeqCst))
    }

    fn stop_pulser(&mut self) -> Result<(), MxError> {
        match self.registry.get_mut(self.handle) {
            Some(pulser) => pulser.stop(),
            None => Ok(()),
        }
    }
}

impl Job for PulseTrainJob<'_> {
    type Output = TrainSummary;

    fn run(&mut self, timeout: Duration) -> Result<TrainSummary, MxError> {
        let handle = self.handle;
        let name = {
            let pulser = self.registry.get_mut(handle).ok_or_else(|| {
                MxError::CorruptDataStructure(format!("Stale record handle {handle:?}"))
            })?;
            let name = pulser.core().name.clone();
            if pulser.is_busy()? {
                // started by start_on_open
                info!("'{}' already running, following its train", name);
            } else {
                pulser.start()?;
            }
            name
        };
        let started = Instant::now();

        loop {
            if let Some(callbacks) = self.callbacks {
                callbacks.poll(self.registry)?;
            }

            let busy = match self.registry.get_mut(handle) {
                Some(pulser) => pulser.is_busy()?,
                None => false,
            };
            if !busy {
                info!("Pulse train on '{}' complete", name);
                return Ok(TrainSummary {
                    pulser: name,
                    elapsed_s: started.elapsed().as_secs_f64(),
                    interrupted: false,
                });
            }

            if self.shutdown_requested() {
                info!("Stopping '{}' on request", name);
                self.stop_pulser()?;
                return Ok(TrainSummary {
                    pulser: name,
                    elapsed_s: started.elapsed().as_secs_f64(),
                    interrupted: true,
                });
            }

            if started.elapsed() >= timeout {
                warn!("Pulse train on '{}' still running after {:?}", name, timeout);
                self.stop_pulser()?;
                return Err(MxError::Timeout);
            }

            thread::sleep(self.poll_interval);
        }
    }
}
