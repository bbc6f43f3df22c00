//! One-shot virtual timers and the callback pipe
//!
//! Timers live in a deadline queue read against a `Clock`. When a timer
//! expires its message is pushed into the callback pipe (a crossbeam
//! channel). `CallbackLoop::poll` drains the pipe on the calling thread and
//! hands each message to the record that owns the timer, so record state is
//! only ever touched from the loop thread.
//!
//! A timer fires at most once per `start`; handlers that want periodic
//! service restart their timer on every callback. This keeps the pipe from
//! filling up when the loop falls behind.

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, error, warn};
use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::clock::{Clock, Timestamp};
use crate::error::MxError;
use crate::registry::{RecordHandle, Registry};

/// Default service interval for software pulsers
pub const DEFAULT_CALLBACK_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallbackMessage {
    pub handle: RecordHandle,
    pub timer: TimerId,
}

#[derive(Debug)]
struct ArmedTimer {
    handle: RecordHandle,
    generation: u64,
    deadline: Option<Timestamp>,
}

#[derive(Debug, Default)]
struct TimerQueue {
    next_id: u64,
    timers: HashMap<TimerId, ArmedTimer>,
    deadlines: BinaryHeap<Reverse<(Timestamp, TimerId, u64)>>,
}

impl TimerQueue {
    /// Pop every live timer whose deadline has passed
    fn expire(&mut self, now: Timestamp) -> Vec<CallbackMessage> {
        let mut expired = Vec::new();
        while let Some(Reverse((deadline, id, generation))) = self.deadlines.peek().copied() {
            if deadline > now {
                break;
            }
            self.deadlines.pop();
            if let Some(timer) = self.timers.get_mut(&id) {
                if timer.generation == generation && timer.deadline.is_some() {
                    timer.deadline = None;
                    expired.push(CallbackMessage {
                        handle: timer.handle,
                        timer: id,
                    });
                }
            }
        }
        expired
    }

    fn next_deadline(&self) -> Option<Timestamp> {
        self.timers.values().filter_map(|t| t.deadline).min()
    }
}

struct Shared {
    clock: Arc<dyn Clock>,
    queue: Mutex<TimerQueue>,
    sender: Sender<CallbackMessage>,
}

impl Shared {
    fn expire_into_pipe(&self, now: Timestamp) -> Result<usize, MxError> {
        let expired = self.queue.lock().expire(now);
        let count = expired.len();
        for message in expired {
            self.sender
                .send(message)
                .map_err(|e| MxError::Callback(format!("Callback pipe closed: {e}")))?;
        }
        Ok(count)
    }
}

/// Handle to a one-shot virtual timer owned by a record
pub struct OneShotTimer {
    id: TimerId,
    shared: Arc<Shared>,
}

impl OneShotTimer {
    pub fn id(&self) -> TimerId {
        self.id
    }

    /// Arm the timer to fire once, `interval` from now
    ///
    /// Restarting an armed timer replaces its deadline.
    pub fn start(&self, interval: Duration) -> Result<(), MxError> {
        let deadline = self.shared.clock.now().saturating_add(interval);
        let mut queue = self.shared.queue.lock();
        let timer = queue.timers.get_mut(&self.id).ok_or_else(|| {
            MxError::CorruptDataStructure(format!("Virtual timer {:?} is not registered", self.id))
        })?;
        timer.generation += 1;
        timer.deadline = Some(deadline);
        let generation = timer.generation;
        queue.deadlines.push(Reverse((deadline, self.id, generation)));
        Ok(())
    }

    pub fn stop(&self) {
        if let Some(timer) = self.shared.queue.lock().timers.get_mut(&self.id) {
            timer.generation += 1;
            timer.deadline = None;
        }
    }

    pub fn is_armed(&self) -> bool {
        self.shared
            .queue
            .lock()
            .timers
            .get(&self.id)
            .is_some_and(|t| t.deadline.is_some())
    }
}

impl Drop for OneShotTimer {
    fn drop(&mut self) {
        self.shared.queue.lock().timers.remove(&self.id);
    }
}

/// Single-threaded event loop servicing record callbacks
pub struct CallbackLoop {
    shared: Arc<Shared>,
    receiver: Receiver<CallbackMessage>,
}

impl CallbackLoop {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let (sender, receiver) = unbounded();
        Self {
            shared: Arc::new(Shared {
                clock,
                queue: Mutex::new(TimerQueue::default()),
                sender,
            }),
            receiver,
        }
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.shared.clock.clone()
    }

    /// Create a disarmed one-shot timer whose callbacks go to `handle`
    pub fn create_timer(&self, handle: RecordHandle) -> OneShotTimer {
        let mut queue = self.shared.queue.lock();
        let id = TimerId(queue.next_id);
        queue.next_id += 1;
        queue.timers.insert(
            id,
            ArmedTimer {
                handle,
                generation: 0,
                deadline: None,
            },
        );
        debug!("Created virtual timer {:?} for record {:?}", id, handle);
        OneShotTimer {
            id,
            shared: self.shared.clone(),
        }
    }

    pub fn next_deadline(&self) -> Option<Timestamp> {
        self.shared.queue.lock().next_deadline()
    }

    pub fn pending_messages(&self) -> usize {
        self.receiver.len()
    }

    /// Expire due timers, then dispatch everything in the pipe
    ///
    /// Handler errors are logged and do not stop the remaining dispatches.
    ///
    /// # Returns
    /// Number of callbacks delivered to records
    pub fn poll(&self, registry: &mut Registry) -> Result<usize, MxError> {
        self.shared.expire_into_pipe(self.shared.clock.now())?;

        let mut delivered = 0;
        while let Ok(message) = self.receiver.try_recv() {
            let Some(pulser) = registry.get_mut(message.handle) else {
                warn!("Dropping callback for unknown record {:?}", message.handle);
                continue;
            };
            delivered += 1;
            if let Err(e) = pulser.on_callback() {
                error!("Callback for '{}' failed: {}", pulser.core().name, e);
            }
        }
        Ok(delivered)
    }

    /// Service callbacks until `shutdown` is raised
    ///
    /// # Arguments
    /// * `registry` - Records the timers belong to
    /// * `shutdown` - Flag checked between iterations
    /// * `max_sleep` - Upper bound on idle sleeping between polls
    pub fn run(
        &self,
        registry: &mut Registry,
        shutdown: &AtomicBool,
        max_sleep: Duration,
    ) -> Result<(), MxError> {
        while !shutdown.load(Ordering::SeqCst) {
            self.poll(registry)?;
            let now = self.shared.clock.now();
            let sleep = self
                .next_deadline()
                .map(|deadline| deadline.saturating_sub(now))
                .unwrap_or(max_sleep)
                .min(max_sleep);
            if !sleep.is_zero() {
                thread::sleep(sleep);
            }
        }
        Ok(())
    }

    /// Expire timers in real time from a background thread
    ///
    /// The thread only moves messages into the pipe; dispatch still
    /// happens in `poll` on the loop thread.
    pub fn spawn_master_timer(&self, tick: Duration) -> MasterTimer {
        let shared = self.shared.clone();
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_clone = shutdown.clone();

        let thread = thread::spawn(move || {
            log::info!("Master timer started ({} ms tick)", tick.as_millis());
            while !shutdown_clone.load(Ordering::Relaxed) {
                if let Err(e) = shared.expire_into_pipe(shared.clock.now()) {
                    error!("Master timer stopping: {}", e);
                    break;
                }
                thread::sleep(tick);
            }
        });

        MasterTimer {
            shutdown,
            thread: Some(thread),
        }
    }
}

/// Background timer thread, stopped and joined on drop
pub struct MasterTimer {
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl MasterTimer {
    pub fn is_running(&self) -> bool {
        !self.shutdown.load(Ordering::Relaxed)
    }
}

impl Drop for MasterTimer {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
