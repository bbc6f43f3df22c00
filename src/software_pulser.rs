//! Pulse generators emulated in software
//!
//! A digital output (or a relay) is toggled according to a `PulseTrain`.
//! The train is advanced either by a 100 ms one-shot timer serviced by the
//! callback loop, or, when no loop is available, every time somebody asks
//! whether the pulser is busy.

use crossbeam_channel::Sender;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::callback::{OneShotTimer, DEFAULT_CALLBACK_INTERVAL};
use crate::clock::{Clock, Timestamp};
use crate::error::MxError;
use crate::hal::{DigitalOutput, Relay};
use crate::output::{DigitalOutputLine, OutputLine, RelayLine};
use crate::pulse_generator::{OpenContext, PulseGenerator, PulseGeneratorCore};
use crate::pulse_train::{PulseTrain, Transition};
use crate::types::{FunctionMode, Level, Parameter, PulseParameters, TriggerMode};

/// A level change reported to an optional observer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionEvent {
    pub pulser: String,
    /// Clock reading when the level was written
    pub written_at: Timestamp,
    #[serde(flatten)]
    pub transition: Transition,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateMode {
    Callback,
    Poll,
}

pub struct SoftwarePulser<L: OutputLine> {
    core: PulseGeneratorCore,
    driver_name: &'static str,
    line: L,
    train: PulseTrain,
    clock: Arc<dyn Clock>,
    callback_interval: Duration,
    timer: Option<OneShotTimer>,
    sink: Option<Sender<TransitionEvent>>,
}

impl<D: DigitalOutput> SoftwarePulser<DigitalOutputLine<D>> {
    /// Pulser toggling bit 0 of a digital output
    pub fn digital_output(
        name: impl Into<String>,
        output: D,
        params: PulseParameters,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self::new(name, "doutput_pulser", DigitalOutputLine::new(output), params, clock)
    }
}

impl<R: Relay> SoftwarePulser<RelayLine<R>> {
    /// Pulser closing a relay for the high part of each cycle
    pub fn relay(
        name: impl Into<String>,
        relay: R,
        params: PulseParameters,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self::new(name, "relay_pulser", RelayLine::new(relay), params, clock)
    }
}

impl<L: OutputLine> SoftwarePulser<L> {
    pub fn new(
        name: impl Into<String>,
        driver_name: &'static str,
        line: L,
        params: PulseParameters,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let now = clock.now();
        Self {
            core: PulseGeneratorCore::new(name, params),
            driver_name,
            line,
            train: PulseTrain::new(now, false),
            clock,
            callback_interval: DEFAULT_CALLBACK_INTERVAL,
            timer: None,
            sink: None,
        }
    }

    /// Schedule each transition from `now` instead of from when the
    /// previous one was due
    pub fn with_time_skew(mut self, allow: bool) -> Self {
        self.train = PulseTrain::new(self.clock.now(), allow);
        self
    }

    pub fn with_callback_interval(mut self, interval: Duration) -> Self {
        self.callback_interval = interval;
        self
    }

    pub fn with_start_on_open(mut self, start: bool) -> Self {
        self.core.start_on_open = start;
        self
    }

    pub fn with_transition_sink(mut self, sink: Sender<TransitionEvent>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn train(&self) -> &PulseTrain {
        &self.train
    }

    pub fn update_mode(&self) -> UpdateMode {
        if self.timer.is_some() {
            UpdateMode::Callback
        } else {
            UpdateMode::Poll
        }
    }

    fn effective_width(&self) -> f64 {
        let params = &self.core.params;
        match params.function_mode {
            FunctionMode::Pulse => params.pulse_width,
            FunctionMode::SquareWave => 0.5 * params.pulse_period,
        }
    }

    /// Perform the transition that is due, if any
    pub fn update(&mut self) -> Result<(), MxError> {
        let now = self.clock.now();
        let width = self.effective_width();
        let period = self.core.params.pulse_period;

        if let Some(transition) = self.train.plan(now, width, period) {
            self.line.set_level(transition.level)?;
            self.train.apply(&transition);

            debug!(
                "Pulser '{}' -> {:?} ({} pulses left, next {:?})",
                self.core.name, transition.level, transition.pulses_left, transition.next_transition
            );
            if !transition.busy_after {
                info!("Pulser '{}' finished its pulse train", self.core.name);
            }
            if let Some(sink) = &self.sink {
                let event = TransitionEvent {
                    pulser: self.core.name.clone(),
                    written_at: now,
                    transition,
                };
                if sink.send(event).is_err() {
                    warn!("Transition observer for '{}' went away", self.core.name);
                    self.sink = None;
                }
            }
        }

        self.core.busy = self.train.is_busy();
        Ok(())
    }
}

impl<L: OutputLine> PulseGenerator for SoftwarePulser<L> {
    fn core(&self) -> &PulseGeneratorCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut PulseGeneratorCore {
        &mut self.core
    }

    fn driver_name(&self) -> &'static str {
        self.driver_name
    }

    fn open(&mut self, ctx: OpenContext<'_>) -> Result<(), MxError> {
        self.line.set_level(Level::Low)?;
        self.train.reset(self.clock.now());
        self.core.busy = false;

        if let Some(callbacks) = ctx.callbacks {
            let timer = callbacks.create_timer(ctx.handle);
            timer.start(self.callback_interval)?;
            self.timer = Some(timer);
            debug!(
                "Pulser '{}' serviced every {} ms by callback",
                self.core.name,
                self.callback_interval.as_millis()
            );
        } else {
            self.timer = None;
        }
        Ok(())
    }

    fn check_busy(&mut self) -> Result<(), MxError> {
        if self.timer.is_none() && self.train.is_busy() {
            self.update()?;
        }
        self.core.busy = self.train.is_busy();
        Ok(())
    }

    fn start(&mut self) -> Result<(), MxError> {
        let params = &mut self.core.params;
        if params.pulse_width < 0.0 {
            return Err(MxError::IllegalArgument(format!(
                "Pulse width {} for pulser '{}' is negative",
                params.pulse_width, self.core.name
            )));
        }
        if params.pulse_period < params.pulse_width {
            debug!(
                "Pulser '{}': pulse period {} raised to pulse width {}",
                self.core.name, params.pulse_period, params.pulse_width
            );
            params.pulse_period = params.pulse_width;
        }

        info!(
            "Pulser '{}' starting: width = {} s, period = {} s, pulses = {:?}",
            self.core.name,
            self.core.params.pulse_width,
            self.core.params.pulse_period,
            self.core.params.num_pulses
        );

        self.line.set_level(Level::Low)?;
        self.train.arm(self.clock.now(), self.core.params.num_pulses);
        self.core.busy = true;

        self.update()
    }

    fn stop(&mut self) -> Result<(), MxError> {
        self.line.set_level(Level::Low)?;
        self.train.reset(self.clock.now());
        self.core.busy = false;
        debug!("Pulser '{}' stopped", self.core.name);
        Ok(())
    }

    fn get_parameter(&mut self, parameter: Parameter) -> Result<(), MxError> {
        match parameter {
            Parameter::FunctionMode => {
                if self.core.params.function_mode == FunctionMode::SquareWave {
                    self.core.params.pulse_width = 0.5 * self.core.params.pulse_period;
                }
                Ok(())
            }
            Parameter::TriggerMode => {
                self.core.params.trigger_mode = TriggerMode::Internal;
                Ok(())
            }
            Parameter::LastPulseNumber => {
                self.check_busy()?;
                crate::pulse_generator::default_get_parameter(&mut self.core, parameter)
            }
            _ => crate::pulse_generator::default_get_parameter(&mut self.core, parameter),
        }
    }

    fn set_parameter(&mut self, parameter: Parameter) -> Result<(), MxError> {
        match parameter {
            Parameter::PulseWidth if self.core.params.pulse_width < 0.0 => {
                Err(MxError::IllegalArgument(format!(
                    "Pulse width {} for pulser '{}' is negative",
                    self.core.params.pulse_width, self.core.name
                )))
            }
            Parameter::TriggerMode => {
                self.core.params.trigger_mode = TriggerMode::Internal;
                Ok(())
            }
            _ => crate::pulse_generator::default_set_parameter(&self.core, parameter),
        }
    }

    fn on_callback(&mut self) -> Result<(), MxError> {
        let timer = self.timer.as_ref().ok_or_else(|| {
            MxError::CorruptDataStructure(format!(
                "Pulser '{}' received a callback but owns no timer",
                self.core.name
            ))
        })?;
        timer.start(self.callback_interval)?;
        self.update()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::hal::{RelayStatus, SoftDigitalOutput, SoftRelay};
    use crate::registry::RecordHandle;
    use crate::types::PulseCount;

    fn params(width: f64, period: f64, count: PulseCount) -> PulseParameters {
        PulseParameters {
            pulse_width: width,
            pulse_period: period,
            num_pulses: count,
            ..Default::default()
        }
    }

    fn poll_mode(
        width: f64,
        period: f64,
        count: PulseCount,
    ) -> (
        ManualClock,
        SoftDigitalOutput,
        SoftwarePulser<DigitalOutputLine<SoftDigitalOutput>>,
    ) {
        let clock = ManualClock::new();
        let shared: Arc<dyn Clock> = Arc::new(clock.clone());
        let dout = SoftDigitalOutput::with_clock("dout", shared.clone());
        let train = params(width, period, count);
        let mut pulser = SoftwarePulser::digital_output("pulser", dout.clone(), train, shared);
        pulser
            .open(OpenContext {
                handle: RecordHandle::new(0),
                callbacks: None,
            })
            .unwrap();
        dout.clear_history();
        (clock, dout, pulser)
    }

    #[test]
    fn test_open_drives_low_in_poll_mode() {
        let (_clock, dout, pulser) = poll_mode(0.1, 0.5, PulseCount::Finite(1));
        assert_eq!(dout.value(), 0);
        assert_eq!(pulser.update_mode(), UpdateMode::Poll);
        assert!(!pulser.core().busy);
    }

    #[test]
    fn test_start_emits_first_edge_immediately() {
        let (_clock, dout, mut pulser) = poll_mode(0.1, 0.5, PulseCount::Finite(3));
        pulser.start().unwrap();
        assert_eq!(dout.history(), vec![(Duration::ZERO, 0), (Duration::ZERO, 1)]);
        assert!(pulser.is_busy().unwrap());
    }

    #[test]
    fn test_period_raised_to_width() {
        let (_clock, _dout, mut pulser) = poll_mode(0.3, 0.1, PulseCount::Finite(1));
        pulser.start().unwrap();
        assert_eq!(pulser.pulse_period().unwrap(), 0.3);
    }

    #[test]
    fn test_negative_width_rejected() {
        let (_clock, _dout, mut pulser) = poll_mode(0.1, 0.5, PulseCount::Finite(1));
        assert!(pulser.set_pulse_width(-0.1).is_err());
        assert!(pulser.start().is_err());
    }

    #[test]
    fn test_write_failure_aborts_start() {
        let (_clock, dout, mut pulser) = poll_mode(0.1, 0.5, PulseCount::Finite(1));
        dout.inject_fault("bus error");
        let err = pulser.start().unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Io);
        assert!(!pulser.train().is_busy());
    }

    #[test]
    fn test_stop_is_idempotent() {
        let (clock, _dout, mut pulser) = poll_mode(0.1, 0.5, PulseCount::Forever);
        pulser.start().unwrap();
        clock.advance(Duration::from_millis(120));
        pulser.stop().unwrap();
        let once = pulser.train().clone();
        pulser.stop().unwrap();
        assert_eq!(pulser.train(), &once);
        assert!(!pulser.is_busy().unwrap());
        assert!(!pulser.train().count_forever());
    }

    #[test]
    fn test_square_wave_width_follows_period() {
        let (_clock, _dout, mut pulser) = poll_mode(0.1, 0.8, PulseCount::Finite(1));
        pulser.set_function_mode(FunctionMode::SquareWave).unwrap();
        assert_eq!(pulser.function_mode().unwrap(), FunctionMode::SquareWave);
        assert_eq!(pulser.pulse_width().unwrap(), 0.4);
    }

    #[test]
    fn test_trigger_mode_forced_internal() {
        let (_clock, _dout, mut pulser) = poll_mode(0.1, 0.8, PulseCount::Finite(1));
        pulser.set_trigger_mode(TriggerMode::External).unwrap();
        assert_eq!(pulser.trigger_mode().unwrap(), TriggerMode::Internal);
    }

    #[test]
    fn test_transition_sink_receives_events() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let (clock, _dout, pulser) = poll_mode(0.1, 0.5, PulseCount::Finite(1));
        let mut pulser = pulser.with_transition_sink(tx);
        pulser.start().unwrap();
        clock.advance(Duration::from_millis(100));
        pulser.is_busy().unwrap();
        let levels: Vec<Level> = rx.try_iter().map(|e| e.transition.level).collect();
        assert_eq!(levels, vec![Level::High, Level::Low]);
    }

    #[test]
    fn test_relay_pulser_closes_for_high() {
        let clock = ManualClock::new();
        let shared: Arc<dyn Clock> = Arc::new(clock.clone());
        let relay = SoftRelay::with_clock("relay", shared.clone());
        let mut pulser = SoftwarePulser::relay(
            "relay_pulser",
            relay.clone(),
            params(0.2, 1.0, PulseCount::Finite(1)),
            shared,
        );
        pulser
            .open(OpenContext {
                handle: RecordHandle::new(0),
                callbacks: None,
            })
            .unwrap();
        assert_eq!(relay.current_status(), RelayStatus::Open);

        pulser.arm().unwrap();
        assert_eq!(relay.current_status(), RelayStatus::Closed);
        pulser.trigger().unwrap();

        clock.advance(Duration::from_millis(200));
        assert!(!pulser.is_busy().unwrap());
        assert_eq!(relay.current_status(), RelayStatus::Open);
        assert_eq!(pulser.driver_name(), "relay_pulser");
    }

    #[test]
    fn test_callback_without_timer_is_corrupt() {
        let (_clock, _dout, mut pulser) = poll_mode(0.1, 0.5, PulseCount::Finite(1));
        assert!(pulser.on_callback().unwrap_err().is_fatal());
    }
}
