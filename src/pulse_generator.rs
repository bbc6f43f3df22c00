//! Generic pulse generator class
//!
//! `PulseGenerator` is the per-type operation table. A driver embeds a
//! `PulseGeneratorCore` (the class fields every pulser shares) and
//! overrides the hooks it supports. The provided methods are the public
//! class API: each setter stores the new value in the core and then gives
//! the driver a chance to program the hardware; each getter asks the
//! driver to refresh the core first.

use log::{debug, info};
use serde::Serialize;

use crate::callback::CallbackLoop;
use crate::error::MxError;
use crate::registry::RecordHandle;
use crate::types::{FunctionMode, Parameter, PulseCount, PulseParameters, TriggerMode};

/// Class fields shared by all pulse generators
#[derive(Debug, Clone, Serialize)]
pub struct PulseGeneratorCore {
    pub name: String,
    pub params: PulseParameters,
    pub busy: bool,
    pub last_pulse_number: i64,
    /// Start the train as soon as the record is opened
    pub start_on_open: bool,
}

impl PulseGeneratorCore {
    pub fn new(name: impl Into<String>, params: PulseParameters) -> Self {
        Self {
            name: name.into(),
            params,
            busy: false,
            last_pulse_number: -1,
            start_on_open: false,
        }
    }
}

/// What a record is handed when it is opened
pub struct OpenContext<'a> {
    pub handle: RecordHandle,
    /// Present when an event loop will service timer callbacks
    pub callbacks: Option<&'a CallbackLoop>,
}

/// Echo handler for parameters a driver does not treat specially
///
/// `LastPulseNumber` reports `0` while busy and `-1` when idle; the busy
/// flag must be refreshed by the caller beforehand.
pub fn default_get_parameter(
    core: &mut PulseGeneratorCore,
    parameter: Parameter,
) -> Result<(), MxError> {
    match parameter {
        Parameter::NumPulses
        | Parameter::PulseWidth
        | Parameter::PulseDelay
        | Parameter::PulsePeriod
        | Parameter::FunctionMode
        | Parameter::TriggerMode => Ok(()),
        Parameter::LastPulseNumber => {
            core.last_pulse_number = if core.busy { 0 } else { -1 };
            Ok(())
        }
    }
}

/// Accept-and-keep handler for writable parameters
pub fn default_set_parameter(
    core: &PulseGeneratorCore,
    parameter: Parameter,
) -> Result<(), MxError> {
    match parameter {
        Parameter::NumPulses
        | Parameter::PulseWidth
        | Parameter::PulseDelay
        | Parameter::PulsePeriod
        | Parameter::FunctionMode
        | Parameter::TriggerMode => Ok(()),
        Parameter::LastPulseNumber => Err(MxError::Unsupported(format!(
            "Parameter '{}' cannot be set for pulse generator '{}'",
            parameter, core.name
        ))),
    }
}

pub trait PulseGenerator: Send {
    fn core(&self) -> &PulseGeneratorCore;

    fn core_mut(&mut self) -> &mut PulseGeneratorCore;

    /// Driver type name, e.g. `doutput_pulser`
    fn driver_name(&self) -> &'static str;

    // === Driver hooks ===

    /// Bring the hardware to a known idle state
    fn open(&mut self, _ctx: OpenContext<'_>) -> Result<(), MxError> {
        Ok(())
    }

    /// Refresh `core().busy` from the hardware or the emulation
    fn check_busy(&mut self) -> Result<(), MxError> {
        Ok(())
    }

    fn start(&mut self) -> Result<(), MxError> {
        Err(MxError::NotYetImplemented(format!(
            "Starting '{}' pulse generator '{}' is not yet implemented",
            self.driver_name(),
            self.core().name
        )))
    }

    fn stop(&mut self) -> Result<(), MxError> {
        Err(MxError::NotYetImplemented(format!(
            "Stopping '{}' pulse generator '{}' is not yet implemented",
            self.driver_name(),
            self.core().name
        )))
    }

    /// Prepare a train; for internally triggered drivers this starts it
    fn arm(&mut self) -> Result<(), MxError> {
        self.start()
    }

    fn trigger(&mut self) -> Result<(), MxError> {
        Ok(())
    }

    fn get_parameter(&mut self, parameter: Parameter) -> Result<(), MxError> {
        if parameter == Parameter::LastPulseNumber {
            self.check_busy()?;
        }
        default_get_parameter(self.core_mut(), parameter)
    }

    fn set_parameter(&mut self, parameter: Parameter) -> Result<(), MxError> {
        default_set_parameter(self.core(), parameter)
    }

    /// Invoked from the callback loop when the record's timer fires
    fn on_callback(&mut self) -> Result<(), MxError> {
        Ok(())
    }

    // === Class API ===

    fn is_busy(&mut self) -> Result<bool, MxError> {
        self.check_busy()?;
        Ok(self.core().busy)
    }

    fn pulse_width(&mut self) -> Result<f64, MxError> {
        self.get_parameter(Parameter::PulseWidth)?;
        Ok(self.core().params.pulse_width)
    }

    fn set_pulse_width(&mut self, pulse_width: f64) -> Result<(), MxError> {
        self.core_mut().params.pulse_width = pulse_width;
        self.set_parameter(Parameter::PulseWidth)
    }

    fn pulse_period(&mut self) -> Result<f64, MxError> {
        self.get_parameter(Parameter::PulsePeriod)?;
        Ok(self.core().params.pulse_period)
    }

    fn set_pulse_period(&mut self, pulse_period: f64) -> Result<(), MxError> {
        self.core_mut().params.pulse_period = pulse_period;
        self.set_parameter(Parameter::PulsePeriod)
    }

    fn pulse_delay(&mut self) -> Result<f64, MxError> {
        self.get_parameter(Parameter::PulseDelay)?;
        Ok(self.core().params.pulse_delay)
    }

    fn set_pulse_delay(&mut self, pulse_delay: f64) -> Result<(), MxError> {
        self.core_mut().params.pulse_delay = pulse_delay;
        self.set_parameter(Parameter::PulseDelay)
    }

    fn num_pulses(&mut self) -> Result<PulseCount, MxError> {
        self.get_parameter(Parameter::NumPulses)?;
        Ok(self.core().params.num_pulses)
    }

    fn set_num_pulses(&mut self, num_pulses: PulseCount) -> Result<(), MxError> {
        self.core_mut().params.num_pulses = num_pulses;
        self.set_parameter(Parameter::NumPulses)
    }

    fn function_mode(&mut self) -> Result<FunctionMode, MxError> {
        self.get_parameter(Parameter::FunctionMode)?;
        Ok(self.core().params.function_mode)
    }

    fn set_function_mode(&mut self, mode: FunctionMode) -> Result<(), MxError> {
        self.core_mut().params.function_mode = mode;
        self.set_parameter(Parameter::FunctionMode)
    }

    fn trigger_mode(&mut self) -> Result<TriggerMode, MxError> {
        self.get_parameter(Parameter::TriggerMode)?;
        Ok(self.core().params.trigger_mode)
    }

    fn set_trigger_mode(&mut self, mode: TriggerMode) -> Result<(), MxError> {
        self.core_mut().params.trigger_mode = mode;
        self.set_parameter(Parameter::TriggerMode)
    }

    fn last_pulse_number(&mut self) -> Result<i64, MxError> {
        self.get_parameter(Parameter::LastPulseNumber)?;
        Ok(self.core().last_pulse_number)
    }

    /// Push a complete parameter set through the setters
    fn setup(&mut self, params: &PulseParameters) -> Result<(), MxError> {
        self.set_pulse_period(params.pulse_period)?;
        self.set_pulse_width(params.pulse_width)?;
        self.set_num_pulses(params.num_pulses)?;
        self.set_pulse_delay(params.pulse_delay)?;
        self.set_function_mode(params.function_mode)?;
        self.set_trigger_mode(params.trigger_mode)
    }

    /// Apply the configured parameters and start, if requested at open
    fn initialize(&mut self) -> Result<(), MxError> {
        if !self.core().start_on_open {
            debug!("Pulse generator '{}' left idle after open", self.core().name);
            return Ok(());
        }
        let params = self.core().params.clone();
        self.setup(&params)?;
        info!("Starting pulse generator '{}' on open", self.core().name);
        self.start()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Driver that only supplies the class struct
    struct Bare {
        core: PulseGeneratorCore,
    }

    impl PulseGenerator for Bare {
        fn core(&self) -> &PulseGeneratorCore {
            &self.core
        }

        fn core_mut(&mut self) -> &mut PulseGeneratorCore {
            &mut self.core
        }

        fn driver_name(&self) -> &'static str {
            "bare"
        }
    }

    fn bare() -> Bare {
        Bare {
            core: PulseGeneratorCore::new("pg", PulseParameters::default()),
        }
    }

    #[test]
    fn test_start_without_driver_support() {
        let mut pg = bare();
        let err = pg.start().unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotYetImplemented);
        assert!(pg.stop().is_err());
    }

    #[test]
    fn test_default_handlers_echo_values() {
        let mut pg = bare();
        pg.set_pulse_period(2.5).unwrap();
        pg.set_num_pulses(PulseCount::Forever).unwrap();
        assert_eq!(pg.pulse_period().unwrap(), 2.5);
        assert_eq!(pg.num_pulses().unwrap(), PulseCount::Forever);
    }

    #[test]
    fn test_last_pulse_number_default() {
        let mut pg = bare();
        assert_eq!(pg.last_pulse_number().unwrap(), -1);
        pg.core_mut().busy = true;
        assert_eq!(pg.last_pulse_number().unwrap(), 0);
    }

    #[test]
    fn test_last_pulse_number_is_read_only() {
        let mut pg = bare();
        assert!(pg.set_parameter(Parameter::LastPulseNumber).is_err());
    }

    #[test]
    fn test_initialize_without_start_on_open() {
        let mut pg = bare();
        assert!(pg.initialize().is_ok());
        pg.core_mut().start_on_open = true;
        assert!(pg.initialize().is_err());
    }
}
