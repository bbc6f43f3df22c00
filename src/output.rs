//! Level adapters between a software pulser and its hardware
//!
//! No buffering, no retry: one level change is one backend call.

use crate::error::MxError;
use crate::hal::{DigitalOutput, Relay, RelayCommand};
use crate::types::Level;

pub trait OutputLine: Send {
    /// Name of the record behind this line
    fn name(&self) -> &str;

    fn set_level(&mut self, level: Level) -> Result<(), MxError>;
}

/// Drives `1` for high and `0` for low on a digital output
pub struct DigitalOutputLine<D: DigitalOutput> {
    output: D,
}

impl<D: DigitalOutput> DigitalOutputLine<D> {
    pub fn new(output: D) -> Self {
        Self { output }
    }
}

impl<D: DigitalOutput> OutputLine for DigitalOutputLine<D> {
    fn name(&self) -> &str {
        self.output.name()
    }

    fn set_level(&mut self, level: Level) -> Result<(), MxError> {
        self.output.write(u64::from(level))
    }
}

/// Closes the relay for high and opens it for low
pub struct RelayLine<R: Relay> {
    relay: R,
}

impl<R: Relay> RelayLine<R> {
    pub fn new(relay: R) -> Self {
        Self { relay }
    }
}

impl<R: Relay> OutputLine for RelayLine<R> {
    fn name(&self) -> &str {
        self.relay.name()
    }

    fn set_level(&mut self, level: Level) -> Result<(), MxError> {
        let command = match level {
            Level::High => RelayCommand::Close,
            Level::Low => RelayCommand::Open,
        };
        self.relay.command(command)
    }
}

impl OutputLine for Box<dyn OutputLine> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn set_level(&mut self, level: Level) -> Result<(), MxError> {
        (**self).set_level(level)
    }
}
