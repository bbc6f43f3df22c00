pub mod soft;

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::MxError;

pub use soft::{SoftDigitalOutput, SoftRelay, SoftVme, VmeAccess};

/// Digital output record a software pulser toggles
///
/// Implementations wrap whatever actually drives the line (a parallel
/// port bit, a PLC coil, a DAQ card channel). Each pulser owns its output
/// exclusively, so no locking is required by callers.
pub trait DigitalOutput: Send {
    /// Name of the output record, used in error messages
    fn name(&self) -> &str;

    /// Write a new output value
    ///
    /// # Arguments
    /// * `value` - Bit pattern to drive; pulsers only use `0` and `1`
    fn write(&mut self, value: u64) -> Result<(), MxError>;

    /// Read back the value currently driven
    fn read(&mut self) -> Result<u64, MxError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayCommand {
    Open,
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayStatus {
    Open,
    Closed,
    Unknown,
}

pub trait Relay: Send {
    fn name(&self) -> &str;

    /// Drive the relay to the requested position
    fn command(&mut self, command: RelayCommand) -> Result<(), MxError>;

    fn status(&mut self) -> Result<RelayStatus, MxError>;
}

/// VME address modifier class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AddressMode {
    A16,
    A24,
    A32,
}

impl FromStr for AddressMode {
    type Err = MxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "A16" => Ok(AddressMode::A16),
            "A24" => Ok(AddressMode::A24),
            "A32" => Ok(AddressMode::A32),
            other => Err(MxError::IllegalArgument(format!(
                "Unrecognized VME address mode '{other}'"
            ))),
        }
    }
}

/// 32-bit register access to a VME crate
pub trait VmeBus: Send {
    /// Write a 32-bit register
    ///
    /// # Arguments
    /// * `crate_number` - Crate the module sits in
    /// * `mode` - Address modifier class
    /// * `address` - Absolute register address (base + offset)
    /// * `value` - Value to write
    fn out32(
        &mut self,
        crate_number: u32,
        mode: AddressMode,
        address: u32,
        value: u32,
    ) -> Result<(), MxError>;

    /// Read a 32-bit register
    fn in32(&mut self, crate_number: u32, mode: AddressMode, address: u32)
        -> Result<u32, MxError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_address_mode() {
        assert_eq!("a24".parse::<AddressMode>().unwrap(), AddressMode::A24);
        assert_eq!(" A32 ".parse::<AddressMode>().unwrap(), AddressMode::A32);
        assert!("A64".parse::<AddressMode>().is_err());
    }
}
