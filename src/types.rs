use serde::{Deserialize, Serialize};

use crate::error::MxError;

/// Electrical level of an emulated output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Low,
    High,
}

impl From<bool> for Level {
    fn from(high: bool) -> Self {
        if high { Level::High } else { Level::Low }
    }
}

impl From<Level> for u64 {
    fn from(level: Level) -> Self {
        match level {
            Level::Low => 0,
            Level::High => 1,
        }
    }
}

/// Number of pulses in a train
///
/// The external representation uses `-1` for "run until stopped".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub enum PulseCount {
    Finite(u64),
    Forever,
}

impl PulseCount {
    pub const FOREVER_SENTINEL: i64 = -1;

    pub fn is_forever(self) -> bool {
        matches!(self, PulseCount::Forever)
    }
}

impl Default for PulseCount {
    fn default() -> Self {
        PulseCount::Finite(1)
    }
}

impl TryFrom<i64> for PulseCount {
    type Error = MxError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            Self::FOREVER_SENTINEL => Ok(PulseCount::Forever),
            n if n >= 0 => Ok(PulseCount::Finite(n as u64)),
            n => Err(MxError::IllegalArgument(format!(
                "Pulse count {n} is invalid, use -1 to count forever"
            ))),
        }
    }
}

/// Counts beyond `i64::MAX` saturate rather than wrap into the sentinel
impl From<PulseCount> for i64 {
    fn from(count: PulseCount) -> Self {
        match count {
            PulseCount::Finite(n) => i64::try_from(n).unwrap_or(i64::MAX),
            PulseCount::Forever => PulseCount::FOREVER_SENTINEL,
        }
    }
}

/// Shape of the generated waveform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FunctionMode {
    #[default]
    Pulse = 1,
    SquareWave = 2,
}

impl TryFrom<i64> for FunctionMode {
    type Error = MxError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(FunctionMode::Pulse),
            2 => Ok(FunctionMode::SquareWave),
            other => Err(MxError::IllegalArgument(format!(
                "Illegal function mode {other}. \
                 The allowed modes are 'pulse' (1) or 'square wave' (2)"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TriggerMode {
    #[default]
    Internal,
    External,
}

/// Class-level fields a driver may be asked to read or write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parameter {
    NumPulses,
    PulseWidth,
    PulseDelay,
    PulsePeriod,
    FunctionMode,
    TriggerMode,
    LastPulseNumber,
}

impl std::fmt::Display for Parameter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Parameter::NumPulses => "num_pulses",
            Parameter::PulseWidth => "pulse_width",
            Parameter::PulseDelay => "pulse_delay",
            Parameter::PulsePeriod => "pulse_period",
            Parameter::FunctionMode => "function_mode",
            Parameter::TriggerMode => "trigger_mode",
            Parameter::LastPulseNumber => "last_pulse_number",
        };
        f.write_str(label)
    }
}

/// Generic pulse generator class fields, in seconds where applicable
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PulseParameters {
    pub pulse_width: f64,
    pub pulse_period: f64,
    #[serde(default)]
    pub pulse_delay: f64,
    pub num_pulses: PulseCount,
    #[serde(default)]
    pub function_mode: FunctionMode,
    #[serde(default)]
    pub trigger_mode: TriggerMode,
}

impl Default for PulseParameters {
    fn default() -> Self {
        Self {
            pulse_width: 0.1,
            pulse_period: 1.0,
            pulse_delay: 0.0,
            num_pulses: PulseCount::default(),
            function_mode: FunctionMode::Pulse,
            trigger_mode: TriggerMode::Internal,
        }
    }
}

impl PulseParameters {
    /// Time the output spends low in each cycle, never negative
    pub fn low_time(&self) -> f64 {
        (self.pulse_period - self.pulse_width).max(0.0)
    }
}
