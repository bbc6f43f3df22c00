use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use crate::error::MxError;
use crate::hal::AddressMode;
use crate::sis38xx_pulser::{ModuleModel, VmeLocation};
use crate::types::{FunctionMode, PulseCount, PulseParameters, TriggerMode};

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub callback: CallbackConfig,
    #[serde(default)]
    pub pulsers: Vec<PulserConfig>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    pub log_level: String,
    /// Write every output transition to a JSONL file under `log_path`
    pub transition_log: bool,
    pub log_path: String,
    pub buffer_size: usize,
    /// Most recent writes each soft device keeps for the waveform plot
    pub history_limit: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CallbackConfig {
    /// Drive software pulsers from timers instead of from busy polls
    pub enabled: bool,
    pub interval_ms: u64,
    /// Resolution of the background master timer
    pub tick_ms: u64,
}

/// Timing fields shared by every pulser entry
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PulserSettings {
    pub name: String,
    #[serde(default = "default_pulse_width")]
    pub pulse_width: f64,
    #[serde(default = "default_pulse_period")]
    pub pulse_period: f64,
    #[serde(default)]
    pub pulse_delay: f64,
    #[serde(default)]
    pub num_pulses: PulseCount,
    #[serde(default)]
    pub function_mode: FunctionMode,
    #[serde(default)]
    pub start_on_open: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PulserConfig {
    Doutput {
        #[serde(flatten)]
        settings: PulserSettings,
        output: String,
        #[serde(default)]
        allow_time_skew: bool,
    },
    Relay {
        #[serde(flatten)]
        settings: PulserSettings,
        relay: String,
        #[serde(default)]
        allow_time_skew: bool,
    },
    Sis3801 {
        #[serde(flatten)]
        settings: PulserSettings,
        #[serde(flatten)]
        location: VmeLocation,
        #[serde(default)]
        control_input_mode: u32,
    },
    Sis3820 {
        #[serde(flatten)]
        settings: PulserSettings,
        #[serde(flatten)]
        location: VmeLocation,
        #[serde(default)]
        control_input_mode: u32,
    },
}

fn default_pulse_width() -> f64 {
    PulseParameters::default().pulse_width
}

fn default_pulse_period() -> f64 {
    PulseParameters::default().pulse_period
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            transition_log: false,
            log_path: "./logs".to_string(),
            buffer_size: 64,
            history_limit: 10_000,
        }
    }
}

impl Default for CallbackConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 100,
            tick_ms: 10,
        }
    }
}

impl CallbackConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }
}

impl PulserSettings {
    pub fn parameters(&self) -> PulseParameters {
        PulseParameters {
            pulse_width: self.pulse_width,
            pulse_period: self.pulse_period,
            pulse_delay: self.pulse_delay,
            num_pulses: self.num_pulses,
            function_mode: self.function_mode,
            trigger_mode: TriggerMode::Internal,
        }
    }
}

impl PulserConfig {
    /// Three 100 ms pulses a second on a soft digital output
    pub fn demo() -> Self {
        PulserConfig::Doutput {
            settings: PulserSettings {
                name: "pulser".to_string(),
                pulse_width: 0.1,
                pulse_period: 0.5,
                pulse_delay: 0.0,
                num_pulses: PulseCount::Finite(3),
                function_mode: FunctionMode::Pulse,
                start_on_open: false,
            },
            output: "do0".to_string(),
            allow_time_skew: false,
        }
    }

    pub fn settings(&self) -> &PulserSettings {
        match self {
            PulserConfig::Doutput { settings, .. }
            | PulserConfig::Relay { settings, .. }
            | PulserConfig::Sis3801 { settings, .. }
            | PulserConfig::Sis3820 { settings, .. } => settings,
        }
    }

    pub fn name(&self) -> &str {
        &self.settings().name
    }

    pub fn module_model(&self) -> Option<ModuleModel> {
        match self {
            PulserConfig::Sis3801 { .. } => Some(ModuleModel::Sis3801),
            PulserConfig::Sis3820 { .. } => Some(ModuleModel::Sis3820),
            _ => None,
        }
    }
}

impl AppConfig {
    /// Reject settings no pulser could run with
    pub fn validate(&self) -> Result<(), MxError> {
        if self.callback.enabled && self.callback.interval_ms == 0 {
            return Err(MxError::IllegalArgument(
                "callback.interval_ms must be greater than zero".to_string(),
            ));
        }

        let mut names = HashSet::new();
        for pulser in &self.pulsers {
            let settings = pulser.settings();
            if !names.insert(settings.name.as_str()) {
                return Err(MxError::IllegalArgument(format!(
                    "Duplicate pulser name '{}'",
                    settings.name
                )));
            }
            if settings.pulse_width < 0.0 {
                return Err(MxError::IllegalArgument(format!(
                    "Pulser '{}': negative pulse width {}",
                    settings.name, settings.pulse_width
                )));
            }
            if settings.pulse_period < 0.0 {
                return Err(MxError::IllegalArgument(format!(
                    "Pulser '{}': negative pulse period {}",
                    settings.name, settings.pulse_period
                )));
            }
            if let PulserConfig::Sis3801 { location, .. } | PulserConfig::Sis3820 { location, .. } =
                pulser
            {
                location.address_mode.parse::<AddressMode>()?;
            }
        }
        Ok(())
    }
}

/// Load configuration from file with layered fallbacks
pub fn load_config(config_path: Option<&Path>) -> Result<AppConfig, ConfigError> {
    let mut builder = Config::builder().add_source(Config::try_from(&AppConfig::default())?);

    if let Some(path) = config_path {
        if path.exists() {
            builder = builder.add_source(File::from(path));
        } else {
            return Err(ConfigError::Message(format!(
                "Config file not found: {}",
                path.display()
            )));
        }
    } else {
        let possible_paths = ["mx-pulser.toml", "config.toml"];

        for path in &possible_paths {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
                break;
            }
        }
    }

    // e.g. MX_PULSER__CALLBACK__ENABLED=false
    builder = builder.add_source(
        Environment::with_prefix("MX_PULSER")
            .separator("__")
            .try_parsing(true),
    );

    let config = builder.build()?;
    config.try_deserialize::<AppConfig>()
}

/// Load configuration, falling back to defaults on any failure
pub fn load_config_or_default(config_path: Option<&Path>) -> AppConfig {
    match load_config(config_path) {
        Ok(config) => {
            log::info!("Configuration loaded successfully");
            config
        }
        Err(e) => {
            log::warn!("Failed to load config ({}), using defaults", e);
            AppConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
[logging]
log_level = "debug"
transition_log = true
log_path = "./logs"
buffer_size = 8

[callback]
enabled = false
interval_ms = 50
tick_ms = 5

[[pulsers]]
type = "doutput"
name = "shutter"
output = "do1"
pulse_width = 0.2
pulse_period = 1.0
num_pulses = -1

[[pulsers]]
type = "sis3801"
name = "lne"
crate_number = 0
base_address = 0x38000000
address_mode = "A32"
pulse_period = 0.001
num_pulses = 1000
"#;

    fn write_sample(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_sample_file() {
        let file = write_sample(SAMPLE);
        let config = load_config(Some(file.path())).unwrap();

        assert_eq!(config.logging.log_level, "debug");
        assert_eq!(config.logging.history_limit, 10_000);
        assert!(!config.callback.enabled);
        assert_eq!(config.callback.interval(), Duration::from_millis(50));
        assert_eq!(config.pulsers.len(), 2);

        let shutter = &config.pulsers[0];
        assert_eq!(shutter.name(), "shutter");
        assert_eq!(shutter.settings().num_pulses, PulseCount::Forever);
        assert_eq!(shutter.settings().pulse_delay, 0.0);

        match &config.pulsers[1] {
            PulserConfig::Sis3801 { location, .. } => {
                assert_eq!(location.base_address, 0x3800_0000);
                assert_eq!(location.address_mode, "A32");
            }
            other => panic!("unexpected pulser {other:?}"),
        }
        config.validate().unwrap();
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(load_config(Some(Path::new("/nonexistent/mx-pulser.toml"))).is_err());
    }

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert!(config.callback.enabled);
        assert_eq!(config.callback.interval_ms, 100);
        assert!(config.pulsers.is_empty());
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_duplicates() {
        let config = AppConfig {
            pulsers: vec![PulserConfig::demo(), PulserConfig::demo()],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_negative_width() {
        let mut pulser = PulserConfig::demo();
        if let PulserConfig::Doutput { settings, .. } = &mut pulser {
            settings.pulse_width = -0.5;
        }
        let config = AppConfig {
            pulsers: vec![pulser],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_address_mode() {
        let config = AppConfig {
            pulsers: vec![PulserConfig::Sis3820 {
                settings: PulserConfig::demo().settings().clone(),
                location: VmeLocation {
                    crate_number: 0,
                    base_address: 0,
                    address_mode: "A64".to_string(),
                },
                control_input_mode: 0,
            }],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
