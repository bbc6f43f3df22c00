//! Records built from configuration on top of the soft backends

use crossbeam_channel::Sender;
use log::info;
use std::collections::HashMap;
use std::sync::Arc;

use crate::clock::Clock;
use crate::config::{AppConfig, PulserConfig};
use crate::error::MxError;
use crate::hal::{SoftDigitalOutput, SoftRelay, SoftVme};
use crate::registry::Registry;
use crate::sis38xx_pulser::{ModuleModel, Sis38xxPulser};
use crate::software_pulser::{SoftwarePulser, TransitionEvent};

/// Module id register contents reported by the soft VME crate
pub fn simulated_module_id(model: ModuleModel) -> u32 {
    match model {
        ModuleModel::Sis3801 => 0x3801_a000,
        ModuleModel::Sis3820 => 0x3820_1000,
    }
}

/// A registry plus inspection handles to every soft device behind it
pub struct SoftBench {
    pub registry: Registry,
    pub outputs: HashMap<String, SoftDigitalOutput>,
    pub relays: HashMap<String, SoftRelay>,
    pub vme: SoftVme,
}

impl SoftBench {
    /// Create one record per configured pulser
    ///
    /// Devices with the same name are shared between pulsers.
    pub fn build(
        config: &AppConfig,
        clock: Arc<dyn Clock>,
        sink: Option<Sender<TransitionEvent>>,
    ) -> Result<Self, MxError> {
        config.validate()?;

        let mut bench = SoftBench {
            registry: Registry::new(),
            outputs: HashMap::new(),
            relays: HashMap::new(),
            vme: SoftVme::new(),
        };
        let interval = config.callback.interval();
        let history_limit = config.logging.history_limit;

        for pulser in &config.pulsers {
            let settings = pulser.settings();
            let params = settings.parameters();

            match pulser {
                PulserConfig::Doutput {
                    output,
                    allow_time_skew,
                    ..
                } => {
                    let device = bench
                        .outputs
                        .entry(output.clone())
                        .or_insert_with(|| {
                            SoftDigitalOutput::with_clock(output.clone(), clock.clone())
                                .with_history_limit(history_limit)
                        })
                        .clone();
                    let mut record = SoftwarePulser::digital_output(
                        &settings.name,
                        device,
                        params,
                        clock.clone(),
                    )
                    .with_time_skew(*allow_time_skew)
                    .with_callback_interval(interval)
                    .with_start_on_open(settings.start_on_open);
                    if let Some(sink) = &sink {
                        record = record.with_transition_sink(sink.clone());
                    }
                    bench.registry.add(Box::new(record))?;
                }
                PulserConfig::Relay {
                    relay,
                    allow_time_skew,
                    ..
                } => {
                    let device = bench
                        .relays
                        .entry(relay.clone())
                        .or_insert_with(|| {
                            SoftRelay::with_clock(relay.clone(), clock.clone())
                                .with_history_limit(history_limit)
                        })
                        .clone();
                    let mut record =
                        SoftwarePulser::relay(&settings.name, device, params, clock.clone())
                            .with_time_skew(*allow_time_skew)
                            .with_callback_interval(interval)
                            .with_start_on_open(settings.start_on_open);
                    if let Some(sink) = &sink {
                        record = record.with_transition_sink(sink.clone());
                    }
                    bench.registry.add(Box::new(record))?;
                }
                PulserConfig::Sis3801 {
                    location,
                    control_input_mode,
                    ..
                }
                | PulserConfig::Sis3820 {
                    location,
                    control_input_mode,
                    ..
                } => {
                    let model = pulser.module_model().ok_or_else(|| {
                        MxError::CorruptDataStructure(format!(
                            "Pulser '{}' has no module model",
                            settings.name
                        ))
                    })?;
                    let id_address = location
                        .base_address
                        .wrapping_add(model.registers().module_id_irq_control);
                    bench
                        .vme
                        .preset(location.crate_number, id_address, simulated_module_id(model));

                    let record = Sis38xxPulser::new(
                        &settings.name,
                        model,
                        bench.vme.clone(),
                        location.clone(),
                        params,
                        clock.clone(),
                    )
                    .with_control_input_mode(*control_input_mode)
                    .with_start_on_open(settings.start_on_open);
                    bench.registry.add(Box::new(record))?;
                }
            }
            info!("Configured {} pulser '{}'", pulser_type(pulser), settings.name);
        }

        Ok(bench)
    }

    /// Recorded waveform of a soft digital output, values as 0.0 / 1.0
    pub fn output_waveform(&self, output: &str) -> Option<Vec<(f64, f64)>> {
        self.outputs.get(output).map(|device| {
            device
                .history()
                .into_iter()
                .map(|(at, value)| (at.as_secs_f64(), (value & 1) as f64))
                .collect()
        })
    }
}

fn pulser_type(pulser: &PulserConfig) -> &'static str {
    match pulser {
        PulserConfig::Doutput { .. } => "doutput",
        PulserConfig::Relay { .. } => "relay",
        PulserConfig::Sis3801 { .. } => "sis3801",
        PulserConfig::Sis3820 { .. } => "sis3820",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::sis38xx_pulser::VmeLocation;

    fn sis_entry(name: &str, base_address: u32) -> PulserConfig {
        PulserConfig::Sis3801 {
            settings: crate::config::PulserSettings {
                name: name.to_string(),
                ..PulserConfig::demo().settings().clone()
            },
            location: VmeLocation {
                crate_number: 0,
                base_address,
                address_mode: "A32".to_string(),
            },
            control_input_mode: 1,
        }
    }

    #[test]
    fn test_build_and_open() {
        let config = AppConfig {
            pulsers: vec![PulserConfig::demo(), sis_entry("lne", 0x3800_0000)],
            ..Default::default()
        };
        let clock = ManualClock::new();
        let mut bench = SoftBench::build(&config, Arc::new(clock), None).unwrap();
        assert_eq!(bench.registry.len(), 2);
        assert!(bench.outputs.contains_key("do0"));

        bench.registry.open_all(None).unwrap();
        // open drives the output low
        assert_eq!(bench.output_waveform("do0").unwrap(), vec![(0.0, 0.0)]);
        // control input mode 1 lands in bits 2-3
        assert!(bench.vme.writes_to(0x3800_0000).contains(&(1 << 2)));
    }

    #[test]
    fn test_build_caps_output_history() {
        let mut config = AppConfig {
            pulsers: vec![PulserConfig::demo()],
            ..Default::default()
        };
        config.logging.history_limit = 4;
        let clock = ManualClock::new();
        let mut bench = SoftBench::build(&config, Arc::new(clock.clone()), None).unwrap();
        bench.registry.open_all(None).unwrap();

        let pulser = bench.registry.by_name_mut("pulser").unwrap();
        pulser.set_num_pulses(crate::types::PulseCount::Forever).unwrap();
        pulser.start().unwrap();
        for _ in 0..1000 {
            clock.advance(std::time::Duration::from_millis(10));
            pulser.is_busy().unwrap();
        }

        assert!(bench.outputs["do0"].write_count() > 20);
        assert_eq!(bench.output_waveform("do0").unwrap().len(), 4);
    }

    #[test]
    fn test_build_rejects_invalid_config() {
        let config = AppConfig {
            pulsers: vec![sis_entry("a", 0), sis_entry("a", 0x100)],
            ..Default::default()
        };
        assert!(SoftBench::build(&config, Arc::new(ManualClock::new()), None).is_err());
    }
}
