//! Struck SIS3801 / SIS3820 multichannel scalers used as pulse generators
//!
//! The module's internal 10 MHz clock feeds the LNE prescaler, so the LNE
//! output is a pulse train with period `prescale / 10 MHz`. The module has
//! no countdown register: the driver works out when the train should be
//! over and stops the prescaler the first time it is polled after that.

use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::clock::{seconds, Clock, Timestamp};
use crate::error::MxError;
use crate::hal::{AddressMode, VmeBus};
use crate::pulse_generator::{
    default_get_parameter, default_set_parameter, OpenContext, PulseGenerator, PulseGeneratorCore,
};
use crate::types::{FunctionMode, Parameter, PulseCount, PulseParameters};

pub const INTERNAL_CLOCK_HZ: f64 = 10.0e6;

/// The LNE output width cannot be changed; this is the FIFO copy time
pub const FIXED_PULSE_WIDTH: f64 = 260.0e-9;

/// Extra time allowed before a finite train is declared finished
pub const FINISH_MARGIN: f64 = 0.02;

// Control register bits. The register is J/K style: the low half sets a
// feature, the same bit shifted up by 8 clears it.
pub const ENABLE_10MHZ_TO_LNE_PRESCALER: u32 = 1 << 6;
pub const DISABLE_10MHZ_TO_LNE_PRESCALER: u32 = 1 << 14;
pub const ENABLE_LNE_PRESCALER: u32 = 1 << 7;
pub const DISABLE_LNE_PRESCALER: u32 = 1 << 15;
pub const ENABLE_EXTERNAL_NEXT: u32 = 1 << 16;
pub const DISABLE_EXTERNAL_NEXT: u32 = 1 << 24;
pub const SET_SOFTWARE_DISABLE_COUNTING_BIT: u32 = 1 << 17;
pub const CLEAR_SOFTWARE_DISABLE_COUNTING_BIT: u32 = 1 << 25;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleModel {
    Sis3801,
    Sis3820,
}

/// Register offsets from the module base address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterMap {
    pub control: u32,
    pub module_id_irq_control: u32,
    pub copy_disable: u32,
    pub enable_next_clock_logic: u32,
    pub disable_next_clock_logic: u32,
    pub reset: u32,
    pub prescale_factor: u32,
}

impl ModuleModel {
    pub fn registers(self) -> RegisterMap {
        match self {
            ModuleModel::Sis3801 => RegisterMap {
                control: 0x000,
                module_id_irq_control: 0x004,
                copy_disable: 0x00c,
                enable_next_clock_logic: 0x028,
                disable_next_clock_logic: 0x02c,
                reset: 0x060,
                prescale_factor: 0x080,
            },
            ModuleModel::Sis3820 => RegisterMap {
                control: 0x000,
                module_id_irq_control: 0x004,
                copy_disable: 0x104,
                enable_next_clock_logic: 0x418,
                disable_next_clock_logic: 0x41c,
                reset: 0x400,
                prescale_factor: 0x018,
            },
        }
    }

    /// Largest prescale factor (exclusive) the firmware accepts
    pub fn maximum_prescale_factor(self, firmware_version: u32) -> u64 {
        match (self, firmware_version) {
            (ModuleModel::Sis3820, _) => 1 << 32,
            (ModuleModel::Sis3801, 0x9 | 0xA) => 1 << 28,
            (ModuleModel::Sis3801, _) => 1 << 24,
        }
    }

    fn driver_name(self) -> &'static str {
        match self {
            ModuleModel::Sis3801 => "sis3801_pulser",
            ModuleModel::Sis3820 => "sis3820_pulser",
        }
    }
}

/// Where the module sits on the VME bus
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmeLocation {
    pub crate_number: u32,
    pub base_address: u32,
    /// Parsed when the record is opened
    pub address_mode: String,
}

pub struct Sis38xxPulser<V: VmeBus> {
    core: PulseGeneratorCore,
    model: ModuleModel,
    registers: RegisterMap,
    vme: V,
    location: VmeLocation,
    address_mode: Option<AddressMode>,
    control_input_mode: u32,
    module_id: u32,
    firmware_version: u32,
    maximum_prescale_factor: u64,
    finish_time: Timestamp,
    clock: Arc<dyn Clock>,
}

impl<V: VmeBus> Sis38xxPulser<V> {
    pub fn new(
        name: impl Into<String>,
        model: ModuleModel,
        vme: V,
        location: VmeLocation,
        params: PulseParameters,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let finish_time = clock.now();
        Self {
            core: PulseGeneratorCore::new(name, params),
            model,
            registers: model.registers(),
            vme,
            location,
            address_mode: None,
            control_input_mode: 0,
            module_id: 0,
            firmware_version: 0,
            maximum_prescale_factor: model.maximum_prescale_factor(0),
            finish_time,
            clock,
        }
    }

    pub fn with_control_input_mode(mut self, mode: u32) -> Self {
        self.control_input_mode = mode;
        self
    }

    pub fn with_start_on_open(mut self, start: bool) -> Self {
        self.core.start_on_open = start;
        self
    }

    pub fn model(&self) -> ModuleModel {
        self.model
    }

    pub fn module_id(&self) -> u32 {
        self.module_id
    }

    pub fn firmware_version(&self) -> u32 {
        self.firmware_version
    }

    pub fn maximum_prescale_factor(&self) -> u64 {
        self.maximum_prescale_factor
    }

    pub fn finish_time(&self) -> Timestamp {
        self.finish_time
    }

    fn mode(&self) -> Result<AddressMode, MxError> {
        self.address_mode.ok_or_else(|| {
            MxError::CorruptDataStructure(format!(
                "Pulser '{}' has not been opened, its VME address mode is unknown",
                self.core.name
            ))
        })
    }

    fn out32(&mut self, offset: u32, value: u32) -> Result<(), MxError> {
        let mode = self.mode()?;
        let address = self.location.base_address.wrapping_add(offset);
        self.vme
            .out32(self.location.crate_number, mode, address, value)
    }

    fn in32(&mut self, offset: u32) -> Result<u32, MxError> {
        let mode = self.mode()?;
        let address = self.location.base_address.wrapping_add(offset);
        self.vme.in32(self.location.crate_number, mode, address)
    }
}

impl<V: VmeBus> PulseGenerator for Sis38xxPulser<V> {
    fn core(&self) -> &PulseGeneratorCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut PulseGeneratorCore {
        &mut self.core
    }

    fn driver_name(&self) -> &'static str {
        self.model.driver_name()
    }

    fn open(&mut self, _ctx: OpenContext<'_>) -> Result<(), MxError> {
        self.address_mode = Some(self.location.address_mode.parse()?);
        let regs = self.registers;

        self.out32(regs.reset, 1)?;

        let id_register = self.in32(regs.module_id_irq_control)?;
        self.module_id = (id_register >> 16) & 0xffff;
        self.firmware_version = (id_register >> 12) & 0xf;
        self.maximum_prescale_factor = self.model.maximum_prescale_factor(self.firmware_version);
        info!(
            "Pulser '{}': module id {:#06x}, firmware {:#x}, max prescale {}",
            self.core.name, self.module_id, self.firmware_version, self.maximum_prescale_factor
        );

        // Never copy to the FIFO so it can never fill up.
        self.out32(regs.copy_disable, 1)?;

        self.out32(
            regs.control,
            ENABLE_10MHZ_TO_LNE_PRESCALER | DISABLE_EXTERNAL_NEXT,
        )?;
        self.out32(regs.control, (self.control_input_mode & 0x3) << 2)?;
        self.out32(regs.control, CLEAR_SOFTWARE_DISABLE_COUNTING_BIT)?;

        self.core.busy = false;
        self.finish_time = self.clock.now();

        self.set_parameter(Parameter::PulsePeriod)
    }

    fn check_busy(&mut self) -> Result<(), MxError> {
        if !self.core.busy || self.core.params.num_pulses.is_forever() {
            return Ok(());
        }
        if self.clock.now() >= self.finish_time {
            debug!("Pulser '{}' reached its finish time", self.core.name);
            // the train is over even if the module refuses the stop
            self.core.busy = false;
            self.stop()?;
        }
        Ok(())
    }

    fn start(&mut self) -> Result<(), MxError> {
        let regs = self.registers;
        self.out32(regs.enable_next_clock_logic, 1)?;
        self.out32(regs.control, ENABLE_LNE_PRESCALER)?;
        self.core.busy = true;

        let PulseCount::Finite(num_pulses) = self.core.params.num_pulses else {
            info!("Pulser '{}' started, counting forever", self.core.name);
            return Ok(());
        };

        let countdown = self.core.params.pulse_period * num_pulses as f64 + FINISH_MARGIN;
        let now = self.clock.now();
        self.finish_time = now.saturating_add(seconds(countdown));
        info!(
            "Pulser '{}' started: {} pulses, finishing in {:.3} s",
            self.core.name, num_pulses, countdown
        );
        Ok(())
    }

    fn stop(&mut self) -> Result<(), MxError> {
        let regs = self.registers;
        self.out32(regs.control, DISABLE_LNE_PRESCALER)?;
        self.out32(regs.disable_next_clock_logic, 1)?;
        self.core.busy = false;
        self.finish_time = self.clock.now();
        Ok(())
    }

    fn get_parameter(&mut self, parameter: Parameter) -> Result<(), MxError> {
        match parameter {
            Parameter::NumPulses => Ok(()),
            Parameter::PulseWidth => {
                self.core.params.pulse_width = FIXED_PULSE_WIDTH;
                Ok(())
            }
            Parameter::PulseDelay => {
                self.core.params.pulse_delay = 0.0;
                Ok(())
            }
            Parameter::FunctionMode => {
                self.core.params.function_mode = FunctionMode::Pulse;
                Ok(())
            }
            Parameter::PulsePeriod => {
                let register = self.in32(self.registers.prescale_factor)?;
                self.core.params.pulse_period = (register as f64 + 1.0) / INTERNAL_CLOCK_HZ;
                Ok(())
            }
            Parameter::LastPulseNumber => {
                self.check_busy()?;
                default_get_parameter(&mut self.core, parameter)
            }
            _ => default_get_parameter(&mut self.core, parameter),
        }
    }

    fn set_parameter(&mut self, parameter: Parameter) -> Result<(), MxError> {
        match parameter {
            Parameter::NumPulses => Ok(()),
            Parameter::PulseWidth => {
                self.core.params.pulse_width = FIXED_PULSE_WIDTH;
                Ok(())
            }
            Parameter::PulseDelay => {
                self.core.params.pulse_delay = 0.0;
                Ok(())
            }
            Parameter::FunctionMode => match self.core.params.function_mode {
                FunctionMode::Pulse => Ok(()),
                other => Err(MxError::Unsupported(format!(
                    "Pulse generator mode {:?} is not supported for pulse generator '{}'. \
                     Only pulse mode is supported",
                    other, self.core.name
                ))),
            },
            Parameter::PulsePeriod => {
                let period = self.core.params.pulse_period;
                let prescale = (INTERNAL_CLOCK_HZ * period).round();

                if prescale >= self.maximum_prescale_factor as f64 {
                    let maximum_period = self.maximum_prescale_factor as f64 / INTERNAL_CLOCK_HZ;
                    return Err(MxError::WouldExceedLimit(format!(
                        "The requested pulse period of {} seconds for pulse generator '{}' \
                         is larger than the maximum allowed pulse period of {} seconds",
                        period, self.core.name, maximum_period
                    )));
                }
                if !(prescale >= 1.0) {
                    return Err(MxError::IllegalArgument(format!(
                        "The requested pulse period of {} seconds for pulse generator '{}' \
                         is shorter than one 10 MHz clock tick",
                        period, self.core.name
                    )));
                }

                let register = (prescale as u64 - 1) as u32;
                debug!("Pulser '{}': prescale register = {}", self.core.name, register);
                self.out32(self.registers.prescale_factor, register)
            }
            _ => default_set_parameter(&self.core, parameter),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::hal::SoftVme;
    use crate::registry::RecordHandle;
    use std::time::Duration;

    const BASE: u32 = 0x3800_0000;

    fn location() -> VmeLocation {
        VmeLocation {
            crate_number: 0,
            base_address: BASE,
            address_mode: "A32".to_string(),
        }
    }

    type Opened = (ManualClock, SoftVme, Sis38xxPulser<SoftVme>);

    fn opened(model: ModuleModel, id_register: u32, count: PulseCount) -> Opened {
        let clock = ManualClock::new();
        let vme = SoftVme::new();
        vme.preset(0, BASE + model.registers().module_id_irq_control, id_register);
        let params = PulseParameters {
            pulse_period: 0.001,
            num_pulses: count,
            ..Default::default()
        };
        let mut pulser = Sis38xxPulser::new(
            "sis",
            model,
            vme.clone(),
            location(),
            params,
            Arc::new(clock.clone()),
        );
        pulser
            .open(OpenContext {
                handle: RecordHandle::new(0),
                callbacks: None,
            })
            .unwrap();
        (clock, vme, pulser)
    }

    #[test]
    fn test_open_sequence_sis3801() {
        let (_clock, vme, pulser) =
            opened(ModuleModel::Sis3801, 0x3801_A000, PulseCount::Finite(1));
        assert_eq!(pulser.module_id(), 0x3801);
        assert_eq!(pulser.firmware_version(), 0xA);
        assert_eq!(pulser.maximum_prescale_factor(), 1 << 28);

        assert_eq!(vme.writes_to(BASE + 0x060), vec![1]);
        assert_eq!(vme.writes_to(BASE + 0x00c), vec![1]);
        assert_eq!(
            vme.writes_to(BASE),
            vec![
                ENABLE_10MHZ_TO_LNE_PRESCALER | DISABLE_EXTERNAL_NEXT,
                0,
                CLEAR_SOFTWARE_DISABLE_COUNTING_BIT,
            ]
        );
        // 1 ms at 10 MHz
        assert_eq!(vme.writes_to(BASE + 0x080), vec![9999]);
    }

    #[test]
    fn test_old_firmware_has_24_bit_prescaler() {
        let (_clock, _vme, pulser) =
            opened(ModuleModel::Sis3801, 0x3801_5000, PulseCount::Finite(1));
        assert_eq!(pulser.maximum_prescale_factor(), 1 << 24);
    }

    #[test]
    fn test_period_limit() {
        let (_clock, _vme, mut pulser) =
            opened(ModuleModel::Sis3801, 0x3801_5000, PulseCount::Finite(1));
        let err = pulser.set_pulse_period(2.0).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::WouldExceedLimit);
        let err = pulser.set_pulse_period(1e-9).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::IllegalArgument);
    }

    #[test]
    fn test_period_readback() {
        let (_clock, _vme, mut pulser) =
            opened(ModuleModel::Sis3801, 0x3801_A000, PulseCount::Finite(1));
        pulser.set_pulse_period(0.25).unwrap();
        let period = pulser.pulse_period().unwrap();
        assert!((period - 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_fixed_width_and_mode() {
        let (_clock, _vme, mut pulser) =
            opened(ModuleModel::Sis3801, 0x3801_A000, PulseCount::Finite(1));
        pulser.set_pulse_width(0.5).unwrap();
        assert_eq!(pulser.pulse_width().unwrap(), FIXED_PULSE_WIDTH);
        pulser.set_pulse_delay(1.0).unwrap();
        assert_eq!(pulser.pulse_delay().unwrap(), 0.0);
        assert!(pulser.set_function_mode(FunctionMode::SquareWave).is_err());
    }

    #[test]
    fn test_finite_train_stops_after_finish_time() {
        let (clock, vme, mut pulser) =
            opened(ModuleModel::Sis3801, 0x3801_A000, PulseCount::Finite(100));
        vme.clear_log();
        pulser.start().unwrap();
        assert_eq!(vme.writes_to(BASE + 0x028), vec![1]);
        assert_eq!(vme.writes_to(BASE), vec![ENABLE_LNE_PRESCALER]);
        // 100 * 1 ms + 20 ms margin
        assert_eq!(pulser.finish_time(), Duration::from_millis(120));

        clock.advance(Duration::from_millis(119));
        assert!(pulser.is_busy().unwrap());
        clock.advance(Duration::from_millis(1));
        assert!(!pulser.is_busy().unwrap());
        assert_eq!(vme.writes_to(BASE + 0x02c), vec![1]);
        assert_eq!(vme.writes_to(BASE), vec![ENABLE_LNE_PRESCALER, DISABLE_LNE_PRESCALER]);
    }

    #[test]
    fn test_failed_stop_after_finish_still_goes_idle() {
        let (clock, vme, mut pulser) =
            opened(ModuleModel::Sis3801, 0x3801_A000, PulseCount::Finite(10));
        pulser.start().unwrap();
        clock.advance(Duration::from_millis(30));

        vme.inject_fault("bus error");
        assert!(pulser.is_busy().is_err());
        assert!(!pulser.core().busy);
        assert!(!pulser.is_busy().unwrap());
    }

    #[test]
    fn test_forever_train_stays_busy() {
        let (clock, _vme, mut pulser) =
            opened(ModuleModel::Sis3801, 0x3801_A000, PulseCount::Forever);
        pulser.start().unwrap();
        clock.advance(Duration::from_secs(3600));
        assert!(pulser.is_busy().unwrap());
        pulser.stop().unwrap();
        assert!(!pulser.is_busy().unwrap());
    }

    #[test]
    fn test_sis3820_register_map() {
        let (_clock, vme, mut pulser) =
            opened(ModuleModel::Sis3820, 0x3820_1000, PulseCount::Finite(1));
        assert_eq!(pulser.driver_name(), "sis3820_pulser");
        assert_eq!(pulser.maximum_prescale_factor(), 1 << 32);
        assert_eq!(vme.writes_to(BASE + 0x400), vec![1]);
        pulser.start().unwrap();
        assert_eq!(vme.writes_to(BASE + 0x418), vec![1]);
        pulser.stop().unwrap();
        assert_eq!(vme.writes_to(BASE + 0x41c), vec![1]);
    }

    #[test]
    fn test_unopened_access_is_corrupt() {
        let clock = ManualClock::new();
        let mut pulser = Sis38xxPulser::new(
            "sis",
            ModuleModel::Sis3801,
            SoftVme::new(),
            location(),
            PulseParameters::default(),
            Arc::new(clock),
        );
        assert!(pulser.start().unwrap_err().is_fatal());
    }

    #[test]
    fn test_bad_address_mode() {
        let mut bad = location();
        bad.address_mode = "A99".to_string();
        let mut pulser = Sis38xxPulser::new(
            "sis",
            ModuleModel::Sis3801,
            SoftVme::new(),
            bad,
            PulseParameters::default(),
            Arc::new(ManualClock::new()),
        );
        let result = pulser.open(OpenContext {
            handle: RecordHandle::new(0),
            callbacks: None,
        });
        assert!(result.is_err());
    }
}
