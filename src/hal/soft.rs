//! In-memory hardware backends
//!
//! Every soft device is a cheap clonable handle over shared state, so a
//! test (or the CLI) can keep one clone for inspection while the pulser
//! owns the other. Writes are timestamped with the device's clock.
//! Write histories keep every entry unless a limit is set, in which case
//! the oldest entries are dropped.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use crate::clock::{Clock, MonotonicClock, Timestamp};
use crate::error::MxError;
use crate::hal::{AddressMode, DigitalOutput, Relay, RelayCommand, RelayStatus, VmeBus};

/// Append to a history, dropping the oldest entries beyond `limit`
fn record<T>(history: &mut VecDeque<T>, limit: Option<usize>, entry: T) {
    history.push_back(entry);
    if let Some(limit) = limit {
        while history.len() > limit {
            history.pop_front();
        }
    }
}

#[derive(Debug, Default)]
struct DoutState {
    value: u64,
    writes: usize,
    history: VecDeque<(Timestamp, u64)>,
    history_limit: Option<usize>,
    pending_fault: Option<String>,
}

#[derive(Clone)]
pub struct SoftDigitalOutput {
    name: String,
    clock: Arc<dyn Clock>,
    state: Arc<Mutex<DoutState>>,
}

impl SoftDigitalOutput {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_clock(name, Arc::new(MonotonicClock::new()))
    }

    pub fn with_clock(name: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        Self {
            name: name.into(),
            clock,
            state: Arc::new(Mutex::new(DoutState::default())),
        }
    }

    /// Keep only the most recent `limit` writes in the history
    pub fn with_history_limit(self, limit: usize) -> Self {
        self.state.lock().history_limit = Some(limit);
        self
    }

    /// Current output value
    pub fn value(&self) -> u64 {
        self.state.lock().value
    }

    /// Retained successful writes as `(time, value)`, oldest first
    pub fn history(&self) -> Vec<(Timestamp, u64)> {
        self.state.lock().history.iter().copied().collect()
    }

    /// Successful writes since creation, including those dropped from the history
    pub fn write_count(&self) -> usize {
        self.state.lock().writes
    }

    pub fn clear_history(&self) {
        self.state.lock().history.clear();
    }

    /// Make the next write fail with the given message
    pub fn inject_fault(&self, message: impl Into<String>) {
        self.state.lock().pending_fault = Some(message.into());
    }
}

impl DigitalOutput for SoftDigitalOutput {
    fn name(&self) -> &str {
        &self.name
    }

    fn write(&mut self, value: u64) -> Result<(), MxError> {
        let mut state = self.state.lock();
        if let Some(message) = state.pending_fault.take() {
            return Err(MxError::Hardware {
                record: self.name.clone(),
                message,
            });
        }
        state.value = value;
        state.writes += 1;
        let limit = state.history_limit;
        record(&mut state.history, limit, (self.clock.now(), value));
        Ok(())
    }

    fn read(&mut self) -> Result<u64, MxError> {
        Ok(self.state.lock().value)
    }
}

#[derive(Debug)]
struct RelayState {
    status: RelayStatus,
    history: VecDeque<(Timestamp, RelayCommand)>,
    history_limit: Option<usize>,
    pending_fault: Option<String>,
}

#[derive(Clone)]
pub struct SoftRelay {
    name: String,
    clock: Arc<dyn Clock>,
    state: Arc<Mutex<RelayState>>,
}

impl SoftRelay {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_clock(name, Arc::new(MonotonicClock::new()))
    }

    pub fn with_clock(name: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        Self {
            name: name.into(),
            clock,
            state: Arc::new(Mutex::new(RelayState {
                status: RelayStatus::Unknown,
                history: VecDeque::new(),
                history_limit: None,
                pending_fault: None,
            })),
        }
    }

    pub fn with_history_limit(self, limit: usize) -> Self {
        self.state.lock().history_limit = Some(limit);
        self
    }

    pub fn current_status(&self) -> RelayStatus {
        self.state.lock().status
    }

    pub fn history(&self) -> Vec<(Timestamp, RelayCommand)> {
        self.state.lock().history.iter().copied().collect()
    }

    pub fn inject_fault(&self, message: impl Into<String>) {
        self.state.lock().pending_fault = Some(message.into());
    }
}

impl Relay for SoftRelay {
    fn name(&self) -> &str {
        &self.name
    }

    fn command(&mut self, command: RelayCommand) -> Result<(), MxError> {
        let mut state = self.state.lock();
        if let Some(message) = state.pending_fault.take() {
            return Err(MxError::Hardware {
                record: self.name.clone(),
                message,
            });
        }
        state.status = match command {
            RelayCommand::Open => RelayStatus::Open,
            RelayCommand::Close => RelayStatus::Closed,
        };
        let limit = state.history_limit;
        record(&mut state.history, limit, (self.clock.now(), command));
        Ok(())
    }

    fn status(&mut self) -> Result<RelayStatus, MxError> {
        Ok(self.state.lock().status)
    }
}

/// One register access seen by `SoftVme`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmeAccess {
    Write { address: u32, value: u32 },
    Read { address: u32, value: u32 },
}

#[derive(Debug, Default)]
struct VmeState {
    registers: HashMap<(u32, u32), u32>,
    log: Vec<VmeAccess>,
    pending_fault: Option<String>,
}

/// Register file standing in for a VME crate
///
/// Writes land in the register map, so a register written then read back
/// returns the written value. Module id registers can be preset.
#[derive(Clone, Default)]
pub struct SoftVme {
    state: Arc<Mutex<VmeState>>,
}

impl SoftVme {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn preset(&self, crate_number: u32, address: u32, value: u32) {
        self.state
            .lock()
            .registers
            .insert((crate_number, address), value);
    }

    pub fn register(&self, crate_number: u32, address: u32) -> Option<u32> {
        self.state
            .lock()
            .registers
            .get(&(crate_number, address))
            .copied()
    }

    pub fn accesses(&self) -> Vec<VmeAccess> {
        self.state.lock().log.clone()
    }

    /// Values written to one address, oldest first
    pub fn writes_to(&self, address: u32) -> Vec<u32> {
        self.state
            .lock()
            .log
            .iter()
            .filter_map(|access| match access {
                VmeAccess::Write { address: a, value } if *a == address => Some(*value),
                _ => None,
            })
            .collect()
    }

    pub fn clear_log(&self) {
        self.state.lock().log.clear();
    }

    pub fn inject_fault(&self, message: impl Into<String>) {
        self.state.lock().pending_fault = Some(message.into());
    }
}

impl VmeBus for SoftVme {
    fn out32(
        &mut self,
        crate_number: u32,
        _mode: AddressMode,
        address: u32,
        value: u32,
    ) -> Result<(), MxError> {
        let mut state = self.state.lock();
        if let Some(message) = state.pending_fault.take() {
            return Err(MxError::Hardware {
                record: format!("vme crate {crate_number}"),
                message,
            });
        }
        state.registers.insert((crate_number, address), value);
        state.log.push(VmeAccess::Write { address, value });
        Ok(())
    }

    fn in32(
        &mut self,
        crate_number: u32,
        _mode: AddressMode,
        address: u32,
    ) -> Result<u32, MxError> {
        let mut state = self.state.lock();
        if let Some(message) = state.pending_fault.take() {
            return Err(MxError::Hardware {
                record: format!("vme crate {crate_number}"),
                message,
            });
        }
        let value = state
            .registers
            .get(&(crate_number, address))
            .copied()
            .unwrap_or(0);
        state.log.push(VmeAccess::Read { address, value });
        Ok(value)
    }
}
