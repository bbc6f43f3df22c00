//! Record list
//!
//! Records live in an arena and are addressed by `RecordHandle`. Handles
//! stay valid for the lifetime of the registry because records are never
//! removed individually.

use log::info;
use std::collections::HashMap;

use crate::callback::CallbackLoop;
use crate::error::MxError;
use crate::pulse_generator::{OpenContext, PulseGenerator};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordHandle(usize);

impl RecordHandle {
    pub fn new(index: usize) -> Self {
        Self(index)
    }

    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Default)]
pub struct Registry {
    records: Vec<Box<dyn PulseGenerator>>,
    by_name: HashMap<String, RecordHandle>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a record; names must be unique
    pub fn add(&mut self, record: Box<dyn PulseGenerator>) -> Result<RecordHandle, MxError> {
        let name = record.core().name.clone();
        if self.by_name.contains_key(&name) {
            return Err(MxError::IllegalArgument(format!(
                "A record named '{name}' already exists"
            )));
        }
        let handle = RecordHandle(self.records.len());
        self.records.push(record);
        self.by_name.insert(name, handle);
        Ok(handle)
    }

    pub fn get(&self, handle: RecordHandle) -> Option<&dyn PulseGenerator> {
        self.records.get(handle.0).map(|r| r.as_ref())
    }

    pub fn get_mut(&mut self, handle: RecordHandle) -> Option<&mut (dyn PulseGenerator + 'static)> {
        self.records.get_mut(handle.0).map(|r| r.as_mut())
    }

    pub fn find(&self, name: &str) -> Option<RecordHandle> {
        self.by_name.get(name).copied()
    }

    /// Look up a record by name, failing with `NotFound`
    pub fn by_name_mut(
        &mut self,
        name: &str,
    ) -> Result<&mut (dyn PulseGenerator + 'static), MxError> {
        let handle = self
            .find(name)
            .ok_or_else(|| MxError::NotFound(format!("No record named '{name}'")))?;
        self.get_mut(handle)
            .ok_or_else(|| MxError::CorruptDataStructure(format!("Stale handle for '{name}'")))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.records.iter().map(|r| r.core().name.as_str())
    }

    /// Open every record, then run its start-on-open initialization
    pub fn open_all(&mut self, callbacks: Option<&CallbackLoop>) -> Result<(), MxError> {
        for (index, record) in self.records.iter_mut().enumerate() {
            record.open(OpenContext {
                handle: RecordHandle(index),
                callbacks,
            })?;
            info!(
                "Opened {} record '{}' ({})",
                record.driver_name(),
                record.core().name,
                if callbacks.is_some() { "callback mode" } else { "poll mode" }
            );
        }
        for record in self.records.iter_mut() {
            record.initialize()?;
        }
        Ok(())
    }

    /// Stop every busy record, returning the first failure
    pub fn stop_all(&mut self) -> Result<(), MxError> {
        let mut first_error = None;
        for record in self.records.iter_mut() {
            if record.core().busy {
                if let Err(e) = record.stop() {
                    log::error!("Failed to stop '{}': {}", record.core().name, e);
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
