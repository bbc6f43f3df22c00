use crossbeam_channel::{Receiver, RecvTimeoutError};
use log::info;
use serde::{de::DeserializeOwned, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use std::{io::Write, path::PathBuf};

use crate::error::MxError;

/// Buffered JSONL writer for transition records
#[derive(Debug)]
pub struct EventLogger<T>
where
    T: Serialize + DeserializeOwned,
{
    buffer: Vec<T>,
    buffer_size: usize,
    file_path: PathBuf,
    final_format_json: bool, // If true, convert to a JSON array on finalize
    flush_failures: usize,
    max_flush_failures: usize,
}

impl<T> EventLogger<T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn new<P: Into<PathBuf>>(
        file_path: P,
        buffer_size: usize,
        final_format_json: bool,
    ) -> Self {
        let mut path = file_path.into();

        let extension = if final_format_json { "json" } else { "jsonl" };
        if path.extension() != Some(std::ffi::OsStr::new(extension)) {
            path.set_extension(extension);
        }

        Self {
            buffer: Vec::with_capacity(buffer_size),
            buffer_size: buffer_size.max(1),
            file_path: path,
            final_format_json,
            flush_failures: 0,
            max_flush_failures: 10,
        }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.file_path
    }

    pub fn add(&mut self, data: T) -> Result<(), MxError> {
        self.buffer.push(data);

        if self.buffer.len() >= self.buffer_size {
            self.flush()?;
        }

        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), MxError> {
        if self.buffer.is_empty() {
            return Ok(());
        }

        let result = (|| {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.file_path)?;
            let mut writer = std::io::BufWriter::new(file);
            for data in &self.buffer {
                let json_line = serde_json::to_string(data)?;
                writeln!(writer, "{}", json_line)?;
            }
            writer.flush()?;
            Ok::<(), MxError>(())
        })();

        match result {
            Ok(()) => {
                self.flush_failures = 0;
                log::debug!(
                    "Flushed {} events to {:?}",
                    self.buffer.len(),
                    self.file_path
                );
                self.buffer.clear();
                Ok(())
            }
            Err(e) => {
                self.flush_failures += 1;
                log::error!(
                    "Flush failure {}/{}: {}",
                    self.flush_failures,
                    self.max_flush_failures,
                    e
                );

                if self.flush_failures % 3 == 0 {
                    log::warn!(
                        "Experiencing intermittent flush failures ({}/{})",
                        self.flush_failures,
                        self.max_flush_failures
                    );
                }

                if self.flush_failures >= self.max_flush_failures {
                    return Err(MxError::Io(std::io::Error::other(format!(
                        "Too many consecutive flush failures ({}) for {:?}: {}",
                        self.max_flush_failures, self.file_path, e
                    ))));
                }

                // A transient failure keeps the events buffered for the next flush
                Ok(())
            }
        }
    }

    /// Rewrite the JSONL file as a pretty JSON array
    pub fn finalize_as_json(&mut self) -> Result<(), MxError> {
        if !self.final_format_json {
            return Ok(());
        }

        self.flush()?;
        if !self.file_path.exists() {
            return Ok(());
        }

        let content = std::fs::read_to_string(&self.file_path)?;
        if content.trim_start().starts_with('[') {
            return Ok(());
        }

        let mut entries = Vec::new();
        for line in content.lines() {
            if !line.trim().is_empty() {
                let data: T = serde_json::from_str(line)?;
                entries.push(data);
            }
        }

        let json_output = serde_json::to_string_pretty(&entries)?;
        std::fs::write(&self.file_path, json_output)?;

        info!("Converted {} entries from JSONL to JSON format", entries.len());
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

impl<T> Drop for EventLogger<T>
where
    T: Serialize + DeserializeOwned,
{
    fn drop(&mut self) {
        let _ = self.flush();
        let _ = self.finalize_as_json();
    }
}

/// Background thread moving events from a channel into an `EventLogger`
///
/// Events are written while the producers run, so neither the channel nor
/// the logger buffer grows past `buffer_size`.
pub struct EventRecorder {
    recording_thread: Option<JoinHandle<Result<usize, MxError>>>,
    shutdown_signal: Arc<AtomicBool>,
}

impl EventRecorder {
    pub fn spawn<T>(receiver: Receiver<T>, mut logger: EventLogger<T>) -> Self
    where
        T: Serialize + DeserializeOwned + Send + 'static,
    {
        let shutdown_signal = Arc::new(AtomicBool::new(false));
        let shutdown_clone = shutdown_signal.clone();

        let recording_thread = thread::spawn(move || -> Result<usize, MxError> {
            log::debug!("Recording events to {:?}", logger.path());
            let mut count = 0;

            while !shutdown_clone.load(Ordering::Relaxed) {
                match receiver.recv_timeout(Duration::from_millis(100)) {
                    Ok(event) => {
                        logger.add(event)?;
                        count += 1;
                    }
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }

            for event in receiver.try_iter() {
                logger.add(event)?;
                count += 1;
            }
            logger.flush()?;
            Ok(count)
        });

        Self {
            recording_thread: Some(recording_thread),
            shutdown_signal,
        }
    }

    /// Write out whatever is still queued and stop, returning the event count
    pub fn finish(mut self) -> Result<usize, MxError> {
        self.shutdown_signal.store(true, Ordering::Relaxed);
        match self.recording_thread.take() {
            Some(handle) => handle.join().map_err(|_| {
                MxError::Io(std::io::Error::other("Event recording thread panicked"))
            })?,
            None => Ok(0),
        }
    }
}

impl Drop for EventRecorder {
    fn drop(&mut self) {
        self.shutdown_signal.store(true, Ordering::Relaxed);
        if let Some(handle) = self.recording_thread.take() {
            let _ = handle.join();
        }
    }
}
