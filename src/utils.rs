use std::time::{Duration, Instant};

use crate::error::MxError;
use crate::pulse_generator::PulseGenerator;

/// Error type for polling operations
#[derive(Debug)]
pub enum PollError<E> {
    /// Operation timed out
    Timeout,
    /// Error occurred in the condition/operation function
    ConditionError(E),
}

impl<E> std::fmt::Display for PollError<E>
where
    E: std::fmt::Display,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PollError::Timeout => write!(f, "Operation timed out"),
            PollError::ConditionError(e) => write!(f, "Condition error: {}", e),
        }
    }
}

impl<E> std::error::Error for PollError<E>
where
    E: std::error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PollError::Timeout => None,
            PollError::ConditionError(e) => Some(e),
        }
    }
}

/// Poll a condition with timeout
///
/// Repeatedly calls `condition` until it returns `Ok(true)` or timeout is reached.
///
/// # Arguments
/// * `condition` - Function that returns `Ok(true)` when complete, `Ok(false)` to continue polling
/// * `timeout` - Maximum duration to wait
/// * `poll_interval` - Duration to sleep between condition checks
///
/// # Returns
/// * `Ok(())` when condition returns `Ok(true)`
/// * `Err(PollError::Timeout)` when timeout is reached
/// * `Err(PollError::ConditionError(e))` when condition returns an error
///
/// # Example
/// ```
/// use std::time::Duration;
/// use mx_pulser::utils::poll_until;
///
/// let mut count = 0;
/// poll_until(
///     || {
///         count += 1;
///         Ok::<bool, ()>(count >= 3)
///     },
///     Duration::from_secs(1),
///     Duration::from_millis(1),
/// )
/// .unwrap();
/// ```
pub fn poll_until<F, E>(
    mut condition: F,
    timeout: Duration,
    poll_interval: Duration,
) -> Result<(), PollError<E>>
where
    F: FnMut() -> Result<bool, E>,
{
    let start = Instant::now();

    loop {
        if start.elapsed() >= timeout {
            return Err(PollError::Timeout);
        }

        match condition() {
            Ok(true) => return Ok(()),
            Ok(false) => {
                std::thread::sleep(poll_interval);
            }
            Err(e) => return Err(PollError::ConditionError(e)),
        }
    }
}

/// Wait for a pulse generator to report idle
///
/// Returns `MxError::Timeout` if the train is still running after `timeout`.
/// The pulser is left running in that case.
pub fn wait_until_idle(
    pulser: &mut dyn PulseGenerator,
    timeout: Duration,
    poll_interval: Duration,
) -> Result<(), MxError> {
    poll_until(|| pulser.is_busy().map(|busy| !busy), timeout, poll_interval).map_err(|e| match e {
        PollError::Timeout => MxError::Timeout,
        PollError::ConditionError(e) => e,
    })
}
