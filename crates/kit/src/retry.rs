//! Bounded retry with a fixed inter-attempt delay.
//!
//! This is the only retry primitive in the system. Every stage that polls for
//! eventually-consistent remote state (target discoverability, service
//! readiness) goes through [`retry`] with stage-specific attempt counts.

use std::time::Duration;

use tracing::debug;

/// Invoke `action` up to `max_attempts` times, sleeping `delay` between failed
/// attempts. Returns the first success, or the error from the final attempt.
///
/// Attempts are strictly sequential; the sleep happens on the calling thread.
/// No delay is incurred after a success or after the final failure.
pub fn retry<T, E, F>(max_attempts: u32, delay: Duration, mut action: F) -> Result<T, E>
where
    F: FnMut() -> Result<T, E>,
    E: std::fmt::Display,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match action() {
            Ok(v) => {
                debug!("succeeded on attempt {}/{}", attempt, max_attempts);
                return Ok(v);
            }
            Err(e) if attempt < max_attempts => {
                debug!(
                    "attempt {}/{} failed: {}; retrying in {:?}",
                    attempt, max_attempts, e, delay
                );
                attempt += 1;
                std::thread::sleep(delay);
            }
            Err(e) => {
                debug!("attempt {}/{} failed: {}; giving up", attempt, max_attempts, e);
                return Err(e);
            }
        }
    }
}
