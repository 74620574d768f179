//! Retry with re-initialization
//!
//! Card operations fail transiently (a missed token, a CRC error on a noisy
//! bus). [`keep_trying`] repeats an operation; after a run of consecutive
//! failures it re-initializes the device and keeps going, all under one
//! overall deadline.

use embassy_time::{with_timeout, Instant};

use crate::config::RetryPolicy;
use crate::error::SdcError;

/// A device that can be brought back into a known state
#[allow(async_fn_in_trait)]
pub trait Recover {
    async fn recover(&mut self) -> Result<(), SdcError>;
}

/// Run `op` until it succeeds or `policy.timeout` has elapsed
///
/// Every `policy.attempts_before_reinit` consecutive failures trigger
/// [`Recover::recover`]. When the deadline passes the last operation error
/// is returned, or [`SdcError::Timeout`] if the deadline cut an attempt short.
pub async fn keep_trying<D, T>(
    device: &mut D,
    policy: &RetryPolicy,
    mut op: impl AsyncFnMut(&mut D) -> Result<T, SdcError>,
) -> Result<T, SdcError>
where
    D: Recover,
{
    let deadline = Instant::now() + policy.timeout;
    let mut failures = 0u32;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let error = match with_timeout(remaining, op(device)).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) => e,
            Err(_) => {
                error!("Card operation did not finish in time");
                return Err(SdcError::Timeout);
            }
        };

        failures += 1;
        warn!("Card operation failed (attempt {}): {:?}", failures, error);

        if Instant::now() >= deadline {
            error!("Giving up on card operation: {:?}", error);
            return Err(error);
        }

        if failures >= policy.attempts_before_reinit {
            failures = 0;
            warn!("Re-initializing card");
            let remaining = deadline.saturating_duration_since(Instant::now());
            match with_timeout(remaining, device.recover()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Re-initialization failed: {:?}", e),
                Err(_) => {
                    error!("Re-initialization did not finish in time");
                    return Err(SdcError::Timeout);
                }
            }
        }
    }
}
