//! Acquires payload bytes, preferring the content addressed cache and
//! verifying everything that comes off the network before it is cached or
//! handed downstream.

use crate::{catalog::PayloadRecord, pipeline::Cancel, util::Sha256, Ctx, Error};
use bytes::Bytes;
use sha2::Digest as _;
use std::{io::Read as _, time::Duration};

/// Retry budget and backoff shape for transient download failures
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts per payload, including the first
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff, capped, plus uniform jitter of up to half the
    /// capped delay so a burst of failed workers does not retry in lockstep
    pub(crate) fn delay(&self, prior_attempts: u32) -> Duration {
        use rand::Rng as _;

        let capped = self
            .base_delay
            .saturating_mul(1u32 << prior_attempts.min(16))
            .min(self.max_delay);

        capped + capped.mul_f64(rand::thread_rng().gen_range(0.0..=0.5))
    }
}

/// Where a payload's bytes came from
#[derive(Debug, Copy, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FetchSource {
    Cache,
    Network,
}

pub struct Fetched {
    pub contents: Bytes,
    pub source: FetchSource,
    /// Network attempts made, zero for a cache hit
    pub attempts: u32,
}

enum DownloadError {
    Transient(Box<dyn std::error::Error + Send + Sync>),
    Fatal(u16),
    Cancelled,
}

/// Statuses worth retrying, everything else non-2xx is a definitive no
#[inline]
fn transient_status(code: u16) -> bool {
    matches!(code, 408 | 429 | 500..=599)
}

fn download(
    ctx: &Ctx,
    payload: &PayloadRecord,
    cancel: &Cancel,
    progress: &indicatif::ProgressBar,
) -> Result<(Bytes, Sha256), DownloadError> {
    let response = ctx.agent.get(&payload.url).call().map_err(|err| match err {
        ureq::Error::Status(code, _) if transient_status(code) => {
            DownloadError::Transient(format!("HTTP status {code}").into())
        }
        ureq::Error::Status(code, _) => DownloadError::Fatal(code),
        ureq::Error::Transport(transport) => DownloadError::Transient(Box::new(transport)),
    })?;

    let mut reader = response.into_reader();
    let mut hasher = sha2::Sha256::new();
    let mut contents = Vec::with_capacity(payload.size as usize);
    let mut chunk = [0u8; 64 * 1024];

    loop {
        if cancel.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }

        let read = reader
            .read(&mut chunk)
            .map_err(|e| DownloadError::Transient(Box::new(e)))?;
        if read == 0 {
            break;
        }

        hasher.update(&chunk[..read]);
        contents.extend_from_slice(&chunk[..read]);
        progress.inc(read as u64);
    }

    Ok((contents.into(), Sha256(hasher.finalize().into())))
}

/// Sleeps in small slices so a raised cancellation flag is observed quickly
fn backoff_sleep(cancel: &Cancel, total: Duration) -> Result<(), Error> {
    let slice = Duration::from_millis(50);
    let mut remaining = total;

    while !remaining.is_zero() {
        cancel.check()?;
        let nap = remaining.min(slice);
        std::thread::sleep(nap);
        remaining -= nap;
    }

    cancel.check()
}

/// Obtains a payload's verified bytes, from the cache when possible.
///
/// The digest is computed incrementally while the body streams, transient
/// failures retry within the context's [`RetryPolicy`], and only bytes whose
/// digest matches the catalog's declaration are cached or returned. A
/// mismatch is terminal for the run, the corrupted bytes are dropped.
pub fn fetch_payload(
    ctx: &Ctx,
    payload: &PayloadRecord,
    cancel: &Cancel,
    progress: &indicatif::ProgressBar,
) -> Result<Fetched, Error> {
    cancel.check()?;

    if let Some(contents) = ctx.cache.get(&payload.sha256) {
        tracing::debug!(payload = %payload.file_name, "cache hit");
        progress.inc(contents.len() as u64);
        return Ok(Fetched {
            contents,
            source: FetchSource::Cache,
            attempts: 0,
        });
    }

    let mut attempts = 0u32;
    let (contents, actual) = loop {
        attempts += 1;
        cancel.check()?;

        match download(ctx, payload, cancel, progress) {
            Ok(downloaded) => break downloaded,
            Err(DownloadError::Cancelled) => return Err(Error::Cancelled),
            Err(DownloadError::Fatal(status)) => {
                return Err(Error::FatalFetchError {
                    payload: payload.file_name.clone(),
                    status,
                });
            }
            Err(DownloadError::Transient(source)) => {
                if attempts >= ctx.retry.max_attempts {
                    return Err(Error::TransientFetchError {
                        payload: payload.file_name.clone(),
                        attempts,
                        source,
                    });
                }

                let delay = ctx.retry.delay(attempts - 1);
                tracing::warn!(
                    payload = %payload.file_name,
                    attempt = attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %source,
                    "transient fetch failure, retrying",
                );

                backoff_sleep(cancel, delay)?;
                progress.set_position(0);
            }
        }
    };

    if actual != payload.sha256 {
        return Err(Error::IntegrityMismatch {
            payload: payload.file_name.clone(),
            expected: payload.sha256,
            actual,
        });
    }

    ctx.cache.put(&payload.sha256, &contents)?;

    tracing::debug!(
        payload = %payload.file_name,
        size = contents.len(),
        attempts,
        "fetched and verified",
    );

    Ok(Fetched {
        contents,
        source: FetchSource::Network,
        attempts,
    })
}
