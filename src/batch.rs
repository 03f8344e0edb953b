//! Batch, Retry, and Compression Layer (C8). See spec §4.7.

use std::future::Future;
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::debug;

use crate::change::SyncError;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

#[derive(Debug, Clone, Copy)]
pub struct BatchOptions {
    pub batch_size: usize,
    pub concurrency: usize,
    pub delay_between_batches: Option<Duration>,
}

/// Splits `items` into fixed-size groups, runs at most `concurrency` groups
/// in parallel, and preserves overall ordering of results.
pub async fn process<T, F, Fut>(
    items: Vec<T>,
    processor: F,
    options: BatchOptions,
) -> Vec<Result<(), SyncError>>
where
    T: Send + 'static,
    F: Fn(Vec<T>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), SyncError>> + Send + 'static,
{
    let batches: Vec<Vec<T>> = items
        .into_iter()
        .fold(Vec::new(), |mut acc: Vec<Vec<T>>, item| {
            if acc.last().map(|b| b.len() >= options.batch_size).unwrap_or(true) {
                acc.push(Vec::new());
            }
            acc.last_mut().unwrap().push(item);
            acc
        });

    let processor = Arc::new(processor);
    let semaphore = Arc::new(Semaphore::new(options.concurrency.max(1)));
    let mut join_set = JoinSet::new();

    for (index, batch) in batches.into_iter().enumerate() {
        let processor = processor.clone();
        let semaphore = semaphore.clone();
        let delay = options.delay_between_batches;
        join_set.spawn(async move {
            let _permit = semaphore.acquire_owned().await.unwrap();
            if let Some(delay) = delay {
                tokio::time::sleep(delay * index as u32).await;
            }
            debug!(batch = index, "processing batch");
            (index, processor(batch).await)
        });
    }

    let mut results: Vec<Option<Result<(), SyncError>>> =
        (0..join_set.len()).map(|_| None).collect();
    while let Some(outcome) = join_set.join_next().await {
        match outcome {
            Ok((index, result)) => {
                if index >= results.len() {
                    results.resize(index + 1, None);
                }
                results[index] = Some(result);
            }
            Err(join_err) => {
                // A panicking batch task surfaces as an Unknown error at
                // whatever slot join_set reports; since we lost the index,
                // append at the end rather than silently dropping it.
                results.push(Some(Err(SyncError::unknown(join_err.to_string()))));
            }
        }
    }

    results.into_iter().map(|r| r.unwrap_or_else(|| Ok(()))).collect()
}

/// Computes a batch size from a target memory ceiling and an estimated
/// per-item byte size.
pub fn auto_size_batch(target_bytes: usize, estimated_item_bytes: usize) -> usize {
    if estimated_item_bytes == 0 {
        return target_bytes.max(1);
    }
    (target_bytes / estimated_item_bytes).max(1)
}

/// Spaces invocations by `ceil(1000/rate)` milliseconds; strictly
/// sequential.
pub async fn process_with_rate_limit<T, F, Fut>(
    items: Vec<T>,
    processor: F,
    items_per_second: f64,
) -> Vec<Result<(), SyncError>>
where
    F: Fn(T) -> Fut,
    Fut: Future<Output = Result<(), SyncError>>,
{
    let delay_ms = (1000.0 / items_per_second).ceil().max(0.0) as u64;
    let mut results = Vec::with_capacity(items.len());
    let mut first = true;
    for item in items {
        if !first {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }
        first = false;
        results.push(processor(item).await);
    }
    results
}

/// Gzips `data` if its length is at or above `threshold`; otherwise returns
/// it unchanged, tagged as not compressed.
pub fn compress_if_above_threshold(data: &[u8], threshold: usize) -> (Vec<u8>, bool) {
    if data.len() < threshold {
        return (data.to_vec(), false);
    }
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).expect("in-memory gzip write cannot fail");
    (encoder.finish().expect("in-memory gzip finish cannot fail"), true)
}

/// Decompresses `data` if it carries the gzip magic bytes; passes raw data
/// through otherwise.
pub fn decompress_if_gzipped(data: &[u8]) -> Result<Vec<u8>, SyncError> {
    if data.len() >= 2 && data[0..2] == GZIP_MAGIC {
        let mut decoder = GzDecoder::new(data);
        let mut out = Vec::new();
        decoder
            .read_to_end(&mut out)
            .map_err(|e| SyncError::validation(format!("invalid gzip payload: {e}")))?;
        Ok(out)
    } else {
        Ok(data.to_vec())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryOptions {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
            factor: 2.0,
        }
    }
}

/// Delay before attempt `n` (1-indexed): `min(initial_delay * factor^(n-1),
/// max_delay)`.
pub fn backoff_delay(options: &RetryOptions, attempt: u32) -> Duration {
    let scaled = options.initial_delay.as_secs_f64() * options.factor.powi(attempt as i32 - 1);
    Duration::from_secs_f64(scaled.min(options.max_delay.as_secs_f64()))
}

/// Retries `op` on retryable errors, waiting `backoff_delay` between
/// attempts, giving up at `max_attempts` and surfacing the last error.
pub async fn retry_with_backoff<T, F, Fut>(
    options: RetryOptions,
    mut op: F,
) -> Result<T, SyncError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SyncError>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < options.max_attempts => {
                let delay = backoff_delay(&options, attempt);
                debug!(attempt, ?delay, "retrying after retryable error");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn process_splits_into_batches_and_preserves_order() {
        let items: Vec<i32> = (0..10).collect();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let results = process(
            items,
            move |batch: Vec<i32>| {
                let seen = seen_clone.clone();
                async move {
                    seen.lock().unwrap().push(batch);
                    Ok(())
                }
            },
            BatchOptions {
                batch_size: 3,
                concurrency: 2,
                delay_between_batches: None,
            },
        )
        .await;
        assert_eq!(results.len(), 4);
        assert!(results.iter().all(|r| r.is_ok()));
    }

    #[test]
    fn auto_size_batch_scales_with_item_size() {
        assert_eq!(auto_size_batch(1_000_000, 1000), 1000);
        assert_eq!(auto_size_batch(1_000_000, 0), 1_000_000);
    }

    #[test]
    fn compress_round_trips_and_respects_threshold() {
        let small = vec![1u8; 10];
        let (out, compressed) = compress_if_above_threshold(&small, 100);
        assert!(!compressed);
        assert_eq!(out, small);

        let large = vec![42u8; 1200];
        let (out, compressed) = compress_if_above_threshold(&large, 100);
        assert!(compressed);
        assert_eq!(&out[0..2], &GZIP_MAGIC);
        let back = decompress_if_gzipped(&out).unwrap();
        assert_eq!(back, large);
    }

    #[test]
    fn decompress_passes_through_uncompressed_data() {
        let raw = vec![1, 2, 3, 4];
        let back = decompress_if_gzipped(&raw).unwrap();
        assert_eq!(back, raw);
    }

    #[test]
    fn backoff_delay_follows_exponential_formula() {
        let options = RetryOptions {
            max_attempts: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            factor: 2.0,
        };
        assert_eq!(backoff_delay(&options, 1), Duration::from_millis(100));
        assert_eq!(backoff_delay(&options, 2), Duration::from_millis(200));
        assert_eq!(backoff_delay(&options, 3), Duration::from_millis(400));
    }

    #[tokio::test]
    async fn retry_gives_up_after_max_attempts_on_retryable_error() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();
        let options = RetryOptions {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            factor: 1.0,
        };
        let result: Result<(), SyncError> = retry_with_backoff(options, move || {
            let attempts = attempts_clone.clone();
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(SyncError::Network {
                    retryable: true,
                    status: None,
                    message: "boom".to_string(),
                })
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_does_not_retry_non_retryable_errors() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();
        let result: Result<(), SyncError> = retry_with_backoff(RetryOptions::default(), move || {
            let attempts = attempts_clone.clone();
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(SyncError::validation("bad input"))
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retry_succeeds_after_transient_failures() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();
        let options = RetryOptions {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            factor: 1.0,
        };
        let result = retry_with_backoff(options, move || {
            let attempts = attempts_clone.clone();
            async move {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(SyncError::Network {
                        retryable: true,
                        status: None,
                        message: "boom".to_string(),
                    })
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }
}
