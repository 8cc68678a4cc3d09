//! Paced batch delivery of materialized messages.
//!
//! Messages go out in consecutive groups. Every send in a group is in flight at
//! once on the calling task; the next group starts only after the whole group
//! has resolved and the inter-group delay has elapsed. A failed send is
//! recorded against its message and never stops the batch.

use crate::materializer::PreviewMessage;
use chrono::{DateTime, Utc};
use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const DEFAULT_GROUP_SIZE: usize = 3;
pub const DEFAULT_INTER_GROUP_DELAY: Duration = Duration::from_millis(3000);
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(30);

/// Error text recorded for messages skipped by cancellation.
pub const CANCELLED_ERROR: &str = "dispatch cancelled";

/// Successful send acknowledgement.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendReceipt {
    /// Provider-issued message id, when the provider returns one.
    pub message_id: Option<String>,
}

/// A single send that did not go through.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct SendFailure {
    pub message: String,
}

impl SendFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Transport that delivers one message.
#[async_trait::async_trait]
pub trait MessageSender: Send + Sync {
    async fn send(&self, message: &PreviewMessage) -> Result<SendReceipt, SendFailure>;
}

/// Configuration mistakes caught before any message is sent.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("group size must be at least 1")]
    InvalidGroupSize,
}

#[derive(Debug, Clone)]
pub struct DispatchOptions {
    pub group_size: usize,
    pub inter_group_delay: Duration,
    /// Upper bound for a single send; `None` waits as long as the transport does.
    pub send_timeout: Option<Duration>,
    pub cancel: Option<CancellationToken>,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            group_size: DEFAULT_GROUP_SIZE,
            inter_group_delay: DEFAULT_INTER_GROUP_DELAY,
            send_timeout: Some(DEFAULT_SEND_TIMEOUT),
            cancel: None,
        }
    }
}

/// Counters reported after every resolved message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub processed: usize,
    pub total: usize,
    pub sent: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryFailure {
    pub phone_number: String,
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliverySuccess {
    pub phone_number: String,
    pub message_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Outcome of one dispatch run. `sent + failed == total` once the run returns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchResult {
    pub total: usize,
    pub sent: usize,
    pub failed: usize,
    pub errors: Vec<DeliveryFailure>,
    pub success: Vec<DeliverySuccess>,
}

impl BatchResult {
    fn new(total: usize) -> Self {
        Self {
            total,
            sent: 0,
            failed: 0,
            errors: Vec::new(),
            success: Vec::new(),
        }
    }

    pub fn processed(&self) -> usize {
        self.sent + self.failed
    }

    pub fn progress(&self) -> Progress {
        Progress {
            processed: self.processed(),
            total: self.total,
            sent: self.sent,
            failed: self.failed,
        }
    }

    fn record_success(&mut self, message: &PreviewMessage, receipt: SendReceipt) {
        self.sent += 1;
        self.success.push(DeliverySuccess {
            phone_number: message.phone_number.clone(),
            message_id: receipt.message_id,
            timestamp: Utc::now(),
        });
    }

    fn record_failure(&mut self, message: &PreviewMessage, error: String) {
        self.failed += 1;
        self.errors.push(DeliveryFailure {
            phone_number: message.phone_number.clone(),
            error,
            timestamp: Utc::now(),
        });
    }
}

/// Send `messages` through `sender` in paced groups.
///
/// Validity filtering is the caller's job; every message handed in is
/// attempted. `on_progress` runs after each message resolves. The only error
/// returned is a configuration mistake detected before sending starts.
pub async fn dispatch<S, F>(
    messages: &[PreviewMessage],
    sender: &S,
    options: &DispatchOptions,
    mut on_progress: F,
) -> Result<BatchResult, DispatchError>
where
    S: MessageSender + ?Sized,
    F: FnMut(Progress),
{
    if options.group_size == 0 {
        return Err(DispatchError::InvalidGroupSize);
    }

    let mut result = BatchResult::new(messages.len());
    if messages.is_empty() {
        return Ok(result);
    }

    let group_count = messages.len().div_ceil(options.group_size);
    info!(
        "Dispatching {} messages in {} groups of up to {}",
        messages.len(),
        group_count,
        options.group_size
    );

    for (group_idx, group) in messages.chunks(options.group_size).enumerate() {
        let group_start = group_idx * options.group_size;

        if is_cancelled(options) {
            skip_remaining(&mut result, &messages[group_start..], &mut on_progress);
            break;
        }

        debug!(
            "Sending group {}/{} ({} messages)",
            group_idx + 1,
            group_count,
            group.len()
        );

        let mut in_flight: FuturesUnordered<_> = group
            .iter()
            .map(|message| async move {
                let outcome = send_one(sender, message, options.send_timeout).await;
                (message, outcome)
            })
            .collect();

        while let Some((message, outcome)) = in_flight.next().await {
            match outcome {
                Ok(receipt) => {
                    debug!("Sent to {} (id={:?})", message.phone_number, receipt.message_id);
                    result.record_success(message, receipt);
                }
                Err(failure) => {
                    warn!("Send to {} failed: {}", message.phone_number, failure);
                    result.record_failure(message, failure.message);
                }
            }
            on_progress(result.progress());
        }

        let next_start = group_start + group.len();
        if next_start < messages.len() {
            debug!(
                "Waiting {} ms before next group",
                options.inter_group_delay.as_millis()
            );
            if !pace(options.inter_group_delay, options.cancel.as_ref()).await {
                skip_remaining(&mut result, &messages[next_start..], &mut on_progress);
                break;
            }
        }
    }

    info!(
        "Dispatch finished: {} sent, {} failed of {}",
        result.sent, result.failed, result.total
    );
    Ok(result)
}

async fn send_one<S>(
    sender: &S,
    message: &PreviewMessage,
    timeout: Option<Duration>,
) -> Result<SendReceipt, SendFailure>
where
    S: MessageSender + ?Sized,
{
    match timeout {
        Some(limit) => tokio::time::timeout(limit, sender.send(message))
            .await
            .unwrap_or_else(|_| {
                Err(SendFailure::new(format!(
                    "send timed out after {} ms",
                    limit.as_millis()
                )))
            }),
        None => sender.send(message).await,
    }
}

/// Wait out the inter-group delay. Returns false if cancelled first.
async fn pace(delay: Duration, cancel: Option<&CancellationToken>) -> bool {
    match cancel {
        Some(token) => tokio::select! {
            _ = token.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        },
        None => {
            tokio::time::sleep(delay).await;
            true
        }
    }
}

fn is_cancelled(options: &DispatchOptions) -> bool {
    options
        .cancel
        .as_ref()
        .map(CancellationToken::is_cancelled)
        .unwrap_or(false)
}

fn skip_remaining<F: FnMut(Progress)>(
    result: &mut BatchResult,
    remaining: &[PreviewMessage],
    on_progress: &mut F,
) {
    info!("Dispatch cancelled, skipping {} messages", remaining.len());
    for message in remaining {
        result.record_failure(message, CANCELLED_ERROR.to_string());
        on_progress(result.progress());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indexmap::IndexMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::time::Instant;

    fn message(phone: &str) -> PreviewMessage {
        PreviewMessage {
            phone_number: phone.to_string(),
            message: format!("hello {}", phone),
            row_data: IndexMap::new(),
            cells: vec![phone.to_string()],
            is_valid: true,
            errors: Vec::new(),
        }
    }

    fn messages(n: usize) -> Vec<PreviewMessage> {
        (1..=n).map(|i| message(&i.to_string())).collect()
    }

    /// Records when each send starts and how many are in flight at once.
    /// Fails every phone number listed in `failing` with `error`.
    struct RecordingSender {
        started: Mutex<Vec<(String, Instant)>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        latency: Duration,
        failing: Vec<String>,
        error: String,
    }

    impl RecordingSender {
        fn new() -> Self {
            Self {
                started: Mutex::new(Vec::new()),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                latency: Duration::from_millis(50),
                failing: Vec::new(),
                error: String::new(),
            }
        }

        fn failing(mut self, phones: &[&str], error: &str) -> Self {
            self.failing = phones.iter().map(|p| p.to_string()).collect();
            self.error = error.to_string();
            self
        }

        fn with_latency(mut self, latency: Duration) -> Self {
            self.latency = latency;
            self
        }

        fn calls(&self) -> usize {
            self.started.lock().unwrap().len()
        }

        /// Number of sends that started at each distinct instant, in order.
        fn group_sizes(&self) -> Vec<usize> {
            let started = self.started.lock().unwrap();
            let mut sizes: Vec<(Instant, usize)> = Vec::new();
            for (_, at) in started.iter() {
                match sizes.last_mut() {
                    Some((last, count)) if last == at => *count += 1,
                    _ => sizes.push((*at, 1)),
                }
            }
            sizes.into_iter().map(|(_, count)| count).collect()
        }
    }

    #[async_trait::async_trait]
    impl MessageSender for RecordingSender {
        async fn send(&self, message: &PreviewMessage) -> Result<SendReceipt, SendFailure> {
            self.started
                .lock()
                .unwrap()
                .push((message.phone_number.clone(), Instant::now()));
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);

            tokio::time::sleep(self.latency).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if self.failing.contains(&message.phone_number) {
                Err(SendFailure::new(self.error.clone()))
            } else {
                Ok(SendReceipt {
                    message_id: Some(format!("wamid.{}", message.phone_number)),
                })
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_seven_messages_in_groups_of_three() {
        let sender = RecordingSender::new();
        let mut progress = Vec::new();

        let result = dispatch(&messages(7), &sender, &DispatchOptions::default(), |p| {
            progress.push(p)
        })
        .await
        .unwrap();

        assert_eq!(sender.group_sizes(), vec![3, 3, 1]);
        assert_eq!(sender.max_in_flight.load(Ordering::SeqCst), 3);
        assert_eq!(progress.len(), 7);
        assert_eq!(progress.last().unwrap().processed, 7);
        assert!(progress.windows(2).all(|w| w[1].processed == w[0].processed + 1));
        assert_eq!(result.total, 7);
        assert_eq!(result.sent + result.failed, 7);
        assert_eq!(result.success.len(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_groups_are_paced_by_delay() {
        let sender = RecordingSender::new();
        let begin = Instant::now();
        dispatch(&messages(7), &sender, &DispatchOptions::default(), |_| {})
            .await
            .unwrap();

        let started = sender.started.lock().unwrap();
        let latency = sender.latency;
        assert_eq!(started[0].1, begin);
        assert_eq!(started[3].1, begin + latency + DEFAULT_INTER_GROUP_DELAY);
        assert_eq!(started[6].1, begin + (latency + DEFAULT_INTER_GROUP_DELAY) * 2);
        // No trailing wait after the last group.
        assert_eq!(Instant::now(), started[6].1 + latency);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_failure_does_not_stop_batch() {
        let sender = RecordingSender::new().failing(&["2"], "timeout");
        let result = dispatch(&messages(5), &sender, &DispatchOptions::default(), |_| {})
            .await
            .unwrap();

        assert_eq!(sender.calls(), 5);
        assert_eq!(result.failed, 1);
        assert_eq!(result.sent, 4);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].phone_number, "2");
        assert_eq!(result.errors[0].error, "timeout");
        assert!(result.success.iter().all(|s| s.message_id.is_some()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_batch_sends_nothing_and_does_not_wait() {
        let sender = RecordingSender::new();
        let begin = Instant::now();
        let mut calls = 0;
        let result = dispatch(&[], &sender, &DispatchOptions::default(), |_| calls += 1)
            .await
            .unwrap();

        assert_eq!(result, BatchResult::new(0));
        assert_eq!(sender.calls(), 0);
        assert_eq!(calls, 0);
        assert_eq!(Instant::now(), begin);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_group_size_is_rejected() {
        let sender = RecordingSender::new();
        let options = DispatchOptions {
            group_size: 0,
            ..DispatchOptions::default()
        };
        let err = dispatch(&messages(2), &sender, &options, |_| {})
            .await
            .unwrap_err();
        assert_eq!(err, DispatchError::InvalidGroupSize);
        assert_eq!(sender.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_messages_are_still_attempted() {
        let sender = RecordingSender::new();
        let mut batch = messages(2);
        batch[1].is_valid = false;
        let result = dispatch(&batch, &sender, &DispatchOptions::default(), |_| {})
            .await
            .unwrap();
        assert_eq!(sender.calls(), 2);
        assert_eq!(result.sent, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_send_times_out() {
        let sender = RecordingSender::new().with_latency(Duration::from_secs(120));
        let options = DispatchOptions {
            send_timeout: Some(Duration::from_secs(30)),
            ..DispatchOptions::default()
        };
        let result = dispatch(&messages(1), &sender, &options, |_| {})
            .await
            .unwrap();

        assert_eq!(result.failed, 1);
        assert_eq!(result.errors[0].error, "send timed out after 30000 ms");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_pacing_skips_remaining() {
        let sender = RecordingSender::new();
        let token = CancellationToken::new();
        let options = DispatchOptions {
            cancel: Some(token.clone()),
            ..DispatchOptions::default()
        };
        let mut progress_calls = 0;

        let result = dispatch(&messages(7), &sender, &options, |p| {
            progress_calls += 1;
            if p.processed == 3 {
                token.cancel();
            }
        })
        .await
        .unwrap();

        assert_eq!(sender.calls(), 3);
        assert_eq!(result.sent, 3);
        assert_eq!(result.failed, 4);
        assert_eq!(result.sent + result.failed, result.total);
        assert!(result.errors.iter().all(|e| e.error == CANCELLED_ERROR));
        assert_eq!(progress_calls, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_before_start_sends_nothing() {
        let sender = RecordingSender::new();
        let token = CancellationToken::new();
        token.cancel();
        let options = DispatchOptions {
            cancel: Some(token),
            ..DispatchOptions::default()
        };
        let result = dispatch(&messages(4), &sender, &options, |_| {})
            .await
            .unwrap();

        assert_eq!(sender.calls(), 0);
        assert_eq!(result.failed, 4);
    }
}
