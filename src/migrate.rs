//! The migration pipeline: enumerate refs under the source label, fetch
//! message content with a bounded ordered worker pool, rewrite label
//! sets, and insert sequentially into the destination.

use std::cmp;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::gmail_api::{list_messages, resolve_label_id, MailApi};
use crate::types::{ListParams, Message, MessageFormat, MessageRef, OutgoingMessage};

/// How many refs are handed to the fetch pool at a time.
const FETCH_BATCH: usize = 50;
/// Progress is logged every this many processed messages.
const PROGRESS_EVERY: u64 = 100;

const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MigrationReport {
    /// Messages now present in the destination, counting duplicates that
    /// were already there.
    pub processed: u64,
    /// The source label's message count when the run started. Advisory
    /// only: the label can drift while the run is in flight.
    pub expected: u64,
    pub failed: Vec<FailedMessage>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FailedMessage {
    pub id: String,
    pub reason: String,
}

/// Copy every message under `source_label` in `src` into `dst`, tagging
/// each with `destination_label` in place of the source label and keeping
/// all other labels verbatim. A failed item is recorded and skipped; only
/// authentication failures and listing failures end the run early.
pub async fn migrate<S, D>(
    src: &S,
    dst: &D,
    source_label: &str,
    destination_label: &str,
    query: Option<&str>,
) -> Result<MigrationReport>
where
    S: MailApi + Clone + 'static,
    D: MailApi + ?Sized,
{
    let src_label_id = resolve_label_id(src, source_label).await?;
    let dst_label_id = resolve_label_id(dst, destination_label).await?;
    let expected = src
        .get_label(&src_label_id)
        .await?
        .messages_total
        .unwrap_or(0);
    info!(
        "migrating label {source_label:?} -> {destination_label:?} ({expected} messages reported by the source)"
    );

    let params = ListParams {
        label_ids: vec![src_label_id.clone()],
        query: query.map(str::to_string),
        ..ListParams::default()
    };
    let workers = num_cpus::get();
    let mut report = MigrationReport {
        expected,
        ..MigrationReport::default()
    };

    let mut batches = Box::pin(list_messages(src, params).chunks(FETCH_BATCH));
    while let Some(batch) = batches.next().await {
        let mut refs = Vec::with_capacity(batch.len());
        for item in batch {
            // A listing failure breaks the page-token chain and the cursor
            // cannot be resumed, so the run stops here.
            refs.push(item?);
        }
        for (message_ref, result) in fetch_batch(src, refs, workers).await {
            let outcome = match result {
                Ok(message) => insert_one(dst, message, &src_label_id, &dst_label_id).await,
                Err(e) => Err(e),
            };
            match outcome {
                Ok(()) => {
                    report.processed += 1;
                    if report.processed % PROGRESS_EVERY == 0 {
                        info!(
                            "migrated {} / {} messages",
                            report.processed, report.expected
                        );
                    }
                }
                Err(e @ Error::Auth(_)) => return Err(e),
                Err(e) => {
                    warn!("message {} failed permanently: {e}", message_ref.id);
                    report.failed.push(FailedMessage {
                        id: message_ref.id,
                        reason: e.to_string(),
                    });
                }
            }
        }
    }

    info!(
        "migration finished: {} / {} messages, {} failed",
        report.processed,
        report.expected,
        report.failed.len()
    );
    Ok(report)
}

/// Fetch a batch of messages with at most `limit` requests in flight.
/// Results come back in dispatch order, whatever order the fetches finish
/// in, and every spawned fetch is awaited before this returns.
async fn fetch_batch<S>(
    src: &S,
    refs: Vec<MessageRef>,
    limit: usize,
) -> Vec<(MessageRef, Result<Message>)>
where
    S: MailApi + Clone + 'static,
{
    let semaphore = Arc::new(Semaphore::new(limit));
    let mut handles = Vec::with_capacity(refs.len());
    for message_ref in refs {
        let client = src.clone();
        let semaphore = semaphore.clone();
        let id = message_ref.id.clone();
        let handle = tokio::spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .map_err(|_| Error::Internal("fetch pool closed".to_string()))?;
            with_retry("fetch message", || {
                client.get_message(&id, MessageFormat::Raw)
            })
            .await
        });
        handles.push((message_ref, handle));
    }

    let mut results = Vec::with_capacity(handles.len());
    for (message_ref, handle) in handles {
        let result = match handle.await {
            Ok(result) => result,
            Err(e) => Err(Error::Internal(format!("fetch task failed: {e}"))),
        };
        results.push((message_ref, result));
    }
    results
}

async fn insert_one<D: MailApi + ?Sized>(
    dst: &D,
    message: Message,
    src_label_id: &str,
    dst_label_id: &str,
) -> Result<()> {
    let message_id = message.id.clone();
    let outgoing = relabel(message, src_label_id, dst_label_id)?;
    match with_retry("insert message", || dst.insert_message(&outgoing)).await {
        Ok(()) => Ok(()),
        Err(Error::Conflict(_)) => {
            warn!("message {message_id} is already present in the destination; skipping");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Build the insertion body: replace the source label id with the
/// destination's wherever it appears, keep every other id verbatim in
/// order, and carry the raw content through untouched.
fn relabel(message: Message, src_label_id: &str, dst_label_id: &str) -> Result<OutgoingMessage> {
    let raw = message.raw.ok_or_else(|| {
        Error::Protocol(format!(
            "message {} came back without raw content",
            message.id
        ))
    })?;
    let label_ids = message
        .label_ids
        .into_iter()
        .map(|id| {
            if id == src_label_id {
                dst_label_id.to_string()
            } else {
                id
            }
        })
        .collect();
    Ok(OutgoingMessage { raw, label_ids })
}

/// Run `operation` with bounded retries and doubling backoff. Only
/// rate-limit and transient failures are retried; everything else comes
/// back from the first attempt.
async fn with_retry<T, F, Fut>(operation: &str, mut call: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut delay = INITIAL_BACKOFF;
    let mut attempt = 1u32;
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt <= MAX_RETRIES => {
                warn!(
                    "{operation} failed (attempt {attempt}/{}): {e}; retrying in {delay:?}",
                    MAX_RETRIES + 1
                );
                tokio::time::sleep(delay).await;
                delay = cmp::min(delay * 2, MAX_BACKOFF);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn message(id: &str, label_ids: &[&str], raw: Option<&str>) -> Message {
        Message {
            id: id.to_string(),
            thread_id: format!("thread-{id}"),
            history_id: Some("12345".to_string()),
            label_ids: label_ids.iter().map(|s| s.to_string()).collect(),
            raw: raw.map(str::to_string),
            snippet: None,
            payload: None,
        }
    }

    #[test]
    fn test_relabel_swaps_only_the_source_label() {
        let out = relabel(
            message("m1", &["INBOX", "Label_src", "STARRED"], Some("cmF3")),
            "Label_src",
            "Label_dst",
        )
        .expect("relabel");
        assert_eq!(out.label_ids, vec!["INBOX", "Label_dst", "STARRED"]);
        assert_eq!(out.raw, "cmF3");
    }

    #[test]
    fn test_relabel_keeps_unrelated_labels_verbatim() {
        let out = relabel(message("m1", &["UNREAD", "IMPORTANT"], Some("cmF3")), "X", "Y")
            .expect("relabel");
        assert_eq!(out.label_ids, vec!["UNREAD", "IMPORTANT"]);
    }

    #[test]
    fn test_relabel_handles_unlabeled_messages() {
        let out = relabel(message("m1", &[], Some("cmF3")), "X", "Y").expect("relabel");
        assert!(out.label_ids.is_empty());
    }

    #[test]
    fn test_relabel_without_raw_content_is_a_protocol_error() {
        let err = relabel(message("m1", &["INBOX"], None), "X", "Y").unwrap_err();
        match err {
            Error::Protocol(reason) => assert!(reason.contains("m1")),
            other => panic!("expected Protocol error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_with_retry_recovers_from_transient_failures() {
        let attempts = AtomicU32::new(0);
        let result = with_retry("test op", || async {
            if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(Error::Transient("flaky".to_string()))
            } else {
                Ok(7)
            }
        })
        .await;
        assert_eq!(result.expect("eventually succeeds"), 7);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_with_retry_gives_up_on_permanent_errors_immediately() {
        let attempts = AtomicU32::new(0);
        let result: Result<()> = with_retry("test op", || async {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(Error::NotFound("gone".to_string()))
        })
        .await;
        assert!(matches!(result, Err(Error::NotFound(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_with_retry_is_bounded() {
        let attempts = AtomicU32::new(0);
        let result: Result<()> = with_retry("test op", || async {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(Error::Quota("slow down".to_string()))
        })
        .await;
        assert!(matches!(result, Err(Error::Quota(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), MAX_RETRIES + 1);
    }
}
