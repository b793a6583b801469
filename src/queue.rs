//! Job source abstraction and its Redis list implementation.

use anyhow::{Context, Result};
use futures::stream::{self, BoxStream, StreamExt};
use redis::{aio::ConnectionManager, AsyncCommands};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Default Redis list holding issuance requests.
pub const DEFAULT_QUEUE_KEY: &str = "certificate:issue:queue";

/// Seconds BLPOP waits before returning empty-handed.
const POP_TIMEOUT_SECONDS: f64 = 5.0;

/// Back-off after a failed pop before trying again.
const POP_ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// One delivered work item: the raw job payload and where to report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delivery {
    #[serde(rename = "data")]
    pub payload: Value,
    pub callback: String,
}

/// A queue message that could not be turned into a [`Delivery`].
///
/// Without a callback there is nowhere to report, so these only reach logs
/// and the error sink.
#[derive(Debug, Error)]
#[error("malformed queue message: {source}")]
pub struct MalformedMessage {
    pub raw: String,
    #[source]
    pub source: serde_json::Error,
}

impl Delivery {
    pub fn new(payload: Value, callback: impl Into<String>) -> Self {
        Self {
            payload,
            callback: callback.into(),
        }
    }

    pub fn from_message(raw: &str) -> Result<Self, MalformedMessage> {
        serde_json::from_str(raw).map_err(|source| MalformedMessage {
            raw: raw.to_string(),
            source,
        })
    }
}

pub type Incoming = Result<Delivery, MalformedMessage>;

/// Produces the worker's lazy, unbounded sequence of deliveries.
///
/// Consumed once; connection management stays with whoever built the source.
/// Once `shutdown` fires the stream must end, but only between messages: a
/// message already taken off the queue is still yielded.
pub trait JobSource: Send {
    fn deliveries(self, shutdown: CancellationToken) -> BoxStream<'static, Incoming>;
}

/// In-memory streams hold nothing in flight, so they can stop at once.
impl JobSource for BoxStream<'static, Incoming> {
    fn deliveries(self, shutdown: CancellationToken) -> BoxStream<'static, Incoming> {
        Box::pin(self.take_until(shutdown.cancelled_owned()))
    }
}

/// Redis list used as the certificate request queue.
///
/// Producers RPUSH JSON envelopes; the worker BLPOPs them, which removes
/// (acknowledges) the message before processing starts.
pub struct JobQueue {
    /// Redis connection manager for async operations.
    pub conn: ConnectionManager,
    key: String,
}

impl JobQueue {
    pub fn new(conn: ConnectionManager, key: impl Into<String>) -> Self {
        Self {
            conn,
            key: key.into(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Pushes a request onto the queue.
    pub async fn enqueue(&mut self, delivery: &Delivery) -> Result<()> {
        let message = serde_json::to_string(delivery).context("Failed to serialize delivery")?;

        self.conn
            .rpush::<_, _, ()>(&self.key, &message)
            .await
            .context("Failed to push delivery to queue")?;

        info!(queue = %self.key, callback = %delivery.callback, "Enqueued certificate request");
        Ok(())
    }

    /// Pops the next message, waiting up to five seconds.
    ///
    /// Returns `Ok(None)` on timeout. The inner result carries envelope
    /// parse failures, which are not connection errors.
    pub async fn dequeue(&mut self) -> Result<Option<Incoming>> {
        let result: Option<(String, String)> = self
            .conn
            .blpop(&self.key, POP_TIMEOUT_SECONDS)
            .await
            .context("Failed to pop message from queue")?;

        Ok(result.map(|(_key, message)| {
            debug!(queue = %self.key, bytes = message.len(), "Dequeued message");
            Delivery::from_message(&message)
        }))
    }

    /// Returns the current queue length.
    pub async fn queue_length(&mut self) -> Result<usize> {
        let len: usize = self
            .conn
            .llen(&self.key)
            .await
            .context("Failed to get queue length")?;
        Ok(len)
    }
}

/// [`JobSource`] that keeps popping from a [`JobQueue`] forever.
pub struct RedisJobSource {
    queue: JobQueue,
}

impl RedisJobSource {
    pub fn new(queue: JobQueue) -> Self {
        Self { queue }
    }
}

impl JobSource for RedisJobSource {
    /// Checks `shutdown` before each BLPOP and never abandons one in flight,
    /// so stopping takes up to the pop timeout.
    fn deliveries(self, shutdown: CancellationToken) -> BoxStream<'static, Incoming> {
        Box::pin(stream::unfold(
            (self.queue, shutdown),
            |(mut queue, shutdown)| async move {
                loop {
                    if shutdown.is_cancelled() {
                        info!(queue = %queue.key(), "Stopped pulling from queue");
                        return None;
                    }
                    match queue.dequeue().await {
                        Ok(Some(incoming)) => return Some((incoming, (queue, shutdown))),
                        Ok(None) => continue,
                        Err(e) => {
                            error!(queue = %queue.key(), error = %format!("{e:#}"), "Failed to dequeue message");
                            tokio::select! {
                                _ = shutdown.cancelled() => {}
                                _ = tokio::time::sleep(POP_ERROR_BACKOFF) => {}
                            }
                        }
                    }
                }
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_delivery_envelope() {
        let raw = r#"{"data":{"certificateId":"c-1","name":"Demo"},"callback":"https://api.example.com/c/1"}"#;
        let delivery = Delivery::from_message(raw).unwrap();

        assert_eq!(delivery.payload["certificateId"], json!("c-1"));
        assert_eq!(delivery.callback, "https://api.example.com/c/1");
        assert_eq!(
            serde_json::to_value(&delivery).unwrap(),
            serde_json::from_str::<Value>(raw).unwrap()
        );
    }

    #[test]
    fn test_envelope_without_callback_is_malformed() {
        let err = Delivery::from_message(r#"{"data":{}}"#).unwrap_err();
        assert!(err.to_string().contains("callback"));
        assert_eq!(err.raw, r#"{"data":{}}"#);

        assert!(Delivery::from_message("not json").is_err());
    }

    #[tokio::test]
    async fn test_stream_is_a_job_source() {
        let items: Vec<Incoming> = vec![
            Ok(Delivery::new(json!({"n": 1}), "http://cb/1")),
            Delivery::from_message("{}"),
        ];
        let source: BoxStream<'static, Incoming> = Box::pin(stream::iter(items));

        let collected: Vec<Incoming> = source.deliveries(CancellationToken::new()).collect().await;
        assert_eq!(collected.len(), 2);
        assert!(collected[0].is_ok());
        assert!(collected[1].is_err());
    }

    #[tokio::test]
    async fn test_stream_source_ends_on_shutdown() {
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let source: BoxStream<'static, Incoming> = Box::pin(stream::pending());

        assert!(source.deliveries(shutdown).next().await.is_none());
    }

    // These tests require a running Redis instance.
    // Run with: docker run -d -p 6379:6379 redis:7-alpine

    #[tokio::test]
    #[ignore]
    async fn test_enqueue_dequeue() {
        let client = redis::Client::open("redis://127.0.0.1/").unwrap();
        let conn = ConnectionManager::new(client).await.unwrap();
        let mut queue = JobQueue::new(conn, "certificate:test:queue");

        let delivery = Delivery::new(json!({"certificateId": "c-9"}), "http://cb/9");
        queue.enqueue(&delivery).await.unwrap();

        let dequeued = queue.dequeue().await.unwrap().unwrap().unwrap();
        assert_eq!(dequeued, delivery);
    }

    #[tokio::test]
    #[ignore]
    async fn test_redis_source_yields_in_order() {
        let client = redis::Client::open("redis://127.0.0.1/").unwrap();
        let conn = ConnectionManager::new(client).await.unwrap();
        let mut queue = JobQueue::new(conn.clone(), "certificate:test:ordered");

        for n in 0..3 {
            queue
                .enqueue(&Delivery::new(json!({ "n": n }), "http://cb"))
                .await
                .unwrap();
        }

        let source = RedisJobSource::new(JobQueue::new(conn, "certificate:test:ordered"));
        let received: Vec<Incoming> = source
            .deliveries(CancellationToken::new())
            .take(3)
            .collect()
            .await;
        let ns: Vec<Value> = received
            .into_iter()
            .map(|d| d.unwrap().payload["n"].clone())
            .collect();
        assert_eq!(ns, vec![json!(0), json!(1), json!(2)]);
    }

    #[tokio::test]
    #[ignore]
    async fn test_redis_source_keeps_message_popped_before_shutdown() {
        let client = redis::Client::open("redis://127.0.0.1/").unwrap();
        // Separate connections: the consumer's is held by the blocking pop.
        let producer_conn = ConnectionManager::new(client.clone()).await.unwrap();
        let consumer_conn = ConnectionManager::new(client).await.unwrap();
        let mut producer = JobQueue::new(producer_conn, "certificate:test:shutdown");
        let shutdown = CancellationToken::new();

        let source = RedisJobSource::new(JobQueue::new(consumer_conn, "certificate:test:shutdown"));
        let mut deliveries = source.deliveries(shutdown.clone());
        let next = tokio::spawn(async move {
            let first = deliveries.next().await;
            (first, deliveries.next().await)
        });

        // The pop is blocking when shutdown fires; the push then satisfies it.
        tokio::time::sleep(Duration::from_millis(200)).await;
        shutdown.cancel();
        producer
            .enqueue(&Delivery::new(json!({ "n": 1 }), "http://cb"))
            .await
            .unwrap();

        let (first, second) = next.await.unwrap();
        assert_eq!(first.unwrap().unwrap().payload["n"], json!(1));
        assert!(second.is_none());
    }
}
