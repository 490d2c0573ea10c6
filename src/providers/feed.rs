//! Resilient WebSocket feed connections.
//!
//! Each logical feed (GPS positions, ETA predictions) gets one connection
//! that reconnects on its own with exponential backoff. Payloads that are
//! not JSON objects carrying a string `busId` are logged and dropped; they
//! never terminate the read loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

/// Channel capacity for raw inbound messages per feed
const MESSAGE_BUFFER: usize = 256;

#[derive(Debug, Clone)]
pub struct FeedConfig {
    /// Short name used in log output (e.g. "gps", "eta")
    pub name: String,
    pub url: String,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

/// Handle to one logical feed connection. Dropping the handle does not close
/// the feed; call [`FeedHandle::close`].
pub struct FeedHandle {
    name: String,
    closed: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl FeedHandle {
    /// Stop the connection and suppress further reconnect attempts.
    /// Idempotent; calling it twice is a no-op.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            info!(feed = %self.name, "Closing feed connection");
            self.task.abort();
        }
    }
}

/// Open a feed and return its handle plus a receiver of validated raw
/// JSON payloads. The connection task runs until [`FeedHandle::close`].
pub fn open(config: FeedConfig) -> (FeedHandle, mpsc::Receiver<serde_json::Value>) {
    let (tx, rx) = mpsc::channel(MESSAGE_BUFFER);
    let closed = Arc::new(AtomicBool::new(false));
    let name = config.name.clone();

    let task = tokio::spawn(run_connection(config, closed.clone(), tx));

    (FeedHandle { name, closed, task }, rx)
}

async fn run_connection(
    config: FeedConfig,
    closed: Arc<AtomicBool>,
    tx: mpsc::Sender<serde_json::Value>,
) {
    let mut attempt: u32 = 0;

    loop {
        if closed.load(Ordering::SeqCst) {
            return;
        }

        match connect_async(&config.url).await {
            Ok((mut stream, _)) => {
                info!(feed = %config.name, url = %config.url, "Feed connected");
                attempt = 0;

                while let Some(frame) = stream.next().await {
                    if closed.load(Ordering::SeqCst) {
                        let _ = stream.close(None).await;
                        return;
                    }
                    match frame {
                        Ok(Message::Text(text)) => {
                            if forward_payload(&config.name, text.as_str(), &tx)
                                .await
                                .is_err()
                            {
                                // Receiver gone, the engine is shutting down
                                return;
                            }
                        }
                        Ok(Message::Ping(_) | Message::Pong(_)) => {}
                        Ok(Message::Close(reason)) => {
                            warn!(feed = %config.name, ?reason, "Feed closed by server");
                            break;
                        }
                        Ok(_) => {
                            debug!(feed = %config.name, "Ignoring non-text frame");
                        }
                        Err(e) => {
                            warn!(feed = %config.name, error = %e, "Feed read error");
                            break;
                        }
                    }
                }
            }
            Err(e) => {
                warn!(feed = %config.name, url = %config.url, error = %e, "Feed connect failed");
            }
        }

        if closed.load(Ordering::SeqCst) {
            return;
        }

        attempt += 1;
        let delay = backoff_delay(config.base_delay, config.max_delay, attempt);
        info!(
            feed = %config.name,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "Reconnecting feed"
        );
        tokio::time::sleep(delay).await;
    }
}

/// Delay before the given reconnect attempt: `min(base * 2^attempt, max)`.
/// The attempt counter starts at 1, so the first retry already waits twice
/// the base delay, which gives dependent state a short settling window.
fn backoff_delay(base: Duration, max: Duration, attempt: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt.min(16))).min(max)
}

/// Parse one wire payload and forward it when it carries the `busId`
/// discriminator. Returns Err only when the receiver side is gone.
async fn forward_payload(
    feed: &str,
    text: &str,
    tx: &mpsc::Sender<serde_json::Value>,
) -> Result<(), ()> {
    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => {
            warn!(feed = %feed, error = %e, "Dropping payload with invalid JSON");
            return Ok(());
        }
    };

    if !value.get("busId").is_some_and(serde_json::Value::is_string) {
        warn!(feed = %feed, "Dropping payload without busId discriminator");
        return Ok(());
    }

    tx.send(value).await.map_err(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_from_base_and_caps_at_max() {
        let base = Duration::from_secs(1);
        let max = Duration::from_secs(30);

        assert_eq!(backoff_delay(base, max, 1), Duration::from_secs(2));
        assert_eq!(backoff_delay(base, max, 2), Duration::from_secs(4));
        assert_eq!(backoff_delay(base, max, 4), Duration::from_secs(16));
        assert_eq!(backoff_delay(base, max, 5), Duration::from_secs(30));
        assert_eq!(backoff_delay(base, max, 20), Duration::from_secs(30));
    }

    #[test]
    fn backoff_stays_within_bounds_for_any_attempt() {
        let base = Duration::from_millis(500);
        let max = Duration::from_secs(30);

        for attempt in 1..64 {
            let delay = backoff_delay(base, max, attempt);
            assert!(delay >= base, "attempt {attempt} below base delay");
            assert!(delay <= max, "attempt {attempt} above max delay");
        }
    }

    #[tokio::test]
    async fn malformed_payloads_are_dropped_without_error() {
        let (tx, mut rx) = mpsc::channel(4);

        assert!(forward_payload("gps", "not json", &tx).await.is_ok());
        assert!(forward_payload("gps", r#"{"noBusId":1}"#, &tx).await.is_ok());
        assert!(forward_payload("gps", r#"{"busId":42}"#, &tx).await.is_ok());
        assert!(forward_payload("gps", r#"{"busId":"B1"}"#, &tx).await.is_ok());

        let value = rx.try_recv().expect("valid payload forwarded");
        assert_eq!(value["busId"], "B1");
        assert!(rx.try_recv().is_err(), "only the valid payload is forwarded");
    }
}
