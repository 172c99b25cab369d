use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, Instrument};

use super::{LogCursor, LogStore, RawLogDocument};
use crate::config::LogsConfig;
use crate::error::{EventflowError, Result};
use crate::models::{LogCriteria, LogEntry, LogsSelector};
use crate::store::EventStore;

/// Point and tailing retrieval of Worker and Job logs.
#[derive(Clone)]
pub struct LogStreamer {
    events: Arc<dyn EventStore>,
    logs: Arc<dyn LogStore>,
    poll_interval: Duration,
    buffer: usize,
}

impl std::fmt::Debug for LogStreamer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogStreamer")
            .field("poll_interval", &self.poll_interval)
            .field("buffer", &self.buffer)
            .finish()
    }
}

fn decode(document: RawLogDocument) -> Result<LogEntry> {
    serde_json::from_value(document).map_err(EventflowError::from)
}

impl LogStreamer {
    pub fn new(events: Arc<dyn EventStore>, logs: Arc<dyn LogStore>, config: &LogsConfig) -> Self {
        Self {
            events,
            logs,
            poll_interval: config.poll_interval(),
            buffer: config.stream_buffer.max(1),
        }
    }

    /// Every matching entry stored so far, in insertion order.
    #[instrument(skip(self, selector), fields(job = ?selector.job, container = ?selector.container))]
    pub async fn get_logs(&self, event_id: &str, selector: &LogsSelector) -> Result<Vec<LogEntry>> {
        self.events.get(event_id).await?;
        let criteria = selector.criteria(event_id);
        self.logs
            .find(&criteria)
            .await?
            .into_iter()
            .map(decode)
            .collect()
    }

    /// Live stream of matching entries. The stream ends when `cancel` fires,
    /// when the receiver is dropped, or after an undecodable entry.
    #[instrument(skip(self, selector, cancel), fields(job = ?selector.job, container = ?selector.container))]
    pub async fn stream_logs(
        &self,
        event_id: &str,
        selector: &LogsSelector,
        cancel: CancellationToken,
    ) -> Result<ReceiverStream<LogEntry>> {
        self.events.get(event_id).await?;
        let criteria = selector.criteria(event_id);
        let (tx, rx) = mpsc::channel(self.buffer);

        let producer = LogTail {
            logs: Arc::clone(&self.logs),
            criteria,
            poll_interval: self.poll_interval,
            tx,
            cancel,
        };
        tokio::spawn(producer.run().in_current_span());

        Ok(ReceiverStream::new(rx))
    }
}

/// Producer behind one `stream_logs` call.
struct LogTail {
    logs: Arc<dyn LogStore>,
    criteria: LogCriteria,
    poll_interval: Duration,
    tx: mpsc::Sender<LogEntry>,
    cancel: CancellationToken,
}

impl LogTail {
    async fn run(self) {
        let Some(mut cursor) = self.open_live_cursor().await else {
            return;
        };
        debug!(criteria = ?self.criteria, "📜 Log stream live");

        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            match cursor.try_next().await {
                Ok(Some(document)) => {
                    let entry = match decode(document) {
                        Ok(entry) => entry,
                        Err(e) => {
                            error!(criteria = ?self.criteria, "Undecodable log entry, closing stream: {}", e);
                            break;
                        }
                    };
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        sent = self.tx.send(entry) => {
                            if sent.is_err() {
                                break;
                            }
                        }
                    }
                }
                Ok(None) => {
                    if !self.pause().await {
                        break;
                    }
                }
                Err(e) => {
                    error!(criteria = ?self.criteria, "Log cursor failed, closing stream: {}", e);
                    break;
                }
            }
        }
        info!(criteria = ?self.criteria, "📜 Log stream closed");
    }

    /// Keeps reopening the tail until it is live. `None` when the stream
    /// should stop instead.
    async fn open_live_cursor(&self) -> Option<Box<dyn LogCursor>> {
        loop {
            let opened = tokio::select! {
                _ = self.cancel.cancelled() => return None,
                opened = self.logs.tail(&self.criteria) => opened,
            };
            match opened {
                Ok(cursor) if !cursor.is_dead() => return Some(cursor),
                Ok(_) => debug!(criteria = ?self.criteria, "Log cursor dead on open, retrying"),
                Err(e) => {
                    error!(criteria = ?self.criteria, "Failed to open log cursor: {}", e);
                    return None;
                }
            }
            if !self.pause().await {
                return None;
            }
        }
    }

    /// Waits one poll interval. `false` when canceled or abandoned.
    async fn pause(&self) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = self.tx.closed() => false,
            _ = tokio::time::sleep(self.poll_interval) => true,
        }
    }
}
