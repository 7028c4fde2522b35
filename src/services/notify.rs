use crate::core::context::AnalysisKind;
use serde::Serialize;
use tokio::sync::broadcast;

/// Progress of one scan, as seen by listeners.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ScanEvent {
    Started,
    Running { file_count: usize },
    KindStarted { kind: AnalysisKind },
    KindFinished { kind: AnalysisKind, suggestions: usize },
    KindFailed { kind: AnalysisKind, reason: String },
    Completed { suggestions: usize },
    Failed { reason: String },
    Cancelled,
}

/// Best-effort event delivery. Publishing never fails the caller.
pub trait NotificationSink: Send + Sync {
    fn publish(&self, scan_id: i64, event: ScanEvent);
}

/// Fans events out to every live subscriber.
pub struct BroadcastSink {
    sender: broadcast::Sender<(i64, ScanEvent)>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<(i64, ScanEvent)> {
        self.sender.subscribe()
    }
}

impl NotificationSink for BroadcastSink {
    fn publish(&self, scan_id: i64, event: ScanEvent) {
        if let Err(broadcast::error::SendError((_, event))) = self.sender.send((scan_id, event)) {
            tracing::debug!("Dropped event for scan {} with no subscribers: {:?}", scan_id, event);
        }
    }
}

pub struct LogSink;

impl NotificationSink for LogSink {
    fn publish(&self, scan_id: i64, event: ScanEvent) {
        match &event {
            ScanEvent::Failed { reason } => tracing::warn!("Scan {} failed: {}", scan_id, reason),
            ScanEvent::KindFailed { kind, reason } => {
                tracing::warn!("Scan {} {} analysis failed: {}", scan_id, kind, reason)
            }
            other => tracing::info!("Scan {}: {:?}", scan_id, other),
        }
    }
}

pub struct NullSink;

impl NotificationSink for NullSink {
    fn publish(&self, _scan_id: i64, _event: ScanEvent) {}
}
