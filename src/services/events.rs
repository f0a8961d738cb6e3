use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{broadcast, Mutex};
use uuid::Uuid;

use crate::{
    error::ApiError,
    models::ScanStatus,
    repositories::ScanRepository,
};

// ============================================================================
// Event bus - server-push fan-out for scan lifecycle events
// ============================================================================

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ScanEvent {
    ScanLog {
        scan_id: Uuid,
        line: String,
    },
    ScanProgress {
        scan_id: Uuid,
        status: ScanStatus,
        percent: f64,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    ScanComplete {
        scan_id: Uuid,
        status: ScanStatus,
    },
}

/// Broadcast bus connecting scan workers to SSE subscribers. Publishing
/// never blocks and never fails; events to a bus with no subscribers are
/// simply dropped.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ScanEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ScanEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: ScanEvent) {
        let _ = self.tx.send(event);
    }

    pub fn scan_log(&self, scan_id: Uuid, line: impl Into<String>) {
        self.publish(ScanEvent::ScanLog {
            scan_id,
            line: line.into(),
        });
    }

    pub fn scan_complete(&self, scan_id: Uuid, status: ScanStatus) {
        self.publish(ScanEvent::ScanComplete { scan_id, status });
    }
}

// ============================================================================
// Progress reporter - persist-then-broadcast progress for one scan
// ============================================================================

/// Reports lifecycle progress for a single scan. Percent is clamped to be
/// monotonically non-decreasing, the status must follow the lifecycle
/// transition table (repeats of the current status are fine), and every
/// update is persisted before it is broadcast so a crashed broadcast can
/// never leave the database behind the stream.
pub struct ProgressReporter {
    scan_id: Uuid,
    repo: Arc<dyn ScanRepository>,
    bus: EventBus,
    last: Mutex<(ScanStatus, f64)>,
}

impl ProgressReporter {
    pub fn new(scan_id: Uuid, repo: Arc<dyn ScanRepository>, bus: EventBus) -> Self {
        Self {
            scan_id,
            repo,
            bus,
            last: Mutex::new((ScanStatus::Pending, 0.0)),
        }
    }

    pub fn scan_id(&self) -> Uuid {
        self.scan_id
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn log_line(&self, line: &str) {
        self.bus.scan_log(self.scan_id, line);
    }

    pub async fn emit(
        &self,
        status: ScanStatus,
        percent: f64,
        message: Option<&str>,
    ) -> Result<(), ApiError> {
        let percent = {
            let mut last = self.last.lock().await;
            let (last_status, last_percent) = *last;
            if status != last_status && !last_status.can_transition_to(status) {
                return Err(ApiError::internal(format!(
                    "invalid scan state transition: {} -> {}",
                    last_status, status
                )));
            }
            let clamped = percent.clamp(last_percent, 100.0);
            *last = (status, clamped);
            clamped
        };

        self.repo
            .update_progress(&self.scan_id, status, percent)
            .await?;

        self.bus.publish(ScanEvent::ScanProgress {
            scan_id: self.scan_id,
            status,
            percent,
            message: message.map(String::from),
        });

        Ok(())
    }
}
