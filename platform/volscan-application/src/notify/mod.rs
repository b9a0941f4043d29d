use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use volscan_domain::events::anomaly_event::AnomalyEvent;
use volscan_domain::repositories::alert_sink::AlertSink;

/// Best-effort, at-most-once fan-out of anomaly events to an [`AlertSink`].
///
/// Events go through a bounded queue drained by one background task, so `send` never waits on
/// the transport. When the queue is full the newest event is dropped.
#[derive(Clone)]
pub struct NotificationDispatcher {
    tx: mpsc::Sender<AnomalyEvent>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub queued: usize,
    pub dropped: usize,
}

impl NotificationDispatcher {
    /// Starts the consumer task. It exits once every dispatcher clone is dropped and the queue
    /// is drained.
    pub fn spawn(sink: Arc<dyn AlertSink>, capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<AnomalyEvent>(capacity.max(1));
        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match sink.notify(&event).await {
                    Ok(()) => {
                        metrics::counter!("volscan.notify.sent_total").increment(1);
                        tracing::debug!(symbol = %event.symbol, "anomaly notification sent");
                    }
                    Err(err) => {
                        metrics::counter!("volscan.notify.failed_total").increment(1);
                        tracing::warn!(symbol = %event.symbol, error = %err, "anomaly notification failed");
                    }
                }
            }
            tracing::debug!("notification queue closed");
        });
        (Self { tx }, handle)
    }

    pub fn send(&self, events: Vec<AnomalyEvent>) -> DispatchReport {
        let mut report = DispatchReport::default();
        for event in events {
            match self.tx.try_send(event) {
                Ok(()) => report.queued += 1,
                Err(TrySendError::Full(event)) => {
                    report.dropped += 1;
                    metrics::counter!("volscan.notify.dropped_total", "reason" => "queue_full")
                        .increment(1);
                    tracing::warn!(symbol = %event.symbol, "notification queue full; dropping event");
                }
                Err(TrySendError::Closed(event)) => {
                    report.dropped += 1;
                    metrics::counter!("volscan.notify.dropped_total", "reason" => "closed")
                        .increment(1);
                    tracing::warn!(symbol = %event.symbol, "notification consumer stopped; dropping event");
                }
            }
        }
        report
    }
}
