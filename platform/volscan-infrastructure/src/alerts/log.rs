use async_trait::async_trait;
use volscan_domain::errors::PipelineError;
use volscan_domain::events::anomaly_event::AnomalyEvent;
use volscan_domain::repositories::alert_sink::AlertSink;

/// Writes anomalies to the tracing output only.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn notify(&self, event: &AnomalyEvent) -> Result<(), PipelineError> {
        tracing::warn!(
            target: "volscan::alert",
            symbol = %event.symbol,
            timestamp = event.timestamp,
            volume = event.observed_volume,
            mean = event.baseline_mean,
            std_dev = event.baseline_std_dev,
            k = event.z_score_threshold,
            "volume anomaly"
        );
        Ok(())
    }
}
