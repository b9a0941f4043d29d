use crate::errors::PipelineError;
use crate::events::anomaly_event::AnomalyEvent;
use async_trait::async_trait;

#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn notify(&self, event: &AnomalyEvent) -> Result<(), PipelineError>;
}
