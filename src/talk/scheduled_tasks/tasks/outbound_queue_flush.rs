use std::time::Duration;

use async_trait::async_trait;

use crate::talk::Pipeline;
use crate::talk::error::TalkError;
use crate::talk::scheduled_tasks::Task;

/// Periodic queue pass, so `failed` entries below the retry ceiling are
/// retried while online even when nothing else triggers a flush.
pub(crate) struct OutboundQueueFlush {
    interval: Duration,
}

impl OutboundQueueFlush {
    pub(crate) fn new(interval: Duration) -> Self {
        Self { interval }
    }
}

#[async_trait]
impl Task for OutboundQueueFlush {
    fn name(&self) -> &'static str {
        "outbound_queue_flush"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn execute(&self, pipeline: &Pipeline) -> Result<(), TalkError> {
        if pipeline.queue.is_empty() {
            return Ok(());
        }

        let report = pipeline.flush_outbound_queue().await;
        if !report.skipped {
            tracing::debug!(
                target: "talk::scheduler::outbound_queue_flush",
                "Flushed queue: {} delivered, {} failed, {} left",
                report.delivered,
                report.failed,
                pipeline.queue.len()
            );
        }
        Ok(())
    }
}
