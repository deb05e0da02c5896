use std::time::Duration;

use async_trait::async_trait;

use crate::talk::Pipeline;
use crate::talk::error::TalkError;
use crate::talk::scheduled_tasks::Task;

/// Pings the store's health endpoint and updates the shared online flag.
pub(crate) struct ConnectivityProbe {
    interval: Duration,
}

impl ConnectivityProbe {
    pub(crate) fn new(interval: Duration) -> Self {
        Self { interval }
    }
}

#[async_trait]
impl Task for ConnectivityProbe {
    fn name(&self) -> &'static str {
        "connectivity_probe"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn execute(&self, pipeline: &Pipeline) -> Result<(), TalkError> {
        let online = pipeline.connectivity.probe(pipeline.store.as_ref()).await;
        tracing::trace!(
            target: "talk::scheduler::connectivity_probe",
            "Probe finished, online: {}",
            online
        );
        Ok(())
    }
}
