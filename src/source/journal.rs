use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Placeholder for following a systemd unit's journal.
///
/// It reports readiness and then yields no lines until cancelled.
pub struct JournalSource {
    name: String,
}

impl JournalSource {
    pub fn new(service: &str) -> Self {
        Self {
            name: format!("journal:{service}"),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn run(self, ctx: CancellationToken) -> Result<()> {
        info!(source = %self.name, "journal source ready");
        ctx.cancelled().await;
        Ok(())
    }
}
