pub mod aggregated;
pub mod dispatch;

use anyhow::Result;

use self::dispatch::Dispatcher;

/// Sink consumes telemetry records and exports them.
pub trait Sink: Send {
    /// Returns the sink's name for logging.
    fn name(&self) -> &str;

    /// Spawn the sink's worker.
    fn start(
        &mut self,
        ctx: tokio_util::sync::CancellationToken,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Release the sink's own queue handle and wait for the worker to drain.
    fn stop(&mut self) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Returns a handle sources use to feed records into the sink.
    fn dispatcher(&self) -> Dispatcher;
}
