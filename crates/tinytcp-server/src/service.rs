//! Start/stop contract for long-running services.

use std::future::Future;

use async_trait::async_trait;
use tracing::info;

use crate::ServerError;

/// A service a supervisor can start and stop.
///
/// `start` serves until the service is stopped and only returns an error
/// for fatal failures. `stop` is idempotent and may be called before,
/// during or after `start`.
#[async_trait]
pub trait Service: Send + Sync {
    /// Run until stopped.
    async fn start(&self) -> Result<(), ServerError>;

    /// Request shutdown and wait for it to complete.
    async fn stop(&self);
}

/// Run `service` until it ends by itself or `shutdown` resolves.
///
/// On shutdown the service is stopped and its `start` result returned.
///
/// # Errors
///
/// Whatever the service's `start` returns.
pub async fn run_until<S, F>(service: &S, shutdown: F) -> Result<(), ServerError>
where
    S: Service + ?Sized,
    F: Future<Output = ()>,
{
    let start = service.start();
    tokio::pin!(start);

    tokio::select! {
        result = &mut start => {
            service.stop().await;
            return result;
        },
        () = shutdown => info!("Shutdown requested"),
    }

    service.stop().await;
    start.await
}
