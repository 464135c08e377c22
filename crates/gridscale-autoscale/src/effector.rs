//! Effector seam — where bounded actions leave the engine.
//!
//! The engine never talks to a cloud or cluster API itself. Hosts plug in
//! an [`Effector`] that resizes an instance group or patches a pod's
//! resources.

use std::future::Future;
use std::pin::Pin;

use tracing::info;

use gridscale_core::Capacity;

/// Boxed future returned by [`Effector::apply`].
pub type ApplyFuture<'a> = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'a>>;

/// Applies a new capacity to an external system.
///
/// Called at most once per applied decision. Failures are reported to
/// the host and never retried within the same tick.
pub trait Effector: Send + Sync {
    fn apply<'a>(&'a self, target_id: &'a str, capacity: &'a Capacity) -> ApplyFuture<'a>;
}

/// Effector that only logs the action. Used for dry runs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogEffector;

impl Effector for LogEffector {
    fn apply<'a>(&'a self, target_id: &'a str, capacity: &'a Capacity) -> ApplyFuture<'a> {
        Box::pin(async move {
            info!(%target_id, %capacity, "dry-run: would apply capacity");
            Ok(())
        })
    }
}
