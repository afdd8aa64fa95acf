//! Session rebinding after failover

use crate::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// Recreates application sessions on a freshly established connection
///
/// Called exactly once per successful reconnection, after the connection is
/// CONNECTED and installed as current. An error is surfaced as
/// [`ClientEvent::RebindFailed`](crate::ClientEvent::RebindFailed); the
/// transport stays connected.
#[async_trait]
pub trait SessionRebinder<C>: Send + Sync + 'static
where
    C: Send + Sync + 'static,
{
    async fn rebind(&self, connection: Arc<C>) -> Result<()>;
}

/// Rebinder for applications without server-side session state
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopRebinder;

#[async_trait]
impl<C> SessionRebinder<C> for NoopRebinder
where
    C: Send + Sync + 'static,
{
    async fn rebind(&self, _connection: Arc<C>) -> Result<()> {
        Ok(())
    }
}
