//! Off-thread delivery of topology changes
//!
//! Registry listeners run on whatever thread applied the event, usually a
//! transport reader. `DeferredListener` queues the change and hands it to a
//! dedicated tokio task, so slow follow-up work (re-resolving failover
//! targets, refreshing caches) never holds up event application.

use crate::registry::{TopologyChange, TopologyListener};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Listener that forwards changes to a worker task
pub struct DeferredListener {
    tx: mpsc::UnboundedSender<TopologyChange>,
}

impl DeferredListener {
    /// Spawn the worker running `inner` and return the listener to subscribe.
    ///
    /// The worker exits once the returned listener is dropped (for example
    /// after unsubscribing it) and the queue has drained.
    pub fn spawn<L>(inner: L) -> (Arc<Self>, JoinHandle<()>)
    where
        L: TopologyListener + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<TopologyChange>();

        let handle = tokio::spawn(async move {
            while let Some(change) = rx.recv().await {
                inner.on_topology_change(&change);
            }
            debug!("Deferred topology listener stopped");
        });

        (Arc::new(Self { tx }), handle)
    }
}

impl TopologyListener for DeferredListener {
    fn on_topology_change(&self, change: &TopologyChange) {
        // Worker gone means shutdown; nothing left to notify
        let _ = self.tx.send(change.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::NodeUp;
    use crate::node::Connector;
    use crate::registry::TopologyRegistry;
    use parking_lot::Mutex;

    #[tokio::test]
    async fn test_deferred_listener_delivers_in_order() {
        let registry = TopologyRegistry::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = seen.clone();
        let (listener, handle) = DeferredListener::spawn(move |change: &TopologyChange| {
            sink.lock().push(change.node_id().map(str::to_string));
        });
        let id = registry.subscribe(listener);

        registry.apply_node_up(NodeUp::new(1, "node-1", Connector::new("a", 1)));
        registry.apply_node_up(NodeUp::new(2, "node-2", Connector::new("b", 2)).last());

        // Dropping the last sender stops the worker after the queue drains
        registry.unsubscribe(id);
        handle.await.unwrap();

        assert_eq!(
            *seen.lock(),
            vec![Some("node-1".to_string()), Some("node-2".to_string()), None]
        );
    }
}
