//! Convergence tests for the topology registry
//!
//! - Any arrival order of NodeUp events yields the same view as ascending order
//! - Re-applying events is a no-op
//! - The synchronized signal fires once, whatever the order
//! - Concurrent writers never lose updates

use halyard_topology::{
    Connector, NodeDown, NodeUp, TopologyChange, TopologyRegistry, TopologySnapshot,
};
use proptest::prelude::*;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

const NODES: [&str; 3] = ["node-a", "node-b", "node-c"];

/// Events with ids 1..=n in ascending order
fn build_events(specs: &[(usize, u16, Option<u16>)]) -> Vec<NodeUp> {
    specs
        .iter()
        .enumerate()
        .map(|(i, (node, port, backup))| {
            let mut up = NodeUp::new(i as u64 + 1, NODES[*node], Connector::new("live", *port));
            if let Some(b) = backup {
                up = up.with_backup(Connector::new("backup", *b));
            }
            up
        })
        .collect()
}

fn apply_all(events: &[NodeUp]) -> TopologySnapshot {
    let registry = TopologyRegistry::new();
    for event in events {
        registry.apply_node_up(event.clone());
    }
    registry.current_view()
}

fn event_specs() -> impl Strategy<Value = Vec<(usize, u16, Option<u16>)>> {
    prop::collection::vec(
        (0..NODES.len(), 1u16..1000, prop::option::of(1u16..1000)),
        1..40,
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn prop_order_independence(
        (events, shuffled) in event_specs()
            .prop_map(|specs| build_events(&specs))
            .prop_flat_map(|events| {
                let shuffled = Just(events.clone()).prop_shuffle();
                (Just(events), shuffled)
            })
    ) {
        let ordered = apply_all(&events).into_nodes();
        let reordered = apply_all(&shuffled).into_nodes();
        prop_assert_eq!(ordered, reordered);
    }

    #[test]
    fn prop_reapplying_is_idempotent(specs in event_specs(), replay_from in 0usize..40) {
        let events = build_events(&specs);
        let registry = TopologyRegistry::new();
        for event in &events {
            registry.apply_node_up(event.clone());
        }
        let before: HashMap<_, _> = registry.current_view().into_nodes();

        let start = replay_from.min(events.len());
        for event in events[start..].iter().chain(events.iter().rev()) {
            prop_assert!(!registry.apply_node_up(event.clone()).is_applied());
        }

        prop_assert_eq!(before, registry.current_view().into_nodes());
    }

    #[test]
    fn prop_synchronized_fires_once(
        shuffled in event_specs()
            .prop_map(|specs| {
                let mut events = build_events(&specs);
                if let Some(last) = events.last_mut() {
                    last.is_last = true;
                }
                events
            })
            .prop_flat_map(|events| Just(events).prop_shuffle())
    ) {
        let registry = TopologyRegistry::new();
        let syncs = Arc::new(AtomicUsize::new(0));
        let counter = syncs.clone();
        registry.subscribe(Arc::new(move |change: &TopologyChange| {
            if *change == TopologyChange::Synchronized {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        }));

        for event in &shuffled {
            registry.apply_node_up(event.clone());
        }
        // Duplicate delivery of the whole burst
        for event in &shuffled {
            registry.apply_node_up(event.clone());
        }

        prop_assert!(registry.is_synchronized());
        prop_assert_eq!(syncs.load(Ordering::SeqCst), 1);
    }
}

#[test]
fn test_resurrection_after_down() {
    let registry = TopologyRegistry::new();
    registry.apply_node_up(NodeUp::new(1, "node-a", Connector::new("old", 1)));
    registry.apply_node_down(NodeDown::new(2, "node-a"));
    registry.apply_node_up(
        NodeUp::new(3, "node-a", Connector::new("new", 2)).with_backup(Connector::new("bk", 3)),
    );

    let entry = registry.get("node-a").unwrap();
    assert!(entry.is_up());
    assert_eq!(entry.live_connector, Connector::new("new", 2));
    assert_eq!(entry.backup_connector, Some(Connector::new("bk", 3)));
}

#[test]
fn test_concurrent_writers_distinct_nodes() {
    const THREADS: u64 = 8;
    const PER_THREAD: u64 = 250;

    let registry = Arc::new(TopologyRegistry::new());

    thread::scope(|s| {
        for t in 0..THREADS {
            let registry = registry.clone();
            s.spawn(move || {
                for i in 0..PER_THREAD {
                    let id = t * PER_THREAD + i + 1;
                    let outcome = registry.apply_node_up(NodeUp::new(
                        id,
                        format!("node-{}-{}", t, i),
                        Connector::new(format!("host-{}", t), i as u16),
                    ));
                    assert!(outcome.is_applied());
                }
            });
        }
    });

    let view = registry.current_view();
    assert_eq!(view.len() as u64, THREADS * PER_THREAD);
    for t in 0..THREADS {
        for i in 0..PER_THREAD {
            let entry = view.get(&format!("node-{}-{}", t, i)).unwrap();
            assert_eq!(entry.last_event_id, t * PER_THREAD + i + 1);
        }
    }
}

#[test]
fn test_concurrent_writers_same_node_keep_highest_id() {
    const THREADS: u64 = 8;
    const PER_THREAD: u64 = 500;

    let registry = Arc::new(TopologyRegistry::new());

    // Thread t delivers ids t+1, t+1+THREADS, ... so streams interleave
    thread::scope(|s| {
        for t in 0..THREADS {
            let registry = registry.clone();
            s.spawn(move || {
                for i in 0..PER_THREAD {
                    let id = i * THREADS + t + 1;
                    registry.apply_node_up(NodeUp::new(
                        id,
                        "shared",
                        Connector::new("live", (id % 1000) as u16),
                    ));
                }
            });
        }
    });

    let max_id = THREADS * PER_THREAD;
    let entry = registry.get("shared").unwrap();
    assert_eq!(entry.last_event_id, max_id);
    assert_eq!(entry.live_connector, Connector::new("live", (max_id % 1000) as u16));
}
