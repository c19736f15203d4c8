#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use carto_core::NamespacedName;
use carto_store::{DependencyTracker, GroupKind, Key};

fn template(name: &str) -> Key {
    Key::new(GroupKind::new("carto.run", "ClusterTemplate"), NamespacedName::cluster(name))
}

#[test]
fn concurrent_writers_converge() {
    let tracker = Arc::new(DependencyTracker::new(Duration::from_secs(3600)));
    let handles: Vec<_> = (0..8)
        .map(|i| {
            let t = Arc::clone(&tracker);
            std::thread::spawn(move || {
                let owner = NamespacedName::new("ns", format!("w{}", i));
                for round in 0..50 {
                    t.clear_tracked(&owner);
                    t.track(template("shared"), owner.clone());
                    t.track(template(&format!("own-{}", i)), owner.clone());
                    if round % 7 == 0 {
                        let _ = t.lookup(&template("shared"));
                    }
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let shared = tracker.lookup(&template("shared"));
    assert_eq!(shared.len(), 8);
    for i in 0..8 {
        let own = tracker.lookup(&template(&format!("own-{}", i)));
        assert_eq!(own.as_slice(), &[NamespacedName::new("ns", format!("w{}", i))]);
    }
}

#[test]
fn reconcile_style_retracking_replaces_edges() {
    let tracker = DependencyTracker::new(Duration::from_secs(3600));
    let owner = NamespacedName::new("w1", "app");
    tracker.track(template("old-tpl"), owner.clone());

    // Next pass references a different template only.
    tracker.clear_tracked(&owner);
    tracker.track(template("new-tpl"), owner.clone());

    assert!(tracker.lookup(&template("old-tpl")).is_empty());
    assert_eq!(tracker.lookup(&template("new-tpl")).len(), 1);
}
