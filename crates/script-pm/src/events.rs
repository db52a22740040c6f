//! Change notification
//!
//! Hosts that display the catalog or the installed list subscribe here and
//! re-read the relevant snapshot when an event arrives. Events are delivered
//! over unbounded channels; a dropped receiver is pruned on the next publish.

use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::trace;

/// Something observable changed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PackageEvent {
    /// Repository index and catalog were rebuilt
    CatalogRefreshed { repositories: usize, modules: usize },
    /// Repository added to the index
    RepositoryAdded { name: String },
    /// Repository removed from the index
    RepositoryRemoved { name: String },
    /// Module installed
    Installed { qualified_name: String },
    /// Module uninstalled
    Uninstalled { qualified_name: String },
    /// Installed module replaced by a newer version
    Updated { qualified_name: String },
}

impl PackageEvent {
    /// Whether the host should reload installed scripts
    pub fn requires_reload(&self) -> bool {
        matches!(
            self,
            PackageEvent::Installed { .. }
                | PackageEvent::Uninstalled { .. }
                | PackageEvent::Updated { .. }
        )
    }
}

/// Fan-out of [`PackageEvent`]s to any number of subscribers
#[derive(Debug, Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<Sender<PackageEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new subscriber
    pub fn subscribe(&self) -> Receiver<PackageEvent> {
        let (tx, rx) = unbounded();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Deliver `event` to every live subscriber
    pub fn publish(&self, event: PackageEvent) {
        let mut subscribers = self.subscribers.lock();
        trace!(?event, subscribers = subscribers.len(), "Publishing event");
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_reaches_all_subscribers() {
        let bus = EventBus::new();
        let a = bus.subscribe();
        let b = bus.subscribe();

        bus.publish(PackageEvent::Installed {
            qualified_name: "a.x".to_string(),
        });

        assert_eq!(
            a.try_recv().unwrap(),
            PackageEvent::Installed {
                qualified_name: "a.x".to_string()
            }
        );
        assert!(b.try_recv().is_ok());
    }

    #[test]
    fn test_dropped_subscriber_pruned() {
        let bus = EventBus::new();
        let kept = bus.subscribe();
        drop(bus.subscribe());
        assert_eq!(bus.subscriber_count(), 2);

        bus.publish(PackageEvent::RepositoryRemoved {
            name: "A".to_string(),
        });
        assert_eq!(bus.subscriber_count(), 1);
        assert!(kept.try_recv().is_ok());
    }

    #[test]
    fn test_requires_reload() {
        assert!(PackageEvent::Updated {
            qualified_name: "a".to_string()
        }
        .requires_reload());
        assert!(!PackageEvent::CatalogRefreshed {
            repositories: 1,
            modules: 1
        }
        .requires_reload());
    }
}
