// ABOUTME: In-process publish/subscribe bus for registry change events
// ABOUTME: Delivers via a task boundary so publishers never re-enter listeners

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

use crate::model::RegistryChangeEvent;

type Listener = Arc<dyn Fn(RegistryChangeEvent) + Send + Sync>;

/// A set of listener closures with snapshotted iteration and isolated
/// failure: one listener panicking or erroring never aborts the others,
/// and publishers dispatch through a channel so they never re-enter a
/// listener synchronously (spec section 9, "in-memory pub/sub").
#[derive(Clone)]
pub struct ChangeBus {
    listeners: Arc<DashMap<Uuid, Listener>>,
    sender: mpsc::UnboundedSender<RegistryChangeEvent>,
}

impl ChangeBus {
    #[must_use]
    pub fn new() -> Self {
        let listeners: Arc<DashMap<Uuid, Listener>> = Arc::new(DashMap::new());
        let (sender, mut receiver) = mpsc::unbounded_channel::<RegistryChangeEvent>();
        let listeners_for_task = listeners.clone();
        tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                let snapshot: Vec<Listener> =
                    listeners_for_task.iter().map(|entry| entry.value().clone()).collect();
                for listener in snapshot {
                    // Isolate panics from one listener so others still run.
                    let event = event.clone();
                    let listener = listener.clone();
                    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                        listener(event);
                    }));
                    if result.is_err() {
                        warn!("change bus listener panicked");
                    }
                }
            }
        });
        Self { listeners, sender }
    }

    /// Register a listener, returning an id that can be used to unsubscribe.
    pub fn subscribe<F>(&self, listener: F) -> Uuid
    where
        F: Fn(RegistryChangeEvent) + Send + Sync + 'static,
    {
        let id = Uuid::new_v4();
        self.listeners.insert(id, Arc::new(listener));
        id
    }

    pub fn unsubscribe(&self, id: Uuid) {
        self.listeners.remove(&id);
    }

    /// Publish an event; delivery happens on the bus's own task, never
    /// inline with the caller.
    pub fn publish(&self, event: RegistryChangeEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for ChangeBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ChangeAction;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn delivers_to_all_listeners_and_survives_panics() {
        let bus = ChangeBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        bus.subscribe(move |_| {
            count2.fetch_add(1, Ordering::SeqCst);
        });
        bus.subscribe(|_| panic!("listener failure"));
        bus.publish(RegistryChangeEvent {
            origin_id: "a".into(),
            action: ChangeAction::Create,
            target: Some("dynamic.greeter".into()),
            schema: None,
            timestamp: chrono::Utc::now(),
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
