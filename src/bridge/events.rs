//! Named-event dispatch for UI code that does not own a connection.
//!
//! `EventTarget` mirrors the browser's `addEventListener` / `dispatchEvent`
//! pair: listeners register by event name and are invoked synchronously, in
//! registration order, on the dispatching thread.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub struct CustomEvent {
    pub name: String,
    pub detail: Value,
}

impl CustomEvent {
    pub fn new(name: impl Into<String>, detail: Value) -> Self {
        Self {
            name: name.into(),
            detail,
        }
    }
}

type Listener = Arc<dyn Fn(&CustomEvent) + Send + Sync>;

#[derive(Default)]
struct Listeners {
    next_id: u64,
    by_name: HashMap<String, Vec<(u64, Listener)>>,
}

#[derive(Clone, Default)]
pub struct EventTarget {
    inner: Arc<Mutex<Listeners>>,
}

impl EventTarget {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `listener` for events named `name`. The listener stays
    /// registered until the returned handle is dropped.
    #[must_use = "dropping the handle removes the listener"]
    pub fn add_event_listener<F>(&self, name: &str, listener: F) -> ListenerHandle
    where
        F: Fn(&CustomEvent) + Send + Sync + 'static,
    {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        guard.next_id += 1;
        let id = guard.next_id;
        guard
            .by_name
            .entry(name.to_string())
            .or_default()
            .push((id, Arc::new(listener)));
        ListenerHandle {
            target: Arc::downgrade(&self.inner),
            name: name.to_string(),
            id,
        }
    }

    /// Invoke every listener for `event.name`. Returns how many ran.
    ///
    /// Listeners are snapshotted first, so they may add or remove listeners
    /// without deadlocking.
    pub fn dispatch(&self, event: &CustomEvent) -> usize {
        let listeners: Vec<Listener> = {
            let guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            guard
                .by_name
                .get(&event.name)
                .map(|v| v.iter().map(|(_, l)| l.clone()).collect())
                .unwrap_or_default()
        };
        for listener in &listeners {
            listener(event);
        }
        listeners.len()
    }

    pub fn listener_count(&self, name: &str) -> usize {
        let guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        guard.by_name.get(name).map_or(0, Vec::len)
    }
}

/// Registration token returned by [`EventTarget::add_event_listener`].
pub struct ListenerHandle {
    target: Weak<Mutex<Listeners>>,
    name: String,
    id: u64,
}

impl ListenerHandle {
    pub fn remove(self) {}
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        let Some(target) = self.target.upgrade() else {
            return;
        };
        let mut guard = target.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(list) = guard.by_name.get_mut(&self.name) {
            list.retain(|(id, _)| *id != self.id);
            if list.is_empty() {
                guard.by_name.remove(&self.name);
            }
        }
    }
}

/// Collects every event it sees. Handy for tests and diagnostics.
#[derive(Clone, Default)]
pub struct EventRecorder {
    events: Arc<Mutex<Vec<CustomEvent>>>,
}

impl EventRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start recording events named `name` from `target`.
    #[must_use = "dropping the handle stops recording"]
    pub fn listen(&self, target: &EventTarget, name: &str) -> ListenerHandle {
        let events = self.events.clone();
        target.add_event_listener(name, move |event| {
            events
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(event.clone());
        })
    }

    pub fn events(&self) -> Vec<CustomEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn named(&self, name: &str) -> Vec<CustomEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.name == name)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_dispatch_reaches_matching_listeners_only() {
        let target = EventTarget::new();
        let recorder = EventRecorder::new();
        let _a = recorder.listen(&target, "task_updated");
        let _b = recorder.listen(&target, "company_tabs_updated");

        let ran = target.dispatch(&CustomEvent::new("task_updated", json!({"taskId": 1})));
        assert_eq!(ran, 1);
        assert_eq!(recorder.events().len(), 1);
        assert_eq!(recorder.events()[0].detail["taskId"], 1);
        assert_eq!(target.dispatch(&CustomEvent::new("other", Value::Null)), 0);
    }

    #[test]
    fn test_dropping_handle_removes_listener() {
        let target = EventTarget::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let handle = target.add_event_listener("ws_message", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(target.listener_count("ws_message"), 1);

        target.dispatch(&CustomEvent::new("ws_message", Value::Null));
        handle.remove();
        target.dispatch(&CustomEvent::new("ws_message", Value::Null));

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(target.listener_count("ws_message"), 0);
    }

    #[test]
    fn test_listeners_run_in_registration_order() {
        let target = EventTarget::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let handles: Vec<_> = (0..3)
            .map(|i| {
                let order = order.clone();
                target.add_event_listener("tick", move |_| order.lock().unwrap().push(i))
            })
            .collect();
        target.dispatch(&CustomEvent::new("tick", Value::Null));
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
        drop(handles);
    }

    #[test]
    fn test_listener_may_register_during_dispatch() {
        let target = EventTarget::new();
        let inner_target = target.clone();
        let spawned = Arc::new(Mutex::new(Vec::new()));
        let keep = spawned.clone();
        let _h = target.add_event_listener("boot", move |_| {
            let handle = inner_target.add_event_listener("later", |_| {});
            keep.lock().unwrap().push(handle);
        });
        target.dispatch(&CustomEvent::new("boot", Value::Null));
        assert_eq!(target.listener_count("later"), 1);
    }

    #[test]
    fn test_handle_outliving_target_is_harmless() {
        let target = EventTarget::new();
        let handle = target.add_event_listener("x", |_| {});
        drop(target);
        drop(handle);
    }
}
