//! Republishes hub messages as named events on an [`EventTarget`].

use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use super::events::{CustomEvent, EventTarget};
use super::hub::{ClientHub, InboundMessage, Subscription};
use crate::errors::BridgeError;

/// Name of the event dispatched for every message, whatever its kind.
pub const WS_MESSAGE_EVENT: &str = "ws_message";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Uninitialized,
    Subscribing,
    Subscribed,
    Resubscribing,
    TornDown,
}

/// Sorted, de-duplicated filter list. Empty means every kind.
pub fn normalize_filters<S: AsRef<str>>(filters: &[S]) -> Vec<String> {
    let mut out: Vec<String> = filters.iter().map(|f| f.as_ref().to_string()).collect();
    out.sort_unstable();
    out.dedup();
    out
}

/// Content hash of a filter list; equal contents give equal hashes
/// regardless of order, duplicates or the container they came in.
pub fn filter_hash<S: AsRef<str>>(filters: &[S]) -> String {
    let normalized = normalize_filters(filters);
    let mut hasher = Sha256::new();
    if normalized.is_empty() {
        hasher.update(b"*");
    }
    for filter in &normalized {
        hasher.update(filter.as_bytes());
        hasher.update(b"\n");
    }
    format!("{:x}", hasher.finalize())
}

/// Dispatch `ws_message` (detail: the whole frame) and an event named after
/// the kind (detail: the payload).
pub fn republish(target: &EventTarget, msg: &InboundMessage) {
    target.dispatch(&CustomEvent::new(WS_MESSAGE_EVENT, msg.to_value()));
    target.dispatch(&CustomEvent::new(msg.kind.clone(), msg.payload.clone()));
}

/// Bridges one [`ClientHub`] to one [`EventTarget`].
///
/// `render` may be called as often as the owning view re-renders; only a
/// change in filter contents replaces the underlying subscription.
pub struct SubscriberBridge {
    hub: ClientHub,
    target: EventTarget,
    state: BridgeState,
    filter_hash: Option<String>,
    subscription: Option<Subscription>,
}

impl SubscriberBridge {
    pub fn new(hub: ClientHub, target: EventTarget) -> Self {
        Self {
            hub,
            target,
            state: BridgeState::Uninitialized,
            filter_hash: None,
            subscription: None,
        }
    }

    pub fn state(&self) -> BridgeState {
        self.state
    }

    pub fn filter_hash(&self) -> Option<&str> {
        self.filter_hash.as_deref()
    }

    pub fn target(&self) -> &EventTarget {
        &self.target
    }

    pub fn mount<S: AsRef<str>>(&mut self, filters: &[S]) -> Result<(), BridgeError> {
        self.render(filters)
    }

    /// Ensure a subscription for `filters` exists.
    ///
    /// On failure the error is logged, the bridge returns to
    /// `Uninitialized` and nothing is retried until the next call.
    pub fn render<S: AsRef<str>>(&mut self, filters: &[S]) -> Result<(), BridgeError> {
        if self.state == BridgeState::TornDown {
            return Err(BridgeError::TornDown);
        }
        let hash = filter_hash(filters);
        if self.state == BridgeState::Subscribed && self.filter_hash.as_deref() == Some(hash.as_str()) {
            return Ok(());
        }

        self.state = if self.state == BridgeState::Subscribed {
            BridgeState::Resubscribing
        } else {
            BridgeState::Subscribing
        };
        // Release the old registration before creating its replacement.
        self.subscription = None;
        self.filter_hash = None;

        let normalized = normalize_filters(filters);
        let target = self.target.clone();
        match self
            .hub
            .subscribe(&normalized, move |msg| republish(&target, msg))
        {
            Ok(subscription) => {
                debug!(filters = ?normalized, id = subscription.id(), "bridge subscribed");
                self.subscription = Some(subscription);
                self.filter_hash = Some(hash);
                self.state = BridgeState::Subscribed;
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, filters = ?normalized, "bridge subscription failed");
                self.state = BridgeState::Uninitialized;
                Err(e)
            }
        }
    }

    pub fn unmount(&mut self) {
        self.subscription = None;
        self.filter_hash = None;
        self.state = BridgeState::TornDown;
    }
}

impl Drop for SubscriberBridge {
    fn drop(&mut self) {
        self.unmount();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::events::EventRecorder;

    #[test]
    fn test_filter_hash_ignores_order_and_duplicates() {
        assert_eq!(
            filter_hash(&["task_updated", "company_tabs_updated"]),
            filter_hash(&["company_tabs_updated", "task_updated", "task_updated"])
        );
        assert_ne!(filter_hash(&["task_updated"]), filter_hash::<&str>(&[]));
        assert_eq!(filter_hash::<String>(&[]), filter_hash::<&str>(&[]));
    }

    #[test]
    fn test_mount_subscribes_wildcard_by_default() {
        let hub = ClientHub::new();
        let mut bridge = SubscriberBridge::new(hub.clone(), EventTarget::new());
        assert_eq!(bridge.state(), BridgeState::Uninitialized);

        bridge.mount::<&str>(&[]).unwrap();
        assert_eq!(bridge.state(), BridgeState::Subscribed);
        assert_eq!(hub.subscription_count(), 1);
        assert_eq!(hub.deliver(r#"{"type":"anything"}"#).unwrap(), 1);
    }

    #[test]
    fn test_rerender_with_equal_filters_keeps_one_subscription() {
        let hub = ClientHub::new();
        let mut bridge = SubscriberBridge::new(hub.clone(), EventTarget::new());

        let filters = vec!["task_updated".to_string()];
        bridge.mount(&filters).unwrap();
        let first_hash = bridge.filter_hash().map(str::to_string);

        // Same instance.
        bridge.render(&filters).unwrap();
        assert_eq!(hub.subscription_count(), 1);

        // New instance with equal contents.
        let fresh = vec!["task_updated".to_string()];
        bridge.render(&fresh).unwrap();
        assert_eq!(hub.subscription_count(), 1);
        assert_eq!(bridge.filter_hash().map(str::to_string), first_hash);
        assert_eq!(bridge.state(), BridgeState::Subscribed);
    }

    #[test]
    fn test_changed_filters_replace_subscription() {
        let hub = ClientHub::new();
        let target = EventTarget::new();
        let recorder = EventRecorder::new();
        let _h = recorder.listen(&target, WS_MESSAGE_EVENT);
        let mut bridge = SubscriberBridge::new(hub.clone(), target);

        bridge.mount(&["task_updated"]).unwrap();
        bridge.render(&["company_tabs_updated"]).unwrap();
        assert_eq!(hub.subscription_count(), 1);
        assert_eq!(bridge.state(), BridgeState::Subscribed);

        hub.deliver(r#"{"type":"task_updated","payload":{}}"#).unwrap();
        assert!(recorder.events().is_empty());
        hub.deliver(r#"{"type":"company_tabs_updated","payload":{}}"#)
            .unwrap();
        assert_eq!(recorder.events().len(), 1);
    }

    #[test]
    fn test_each_message_dispatches_two_events() {
        let hub = ClientHub::new();
        let target = EventTarget::new();
        let recorder = EventRecorder::new();
        let _a = recorder.listen(&target, WS_MESSAGE_EVENT);
        let _b = recorder.listen(&target, "company_tabs_updated");
        let mut bridge = SubscriberBridge::new(hub.clone(), target);
        bridge.mount::<&str>(&[]).unwrap();

        hub.deliver(
            r#"{"type":"company_tabs_updated","data":{"companyId":7,"availableTabs":["task-center","file-vault"]}}"#,
        )
        .unwrap();

        let generic = recorder.named(WS_MESSAGE_EVENT);
        assert_eq!(generic.len(), 1);
        assert_eq!(generic[0].detail["type"], "company_tabs_updated");
        assert_eq!(generic[0].detail["payload"]["companyId"], 7);

        let specific = recorder.named("company_tabs_updated");
        assert_eq!(specific.len(), 1);
        assert_eq!(specific[0].detail, generic[0].detail["payload"]);
    }

    #[test]
    fn test_subscription_error_leaves_bridge_uninitialized() {
        let hub = ClientHub::new();
        hub.close();
        let mut bridge = SubscriberBridge::new(hub.clone(), EventTarget::new());
        let err = bridge.mount(&["task_updated"]).unwrap_err();
        assert!(matches!(err, BridgeError::Closed));
        assert_eq!(bridge.state(), BridgeState::Uninitialized);
        assert!(bridge.filter_hash().is_none());
    }

    #[test]
    fn test_unmount_tears_down() {
        let hub = ClientHub::new();
        let mut bridge = SubscriberBridge::new(hub.clone(), EventTarget::new());
        bridge.mount(&["task_updated"]).unwrap();
        bridge.unmount();
        assert_eq!(bridge.state(), BridgeState::TornDown);
        assert_eq!(hub.subscription_count(), 0);
        assert!(matches!(
            bridge.render(&["task_updated"]),
            Err(BridgeError::TornDown)
        ));
    }

    #[test]
    fn test_drop_unsubscribes() {
        let hub = ClientHub::new();
        {
            let mut bridge = SubscriberBridge::new(hub.clone(), EventTarget::new());
            bridge.mount::<&str>(&[]).unwrap();
            assert_eq!(hub.subscription_count(), 1);
        }
        assert_eq!(hub.subscription_count(), 0);
    }
}
