//! Client side of the real-time channel.
//!
//! A process holds one [`ClientHub`] (one WebSocket). UI-facing code never
//! touches the socket: a [`SubscriberBridge`] republishes hub messages as
//! named events on an [`EventTarget`], and a [`ClientCache`] folds them into
//! the local view of task progress and company tabs.
//!
//! | Module       | Responsibility                                        |
//! |--------------|-------------------------------------------------------|
//! | `hub`        | Connection, registry keyed by kind, `Subscription`    |
//! | `events`     | `EventTarget` / `CustomEvent` listener dispatch       |
//! | `subscriber` | `SubscriberBridge` state machine, filter hashing      |
//! | `cache`      | `ClientCache`, idempotent message application         |

pub mod cache;
pub mod events;
pub mod hub;
pub mod subscriber;

pub use cache::ClientCache;
pub use events::{CustomEvent, EventTarget, ListenerHandle};
pub use hub::{ClientHub, InboundMessage, Subscription};
pub use subscriber::{BridgeState, SubscriberBridge};
