//! Task progress and notification back-end.
//!
//! ## Overview
//!
//! Companies work through compliance forms (KYB, KY3P, Open Banking). Each
//! saved field answer recomputes the owning task's completion percentage;
//! changes are persisted to SQLite and pushed to every connected browser
//! session over a WebSocket so badges, sidebars and tab locks update live.
//!
//! ## Module Map
//!
//! ```text
//! ┌──────────┐   HTTP   ┌──────────────────────────────────────────────────┐
//! │  Client  │ ───────> │  server.rs  (axum Router, ServerConfig)          │
//! │ (bridge) │ <─────── │    └─ api.rs  (route handlers, AppState)         │
//! └──────────┘ WebSocket│         │                                        │
//!                       │         │ TaskService::record_response()         │
//!                       │         v                                        │
//!                       │  service.rs  (TaskService)                       │
//!                       │         │                                        │
//!                       │         │ ProgressUpdater::update()              │
//!                       │         v                                        │
//!                       │  updater.rs ──> calculator.rs (pure snapshot)    │
//!                       │         │                                        │
//!                       │         │ EventBroadcaster::publish()            │
//!                       │         v                                        │
//!                       │  ws.rs  (WsMessage, /ws socket loop)             │
//!                       └──────────────────────────────────────────────────┘
//! ```
//!
//! ## Supporting Modules
//!
//! | Module   | Responsibility                                               |
//! |----------|--------------------------------------------------------------|
//! | `models` | Shared types: `Task`, `Company`, `FormResponse`, `TaskStatus`|
//! | `db`     | SQLite access via `DbHandle` (thin `Arc<Mutex<_>>`)          |
//!
//! ## Typical Request Flow (save a field answer)
//!
//! 1. `PUT /api/tasks/{id}/responses/{field_key}` → `api::save_response()`
//! 2. `TaskService::record_response()` rejects locked tasks and keys outside
//!    the task type's form definition, then upserts the response.
//! 3. `ProgressUpdater::update()` loads the task, computes a
//!    `ProgressSnapshot` (percentage + SHA-256 fingerprint of field state)
//!    and writes only when progress, status or fingerprint moved.
//! 4. A write publishes `task_updated`; every `/ws` socket forwards it.
//! 5. Submitting a complete task locks it and, in the same transaction,
//!    recomputes the company's tabs; a change publishes
//!    `company_tabs_updated`.

pub mod api;
pub mod calculator;
pub mod db;
pub mod models;
pub mod server;
pub mod service;
pub mod updater;
pub mod ws;
