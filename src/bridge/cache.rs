use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use serde::Deserialize;
use tracing::debug;

use super::hub::{ClientHub, InboundMessage, Subscription};
use crate::errors::BridgeError;
use crate::progress::models::{TaskStatus, TaskType};
use crate::progress::ws::WsMessage;

/// Kinds the cache listens to.
pub const CACHE_KINDS: [&str; 4] = [
    "initial_data",
    "task_created",
    "task_updated",
    "company_tabs_updated",
];

#[derive(Debug, Clone, PartialEq)]
pub struct CachedTask {
    pub task_id: i64,
    pub company_id: Option<i64>,
    pub task_type: Option<TaskType>,
    pub progress: u8,
    pub status: TaskStatus,
}

/// `task_updated` as the cache reads it. Senders other than this server may
/// omit everything but `taskId` and `progress`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskUpdatedFrame {
    task_id: i64,
    progress: u8,
    #[serde(default)]
    company_id: Option<i64>,
    #[serde(default)]
    status: Option<TaskStatus>,
}

#[derive(Default)]
struct CacheState {
    tasks: HashMap<i64, CachedTask>,
    company_tabs: HashMap<i64, Vec<String>>,
}

/// Client-side view of task progress and tab availability.
///
/// Updated only from real-time messages. Applying the same message twice
/// leaves the cache as it was after the first.
#[derive(Clone, Default)]
pub struct ClientCache {
    inner: Arc<Mutex<CacheState>>,
}

impl ClientCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a message into the cache. Returns whether anything changed;
    /// kinds the cache does not track are ignored.
    pub fn apply(&self, msg: &InboundMessage) -> bool {
        if msg.kind == "task_updated" {
            return self.apply_task_updated(msg);
        }
        let parsed: WsMessage = match serde_json::from_value(msg.to_value()) {
            Ok(parsed) => parsed,
            Err(e) => {
                debug!(kind = %msg.kind, error = %e, "cache ignoring message");
                return false;
            }
        };
        let mut state = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        match parsed {
            WsMessage::InitialData {
                company_id,
                available_tabs,
                tasks,
            } => {
                let mut changed = set_tabs(&mut state, company_id, available_tabs);
                for t in tasks {
                    changed |= upsert_task(
                        &mut state,
                        CachedTask {
                            task_id: t.task_id,
                            company_id: Some(company_id),
                            task_type: Some(t.task_type),
                            progress: t.progress,
                            status: t.status,
                        },
                    );
                }
                changed
            }
            WsMessage::TaskCreated {
                task_id,
                company_id,
                task_type,
                progress,
                status,
            } => upsert_task(
                &mut state,
                CachedTask {
                    task_id,
                    company_id: Some(company_id),
                    task_type: Some(task_type),
                    progress,
                    status,
                },
            ),
            WsMessage::TaskUpdated { .. } => false,
            WsMessage::CompanyTabsUpdated {
                company_id,
                available_tabs,
            } => set_tabs(&mut state, company_id, available_tabs),
            WsMessage::ConnectionEstablished { .. } => false,
        }
    }

    /// Missing `companyId` or `status` keep what the cache already knows; an
    /// unknown task without a status gets the one its progress implies.
    fn apply_task_updated(&self, msg: &InboundMessage) -> bool {
        let frame: TaskUpdatedFrame = match serde_json::from_value(msg.payload.clone()) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(kind = %msg.kind, error = %e, "cache ignoring message");
                return false;
            }
        };
        let mut state = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let known = state.tasks.get(&frame.task_id).cloned();
        let status = frame.status.unwrap_or_else(|| {
            let current = known.as_ref().map_or(TaskStatus::NotStarted, |t| t.status);
            if current.is_locked() {
                current
            } else {
                TaskStatus::for_progress(frame.progress.min(100), current)
            }
        });
        upsert_task(
            &mut state,
            CachedTask {
                task_id: frame.task_id,
                company_id: frame.company_id.or(known.as_ref().and_then(|t| t.company_id)),
                task_type: known.as_ref().and_then(|t| t.task_type),
                progress: frame.progress,
                status,
            },
        )
    }

    pub fn task(&self, task_id: i64) -> Option<CachedTask> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .tasks
            .get(&task_id)
            .cloned()
    }

    pub fn company_tabs(&self, company_id: i64) -> Option<Vec<String>> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .company_tabs
            .get(&company_id)
            .cloned()
    }

    pub fn has_tab(&self, company_id: i64, tab: &str) -> bool {
        self.company_tabs(company_id)
            .is_some_and(|tabs| tabs.iter().any(|t| t == tab))
    }

    /// Keep this cache fed from `hub` for as long as the subscription lives.
    pub fn attach(&self, hub: &ClientHub) -> Result<Subscription, BridgeError> {
        let cache = self.clone();
        let kinds: Vec<String> = CACHE_KINDS.iter().map(|k| k.to_string()).collect();
        hub.subscribe(&kinds, move |msg| {
            cache.apply(msg);
        })
    }
}

fn upsert_task(state: &mut CacheState, task: CachedTask) -> bool {
    if state.tasks.get(&task.task_id) == Some(&task) {
        return false;
    }
    state.tasks.insert(task.task_id, task);
    true
}

fn set_tabs(state: &mut CacheState, company_id: i64, tabs: Vec<String>) -> bool {
    if state.company_tabs.get(&company_id) == Some(&tabs) {
        return false;
    }
    state.company_tabs.insert(company_id, tabs);
    true
}
