//! End-to-end tests over a real socket: server broadcaster -> /ws -> client
//! hub -> subscriber bridge -> event target.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use taskpulse::bridge::events::EventRecorder;
use taskpulse::bridge::subscriber::WS_MESSAGE_EVENT;
use taskpulse::bridge::{ClientCache, ClientHub, EventTarget, SubscriberBridge};
use taskpulse::config::{TabsSection, WebSocketSection};
use taskpulse::progress::api::AppState;
use taskpulse::progress::db::ProgressDb;
use taskpulse::progress::models::{CompanyCategory, FieldStatus, NewFieldDefinition, TaskType};
use taskpulse::progress::server::{build_router, build_state};
use taskpulse::progress::updater::UpdateOptions;
use tokio_tungstenite::tungstenite::protocol::Message;

async fn spawn_server() -> (SocketAddr, Arc<AppState>) {
    let db = ProgressDb::new_in_memory().unwrap();
    let state = build_state(db, WebSocketSection::default(), TabsSection::default());
    let app = build_router(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, state)
}

async fn wait_until<F: Fn() -> bool>(what: &str, condition: F) {
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {}", what);
}

struct Session {
    hub: ClientHub,
    _bridge: SubscriberBridge,
    recorder: EventRecorder,
    _handles: Vec<taskpulse::bridge::ListenerHandle>,
}

async fn open_session(addr: SocketAddr, company_id: i64, kinds: &[&str]) -> Session {
    let hub = ClientHub::connect(&format!("ws://{}/ws?company_id={}", addr, company_id))
        .await
        .unwrap();
    let target = EventTarget::new();
    let recorder = EventRecorder::new();
    let mut handles = vec![recorder.listen(&target, WS_MESSAGE_EVENT)];
    for kind in kinds {
        handles.push(recorder.listen(&target, kind));
    }
    let mut bridge = SubscriberBridge::new(hub.clone(), target);
    bridge.mount::<&str>(&[]).unwrap();
    Session {
        hub,
        _bridge: bridge,
        recorder,
        _handles: handles,
    }
}

#[tokio::test]
async fn test_tabs_update_reaches_every_session() {
    let (addr, state) = spawn_server().await;
    let company = state
        .service
        .create_company("Acme".into(), CompanyCategory::FinTech, false)
        .await
        .unwrap();

    let a = open_session(addr, company.id, &["company_tabs_updated"]).await;
    let b = open_session(addr, company.id, &["company_tabs_updated"]).await;
    let broadcaster = state.service.broadcaster().clone();
    wait_until("both sockets subscribed", || broadcaster.receiver_count() == 2).await;

    state.service.unlock_file_vault(company.id).await.unwrap();

    for session in [&a, &b] {
        let recorder = session.recorder.clone();
        wait_until("company_tabs_updated event", move || {
            !recorder.named("company_tabs_updated").is_empty()
        })
        .await;

        let specific = session.recorder.named("company_tabs_updated");
        assert_eq!(specific.len(), 1);
        assert_eq!(specific[0].detail["companyId"], company.id);
        assert_eq!(
            specific[0].detail["availableTabs"],
            serde_json::json!(["task-center", "file-vault"])
        );

        let generic: Vec<_> = session
            .recorder
            .named(WS_MESSAGE_EVENT)
            .into_iter()
            .filter(|e| e.detail["type"] == "company_tabs_updated")
            .collect();
        assert_eq!(generic.len(), 1);
        assert_eq!(generic[0].detail["payload"], specific[0].detail);
    }

    a.hub.shutdown().await;
    b.hub.shutdown().await;
}

#[tokio::test]
async fn test_forced_update_broadcasts_small_progress() {
    let (addr, state) = spawn_server().await;
    let svc = &state.service;
    let defs = (0..8)
        .map(|i| NewFieldDefinition {
            task_type: TaskType::CompanyKyb,
            field_key: format!("kyb_{}", i),
            group_name: "Company Profile".into(),
            display_order: i,
            demo_value: None,
        })
        .collect();
    svc.import_fields(defs).await.unwrap();
    let company = svc
        .create_company("Acme".into(), CompanyCategory::FinTech, false)
        .await
        .unwrap();
    let task = svc
        .create_task(company.id, "KYB".into(), TaskType::CompanyKyb)
        .await
        .unwrap();
    assert_eq!(task.progress, 0);

    {
        let db = svc.db().lock_sync().unwrap();
        db.upsert_form_response(task.id, "kyb_0", "Acme Ltd", FieldStatus::Complete)
            .unwrap();
    }

    let session = open_session(addr, company.id, &["task_updated"]).await;
    let cache = ClientCache::new();
    let _feed = cache.attach(&session.hub).unwrap();
    let broadcaster = svc.broadcaster().clone();
    wait_until("socket subscribed", || broadcaster.receiver_count() == 1).await;

    let snap = svc
        .calculate(task.id, Default::default())
        .await
        .unwrap();
    assert_eq!(snap.percentage, 13);

    let outcome = svc
        .update_progress(
            task.id,
            UpdateOptions {
                force_update: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(outcome.task().progress, 13);
    assert_eq!(outcome.task().status.as_str(), "in_progress");

    let recorder = session.recorder.clone();
    wait_until("task_updated event", move || {
        !recorder.named("task_updated").is_empty()
    })
    .await;
    let event = &session.recorder.named("task_updated")[0];
    assert_eq!(event.detail["taskId"], task.id);
    assert_eq!(event.detail["progress"], 13);

    let cache_view = cache.clone();
    wait_until("cache applied", move || {
        cache_view.task(task.id).is_some_and(|t| t.progress == 13)
    })
    .await;

    session.hub.shutdown().await;
}

#[tokio::test]
async fn test_socket_greets_then_sends_initial_data() {
    let (addr, state) = spawn_server().await;
    let company = state
        .service
        .create_company("Acme".into(), CompanyCategory::Bank, false)
        .await
        .unwrap();
    state
        .service
        .create_task(company.id, "Open Banking".into(), TaskType::OpenBanking)
        .await
        .unwrap();

    let url = format!("ws://{}/ws?company_id={}", addr, company.id);
    let (mut stream, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();

    let mut frames = Vec::new();
    while frames.len() < 2 {
        let next = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .expect("frame before timeout")
            .expect("stream open")
            .expect("valid frame");
        if let Message::Text(text) = next {
            frames.push(serde_json::from_str::<serde_json::Value>(&text).unwrap());
        }
    }

    assert_eq!(frames[0]["type"], "connection_established");
    assert!(frames[0]["payload"]["clientId"].as_str().is_some());
    assert_eq!(frames[1]["type"], "initial_data");
    assert_eq!(frames[1]["payload"]["companyId"], company.id);
    assert_eq!(
        frames[1]["payload"]["availableTabs"],
        serde_json::json!(["task-center"])
    );
    assert_eq!(frames[1]["payload"]["tasks"][0]["taskType"], "open_banking");
}
