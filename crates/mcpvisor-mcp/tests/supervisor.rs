//! Supervisor lifecycle tests against real short-lived Unix processes.
#![cfg(unix)]

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use mcpvisor_config::{ConfigStore, ConfigStoreOptions};
use mcpvisor_core::{
    EventBus, McpErrorCategory, McpEvent, ServerConfigUpdate, ToolCallError, WorkerStatus,
};
use mcpvisor_mcp::{ReconcileAction, Supervisor, SupervisorError, SupervisorOptions};
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::sync::broadcast;

/// Speaks just enough MCP over stdio: one tool named `echo` that answers `pong`.
const FAKE_MCP_WORKER: &str = r#"
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9][0-9]*\).*/\1/p')
  case "$line" in
    *'"method":"initialize"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":"2024-11-05","serverInfo":{"name":"fake"},"capabilities":{"tools":{}}}}\n' "$id" ;;
    *'"method":"tools/list"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"echo","description":"Echo"}]}}\n' "$id" ;;
    *'"method":"tools/call"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"pong"}]}}\n' "$id" ;;
  esac
done
"#;

struct Harness {
    _dir: TempDir,
    store: Arc<ConfigStore>,
    supervisor: Supervisor,
    bus: EventBus,
}

fn options() -> SupervisorOptions {
    SupervisorOptions {
        startup_grace: Duration::from_millis(200),
        stop_timeout: Duration::from_secs(2),
        restart_delay: Duration::from_millis(50),
        restart_backoff: Duration::from_millis(300),
        auto_restart: true,
        handshake_timeout: Duration::from_millis(300),
        tool_call_timeout: Duration::from_secs(2),
    }
}

fn harness(servers: Value) -> Harness {
    harness_with(servers, options())
}

fn harness_with(servers: Value, options: SupervisorOptions) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mcp.json");
    fs::write(&path, json!({ "mcpServers": servers }).to_string()).unwrap();

    let bus = EventBus::new();
    let store = Arc::new(ConfigStore::new(
        ConfigStoreOptions::new(path),
        Arc::new(bus.clone()),
    ));
    store.initialize().unwrap();
    let supervisor = Supervisor::new(Arc::clone(&store), options, Arc::new(bus.clone()));

    Harness {
        _dir: dir,
        store,
        supervisor,
        bus,
    }
}

fn sleeper() -> Value {
    json!({"command": "sleep", "args": ["30"]})
}

fn shell(script: &str) -> Value {
    json!({"command": "sh", "args": ["-c", script]})
}

/// Wait for the first event matching `pred`, failing the test after `within`.
async fn expect_event<F>(rx: &mut broadcast::Receiver<McpEvent>, within: Duration, pred: F) -> McpEvent
where
    F: Fn(&McpEvent) -> bool,
{
    tokio::time::timeout(within, async {
        loop {
            let event = rx.recv().await.unwrap();
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

fn is_started(name: &str) -> impl Fn(&McpEvent) -> bool + '_ {
    move |e| matches!(e, McpEvent::ServerStarted { server_name, .. } if server_name == name)
}

fn is_stopped(name: &str) -> impl Fn(&McpEvent) -> bool + '_ {
    move |e| matches!(e, McpEvent::ServerStopped { server_name, .. } if server_name == name)
}

#[tokio::test]
async fn test_two_enabled_one_disabled() {
    let h = harness(json!({
        "A": sleeper(),
        "B": sleeper(),
        "C": {"command": "sleep", "args": ["30"], "disabled": true}
    }));
    let mut rx = h.bus.subscribe();

    let results = h.supervisor.initialize().await;
    assert_eq!(results.len(), 2);

    let all = h.supervisor.get_all_servers().await;
    let names: Vec<&str> = all.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["A", "B"]);
    assert!(all.iter().all(|s| s.status == WorkerStatus::Running));
    assert!(h.supervisor.get_server("C").await.is_none());

    let summary = h.supervisor.status_summary().await;
    assert_eq!(summary.total_configured, 3);
    assert_eq!(summary.enabled, 2);
    assert_eq!(summary.running, 2);
    assert_eq!(summary.errored, 0);

    let status = h.supervisor.get_server_status().await;
    assert!(status["A"].pid.is_some());

    h.supervisor.shutdown().await;
    assert!(h.supervisor.get_all_servers().await.is_empty());

    let mut stopped = 0;
    while let Ok(event) = rx.try_recv() {
        if matches!(event, McpEvent::ServerStopped { .. }) {
            stopped += 1;
        }
    }
    assert_eq!(stopped, 2);
}

#[tokio::test]
async fn test_early_exit_ends_in_error() {
    let h = harness(json!({"crash": shell("exit 3")}));
    let mut rx = h.bus.subscribe();

    let config = h.store.entry("crash").unwrap();
    let err = h.supervisor.start_server("crash", config).await.unwrap_err();
    assert!(matches!(err, SupervisorError::StartupCrashed { .. }));

    let snap = h.supervisor.get_server("crash").await.unwrap();
    assert_eq!(snap.status, WorkerStatus::Error);
    assert_eq!(snap.last_exit.and_then(|e| e.code), Some(3));
    assert!(snap.last_error.unwrap().contains("exit code 3"));

    match rx.try_recv().unwrap() {
        McpEvent::ServerError { error } => {
            assert_eq!(error.server_name, "crash");
            assert_eq!(error.category, McpErrorCategory::StartupCrash);
        }
        other => panic!("expected server_error, got {other:?}"),
    }
    assert_eq!(h.supervisor.status_summary().await.errored, 1);
}

#[tokio::test]
async fn test_spawn_failure_ends_in_error() {
    let h = harness(json!({"ghost": {"command": "/nonexistent/mcpvisor-test-binary"}}));
    let mut rx = h.bus.subscribe();

    let results = h.supervisor.initialize().await;
    assert!(matches!(
        results[0].1,
        Err(SupervisorError::SpawnFailed { .. })
    ));

    let snap = h.supervisor.get_server("ghost").await.unwrap();
    assert_eq!(snap.status, WorkerStatus::Error);
    assert!(snap.pid.is_none());

    match rx.try_recv().unwrap() {
        McpEvent::ServerError { error } => assert_eq!(error.category, McpErrorCategory::Spawn),
        other => panic!("expected server_error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_one_failure_does_not_affect_others() {
    let h = harness(json!({
        "bad": {"command": "/nonexistent/mcpvisor-test-binary"},
        "good": sleeper()
    }));

    h.supervisor.initialize().await;
    assert_eq!(
        h.supervisor.get_server("good").await.unwrap().status,
        WorkerStatus::Running
    );
    assert_eq!(
        h.supervisor.get_server("bad").await.unwrap().status,
        WorkerStatus::Error
    );
    h.supervisor.shutdown().await;
}

#[tokio::test]
async fn test_call_tool_preconditions() {
    let h = harness(json!({"a": sleeper()}));
    h.supervisor.initialize().await;

    assert_eq!(
        h.supervisor.call_tool("ghost", "x", json!({})).await.unwrap_err(),
        ToolCallError::ServerNotFound("ghost".to_string())
    );
    assert_eq!(
        h.supervisor.call_tool("a", "x", json!({})).await.unwrap_err(),
        ToolCallError::CapabilityUnavailable("a".to_string())
    );

    h.supervisor.stop_server("a").await;
    assert_eq!(
        h.supervisor.get_server("a").await.unwrap().status,
        WorkerStatus::Stopped
    );
    assert_eq!(
        h.supervisor.call_tool("a", "x", json!({})).await.unwrap_err(),
        ToolCallError::ServerNotRunning("a".to_string())
    );
}

#[tokio::test]
async fn test_crash_is_auto_restarted() {
    let h = harness(json!({"flaky": shell("sleep 1; exit 1")}));
    let mut rx = h.bus.subscribe();

    h.supervisor.initialize().await;
    let first = h.supervisor.get_server("flaky").await.unwrap().pid;

    let stopped = expect_event(&mut rx, Duration::from_secs(5), is_stopped("flaky")).await;
    match stopped {
        McpEvent::ServerStopped { exit, .. } => assert_eq!(exit.and_then(|e| e.code), Some(1)),
        other => panic!("unexpected event {other:?}"),
    }

    expect_event(&mut rx, Duration::from_secs(5), is_started("flaky")).await;
    let second = h.supervisor.get_server("flaky").await.unwrap();
    assert_eq!(second.status, WorkerStatus::Running);
    assert_ne!(second.pid, first);

    h.supervisor.shutdown().await;
}

#[tokio::test]
async fn test_clean_exit_is_not_restarted() {
    let h = harness(json!({"oneshot": shell("sleep 0.5; exit 0")}));
    let mut rx = h.bus.subscribe();

    h.supervisor.initialize().await;
    expect_event(&mut rx, Duration::from_secs(5), is_stopped("oneshot")).await;

    tokio::time::sleep(Duration::from_millis(1000)).await;
    let snap = h.supervisor.get_server("oneshot").await.unwrap();
    assert_eq!(snap.status, WorkerStatus::Stopped);
    assert_eq!(snap.last_exit.and_then(|e| e.code), Some(0));
    while let Ok(event) = rx.try_recv() {
        assert!(!matches!(event, McpEvent::ServerStarted { .. }));
    }
}

#[tokio::test]
async fn test_auto_restart_flag_off() {
    let h = harness_with(
        json!({"flaky": shell("sleep 0.5; exit 1")}),
        options().with_auto_restart(false),
    );
    let mut rx = h.bus.subscribe();

    h.supervisor.initialize().await;
    expect_event(&mut rx, Duration::from_secs(5), is_stopped("flaky")).await;
    tokio::time::sleep(Duration::from_millis(800)).await;
    assert_eq!(
        h.supervisor.get_server("flaky").await.unwrap().status,
        WorkerStatus::Stopped
    );
}

#[tokio::test]
async fn test_shutdown_during_backoff_prevents_restart() {
    let h = harness(json!({"flaky": shell("sleep 0.5; exit 1")}));
    let mut rx = h.bus.subscribe();

    h.supervisor.initialize().await;
    expect_event(&mut rx, Duration::from_secs(5), is_stopped("flaky")).await;

    // The restart is pending on its backoff timer now.
    h.supervisor.shutdown().await;
    tokio::time::sleep(Duration::from_millis(700)).await;

    assert!(h.supervisor.get_all_servers().await.is_empty());
    while let Ok(event) = rx.try_recv() {
        assert!(!matches!(event, McpEvent::ServerStarted { .. }));
    }
}

#[tokio::test]
async fn test_concurrent_stop_and_restart_converge() {
    let h = harness(json!({"a": sleeper()}));
    h.supervisor.initialize().await;

    let (_, restarted) = tokio::join!(
        h.supervisor.stop_server("a"),
        h.supervisor.restart_server("a")
    );
    assert!(restarted.is_ok());

    let snap = h.supervisor.get_server("a").await.unwrap();
    match snap.status {
        WorkerStatus::Running => assert!(snap.pid.is_some()),
        WorkerStatus::Stopped => assert!(snap.pid.is_none()),
        other => panic!("unexpected status {other}"),
    }

    h.supervisor.shutdown().await;
    assert!(h.supervisor.get_all_servers().await.is_empty());
}

#[tokio::test]
async fn test_reconcile_changed_entry_restarts_once() {
    let h = harness(json!({"A": sleeper()}));
    h.supervisor.initialize().await;
    let before = h.supervisor.get_server("A").await.unwrap().pid;

    let update = ServerConfigUpdate {
        args: Some(vec!["31".to_string()]),
        ..ServerConfigUpdate::default()
    };
    let target = h.store.update_entry("A", &update).unwrap();

    let actions = h.supervisor.reconcile(Arc::clone(&target)).await;
    assert_eq!(actions, vec![ReconcileAction::Restart("A".to_string())]);

    let after = h.supervisor.get_server("A").await.unwrap();
    assert_eq!(after.status, WorkerStatus::Running);
    assert_eq!(after.config.args, vec!["31"]);
    assert_ne!(after.pid, before);

    // Same snapshot again: nothing to do
    assert!(h.supervisor.reconcile(target).await.is_empty());
    h.supervisor.shutdown().await;
}

#[tokio::test]
async fn test_reconciler_follows_config_changes() {
    let h = harness(json!({"a": sleeper(), "b": sleeper()}));
    h.supervisor.initialize().await;
    let reconciler = h.supervisor.spawn_reconciler(h.bus.subscribe());
    let mut rx = h.bus.subscribe();

    h.store
        .update_entry("a", &ServerConfigUpdate::disabled(true))
        .unwrap();
    expect_event(&mut rx, Duration::from_secs(5), is_stopped("a")).await;

    // Removal completes right after the stop event
    tokio::time::timeout(Duration::from_secs(2), async {
        while h.supervisor.get_server("a").await.is_some() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(
        h.supervisor.get_server("b").await.unwrap().status,
        WorkerStatus::Running
    );

    h.store
        .update_entry("a", &ServerConfigUpdate::disabled(false))
        .unwrap();
    expect_event(&mut rx, Duration::from_secs(5), is_started("a")).await;

    h.supervisor.shutdown().await;
    tokio::time::timeout(Duration::from_secs(2), reconciler)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_fake_mcp_worker_tools() {
    let h = harness(json!({"fake": shell(FAKE_MCP_WORKER)}));
    let mut rx = h.bus.subscribe();

    h.supervisor.initialize().await;

    match expect_event(&mut rx, Duration::from_secs(5), is_started("fake")).await {
        McpEvent::ServerStarted { tools, .. } => assert_eq!(tools, vec!["echo"]),
        other => panic!("unexpected event {other:?}"),
    }

    let snap = h.supervisor.get_server("fake").await.unwrap();
    assert!(snap.capabilities);
    assert_eq!(snap.tool_names(), vec!["echo"]);
    assert_eq!(h.supervisor.list_all_tools().await["fake"].len(), 1);

    let result = h
        .supervisor
        .call_tool("fake", "echo", json!({"text": "ping"}))
        .await
        .unwrap();
    assert_eq!(result["content"][0]["text"], "pong");

    assert_eq!(
        h.supervisor.call_tool("fake", "nope", json!({})).await.unwrap_err(),
        ToolCallError::ToolNotFound {
            server: "fake".to_string(),
            tool: "nope".to_string()
        }
    );

    h.supervisor.shutdown().await;
}
