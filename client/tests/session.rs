//! End-to-end tests against a scripted stand-in worker.
#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use tsbridge_client::{
    BridgeConfig, BridgeEvent, EventReceiver, ExecuteOptions, ProgressEvent, ServerStatus,
    TsClient, WorkerConfig,
};
use tsbridge_types::{InstanceId, ServerResponse};

const TIMEOUT: Duration = Duration::from_secs(5);

/// Answers a handful of commands, records every command it sees and never
/// answers `completionInfo`. Events are Content-Length framed, responses are
/// bare lines.
const WORKER: &str = r#"
log="$(dirname "$0")/commands.log"
send() {
  printf 'Content-Length: %d\r\n\r\n%s\n' "$(( ${#1} + 1 ))" "$1"
}
while IFS= read -r line; do
  seq=$(printf '%s\n' "$line" | sed -n 's/.*"seq":\([0-9][0-9]*\).*/\1/p')
  cmd=$(printf '%s\n' "$line" | sed -n 's/.*"command":"\([^"]*\)".*/\1/p')
  printf '%s\n' "$cmd" >> "$log"
  case "$cmd" in
    exit) exit 0 ;;
    crash) exit 3 ;;
    quickinfo)
      printf '{"seq":0,"type":"response","command":"quickinfo","request_seq":%s,"success":true,"body":{"displayString":"const x: number"}}\n' "$seq" ;;
    definition)
      printf '{"seq":0,"type":"response","command":"definition","request_seq":%s,"success":false,"message":"No content available."}\n' "$seq" ;;
    explode)
      printf '{"seq":0,"type":"response","command":"explode","request_seq":%s,"success":false,"message":"Debug Failure."}\n' "$seq" ;;
    updateOpen)
      send '{"seq":0,"type":"event","event":"projectLoadingStart","body":{"projectName":"/p/tsconfig.json"}}'
      printf '{"seq":0,"type":"response","command":"updateOpen","request_seq":%s,"success":true}\n' "$seq" ;;
    geterr)
      file=$(printf '%s\n' "$line" | sed -n 's/.*"files":\["\([^"]*\)".*/\1/p')
      send "{\"seq\":0,\"type\":\"event\",\"event\":\"syntaxDiag\",\"body\":{\"file\":\"$file\",\"diagnostics\":[]}}"
      send "{\"seq\":0,\"type\":\"event\",\"event\":\"semanticDiag\",\"body\":{\"file\":\"$file\",\"diagnostics\":[{\"start\":{\"line\":1,\"offset\":1},\"end\":{\"line\":1,\"offset\":4},\"text\":\"Cannot find name 'foo'.\",\"code\":2304,\"category\":\"error\"}]}}"
      send "{\"seq\":0,\"type\":\"event\",\"event\":\"requestCompleted\",\"body\":{\"request_seq\":$seq}}" ;;
  esac
done
"#;

struct Session {
    _dir: TempDir,
    log: PathBuf,
    client: TsClient,
    events: EventReceiver,
}

/// Closes its stdin and lingers, so anything written to it fails.
const DEAF_WORKER: &str = "exec 0<&-\nexec sleep 30";

fn session_with(configure: impl FnOnce(&mut WorkerConfig)) -> Session {
    session_running(WORKER, configure)
}

fn session_running(body: &str, configure: impl FnOnce(&mut WorkerConfig)) -> Session {
    let dir = tempfile::tempdir().unwrap();
    let script = dir.path().join("worker.sh");
    std::fs::write(&script, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

    let mut worker = WorkerConfig {
        tsserver_path: script,
        ..WorkerConfig::default()
    };
    configure(&mut worker);
    let config = BridgeConfig {
        worker,
        ..BridgeConfig::default()
    };
    let (client, events) = TsClient::new(config);
    Session {
        log: dir.path().join("commands.log"),
        _dir: dir,
        client,
        events,
    }
}

fn session() -> Session {
    session_with(|_| {})
}

async fn next_matching(
    events: &mut EventReceiver,
    mut predicate: impl FnMut(&BridgeEvent) -> bool,
) -> BridgeEvent {
    tokio::time::timeout(TIMEOUT, async {
        loop {
            let event = events.recv().await.expect("event stream closed");
            if predicate(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(TIMEOUT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn recorded_commands(log: &Path) -> Vec<String> {
    std::fs::read_to_string(log)
        .unwrap_or_default()
        .lines()
        .map(String::from)
        .collect()
}

async fn quickinfo(client: &TsClient) -> ServerResponse {
    client
        .execute(
            "quickinfo",
            Some(json!({ "file": "/a.ts", "line": 1, "offset": 7 })),
            None,
            ExecuteOptions::default(),
        )
        .await
}

fn pending_completion(
    client: &TsClient,
    token: Option<CancellationToken>,
    options: ExecuteOptions,
) -> tokio::task::JoinHandle<ServerResponse> {
    let client = client.clone();
    tokio::spawn(async move {
        client
            .execute(
                "completionInfo",
                Some(json!({ "file": "/a.ts", "line": 1, "offset": 1 })),
                token,
                options,
            )
            .await
    })
}

#[tokio::test]
async fn test_round_trip_and_graceful_shutdown() {
    let mut s = session();
    assert!(s.client.start().await);
    assert!(matches!(
        s.client.state(),
        ServerStatus::Running { instance, .. } if instance == InstanceId::new(1)
    ));
    next_matching(&mut s.events, |e| {
        matches!(e, BridgeEvent::StateChanged(ServerStatus::Running { .. }))
    })
    .await;

    let response = quickinfo(&s.client).await;
    assert_eq!(
        response.body(),
        Some(&json!({ "displayString": "const x: number" }))
    );
    let definition = s
        .client
        .execute("definition", None, None, ExecuteOptions::default())
        .await;
    assert_eq!(definition, ServerResponse::NoContent);

    s.client.shutdown().await;
    assert_eq!(s.client.state(), ServerStatus::Stopped);
    next_matching(&mut s.events, |e| {
        *e == BridgeEvent::StateChanged(ServerStatus::Stopped)
    })
    .await;
    assert_eq!(
        recorded_commands(&s.log),
        vec!["quickinfo", "definition", "exit"]
    );

    // Idempotent.
    s.client.shutdown().await;
    assert_eq!(s.client.state(), ServerStatus::Stopped);
}

#[tokio::test]
async fn test_cancelled_request_resolves_without_worker_reply() {
    let s = session();
    assert!(s.client.start().await);

    let token = CancellationToken::new();
    let pending = pending_completion(&s.client, Some(token.clone()), ExecuteOptions::default());
    wait_until(|| s.client.pending_requests() == 1).await;

    token.cancel();
    let response = tokio::time::timeout(TIMEOUT, pending)
        .await
        .unwrap()
        .unwrap();
    assert!(response.is_cancelled());

    // The worker is still usable afterwards.
    assert!(quickinfo(&s.client).await.is_success());
    s.client.shutdown().await;
}

#[tokio::test]
async fn test_resource_change_cancels_its_group_only() {
    let s = session();
    assert!(s.client.start().await);

    let a1 = pending_completion(&s.client, None, ExecuteOptions::for_resource("/a.ts"));
    let a2 = pending_completion(&s.client, None, ExecuteOptions::for_resource("/a.ts"));
    let b = pending_completion(&s.client, None, ExecuteOptions::for_resource("/b.ts"));
    wait_until(|| s.client.pending_requests() == 3).await;

    assert_eq!(s.client.cancel_inflight_requests_for_resource("/a.ts"), 2);
    assert!(a1.await.unwrap().is_cancelled());
    assert!(a2.await.unwrap().is_cancelled());
    assert_eq!(s.client.cancel_inflight_requests_for_resource("/a.ts"), 0);
    assert!(!b.is_finished());
    assert_eq!(s.client.pending_requests(), 1);

    s.client.shutdown().await;
    assert_eq!(b.await.unwrap(), ServerResponse::NoServer);
}

#[tokio::test]
async fn test_worker_exit_fails_every_pending_request() {
    let mut s = session();
    assert!(s.client.start().await);

    let pending: Vec<_> = (0..3)
        .map(|_| pending_completion(&s.client, None, ExecuteOptions::default()))
        .collect();
    wait_until(|| s.client.pending_requests() == 3).await;

    s.client.notify("crash", None).await;
    for request in pending {
        let response = tokio::time::timeout(TIMEOUT, request)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response, ServerResponse::NoServer);
    }
    next_matching(&mut s.events, |e| {
        *e == BridgeEvent::StateChanged(ServerStatus::Stopped)
    })
    .await;
    assert_eq!(s.client.state(), ServerStatus::Stopped);
    assert_eq!(quickinfo(&s.client).await, ServerResponse::NoServer);

    // A restart gets a fresh instance.
    assert!(s.client.start().await);
    assert!(matches!(
        s.client.state(),
        ServerStatus::Running { instance, .. } if instance == InstanceId::new(2)
    ));
    assert!(quickinfo(&s.client).await.is_success());
    s.client.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_ends_stopped_when_exit_cannot_be_written() {
    let mut s = session_running(DEAF_WORKER, |_| {});
    assert!(s.client.start().await);
    // Let the worker close its end of the pipe first.
    tokio::time::sleep(Duration::from_millis(200)).await;

    s.client.shutdown().await;
    assert_eq!(s.client.state(), ServerStatus::Stopped);
    next_matching(&mut s.events, |e| {
        *e == BridgeEvent::StateChanged(ServerStatus::Stopped)
    })
    .await;
    assert!(s.client.pid().is_none());
}

#[tokio::test]
async fn test_non_recoverable_failure_moves_to_errored() {
    let mut s = session();
    assert!(s.client.start().await);

    let response = s
        .client
        .execute("explode", None, None, ExecuteOptions::non_recoverable())
        .await;
    assert!(matches!(response, ServerResponse::Failed(_)));

    let event = next_matching(&mut s.events, |e| {
        matches!(e, BridgeEvent::StateChanged(ServerStatus::Errored { .. }))
    })
    .await;
    let BridgeEvent::StateChanged(ServerStatus::Errored { cause, .. }) = event else {
        unreachable!()
    };
    assert!(cause.contains("Debug Failure."), "{cause}");
    assert_eq!(quickinfo(&s.client).await, ServerResponse::NoServer);

    assert!(s.client.restart().await);
    assert!(s.client.is_running());
    assert!(quickinfo(&s.client).await.is_success());
    s.client.shutdown().await;
}

#[tokio::test]
async fn test_plugin_configuration_replayed_on_start() {
    let s = session();
    s.client
        .configure_plugin("styled", json!({ "tags": ["css"] }))
        .await;
    assert!(s.client.start().await);
    assert!(quickinfo(&s.client).await.is_success());
    assert_eq!(
        recorded_commands(&s.log),
        vec!["configurePlugin", "quickinfo"]
    );

    // Later configuration goes straight to the running worker.
    s.client
        .configure_plugin("styled", json!({ "tags": ["sql"] }))
        .await;
    assert!(quickinfo(&s.client).await.is_success());
    assert_eq!(
        recorded_commands(&s.log),
        vec!["configurePlugin", "quickinfo", "configurePlugin", "quickinfo"]
    );
    s.client.shutdown().await;
}

#[tokio::test]
async fn test_old_worker_does_not_receive_plugin_configuration() {
    let s = session_with(|worker| worker.version = Some("3.0.0".to_string()));
    s.client.configure_plugin("styled", json!({})).await;
    assert!(s.client.start().await);
    assert!(quickinfo(&s.client).await.is_success());
    assert_eq!(recorded_commands(&s.log), vec!["quickinfo"]);
    s.client.shutdown().await;
}

#[tokio::test]
async fn test_requested_diagnostics_are_published() {
    let mut s = session();
    assert!(s.client.start().await);

    s.client.request_diagnostics(["/src/a.ts"]);
    let event = next_matching(&mut s.events, |e| {
        matches!(e, BridgeEvent::Diagnostics { diagnostics, .. } if !diagnostics.is_empty())
    })
    .await;
    let BridgeEvent::Diagnostics { file, diagnostics } = event else {
        unreachable!()
    };
    assert_eq!(file, "/src/a.ts");
    assert_eq!(diagnostics.len(), 1);
    assert_eq!(diagnostics[0].code(), Some(2304));

    let snapshot = s.client.diagnostics().snapshot();
    assert_eq!(snapshot.status_string(), "E:1 W:0");

    wait_until(|| !s.client.diagnostics().is_pending("/src/a.ts")).await;
    s.client.shutdown().await;
}

#[tokio::test]
async fn test_settled_update_open_ends_project_loading() {
    let mut s = session();
    assert!(s.client.start().await);

    let response = s
        .client
        .execute(
            "updateOpen",
            Some(json!({ "openFiles": [{ "file": "/a.ts" }] })),
            None,
            ExecuteOptions::default(),
        )
        .await;
    assert!(response.is_success());

    let begin = BridgeEvent::Progress(ProgressEvent::Begin {
        project: "/p/tsconfig.json".to_string(),
    });
    let end = BridgeEvent::Progress(ProgressEvent::End {
        project: "/p/tsconfig.json".to_string(),
    });
    next_matching(&mut s.events, |e| *e == begin).await;
    next_matching(&mut s.events, |e| *e == end).await;
    assert_eq!(s.client.loading_project(), None);
    s.client.shutdown().await;
}
