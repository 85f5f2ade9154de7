// End-to-end tests against an in-process terminal host daemon

mod helpers;

use agent_term_host::session::client::{ClientError, ClientEvent};
use agent_term_host::session::protocol::{CreateOrAttachRequest, ErrorCode};
use helpers::{error_code, wait_for, wait_for_value, HostGuard, RawConn, WAIT};
use serde_json::json;
use tokio::sync::broadcast;

fn shell_request(session_id: &str, workspace_id: &str) -> CreateOrAttachRequest {
    CreateOrAttachRequest {
        session_id: session_id.to_string(),
        workspace_id: workspace_id.to_string(),
        cwd: std::env::temp_dir().to_string_lossy().to_string(),
        cols: 80,
        rows: 24,
        shell: Some("sh".to_string()),
        ..Default::default()
    }
}

/// Collect data for `session_id` until it contains `needle`
async fn wait_for_output(
    events: &mut broadcast::Receiver<ClientEvent>,
    session_id: &str,
    needle: &str,
) -> String {
    let mut output = String::new();
    let deadline = tokio::time::Instant::now() + WAIT;
    while !output.contains(needle) {
        match tokio::time::timeout_at(deadline, events.recv()).await {
            Ok(Ok(ClientEvent::Data { session_id: sid, data, .. })) if sid == session_id => {
                output.push_str(&data)
            }
            Ok(Ok(_)) => {}
            Ok(Err(broadcast::error::RecvError::Lagged(_))) => {}
            Ok(Err(_)) | Err(_) => panic!("no {:?} in output for {}: {:?}", needle, session_id, output),
        }
    }
    output
}

#[tokio::test]
async fn test_echo_then_kill_removes_session() {
    let host = HostGuard::start().await;
    let client = host.client();
    let mut events = client.subscribe();

    let response = client
        .create_or_attach(shell_request("s1", "w1"))
        .await
        .expect("createOrAttach");
    assert!(response.is_new);
    assert!(response.pid.is_some());

    client.write("s1", "echo A\n").await.expect("write");
    let output = wait_for_output(&mut events, "s1", "A\r\n").await;
    assert!(output.contains('A'));

    client.kill("s1").await.expect("kill");
    let exit = wait_for_value("exit event for s1", WAIT, || {
        let event = events.try_recv();
        async move {
            match event {
                Ok(ClientEvent::Exit { session_id, exit_code }) if session_id == "s1" => Ok(exit_code),
                _ => Err("no exit yet"),
            }
        }
    })
    .await;
    assert_eq!(exit, None);

    let sessions = client.list_sessions().await.expect("listSessions");
    assert!(sessions.iter().all(|s| s.session_id != "s1"));
}

#[tokio::test]
async fn test_attach_resumes_with_snapshot() {
    let host = HostGuard::start().await;
    let first = host.client();
    let mut events = first.subscribe();

    first
        .create_or_attach(shell_request("resume", "w1"))
        .await
        .unwrap();
    first.write("resume", "echo marker-$((40+2))\n").await.unwrap();
    wait_for_output(&mut events, "resume", "marker-42").await;

    // A second GUI window attaches with a different size
    let second = host.client();
    let mut request = shell_request("resume", "w1");
    request.cols = 132;
    request.rows = 40;
    let response = second.create_or_attach(request).await.unwrap();

    assert!(!response.is_new);
    assert!(response.snapshot.snapshot_ansi.contains("marker-42"));
    assert_eq!((response.snapshot.cols, response.snapshot.rows), (132, 40));
    assert_eq!(response.snapshot.base_seq, 0);
    assert!(!response.snapshot.truncated);

    let listed = second.list_sessions().await.unwrap();
    let info = listed.iter().find(|s| s.session_id == "resume").unwrap();
    assert_eq!(info.attached_clients, 2);
    assert_eq!(info.workspace_id, "w1");

    second.detach("resume").await.unwrap();
    let listed = first.list_sessions().await.unwrap();
    let info = listed.iter().find(|s| s.session_id == "resume").unwrap();
    assert_eq!(info.attached_clients, 1);
}

#[tokio::test]
async fn test_sessions_do_not_see_each_other() {
    let host = HostGuard::start().await;
    let client_a = host.client();
    let client_b = host.client();
    let mut events_a = client_a.subscribe();
    let mut events_b = client_b.subscribe();

    client_a.create_or_attach(shell_request("iso-a", "w1")).await.unwrap();
    client_b.create_or_attach(shell_request("iso-b", "w2")).await.unwrap();

    client_a.write("iso-a", "echo only-in-a\n").await.unwrap();
    client_b.write("iso-b", "echo only-in-b\n").await.unwrap();

    let out_a = wait_for_output(&mut events_a, "iso-a", "only-in-a\r\n").await;
    let out_b = wait_for_output(&mut events_b, "iso-b", "only-in-b\r\n").await;
    assert!(!out_a.contains("only-in-b"));
    assert!(!out_b.contains("only-in-a"));

    // Nothing from the other session was broadcast to either client
    while let Ok(event) = events_a.try_recv() {
        if let ClientEvent::Data { session_id, .. } = event {
            assert_eq!(session_id, "iso-a");
        }
    }
    while let Ok(event) = events_b.try_recv() {
        if let ClientEvent::Data { session_id, .. } = event {
            assert_eq!(session_id, "iso-b");
        }
    }

    // Replay buffers are separate too
    let observer = host.client();
    let snapshot_a = observer
        .create_or_attach(shell_request("iso-a", "w1"))
        .await
        .unwrap()
        .snapshot;
    assert!(snapshot_a.snapshot_ansi.contains("only-in-a"));
    assert!(!snapshot_a.snapshot_ansi.contains("only-in-b"));
}

#[tokio::test]
async fn test_wrong_token_is_rejected_and_closed() {
    let host = HostGuard::start().await;
    let mut conn = RawConn::connect(&host.config).await;

    let response = conn.hello("not-the-token", "intruder", "control").await;
    assert_eq!(response["ok"], json!(false));
    assert_eq!(error_code(&response), Some("AUTH_FAILED"));
    assert!(conn.next_frame().await.is_none());
}

#[tokio::test]
async fn test_protocol_gate_errors() {
    let host = HostGuard::start().await;

    let mut conn = RawConn::connect(&host.config).await;
    let response = conn.request("listSessions", json!({})).await;
    assert_eq!(error_code(&response), Some("NOT_AUTHENTICATED"));

    let response = conn
        .request(
            "hello",
            json!({ "token": host.token(), "protocolVersion": 999, "clientId": "c", "role": "control" }),
        )
        .await;
    assert_eq!(error_code(&response), Some("PROTOCOL_MISMATCH"));

    let mut conn = RawConn::connect(&host.config).await;
    let response = conn.request("hello", json!({ "token": host.token() })).await;
    assert_eq!(error_code(&response), Some("INVALID_HELLO"));

    let mut conn = RawConn::connect(&host.config).await;
    let response = conn.hello(&host.token(), "c1", "control").await;
    assert_eq!(response["ok"], json!(true));

    let response = conn.request("frobnicate", json!({})).await;
    assert_eq!(error_code(&response), Some("UNKNOWN_REQUEST"));

    // No stream socket registered for c1 yet
    let response = conn
        .request(
            "createOrAttach",
            json!({ "sessionId": "x", "workspaceId": "w", "cwd": "", "cols": 80, "rows": 24 }),
        )
        .await;
    assert_eq!(error_code(&response), Some("STREAM_NOT_CONNECTED"));

    let response = conn.request("kill", json!({ "sessionId": "missing" })).await;
    assert_eq!(error_code(&response), Some("INTERNAL_ERROR"));

    let mut stream = RawConn::connect(&host.config).await;
    assert_eq!(stream.hello(&host.token(), "c1", "stream").await["ok"], json!(true));
    let response = stream.request("listSessions", json!({})).await;
    assert_eq!(error_code(&response), Some("INVALID_ROLE"));
}

#[tokio::test]
async fn test_client_surfaces_remote_errors() {
    let host = HostGuard::start().await;
    let client = host.client();

    let err = client.kill("does-not-exist").await.unwrap_err();
    assert!(matches!(err, ClientError::Remote { .. }));
    assert_eq!(err.code(), Some(ErrorCode::InternalError));
}

#[tokio::test]
async fn test_shutdown_acknowledges_then_stops() {
    let host = HostGuard::start().await;
    let client = host.client();
    client.create_or_attach(shell_request("bye", "w1")).await.unwrap();

    client.shutdown(true).await.expect("shutdown is acknowledged");

    let config = host.config.clone();
    wait_for("socket and pid file removed", WAIT, || {
        let gone = !config.socket_path.exists() && !config.pid_file.exists();
        async move { gone }
    })
    .await;
}

#[tokio::test]
async fn test_attach_since_seq_skips_seen_output() {
    let host = HostGuard::start().await;
    let client = host.client();
    let mut events = client.subscribe();

    client.create_or_attach(shell_request("since", "w1")).await.unwrap();
    client.write("since", "echo seen-before\n").await.unwrap();
    wait_for_output(&mut events, "since", "seen-before\r\n").await;

    let other = host.client();
    let full = other
        .create_or_attach(shell_request("since", "w1"))
        .await
        .unwrap()
        .snapshot;
    assert!(full.snapshot_ansi.contains("seen-before"));

    let mut request = shell_request("since", "w1");
    request.since_seq = Some(full.end_seq);
    let resumed = other.create_or_attach(request).await.unwrap().snapshot;
    assert_eq!(resumed.base_seq, full.end_seq);
    assert!(!resumed.snapshot_ansi.contains("seen-before"));
    assert!(!resumed.truncated);
}

#[tokio::test]
async fn test_process_exit_is_broadcast_with_code() {
    let host = HostGuard::start().await;
    let client = host.client();
    let mut events = client.subscribe();

    let mut request = shell_request("short", "w1");
    request.args = Some(vec!["-c".to_string(), "sleep 0.2; exit 3".to_string()]);
    client.create_or_attach(request).await.unwrap();

    let exit = wait_for_value("exit event for short", WAIT, || {
        let event = events.try_recv();
        async move {
            match event {
                Ok(ClientEvent::Exit { session_id, exit_code }) if session_id == "short" => Ok(exit_code),
                _ => Err("no exit yet"),
            }
        }
    })
    .await;
    assert_eq!(exit, Some(3));

    let sessions = client.list_sessions().await.unwrap();
    assert!(sessions.is_empty());
}
