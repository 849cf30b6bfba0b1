use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use demogate_protocol::{
    ClientMessage, EndReason, InviteStatus, RejectReason, ServerMessage,
};
use libdemogate::{Broker, Config, Kv};
use tokio::sync::mpsc;

fn test_config(dir: &Path) -> Config {
    let mut cfg = Config {
        session_secret: "0123456789abcdef0123456789abcdef".to_string(),
        kv_url: "memory://".to_string(),
        credentials_dir: dir.join("credentials"),
        disconnect_grace_ms: 150,
        require_invite: false,
        ..Config::default()
    };
    cfg.terminal.command = "/bin/sh".to_string();
    cfg.terminal.args = vec!["-c".to_string(), "sleep 30".to_string()];
    cfg.reset.command = None;
    cfg
}

fn broker_with(cfg: Config) -> Arc<Broker> {
    Broker::with_kv(cfg, Kv::memory())
}

async fn connect(broker: &Arc<Broker>, id: &str, addr: &str) -> mpsc::Receiver<ServerMessage> {
    let (tx, rx) = mpsc::channel(32);
    broker
        .handle_connect(id, tx, addr.to_string(), "test-agent".to_string())
        .await;
    rx
}

async fn recv(rx: &mut mpsc::Receiver<ServerMessage>) -> ServerMessage {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for message")
        .expect("channel closed")
}

async fn expect_status(rx: &mut mpsc::Receiver<ServerMessage>) {
    match recv(rx).await {
        ServerMessage::Status { .. } => {}
        other => panic!("expected status, got {other:?}"),
    }
}

async fn expect_session_starting(rx: &mut mpsc::Receiver<ServerMessage>) -> String {
    match recv(rx).await {
        ServerMessage::SessionStarting { session_token, .. } => session_token,
        other => panic!("expected session_starting, got {other:?}"),
    }
}

async fn expect_position(rx: &mut mpsc::Receiver<ServerMessage>) -> (usize, usize) {
    match recv(rx).await {
        ServerMessage::QueuePosition {
            position,
            queue_size,
            ..
        } => (position, queue_size),
        other => panic!("expected queue_position, got {other:?}"),
    }
}

fn credential_files(dir: &Path) -> Vec<String> {
    match std::fs::read_dir(dir.join("credentials")) {
        Ok(entries) => entries
            .flatten()
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .filter(|name| name.starts_with("session-"))
            .collect(),
        Err(_) => Vec::new(),
    }
}

#[tokio::test]
async fn happy_path_invite_to_used_with_audit() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = test_config(dir.path());
    cfg.require_invite = true;
    let broker = broker_with(cfg);

    let invite = broker
        .invites
        .generate(
            Duration::from_secs(48 * 3_600),
            1,
            Some("Demo".to_string()),
            None,
            "cli",
        )
        .await
        .unwrap();

    let mut rx = connect(&broker, "client-a", "10.0.0.1").await;
    expect_status(&mut rx).await;

    broker
        .handle_message(
            "client-a",
            ClientMessage::JoinQueue {
                invite_token: Some(invite.token.clone()),
            },
        )
        .await;
    let token = expect_session_starting(&mut rx).await;
    assert!(!token.is_empty());
    assert!(broker.session_active().await);
    assert_eq!(credential_files(dir.path()).len(), 1);

    broker
        .handle_message("client-a", ClientMessage::EndSession)
        .await;
    match recv(&mut rx).await {
        ServerMessage::SessionEnded {
            reason,
            clear_session_cookie,
        } => {
            assert_eq!(reason, EndReason::UserEnded);
            assert!(clear_session_cookie);
        }
        other => panic!("expected session_ended, got {other:?}"),
    }

    assert!(!broker.session_active().await);
    assert!(credential_files(dir.path()).is_empty());

    let stored = broker.invites.info(&invite.token).await.unwrap().unwrap();
    assert_eq!(stored.status, InviteStatus::Used);
    assert_eq!(stored.use_count, 1);
    assert_eq!(stored.audit.len(), 1);
    assert_eq!(stored.audit[0].end_reason, EndReason::UserEnded);
    assert_eq!(stored.audit[0].remote_addr, "10.0.0.1");
}

#[tokio::test]
async fn waitlist_positions_track_joins_and_leaves() {
    let dir = tempfile::tempdir().unwrap();
    let broker = broker_with(test_config(dir.path()));

    let mut rx_a = connect(&broker, "a", "10.0.0.1").await;
    expect_status(&mut rx_a).await;
    broker
        .handle_message("a", ClientMessage::JoinQueue { invite_token: None })
        .await;
    expect_session_starting(&mut rx_a).await;

    let mut rx_b = connect(&broker, "b", "10.0.0.2").await;
    expect_status(&mut rx_b).await;
    broker
        .handle_message("b", ClientMessage::JoinQueue { invite_token: None })
        .await;
    assert_eq!(expect_position(&mut rx_b).await, (1, 1));

    let mut rx_c = connect(&broker, "c", "10.0.0.3").await;
    expect_status(&mut rx_c).await;
    broker
        .handle_message("c", ClientMessage::JoinQueue { invite_token: None })
        .await;
    assert_eq!(expect_position(&mut rx_b).await, (1, 2));
    assert_eq!(expect_position(&mut rx_c).await, (2, 2));

    broker.handle_message("b", ClientMessage::LeaveQueue).await;
    match recv(&mut rx_b).await {
        ServerMessage::LeftQueue => {}
        other => panic!("expected left_queue, got {other:?}"),
    }
    assert_eq!(expect_position(&mut rx_c).await, (1, 1));

    // Second leave_queue is a silent no-op for everyone.
    broker.handle_message("b", ClientMessage::LeaveQueue).await;
    assert!(rx_b.try_recv().is_err());
    assert!(rx_c.try_recv().is_err());
}

#[tokio::test]
async fn promotion_follows_session_end_in_queue_order() {
    let dir = tempfile::tempdir().unwrap();
    let broker = broker_with(test_config(dir.path()));

    let mut rx_a = connect(&broker, "a", "10.0.0.1").await;
    expect_status(&mut rx_a).await;
    broker
        .handle_message("a", ClientMessage::JoinQueue { invite_token: None })
        .await;
    expect_session_starting(&mut rx_a).await;

    let mut rx_b = connect(&broker, "b", "10.0.0.2").await;
    expect_status(&mut rx_b).await;
    broker
        .handle_message("b", ClientMessage::JoinQueue { invite_token: None })
        .await;
    expect_position(&mut rx_b).await;

    let mut rx_c = connect(&broker, "c", "10.0.0.3").await;
    expect_status(&mut rx_c).await;
    broker
        .handle_message("c", ClientMessage::JoinQueue { invite_token: None })
        .await;
    expect_position(&mut rx_b).await;
    expect_position(&mut rx_c).await;

    broker
        .handle_message("a", ClientMessage::EndSession)
        .await;
    match recv(&mut rx_a).await {
        ServerMessage::SessionEnded { .. } => {}
        other => panic!("expected session_ended, got {other:?}"),
    }

    // Head of the queue gets the slot; the other client moves up.
    expect_session_starting(&mut rx_b).await;
    assert_eq!(expect_position(&mut rx_c).await, (1, 1));
}

#[tokio::test]
async fn reconnect_within_grace_rebinds_the_session() {
    let dir = tempfile::tempdir().unwrap();
    let broker = broker_with(test_config(dir.path()));

    let mut rx_a = connect(&broker, "a", "10.0.0.1").await;
    expect_status(&mut rx_a).await;
    broker
        .handle_message("a", ClientMessage::JoinQueue { invite_token: None })
        .await;
    let token = expect_session_starting(&mut rx_a).await;

    broker.handle_disconnect("a").await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(broker.session_active().await);

    let mut rx_a2 = connect(&broker, "a2", "10.0.0.1").await;
    expect_status(&mut rx_a2).await;
    broker
        .handle_message(
            "a2",
            ClientMessage::ResumeSession {
                session_token: token.clone(),
            },
        )
        .await;
    let resumed = expect_session_starting(&mut rx_a2).await;
    assert_eq!(resumed, token);
    assert!(broker.session_active().await);

    // A second resume attempt with the same token is rejected.
    let mut rx_a3 = connect(&broker, "a3", "10.0.0.1").await;
    expect_status(&mut rx_a3).await;
    broker
        .handle_message(
            "a3",
            ClientMessage::ResumeSession {
                session_token: token.clone(),
            },
        )
        .await;
    match recv(&mut rx_a3).await {
        ServerMessage::Error { .. } => {}
        other => panic!("expected error, got {other:?}"),
    }
}

#[tokio::test]
async fn grace_expiry_ends_the_session_and_promotes_next() {
    let dir = tempfile::tempdir().unwrap();
    let broker = broker_with(test_config(dir.path()));

    let mut rx_a = connect(&broker, "a", "10.0.0.1").await;
    expect_status(&mut rx_a).await;
    broker
        .handle_message("a", ClientMessage::JoinQueue { invite_token: None })
        .await;
    let token = expect_session_starting(&mut rx_a).await;

    let mut rx_b = connect(&broker, "b", "10.0.0.2").await;
    expect_status(&mut rx_b).await;
    broker
        .handle_message("b", ClientMessage::JoinQueue { invite_token: None })
        .await;
    expect_position(&mut rx_b).await;

    broker.handle_disconnect("a").await;
    tokio::time::sleep(Duration::from_millis(400)).await;

    // B owns the slot now; a late resume with the old token fails.
    expect_session_starting(&mut rx_b).await;
    let mut rx_a2 = connect(&broker, "a2", "10.0.0.1").await;
    expect_status(&mut rx_a2).await;
    broker
        .handle_message(
            "a2",
            ClientMessage::ResumeSession {
                session_token: token,
            },
        )
        .await;
    match recv(&mut rx_a2).await {
        ServerMessage::Error { .. } => {}
        other => panic!("expected error, got {other:?}"),
    }
}

#[tokio::test]
async fn invalid_invites_reject_without_enqueueing() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = test_config(dir.path());
    cfg.require_invite = true;
    let broker = broker_with(cfg);

    let mut rx = connect(&broker, "a", "10.0.0.1").await;
    expect_status(&mut rx).await;

    // Too short to even look up.
    broker
        .handle_message(
            "a",
            ClientMessage::JoinQueue {
                invite_token: Some("zzz".to_string()),
            },
        )
        .await;
    match recv(&mut rx).await {
        ServerMessage::InviteInvalid { reason, .. } => {
            assert_eq!(reason, RejectReason::Invalid);
        }
        other => panic!("expected invite_invalid, got {other:?}"),
    }

    // Well-formed but unknown.
    broker
        .handle_message(
            "a",
            ClientMessage::JoinQueue {
                invite_token: Some("not-a-known-token".to_string()),
            },
        )
        .await;
    match recv(&mut rx).await {
        ServerMessage::InviteInvalid { reason, .. } => {
            assert_eq!(reason, RejectReason::NotFound);
        }
        other => panic!("expected invite_invalid, got {other:?}"),
    }

    // No token at all.
    broker
        .handle_message("a", ClientMessage::JoinQueue { invite_token: None })
        .await;
    match recv(&mut rx).await {
        ServerMessage::InviteInvalid { reason, .. } => {
            assert_eq!(reason, RejectReason::Missing);
        }
        other => panic!("expected invite_invalid, got {other:?}"),
    }

    assert!(!broker.session_active().await);
    assert_eq!(broker.queue.len().await, 0);
}

#[tokio::test]
async fn eleventh_failed_attempt_is_rate_limited() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = test_config(dir.path());
    cfg.require_invite = true;
    let broker = broker_with(cfg);

    let mut rx = connect(&broker, "a", "10.0.0.1").await;
    expect_status(&mut rx).await;

    for _ in 0..10 {
        broker
            .handle_message(
                "a",
                ClientMessage::JoinQueue {
                    invite_token: Some("wrong-token-wrong".to_string()),
                },
            )
            .await;
        match recv(&mut rx).await {
            ServerMessage::InviteInvalid { reason, .. } => {
                assert_eq!(reason, RejectReason::NotFound);
            }
            other => panic!("expected invite_invalid, got {other:?}"),
        }
    }

    broker
        .handle_message(
            "a",
            ClientMessage::JoinQueue {
                invite_token: Some("wrong-token-wrong".to_string()),
            },
        )
        .await;
    match recv(&mut rx).await {
        ServerMessage::InviteInvalid { reason, .. } => {
            assert_eq!(reason, RejectReason::RateLimited);
        }
        other => panic!("expected invite_invalid, got {other:?}"),
    }
}

#[tokio::test]
async fn queue_full_until_a_slot_frees() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = test_config(dir.path());
    cfg.max_queue_size = 2;
    let broker = broker_with(cfg);

    let mut rx_a = connect(&broker, "a", "10.0.0.1").await;
    expect_status(&mut rx_a).await;
    broker
        .handle_message("a", ClientMessage::JoinQueue { invite_token: None })
        .await;
    expect_session_starting(&mut rx_a).await;

    for (id, addr) in [("b", "10.0.0.2"), ("c", "10.0.0.3")] {
        let mut rx = connect(&broker, id, addr).await;
        expect_status(&mut rx).await;
        broker
            .handle_message(id, ClientMessage::JoinQueue { invite_token: None })
            .await;
        expect_position(&mut rx).await;
    }

    let mut rx_d = connect(&broker, "d", "10.0.0.4").await;
    expect_status(&mut rx_d).await;
    broker
        .handle_message("d", ClientMessage::JoinQueue { invite_token: None })
        .await;
    match recv(&mut rx_d).await {
        ServerMessage::QueueFull { .. } => {}
        other => panic!("expected queue_full, got {other:?}"),
    }

    broker.handle_message("b", ClientMessage::LeaveQueue).await;
    broker
        .handle_message("d", ClientMessage::JoinQueue { invite_token: None })
        .await;
    let (position, queue_size) = expect_position(&mut rx_d).await;
    assert_eq!((position, queue_size), (2, 2));
}

#[tokio::test]
async fn duplicate_join_reports_already_in_queue() {
    let dir = tempfile::tempdir().unwrap();
    let broker = broker_with(test_config(dir.path()));

    let mut rx_a = connect(&broker, "a", "10.0.0.1").await;
    expect_status(&mut rx_a).await;
    broker
        .handle_message("a", ClientMessage::JoinQueue { invite_token: None })
        .await;
    expect_session_starting(&mut rx_a).await;

    // The active owner cannot join again.
    broker
        .handle_message("a", ClientMessage::JoinQueue { invite_token: None })
        .await;
    match recv(&mut rx_a).await {
        ServerMessage::Error { message } => assert_eq!(message, "Already in queue"),
        other => panic!("expected error, got {other:?}"),
    }

    let mut rx_b = connect(&broker, "b", "10.0.0.2").await;
    expect_status(&mut rx_b).await;
    broker
        .handle_message("b", ClientMessage::JoinQueue { invite_token: None })
        .await;
    expect_position(&mut rx_b).await;
    broker
        .handle_message("b", ClientMessage::JoinQueue { invite_token: None })
        .await;
    match recv(&mut rx_b).await {
        ServerMessage::Error { message } => assert_eq!(message, "Already in queue"),
        other => panic!("expected error, got {other:?}"),
    }
}

#[tokio::test]
async fn spawn_failure_recovers_to_idle_and_cleans_up() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = test_config(dir.path());
    cfg.terminal.command = "/nonexistent/demo-terminal".to_string();
    let broker = broker_with(cfg);

    let mut rx = connect(&broker, "a", "10.0.0.1").await;
    expect_status(&mut rx).await;
    broker
        .handle_message("a", ClientMessage::JoinQueue { invite_token: None })
        .await;
    match recv(&mut rx).await {
        ServerMessage::Error { .. } => {}
        other => panic!("expected error, got {other:?}"),
    }

    assert!(!broker.session_active().await);
    assert!(credential_files(dir.path()).is_empty());

    // The slot is usable again once spawning works.
    let mut cfg_ok = test_config(dir.path());
    cfg_ok.terminal.command = "/bin/sh".to_string();
    let broker = broker_with(cfg_ok);
    let mut rx = connect(&broker, "b", "10.0.0.2").await;
    expect_status(&mut rx).await;
    broker
        .handle_message("b", ClientMessage::JoinQueue { invite_token: None })
        .await;
    expect_session_starting(&mut rx).await;
}

#[tokio::test]
async fn shutdown_ends_the_active_session_without_promoting() {
    let dir = tempfile::tempdir().unwrap();
    let broker = broker_with(test_config(dir.path()));

    let mut rx_a = connect(&broker, "a", "10.0.0.1").await;
    expect_status(&mut rx_a).await;
    broker
        .handle_message("a", ClientMessage::JoinQueue { invite_token: None })
        .await;
    expect_session_starting(&mut rx_a).await;

    let mut rx_b = connect(&broker, "b", "10.0.0.2").await;
    expect_status(&mut rx_b).await;
    broker
        .handle_message("b", ClientMessage::JoinQueue { invite_token: None })
        .await;
    expect_position(&mut rx_b).await;

    broker.shutdown().await;
    match recv(&mut rx_a).await {
        ServerMessage::SessionEnded { reason, .. } => assert_eq!(reason, EndReason::Shutdown),
        other => panic!("expected session_ended, got {other:?}"),
    }
    assert!(!broker.session_active().await);
    // No promotion after shutdown.
    assert!(rx_b.try_recv().is_err());
}

#[tokio::test]
async fn container_exit_tears_the_session_down() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = test_config(dir.path());
    cfg.terminal.args = vec!["-c".to_string(), "exit 0".to_string()];
    let broker = broker_with(cfg);

    let mut rx = connect(&broker, "a", "10.0.0.1").await;
    expect_status(&mut rx).await;
    broker
        .handle_message("a", ClientMessage::JoinQueue { invite_token: None })
        .await;
    expect_session_starting(&mut rx).await;

    match recv(&mut rx).await {
        ServerMessage::SessionEnded { reason, .. } => {
            assert_eq!(reason, EndReason::ContainerExit);
        }
        other => panic!("expected session_ended, got {other:?}"),
    }
    assert!(!broker.session_active().await);
    assert!(credential_files(dir.path()).is_empty());
}

#[tokio::test]
async fn heartbeat_is_acknowledged() {
    let dir = tempfile::tempdir().unwrap();
    let broker = broker_with(test_config(dir.path()));
    let mut rx = connect(&broker, "a", "10.0.0.1").await;
    expect_status(&mut rx).await;
    broker.handle_message("a", ClientMessage::Heartbeat).await;
    match recv(&mut rx).await {
        ServerMessage::HeartbeatAck => {}
        other => panic!("expected heartbeat_ack, got {other:?}"),
    }
}
