//! End-to-end exchanges between two nodes over the in-process rendezvous.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as B64, Engine};
use parking_lot::Mutex;
use tokio::io::BufReader;

use wop_crypto::agreement::EphemeralPair;
use wop_crypto::rotation::RotationReason;
use wop_crypto::{aead, topic_of, Identity, PublicKeyBytes};
use wop_node::node::Node;
use wop_node::{ExitCode, InjectHandler, JoinMode, LogHandler, MemoryHub, Outcome, Rendezvous};
use wop_proto::codec::{parse_frame, read_frame, write_frame};
use wop_proto::envelope::{Body, Envelope};
use wop_store::NodeConfig;

fn make_node(hub: &Arc<MemoryHub>, name: &str) -> (tempfile::TempDir, Arc<Node>) {
    let dir = tempfile::tempdir().unwrap();
    let config = NodeConfig { display_name: name.into(), ..Default::default() };
    let node = Node::open(dir.path(), config, Arc::new(hub.endpoint())).unwrap();
    (dir, Arc::new(node))
}

fn strs(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

struct RecordingLog {
    lines: Arc<Mutex<Vec<(String, String, String)>>>,
}

#[async_trait]
impl LogHandler for RecordingLog {
    async fn on_log(&self, session: &str, message: &str, sender: &str) {
        self.lines
            .lock()
            .push((session.to_string(), message.to_string(), sender.to_string()));
    }
}

struct ScriptedAgent;

#[async_trait]
impl InjectHandler for ScriptedAgent {
    async fn on_inject(&self, _session: &str, message: &str, _sender: &str) -> anyhow::Result<String> {
        Ok(match message {
            "hello" => "hi".to_string(),
            other => format!("echo:{other}"),
        })
    }
}

#[tokio::test]
async fn token_claim_happy_path() {
    let hub = MemoryHub::new();
    let (_da, alice) = make_node(&hub, "alice");
    let (_db, bob) = make_node(&hub, "bob");
    alice.start().await.unwrap();

    let uri = alice
        .issue_invite(&bob.sign_pub(), strs(&["s1"]), strs(&["inject"]), 1)
        .unwrap();
    let outcome = bob.claim(&uri, Duration::from_secs(5)).await;
    assert_eq!(outcome.code, ExitCode::Ok, "{:?}", outcome.message);

    let grants = alice.trust().grants();
    assert_eq!(grants.len(), 1);
    assert_eq!(grants[0].peer_sign_pub, bob.sign_pub());
    assert_eq!(grants[0].sessions, strs(&["s1"]));
    assert_eq!(grants[0].caps, strs(&["inject"]));
    assert_eq!(grants[0].peer_kx_pub.as_deref(), Some(bob.kx_pub().as_str()));

    // Bob recorded Alice for later key lookups.
    assert_eq!(bob.trust().peer_kx(&alice.sign_pub()).as_deref(), Some(alice.kx_pub().as_str()));
}

#[tokio::test]
async fn inject_round_trip_with_forward_secrecy() {
    let hub = MemoryHub::new();
    let (_da, alice) = make_node(&hub, "alice");
    let (_db, bob) = make_node(&hub, "bob");
    alice.set_inject_handler(Arc::new(ScriptedAgent));
    alice.start().await.unwrap();

    let uri = alice
        .issue_invite(&bob.sign_pub(), strs(&["s1"]), strs(&["inject"]), 1)
        .unwrap();
    assert!(bob.claim(&uri, Duration::from_secs(5)).await.is_ok());

    let outcome = bob
        .send_inject(&alice.sign_pub(), "s1", "hello", Duration::from_secs(5))
        .await;
    assert_eq!(outcome.code, ExitCode::Ok, "{:?}", outcome.message);
    assert_eq!(outcome.reply.as_deref(), Some("hi"));
}

#[tokio::test]
async fn unauthorized_session_is_rejected() {
    let hub = MemoryHub::new();
    let (_da, alice) = make_node(&hub, "alice");
    let (_db, bob) = make_node(&hub, "bob");
    alice.set_inject_handler(Arc::new(ScriptedAgent));
    alice.start().await.unwrap();

    let uri = alice
        .issue_invite(&bob.sign_pub(), strs(&["s1"]), strs(&["inject"]), 1)
        .unwrap();
    assert!(bob.claim(&uri, Duration::from_secs(5)).await.is_ok());

    let outcome = bob
        .send_inject(&alice.sign_pub(), "s2", "hello", Duration::from_secs(5))
        .await;
    assert_eq!(outcome.code, ExitCode::Rejected);
    assert_eq!(outcome.message.as_deref(), Some("unauthorized"));
}

#[tokio::test]
async fn replayed_frame_is_silently_dropped() {
    let hub = MemoryHub::new();
    let (_da, alice) = make_node(&hub, "alice");
    let lines = Arc::new(Mutex::new(Vec::new()));
    alice.set_log_handler(Arc::new(RecordingLog { lines: Arc::clone(&lines) }));
    alice.start().await.unwrap();

    // A standalone sender with a grant, driven at the frame level so the
    // exact bytes can be replayed.
    let mallory_view = Identity::generate();
    alice
        .trust()
        .grant_access(
            &mallory_view.sign_pub.to_b64(),
            &strs(&["s1"]),
            &strs(&["message"]),
            Some(&mallory_view.kx_pub.to_b64()),
        )
        .unwrap();

    let endpoint = hub.endpoint();
    let alice_key = PublicKeyBytes::from_b64(&alice.sign_pub()).unwrap();
    let mut rx = endpoint
        .join(topic_of(&alice_key.0), JoinMode::Client)
        .await
        .unwrap();
    let stream = rx.recv().await.unwrap().stream;
    let (read_half, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half);

    let ephemeral = EphemeralPair::generate(chrono::Duration::minutes(5));
    let mut hello = Envelope::new(
        2,
        mallory_view.sign_pub.to_b64(),
        Body::Hello {
            versions: vec![2, 1],
            ephemeral_pub: Some(ephemeral.kx_pub.to_b64()),
            kx_pub: Some(mallory_view.kx_pub.to_b64()),
        },
    );
    hello.sign(&mallory_view).unwrap();
    write_frame(&mut writer, &hello).await.unwrap();

    let ack = parse_frame(&read_frame(&mut reader).await.unwrap().unwrap()).unwrap();
    let Body::HelloAck { ephemeral_pub: Some(server_ephemeral), .. } = ack.body else {
        panic!("expected hello-ack with ephemeral");
    };

    let key = ephemeral
        .derive_shared(&PublicKeyBytes::from_b64(&server_ephemeral).unwrap())
        .unwrap();
    let payload = B64.encode(aead::encrypt(&key, b"line one").unwrap());
    let mut log = Envelope::new(
        2,
        mallory_view.sign_pub.to_b64(),
        Body::Log {
            session: "s1".into(),
            payload,
            ephemeral_pub: Some(ephemeral.kx_pub.to_b64()),
        },
    );
    log.sign(&mallory_view).unwrap();

    write_frame(&mut writer, &log).await.unwrap();
    let first = parse_frame(&read_frame(&mut reader).await.unwrap().unwrap()).unwrap();
    assert!(matches!(first.body, Body::Ack { .. }));

    // Replay the identical bytes: no reply at all.
    write_frame(&mut writer, &log).await.unwrap();
    let silence =
        tokio::time::timeout(Duration::from_millis(300), read_frame(&mut reader)).await;
    assert!(silence.is_err(), "replay must be dropped without a reply");

    assert_eq!(lines.lock().len(), 1);
    assert_eq!(lines.lock()[0].1, "line one");
}

#[tokio::test]
async fn inject_without_payload_ephemeral_is_answered_on_the_static_path() {
    let hub = MemoryHub::new();
    let (_da, alice) = make_node(&hub, "alice");
    alice.set_inject_handler(Arc::new(ScriptedAgent));
    alice.start().await.unwrap();

    let sender = Identity::generate();
    alice
        .trust()
        .grant_access(
            &sender.sign_pub.to_b64(),
            &strs(&["s1"]),
            &strs(&["inject"]),
            Some(&sender.kx_pub.to_b64()),
        )
        .unwrap();

    let endpoint = hub.endpoint();
    let alice_key = PublicKeyBytes::from_b64(&alice.sign_pub()).unwrap();
    let mut rx = endpoint
        .join(topic_of(&alice_key.0), JoinMode::Client)
        .await
        .unwrap();
    let stream = rx.recv().await.unwrap().stream;
    let (read_half, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half);

    // A v2 hello that advertises an ephemeral like any other dialer.
    let ephemeral = EphemeralPair::generate(chrono::Duration::minutes(5));
    let mut hello = Envelope::new(
        2,
        sender.sign_pub.to_b64(),
        Body::Hello {
            versions: vec![2, 1],
            ephemeral_pub: Some(ephemeral.kx_pub.to_b64()),
            kx_pub: Some(sender.kx_pub.to_b64()),
        },
    );
    hello.sign(&sender).unwrap();
    write_frame(&mut writer, &hello).await.unwrap();

    let ack = parse_frame(&read_frame(&mut reader).await.unwrap().unwrap()).unwrap();
    let Body::HelloAck { version: 2, kx_pub: Some(server_kx), .. } = ack.body else {
        panic!("expected v2 hello-ack with a static kx key");
    };

    // The inject body itself carries no ephemeralPub, so the whole exchange
    // runs on the legacy static keys despite the hello-time advertisement.
    let static_key = wop_crypto::agreement::derive_shared(
        sender.kx_secret_bytes(),
        &PublicKeyBytes::from_b64(&server_kx).unwrap().as_array().unwrap(),
    );
    let payload = B64.encode(aead::encrypt(&static_key, b"hello").unwrap());
    let mut inject = Envelope::new(
        2,
        sender.sign_pub.to_b64(),
        Body::Inject {
            session: "s1".into(),
            payload,
            request_id: Some("r-1".into()),
            ephemeral_pub: None,
        },
    );
    inject.sign(&sender).unwrap();
    write_frame(&mut writer, &inject).await.unwrap();

    let reply = parse_frame(&read_frame(&mut reader).await.unwrap().unwrap()).unwrap();
    let Body::Response { request_id, payload, ephemeral_pub } = reply.body else {
        panic!("expected a response");
    };
    assert_eq!(request_id.as_deref(), Some("r-1"));
    assert!(
        ephemeral_pub.is_none(),
        "a static-path inject must not be answered with a fresh ephemeral"
    );
    let sealed = B64.decode(&payload).unwrap();
    let plain = aead::decrypt(&static_key, &sealed).unwrap();
    assert_eq!(&plain[..], b"hi");
}

#[tokio::test]
async fn hello_without_common_version_is_rejected() {
    let hub = MemoryHub::new();
    let (_da, alice) = make_node(&hub, "alice");
    alice.start().await.unwrap();

    let stranger = Identity::generate();
    let endpoint = hub.endpoint();
    let alice_key = PublicKeyBytes::from_b64(&alice.sign_pub()).unwrap();
    let mut rx = endpoint
        .join(topic_of(&alice_key.0), JoinMode::Client)
        .await
        .unwrap();
    let stream = rx.recv().await.unwrap().stream;
    let (read_half, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half);

    let mut hello = Envelope::new(
        9,
        stranger.sign_pub.to_b64(),
        Body::Hello { versions: vec![9, 8], ephemeral_pub: None, kx_pub: None },
    );
    hello.sign(&stranger).unwrap();
    write_frame(&mut writer, &hello).await.unwrap();

    let reply = parse_frame(&read_frame(&mut reader).await.unwrap().unwrap()).unwrap();
    match reply.body {
        Body::Reject { reason } => assert_eq!(reason, "no common protocol version"),
        other => panic!("expected reject, got {:?}", other.type_name()),
    }
}

#[tokio::test]
async fn key_rotation_keeps_old_key_authorized_through_grace() {
    let hub = MemoryHub::new();
    let (_da, alice) = make_node(&hub, "alice");
    let (_db, bob) = make_node(&hub, "bob");
    bob.start().await.unwrap();

    let alice_old_key = alice.sign_pub();
    bob.trust()
        .grant_access(&alice_old_key, &strs(&["s1"]), &strs(&["inject"]), Some(&alice.kx_pub()))
        .unwrap();
    alice
        .trust()
        .add_peer(&bob.sign_pub(), &[], &[], Some(&bob.kx_pub()))
        .unwrap();

    let record = alice.rotate_identity(RotationReason::Scheduled).unwrap();
    assert_eq!(alice.sign_pub(), record.new_sign_pub);

    let outcome = alice
        .notify_rotation(&bob.sign_pub(), &record, Duration::from_secs(5))
        .await;
    assert_eq!(outcome.code, ExitCode::Ok, "{:?}", outcome.message);

    // New key authorized outright, old key only through the grace window.
    assert!(bob.trust().is_authorized(&record.new_sign_pub, "s1"));
    assert!(bob.trust().is_authorized(&alice_old_key, "s1"));

    let grants = bob.trust().grants();
    assert_eq!(grants[0].peer_sign_pub, record.new_sign_pub);
    let history = &grants[0].key_history;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].sign_pub, alice_old_key);
    let until = history[0].valid_until.unwrap().timestamp_millis();
    assert_eq!(until, record.effective_at + record.grace_period_ms);
}

#[tokio::test]
async fn rotation_from_stranger_is_rejected() {
    let hub = MemoryHub::new();
    let (_da, alice) = make_node(&hub, "alice");
    let (_db, bob) = make_node(&hub, "bob");
    bob.start().await.unwrap();

    // Bob has no grant for Alice, so the rotation applies to nothing.
    alice
        .trust()
        .add_peer(&bob.sign_pub(), &[], &[], Some(&bob.kx_pub()))
        .unwrap();
    let record = alice.rotate_identity(RotationReason::Compromise).unwrap();
    let outcome = alice
        .notify_rotation(&bob.sign_pub(), &record, Duration::from_secs(5))
        .await;
    assert_eq!(outcome.code, ExitCode::Rejected);
    assert_eq!(outcome.message.as_deref(), Some("invalid key rotation"));
}

struct ReentrantAgent {
    node: Mutex<Option<Arc<Node>>>,
    peer: Mutex<Option<String>>,
    observed: Arc<Mutex<Option<Outcome>>>,
}

#[async_trait]
impl InjectHandler for ReentrantAgent {
    async fn on_inject(&self, session: &str, _message: &str, _sender: &str) -> anyhow::Result<String> {
        let node = self.node.lock().clone().expect("node wired");
        let peer = self.peer.lock().clone().expect("peer wired");
        let outcome = node
            .send_inject(&peer, session, "callback", Duration::from_secs(1))
            .await;
        *self.observed.lock() = Some(outcome);
        Ok("handled".to_string())
    }
}

#[tokio::test]
async fn inject_handler_cannot_reenter_its_own_session() {
    let hub = MemoryHub::new();
    let (_da, alice) = make_node(&hub, "alice");
    let (_db, bob) = make_node(&hub, "bob");

    let observed = Arc::new(Mutex::new(None));
    let agent = Arc::new(ReentrantAgent {
        node: Mutex::new(None),
        peer: Mutex::new(None),
        observed: Arc::clone(&observed),
    });
    *agent.node.lock() = Some(Arc::clone(&alice));
    *agent.peer.lock() = Some(bob.sign_pub());
    alice.set_inject_handler(agent);
    alice.start().await.unwrap();

    let uri = alice
        .issue_invite(&bob.sign_pub(), strs(&["s1"]), strs(&["inject"]), 1)
        .unwrap();
    assert!(bob.claim(&uri, Duration::from_secs(5)).await.is_ok());

    let outcome = bob
        .send_inject(&alice.sign_pub(), "s1", "go", Duration::from_secs(5))
        .await;
    assert_eq!(outcome.code, ExitCode::Ok);
    assert_eq!(outcome.reply.as_deref(), Some("handled"));

    let inner = observed.lock().clone().expect("handler ran");
    assert!(inner.is_reentrancy_blocked(), "{:?}", inner);
}

#[tokio::test]
async fn dialing_an_absent_peer_reports_peer_offline() {
    let hub = MemoryHub::new();
    let (_da, alice) = make_node(&hub, "alice");
    let (_db, bob) = make_node(&hub, "bob");
    // Alice never starts a listener.
    bob.trust()
        .add_peer(&alice.sign_pub(), &[], &[], Some(&alice.kx_pub()))
        .unwrap();

    let outcome = bob
        .send_log(&alice.sign_pub(), "s1", "anyone home?", Duration::from_secs(1))
        .await;
    assert_eq!(outcome.code, ExitCode::PeerOffline);
}

#[tokio::test]
async fn friend_handshake_grants_both_sides() {
    let hub = MemoryHub::new();
    let (_da, alice) = make_node(&hub, "alice");
    let (_db, bob) = make_node(&hub, "bob");
    let lines = Arc::new(Mutex::new(Vec::new()));
    bob.set_log_handler(Arc::new(RecordingLog { lines: Arc::clone(&lines) }));
    bob.start().await.unwrap();

    // Out-of-band: Alice asks, Bob decides explicitly.
    let request_wire = alice.friend_request("bob").unwrap();
    assert!(bob.handle_friend_request(&request_wire).unwrap().is_none());
    let pending = bob.pending_friend_requests();
    assert_eq!(pending.len(), 1);
    let accept_wire = bob.accept_friend(&pending[0].request.sig).unwrap();
    assert!(alice.handle_friend_accept(&accept_wire).unwrap());

    // Bob granted Alice the deterministic friend session.
    let alice_key = PublicKeyBytes::from_b64(&alice.sign_pub()).unwrap();
    let session = wop_proto::friend::friend_session_name("alice", &alice_key);
    assert!(bob.trust().is_authorized(&alice.sign_pub(), &session));

    // And the session carries live traffic over the swarm.
    let outcome = alice
        .send_log(&bob.sign_pub(), &session, "hi bob", Duration::from_secs(5))
        .await;
    assert_eq!(outcome.code, ExitCode::Ok, "{:?}", outcome.message);
    assert_eq!(lines.lock()[0].1, "hi bob");
}

#[tokio::test]
async fn friend_request_auto_accepts_on_pattern() {
    let hub = MemoryHub::new();
    let (_da, alice) = make_node(&hub, "alice");
    let (_db, bob) = make_node(&hub, "bob");
    bob.set_auto_accept(vec!["alice|carol".into()]).unwrap();

    let request_wire = alice.friend_request("bob").unwrap();
    let accept_wire = bob
        .handle_friend_request(&request_wire)
        .unwrap()
        .expect("auto-accept should answer immediately");
    assert!(bob.pending_friend_requests().is_empty());
    assert!(alice.handle_friend_accept(&accept_wire).unwrap());

    let bob_key = PublicKeyBytes::from_b64(&bob.sign_pub()).unwrap();
    let session = wop_proto::friend::friend_session_name("bob", &bob_key);
    assert!(alice.trust().is_authorized(&bob.sign_pub(), &session));
}

#[tokio::test]
async fn revoked_invite_is_rejected_at_claim() {
    let hub = MemoryHub::new();
    let (_da, alice) = make_node(&hub, "alice");
    let (_db, bob) = make_node(&hub, "bob");
    alice.start().await.unwrap();

    let uri = alice
        .issue_invite(&bob.sign_pub(), strs(&["s1"]), strs(&["inject"]), 1)
        .unwrap();
    let issued = alice.issued_invites();
    assert_eq!(issued.len(), 1);
    alice.revoke_invite(&issued[0].nonce).unwrap();

    let outcome = bob.claim(&uri, Duration::from_secs(5)).await;
    assert_eq!(outcome.code, ExitCode::Rejected);
    assert_eq!(outcome.message.as_deref(), Some("token revoked"));
    assert!(alice.trust().grants().is_empty());
}

#[tokio::test]
async fn expired_invite_fails_locally_with_invalid() {
    let hub = MemoryHub::new();
    let (_da, alice) = make_node(&hub, "alice");
    let (_db, bob) = make_node(&hub, "bob");
    alice.start().await.unwrap();

    let uri = alice
        .issue_invite(&bob.sign_pub(), strs(&["s1"]), strs(&["inject"]), -1)
        .unwrap();
    let outcome = bob.claim(&uri, Duration::from_secs(5)).await;
    assert_eq!(outcome.code, ExitCode::Invalid);
}

#[tokio::test]
async fn claiming_someone_elses_token_is_unauthorized() {
    let hub = MemoryHub::new();
    let (_da, alice) = make_node(&hub, "alice");
    let (_db, bob) = make_node(&hub, "bob");
    let (_dc, carol) = make_node(&hub, "carol");
    alice.start().await.unwrap();

    let uri = alice
        .issue_invite(&carol.sign_pub(), strs(&["s1"]), strs(&["inject"]), 1)
        .unwrap();
    let outcome = bob.claim(&uri, Duration::from_secs(5)).await;
    assert_eq!(outcome.code, ExitCode::Unauthorized);
}
