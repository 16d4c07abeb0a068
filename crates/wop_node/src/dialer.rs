//! Dialer-side wire engine.
//!
//! Mirrors the listener: join the peer's topic as a seeker, complete the
//! handshake on the first connection that emerges, send exactly one request,
//! await the substantive reply, tear down. Every phase is bounded — the
//! handshake by its own 5-second sub-deadline, the rest by the caller's
//! timeout — and the swarm membership is released on all exit paths.

use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as B64, Engine};
use chrono::Duration as ChronoDuration;
use tokio::io::BufReader;
use tokio::time::timeout;
use tracing::{debug, warn};
use uuid::Uuid;

use wop_crypto::agreement::{derive_shared, EphemeralPair};
use wop_crypto::rotation::KeyRotation;
use wop_crypto::token::InviteToken;
use wop_crypto::{aead, topic_of, PublicKeyBytes};
use wop_proto::codec::{parse_frame, read_frame};
use wop_proto::envelope::{Body, MIN_PROTOCOL_VERSION, PROTOCOL_VERSION};
use wop_proto::ExitCode;

use crate::engine::send_signed;
use crate::node::{NodeState, Outcome};
use crate::rendezvous::{BoxedStream, JoinMode};

const EPHEMERAL_TTL_MINUTES: i64 = 10;

pub(crate) enum Request {
    Claim { uri: String, token: InviteToken },
    Log { session: String, message: String },
    Inject { session: String, message: String },
    Rotation { record: KeyRotation },
}

/// One request-response exchange against a peer's rendezvous topic.
pub(crate) async fn dial(
    state: &Arc<NodeState>,
    peer_sign_pub: &str,
    request: Request,
    total: Duration,
) -> Outcome {
    let peer_key = match PublicKeyBytes::from_b64(peer_sign_pub) {
        Ok(key) => key,
        Err(_) => return Outcome::fail(ExitCode::Invalid, "malformed peer key"),
    };
    let topic = topic_of(&peer_key.0);

    let mut connections = match state.rendezvous.join(topic, JoinMode::Client).await {
        Ok(rx) => rx,
        Err(e) => {
            return Outcome::fail(ExitCode::PeerOffline, format!("rendezvous join failed: {e}"))
        }
    };

    let outcome = match timeout(total, connections.recv()).await {
        Err(_) | Ok(None) => Outcome::fail(ExitCode::PeerOffline, "no connection at peer topic"),
        Ok(Some(conn)) => exchange(state, peer_sign_pub, request, total, conn.stream).await,
    };

    // Membership and ephemeral state are released on every path.
    let _ = state.rendezvous.leave(topic).await;
    outcome
}

async fn exchange(
    state: &Arc<NodeState>,
    peer_sign_pub: &str,
    request: Request,
    total: Duration,
    stream: BoxedStream,
) -> Outcome {
    let (read_half, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half);

    let our_ephemeral = EphemeralPair::generate(ChronoDuration::minutes(EPHEMERAL_TTL_MINUTES));

    let hello = Body::Hello {
        versions: vec![PROTOCOL_VERSION, MIN_PROTOCOL_VERSION],
        ephemeral_pub: Some(our_ephemeral.kx_pub.to_b64()),
        kx_pub: Some(state.identity.read().kx_pub.to_b64()),
    };
    if send_signed(state, &mut writer, PROTOCOL_VERSION, hello).await.is_err() {
        return Outcome::fail(ExitCode::Offline, "write failed during handshake");
    }

    let handshake_deadline = Duration::from_millis(state.config.handshake_timeout_ms);
    let ack = match timeout(handshake_deadline, read_reply(&mut reader, peer_sign_pub)).await {
        Err(_) => return Outcome::fail(ExitCode::Offline, "handshake timeout"),
        Ok(None) => return Outcome::fail(ExitCode::Offline, "connection closed during handshake"),
        Ok(Some(body)) => body,
    };
    let (version, server_ephemeral, server_kx) = match ack {
        Body::HelloAck { version, ephemeral_pub, kx_pub } => (version, ephemeral_pub, kx_pub),
        Body::Reject { reason } if reason.contains("protocol version") => {
            return Outcome::fail(ExitCode::VersionMismatch, reason)
        }
        Body::Reject { reason } => return Outcome::fail(ExitCode::Rejected, reason),
        other => {
            debug!(msg_type = other.type_name(), "unexpected handshake reply");
            return Outcome::fail(ExitCode::Offline, "unexpected handshake reply");
        }
    };

    let mut request_id = None;
    let body = match &request {
        Request::Claim { uri, .. } => Body::Claim {
            token: uri.clone(),
            kx_pub: Some(state.identity.read().kx_pub.to_b64()),
        },
        Request::Log { session, message } => {
            match seal_payload(
                state,
                &our_ephemeral,
                server_ephemeral.as_deref(),
                server_kx.as_deref(),
                peer_sign_pub,
                version,
                message,
            ) {
                Ok((payload, ephemeral_pub)) => Body::Log {
                    session: session.clone(),
                    payload,
                    ephemeral_pub,
                },
                Err(reason) => return Outcome::fail(ExitCode::Invalid, reason),
            }
        }
        Request::Inject { session, message } => {
            let id = Uuid::new_v4().to_string();
            request_id = Some(id.clone());
            match seal_payload(
                state,
                &our_ephemeral,
                server_ephemeral.as_deref(),
                server_kx.as_deref(),
                peer_sign_pub,
                version,
                message,
            ) {
                Ok((payload, ephemeral_pub)) => Body::Inject {
                    session: session.clone(),
                    payload,
                    request_id: Some(id),
                    ephemeral_pub,
                },
                Err(reason) => return Outcome::fail(ExitCode::Invalid, reason),
            }
        }
        Request::Rotation { record } => Body::KeyRotation {
            key_rotation: record.clone(),
        },
    };
    if send_signed(state, &mut writer, version, body).await.is_err() {
        return Outcome::fail(ExitCode::Offline, "write failed");
    }

    let result = timeout(total, async {
        loop {
            let Some(body) = read_reply(&mut reader, peer_sign_pub).await else {
                return Outcome::fail(ExitCode::Offline, "connection closed before reply");
            };
            match body {
                Body::Ack { kx_pub } => return on_ack(state, &request, peer_sign_pub, kx_pub),
                Body::Response { request_id: rid, payload, ephemeral_pub } => {
                    if request_id.is_some() && rid != request_id {
                        debug!("skipping response for unknown request id");
                        continue;
                    }
                    return open_response(
                        state,
                        &our_ephemeral,
                        server_kx.as_deref(),
                        peer_sign_pub,
                        version,
                        &payload,
                        ephemeral_pub.as_deref(),
                    );
                }
                Body::Reject { reason } => return map_reject(reason),
                other => {
                    debug!(msg_type = other.type_name(), "ignoring message while awaiting reply");
                }
            }
        }
    })
    .await;

    match result {
        Ok(outcome) => outcome,
        Err(_) => Outcome::fail(ExitCode::Offline, "timed out waiting for reply"),
    }
}

/// Read frames until one parses and verifies against the dialed peer's key.
/// `None` means the stream closed or broke.
async fn read_reply<R>(reader: &mut R, peer_sign_pub: &str) -> Option<Body>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    loop {
        let line = read_frame(reader).await.ok()??;
        let Ok(env) = parse_frame(&line) else {
            continue;
        };
        if !env.verify_signature(peer_sign_pub) {
            debug!("dropping reply with bad signature");
            continue;
        }
        return Some(env.body);
    }
}

fn on_ack(
    state: &Arc<NodeState>,
    request: &Request,
    peer_sign_pub: &str,
    ack_kx: Option<String>,
) -> Outcome {
    if let Request::Claim { token, .. } = request {
        // Remember the issuer so later sends can find its key material.
        if let Err(e) =
            state
                .trust
                .add_peer(peer_sign_pub, &token.ses, &token.cap, ack_kx.as_deref())
        {
            warn!("claimed peer could not be recorded: {e}");
        }
    }
    Outcome::ok()
}

fn seal_payload(
    state: &Arc<NodeState>,
    our_ephemeral: &EphemeralPair,
    server_ephemeral: Option<&str>,
    server_kx: Option<&str>,
    peer_sign_pub: &str,
    version: u32,
    message: &str,
) -> Result<(String, Option<String>), String> {
    if version >= 2 {
        if let Some(ephemeral) = server_ephemeral {
            let their = PublicKeyBytes::from_b64(ephemeral)
                .map_err(|_| "invalid server ephemeral key".to_string())?;
            let key = our_ephemeral
                .derive_shared(&their)
                .map_err(|_| "invalid server ephemeral key".to_string())?;
            let sealed =
                aead::encrypt(&key, message.as_bytes()).map_err(|e| e.to_string())?;
            return Ok((B64.encode(sealed), Some(our_ephemeral.kx_pub.to_b64())));
        }
    }
    // Legacy static path: the peer advertised no ephemeral.
    let their_kx = state
        .trust
        .peer_kx(peer_sign_pub)
        .or_else(|| server_kx.map(str::to_string))
        .ok_or_else(|| "no key material for peer".to_string())?;
    let key = static_key(state, &their_kx)?;
    let sealed = aead::encrypt(&key, message.as_bytes()).map_err(|e| e.to_string())?;
    Ok((B64.encode(sealed), None))
}

#[allow(clippy::too_many_arguments)]
fn open_response(
    state: &Arc<NodeState>,
    our_ephemeral: &EphemeralPair,
    server_kx: Option<&str>,
    peer_sign_pub: &str,
    version: u32,
    payload: &str,
    response_ephemeral: Option<&str>,
) -> Outcome {
    let Ok(sealed) = B64.decode(payload) else {
        return Outcome::fail(ExitCode::Invalid, "invalid response encoding");
    };
    let key = match response_ephemeral {
        Some(ephemeral) if version >= 2 => {
            let derived = PublicKeyBytes::from_b64(ephemeral)
                .ok()
                .and_then(|their| our_ephemeral.derive_shared(&their).ok());
            match derived {
                Some(key) => key,
                None => {
                    return Outcome::fail(ExitCode::Invalid, "invalid response ephemeral key")
                }
            }
        }
        _ => {
            let Some(their_kx) = state
                .trust
                .peer_kx(peer_sign_pub)
                .or_else(|| server_kx.map(str::to_string))
            else {
                return Outcome::fail(ExitCode::Invalid, "no key material for peer");
            };
            match static_key(state, &their_kx) {
                Ok(key) => key,
                Err(reason) => return Outcome::fail(ExitCode::Invalid, reason),
            }
        }
    };
    let Ok(plaintext) = aead::decrypt(&key, &sealed) else {
        return Outcome::fail(ExitCode::Invalid, "cannot decrypt response");
    };
    match String::from_utf8(plaintext.to_vec()) {
        Ok(text) => Outcome::ok_with_reply(text),
        Err(_) => Outcome::fail(ExitCode::Invalid, "response is not valid UTF-8"),
    }
}

fn static_key(state: &Arc<NodeState>, their_kx_b64: &str) -> Result<[u8; 32], String> {
    let their = PublicKeyBytes::from_b64(their_kx_b64)
        .map_err(|_| "invalid peer key material".to_string())?;
    let their_arr = their
        .as_array()
        .map_err(|_| "invalid peer key material".to_string())?;
    Ok(derive_shared(
        state.identity.read().kx_secret_bytes(),
        &their_arr,
    ))
}

fn map_reject(reason: String) -> Outcome {
    let code = if reason.contains("rate limited") {
        ExitCode::RateLimited
    } else if reason.contains("protocol version") {
        ExitCode::VersionMismatch
    } else {
        ExitCode::Rejected
    };
    Outcome::fail(code, reason)
}
