//! Listener-side wire engine.
//!
//! One task per accepted connection. The state machine is:
//!
//! ```text
//! INIT ── recv hello ──► send hello-ack ──► AUTHENTICATED
//! AUTHENTICATED ── recv X ──► handler ──► AUTHENTICATED | CLOSED
//! ```
//!
//! After the handshake every message must verify against `from` and pass the
//! replay check; failures charge the `invalid` limiter and are dropped with
//! no reply. `key-rotation` is the one type verified against the embedded
//! record's `oldSignPub` instead of `from`. Handler failures become
//! `reject`s — nothing unwinds past the connection boundary.

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as B64, Engine};
use chrono::Duration as ChronoDuration;
use tokio::io::{AsyncWrite, BufReader};
use tracing::{debug, info, warn};

use wop_crypto::agreement::{derive_shared, EphemeralPair};
use wop_crypto::{aead, rotation, token, PublicKeyBytes};
use wop_proto::codec::{parse_frame, read_frame, write_frame, CodecError, MAX_PAYLOAD_BYTES};
use wop_proto::envelope::{negotiate, Body, Envelope};

use crate::node::NodeState;
use crate::rendezvous::BoxedStream;

/// Lifetime of the per-connection ephemeral pair; connections this old are
/// torn down by their peers long before the pair expires.
const EPHEMERAL_TTL_MINUTES: i64 = 10;

struct ConnState {
    version: u32,
    our_ephemeral: EphemeralPair,
    /// Long-term kx key the peer advertised in its hello, if any.
    peer_hello_kx: Option<String>,
}

/// Entry point for every accepted stream. Transport errors during teardown
/// are expected and never propagate.
pub(crate) async fn serve_connection(state: Arc<NodeState>, stream: BoxedStream) {
    if let Err(e) = run_connection(state, stream).await {
        debug!("connection closed: {e}");
    }
}

async fn run_connection(state: Arc<NodeState>, stream: BoxedStream) -> anyhow::Result<()> {
    let (read_half, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half);

    let Some(conn) = handshake(&state, &mut reader, &mut writer).await? else {
        return Ok(());
    };

    loop {
        let line = match read_frame(&mut reader).await {
            Ok(Some(line)) => line,
            Ok(None) => return Ok(()),
            Err(CodecError::FrameTooLarge) => {
                send_signed(&state, &mut writer, conn.version, Body::Reject {
                    reason: "payload too large".into(),
                })
                .await?;
                return Ok(());
            }
            Err(e) => {
                debug!("unreadable frame, closing: {e}");
                return Ok(());
            }
        };
        let env = match parse_frame(&line) {
            Ok(env) => env,
            Err(e) => {
                debug!("dropping unparseable message: {e}");
                continue;
            }
        };
        if !gate(&state, &env) {
            continue;
        }
        dispatch(&state, &conn, env, &mut writer).await?;
    }
}

/// INIT state: the first frame must be a `hello`. Returns `None` when the
/// connection was rejected or closed before authentication.
async fn handshake<W>(
    state: &Arc<NodeState>,
    reader: &mut BufReader<tokio::io::ReadHalf<BoxedStream>>,
    writer: &mut W,
) -> anyhow::Result<Option<ConnState>>
where
    W: AsyncWrite + Unpin,
{
    let Some(line) = read_frame(reader).await? else {
        return Ok(None);
    };
    let env = parse_frame(&line)?;
    let Body::Hello { versions, kx_pub, .. } = env.body else {
        debug!("first frame was not a hello, closing");
        return Ok(None);
    };
    let Some(version) = negotiate(&versions) else {
        send_signed(state, writer, wop_proto::PROTOCOL_VERSION, Body::Reject {
            reason: "no common protocol version".into(),
        })
        .await?;
        return Ok(None);
    };

    let our_ephemeral = EphemeralPair::generate(ChronoDuration::minutes(EPHEMERAL_TTL_MINUTES));
    let ack = Body::HelloAck {
        version,
        ephemeral_pub: (version >= 2).then(|| our_ephemeral.kx_pub.to_b64()),
        kx_pub: Some(state.identity.read().kx_pub.to_b64()),
    };
    send_signed(state, writer, version, ack).await?;
    debug!(peer = %peer_tag(&env.from), version, "handshake complete");

    Ok(Some(ConnState {
        version,
        our_ephemeral,
        peer_hello_kx: kx_pub,
    }))
}

/// Signature and replay gate. A failure charges the sender's `invalid`
/// limiter and drops the message silently.
fn gate(state: &NodeState, env: &Envelope) -> bool {
    let sig_ok = match &env.body {
        Body::KeyRotation { key_rotation } => rotation::verify(key_rotation),
        _ => env.verify_from(),
    };
    if !sig_ok {
        state.limiter.check(&env.from, "invalid");
        debug!(msg_type = env.body.type_name(), "dropping message with bad signature");
        return false;
    }
    if !state.replay.check(&env.nonce, env.ts) {
        state.limiter.check(&env.from, "invalid");
        debug!(msg_type = env.body.type_name(), "dropping replayed or stale message");
        return false;
    }
    true
}

async fn dispatch<W>(
    state: &Arc<NodeState>,
    conn: &ConnState,
    env: Envelope,
    writer: &mut W,
) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let from = env.from.clone();
    match env.body {
        Body::Claim { token, kx_pub } => {
            handle_claim(state, conn, writer, &from, &token, kx_pub.as_deref()).await
        }
        Body::Log { session, payload, ephemeral_pub } => {
            handle_log(state, conn, writer, &from, &session, &payload, ephemeral_pub.as_deref())
                .await
        }
        Body::Inject { session, payload, request_id, ephemeral_pub } => {
            handle_inject(
                state,
                conn,
                writer,
                &from,
                &session,
                &payload,
                request_id,
                ephemeral_pub.as_deref(),
            )
            .await
        }
        Body::KeyRotation { key_rotation } => {
            let applied = state
                .trust
                .process_peer_rotation(&key_rotation)
                .unwrap_or_else(|e| {
                    warn!("rotation persistence failed: {e}");
                    false
                });
            let reply = if applied {
                Body::Ack { kx_pub: None }
            } else {
                Body::Reject { reason: "invalid key rotation".into() }
            };
            send_signed(state, writer, conn.version, reply).await
        }
        other => {
            debug!(msg_type = other.type_name(), "dropping unexpected message");
            Ok(())
        }
    }
}

async fn handle_claim<W>(
    state: &Arc<NodeState>,
    conn: &ConnState,
    writer: &mut W,
    from: &str,
    token_uri: &str,
    claim_kx: Option<&str>,
) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    if !state.limiter.check(from, "claim") {
        return send_signed(state, writer, conn.version, Body::Reject {
            reason: "rate limited".into(),
        })
        .await;
    }

    let reply = match token::parse(token_uri) {
        Err(e) => Body::Reject { reason: e.to_string() },
        Ok(tok) => {
            let our_key = state.identity.read().sign_pub.to_b64();
            if tok.iss != our_key {
                Body::Reject { reason: "token not issued by this node".into() }
            } else if tok.sub != from {
                Body::Reject { reason: "token subject mismatch".into() }
            } else if state.invites.is_revoked(&tok.nonce) {
                Body::Reject { reason: "token revoked".into() }
            } else {
                let kx = claim_kx.or(conn.peer_hello_kx.as_deref());
                match state.trust.grant_access(&tok.sub, &tok.ses, &tok.cap, kx) {
                    Ok(_) => {
                        info!(peer = %peer_tag(from), sessions = ?tok.ses, "invite claimed");
                        Body::Ack { kx_pub: Some(state.identity.read().kx_pub.to_b64()) }
                    }
                    Err(e) => {
                        warn!("grant persistence failed: {e}");
                        Body::Reject { reason: "grant failed".into() }
                    }
                }
            }
        }
    };
    send_signed(state, writer, conn.version, reply).await
}

async fn handle_log<W>(
    state: &Arc<NodeState>,
    conn: &ConnState,
    writer: &mut W,
    from: &str,
    session: &str,
    payload: &str,
    msg_ephemeral: Option<&str>,
) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    if !state.limiter.check(from, "log") {
        return send_signed(state, writer, conn.version, Body::Reject {
            reason: "rate limited".into(),
        })
        .await;
    }
    let plaintext = match authorize_and_decrypt(state, conn, from, session, payload, msg_ephemeral)
    {
        Ok(text) => text,
        Err(reason) => {
            return send_signed(state, writer, conn.version, Body::Reject { reason }).await;
        }
    };

    let handler = state.log_handler.read().clone();
    if let Some(handler) = handler {
        handler.on_log(session, &plaintext, from).await;
    }
    send_signed(state, writer, conn.version, Body::Ack { kx_pub: None }).await
}

#[allow(clippy::too_many_arguments)]
async fn handle_inject<W>(
    state: &Arc<NodeState>,
    conn: &ConnState,
    writer: &mut W,
    from: &str,
    session: &str,
    payload: &str,
    request_id: Option<String>,
    msg_ephemeral: Option<&str>,
) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    if !state.limiter.check(from, "inject") {
        return send_signed(state, writer, conn.version, Body::Reject {
            reason: "rate limited".into(),
        })
        .await;
    }
    let plaintext = match authorize_and_decrypt(state, conn, from, session, payload, msg_ephemeral)
    {
        Ok(text) => text,
        Err(reason) => {
            return send_signed(state, writer, conn.version, Body::Reject { reason }).await;
        }
    };

    let handler = state.inject_handler.read().clone();
    let Some(handler) = handler else {
        // Back-compat: a node without an agent acknowledges and moves on.
        return send_signed(state, writer, conn.version, Body::Ack { kx_pub: None }).await;
    };

    let agent_reply = {
        let _slot = state.inject_guard.enter(session);
        handler.on_inject(session, &plaintext, from).await
    };
    let reply_text = match agent_reply {
        Ok(text) => text,
        Err(e) => {
            warn!(session, "inject handler failed: {e}");
            return send_signed(state, writer, conn.version, Body::Reject {
                reason: "inject failed".into(),
            })
            .await;
        }
    };

    let reply = match encrypt_response(state, conn, from, msg_ephemeral, &reply_text) {
        Ok((payload, ephemeral_pub)) => Body::Response { request_id, payload, ephemeral_pub },
        Err(reason) => Body::Reject { reason },
    };
    send_signed(state, writer, conn.version, reply).await
}

/// Size bound, authorization, then decryption — in that order, each failure
/// with its own reject reason.
fn authorize_and_decrypt(
    state: &NodeState,
    conn: &ConnState,
    from: &str,
    session: &str,
    payload: &str,
    msg_ephemeral: Option<&str>,
) -> Result<String, String> {
    let sealed = B64
        .decode(payload)
        .map_err(|_| "invalid payload encoding".to_string())?;
    if sealed.len() > MAX_PAYLOAD_BYTES {
        return Err("payload too large".into());
    }
    if !state.trust.is_authorized(from, session) {
        return Err("unauthorized".into());
    }

    let key = payload_key(state, conn, from, msg_ephemeral)?;
    let plaintext = aead::decrypt(&key, &sealed).map_err(|_| "decrypt failed".to_string())?;
    String::from_utf8(plaintext.to_vec()).map_err(|_| "invalid payload".into())
}

/// Forward-secret key when the negotiated version allows it and the message
/// carries an `ephemeralPub`; the legacy static path otherwise.
fn payload_key(
    state: &NodeState,
    conn: &ConnState,
    from: &str,
    msg_ephemeral: Option<&str>,
) -> Result<[u8; 32], String> {
    if conn.version >= 2 {
        if let Some(ephemeral) = msg_ephemeral {
            let their = PublicKeyBytes::from_b64(ephemeral)
                .map_err(|_| "invalid ephemeral key".to_string())?;
            return conn
                .our_ephemeral
                .derive_shared(&their)
                .map_err(|_| "invalid ephemeral key".into());
        }
    }
    let their_kx = state
        .trust
        .grant_for(from)
        .and_then(|g| g.peer_kx_pub)
        .or_else(|| conn.peer_hello_kx.clone())
        .ok_or_else(|| "no key material for sender".to_string())?;
    let their = PublicKeyBytes::from_b64(&their_kx).map_err(|_| "invalid key material".to_string())?;
    let their_arr = their.as_array().map_err(|_| "invalid key material".to_string())?;
    Ok(derive_shared(state.identity.read().kx_secret_bytes(), &their_arr))
}

/// Inject replies get a fresh server-side ephemeral pair keyed against the
/// sender's ephemeral when forward secrecy is on. The current message's
/// `ephemeralPub` governs the choice of path, exactly as it did for the
/// decrypt in `payload_key`; a message that arrived on the static path is
/// answered on the static path.
fn encrypt_response(
    state: &NodeState,
    conn: &ConnState,
    from: &str,
    msg_ephemeral: Option<&str>,
    reply_text: &str,
) -> Result<(String, Option<String>), String> {
    if conn.version >= 2 {
        if let Some(ephemeral) = msg_ephemeral {
            let fresh = EphemeralPair::generate(ChronoDuration::minutes(EPHEMERAL_TTL_MINUTES));
            let their = PublicKeyBytes::from_b64(ephemeral)
                .map_err(|_| "invalid ephemeral key".to_string())?;
            let key = fresh
                .derive_shared(&their)
                .map_err(|_| "invalid ephemeral key".to_string())?;
            let sealed = aead::encrypt(&key, reply_text.as_bytes())
                .map_err(|_| "encrypt failed".to_string())?;
            return Ok((B64.encode(sealed), Some(fresh.kx_pub.to_b64())));
        }
    }
    let key = payload_key(state, conn, from, None)?;
    let sealed =
        aead::encrypt(&key, reply_text.as_bytes()).map_err(|_| "encrypt failed".to_string())?;
    Ok((B64.encode(sealed), None))
}

/// Build, sign and write one envelope with the node's current identity.
pub(crate) async fn send_signed<W>(
    state: &NodeState,
    writer: &mut W,
    version: u32,
    body: Body,
) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let env = {
        let identity = state.identity.read();
        let mut env = Envelope::new(version, identity.sign_pub.to_b64(), body);
        env.sign(&identity)?;
        env
    };
    write_frame(writer, &env).await?;
    Ok(())
}

/// Short handle for log lines; falls back to a prefix of the raw string.
fn peer_tag(from: &str) -> String {
    PublicKeyBytes::from_b64(from)
        .map(|k| k.short_id())
        .unwrap_or_else(|_| from.chars().take(8).collect())
}
