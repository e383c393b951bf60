//! Authentication Handshake
//!
//! SSH-style mutual public-key authentication, run immediately after the
//! TCP connection opens and before any event frames flow. Both sides
//! prove possession of their private key by signing the peer's random
//! challenge; the server additionally screens the client's key fingerprint
//! against the trust store and, for unknown keys, asks the operator.
//!
//! # Sequence
//!
//! ```text
//! server                                   client
//!   │ ── ServerHello{host key, challenge} ──▶ │
//!   │ ◀── ClientHello{user key, challenge,    │
//!   │         sig(server challenge)} ───────  │
//!   │   verify sig, check fingerprint         │
//!   │ ── Verdict::Pending (unknown key) ────▶ │  client reports AwaitingApproval
//!   │   ... operator decision, ≤ 30 s ...     │
//!   │ ── Verdict::Accepted{sig(client         │
//!   │         challenge)} / Denied ─────────▶ │  client verifies host sig
//! ```
//!
//! The handshake runs over the same length-prefixed framing as event
//! traffic, with its own payload layout; after acceptance the connection
//! switches codecs and the first event frame must be the client's
//! configuration.

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use rand_core::{OsRng, RngCore};
use ssh_key::{PrivateKey, PublicKey};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use super::keys::{self, KeyError, UserKey};
use super::trust::{TrustPolicy, TrustStore};
use crate::protocol::codec::{get_str, get_u8, need, put_str};
use crate::protocol::ProtocolError;

/// Time allowed for the mechanical part of the handshake.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Time the operator has to decide on an unknown fingerprint.
pub const APPROVAL_TIMEOUT: Duration = Duration::from_secs(30);

/// Domain-separation prefix for challenge signatures.
const SIGN_CONTEXT: &[u8] = b"waylink-handshake-v1:";

/// Handshake frame tags.
const TAG_SERVER_HELLO: u8 = 1;
const TAG_CLIENT_HELLO: u8 = 2;
const TAG_VERDICT: u8 = 3;

/// Verdict codes inside [`AuthFrame::Verdict`].
const VERDICT_ACCEPTED: u8 = 1;
const VERDICT_PENDING: u8 = 2;
const VERDICT_DENIED: u8 = 3;

/// Authentication failures. All of them close the session.
#[derive(Debug, Error)]
pub enum AuthError {
    /// The peer violated the handshake sequence.
    #[error("handshake protocol violation: {0}")]
    Protocol(&'static str),

    /// Frame-level failure during the handshake.
    #[error(transparent)]
    Codec(#[from] ProtocolError),

    /// Key material problems on our side, or a bad peer signature.
    #[error(transparent)]
    Key(#[from] KeyError),

    /// The operator (or policy) rejected the peer.
    #[error("authentication denied for {fingerprint}")]
    Denied {
        /// Fingerprint of the rejected key.
        fingerprint: String,
    },

    /// Nobody approved the peer within the approval window.
    #[error("approval timed out for {fingerprint}")]
    ApprovalTimeout {
        /// Fingerprint awaiting approval.
        fingerprint: String,
    },

    /// The mechanical handshake exceeded its deadline.
    #[error("handshake timed out")]
    Timeout,

    /// The peer hung up mid-handshake.
    #[error("connection closed during handshake")]
    Closed,
}

/// Handshake frames.
#[derive(Debug, Clone, PartialEq)]
pub enum AuthFrame {
    /// Server opens: its host public key and a random challenge.
    ServerHello {
        /// Host public key, OpenSSH text form.
        host_key: String,
        /// 32 random bytes the client must sign.
        challenge: Vec<u8>,
    },
    /// Client answers: its user public key, its own challenge, and a
    /// signature over the server's challenge.
    ClientHello {
        /// User public key, OpenSSH text form.
        user_key: String,
        /// 32 random bytes the server must sign on acceptance.
        challenge: Vec<u8>,
        /// SSH wire-format signature over context + server challenge.
        signature: Vec<u8>,
    },
    /// Server's decision. `Pending` may precede the final answer.
    Verdict {
        /// Accepted, pending, or denied.
        verdict: Verdict,
        /// Human-readable detail (fingerprint, denial reason).
        detail: String,
        /// On acceptance: host-key signature over context + client
        /// challenge. Empty otherwise.
        signature: Vec<u8>,
    },
}

/// Server decision states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Key accepted; session may proceed.
    Accepted,
    /// Key unknown; operator approval in progress.
    Pending,
    /// Key rejected.
    Denied,
}

/// What the client-side handshake reports while it runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStatus {
    /// Waiting for the operator on the server to approve our key.
    AwaitingApproval,
}

/// Result of an interactive approval request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalOutcome {
    /// Operator accepted the key.
    Approved,
    /// Operator rejected the key (or let the window lapse).
    Denied,
    /// No interactive approver exists in this process.
    Unavailable,
}

/// A peer awaiting an approval decision.
#[derive(Debug, Clone)]
pub struct PeerClaim {
    /// SHA-256 fingerprint of the presented key.
    pub fingerprint: String,
    /// Remote socket address.
    pub addr: SocketAddr,
}

/// Interactive approval seam. The server wires a terminal prompt; tests
/// wire scripted deciders; a UI would wire its own dialog.
#[async_trait]
pub trait ApprovalPrompt: Send + Sync {
    /// Ask about one peer. Implementations should answer promptly; the
    /// caller enforces the 30-second window.
    async fn request(&self, peer: &PeerClaim) -> ApprovalOutcome;
}

/// Terminal prompt: prints the fingerprint, reads y/n from stdin.
/// Reports [`ApprovalOutcome::Unavailable`] when stdin is not a terminal.
pub struct StdinPrompt;

#[async_trait]
impl ApprovalPrompt for StdinPrompt {
    async fn request(&self, peer: &PeerClaim) -> ApprovalOutcome {
        use std::io::IsTerminal;
        if !std::io::stdin().is_terminal() {
            return ApprovalOutcome::Unavailable;
        }

        eprintln!();
        eprintln!("New client connection from {}", peer.addr);
        eprintln!("Key fingerprint: {}", peer.fingerprint);
        eprint!("Trust this client? [y/N] ");

        use tokio::io::{AsyncBufReadExt, BufReader};
        let mut line = String::new();
        let mut reader = BufReader::new(tokio::io::stdin());
        match reader.read_line(&mut line).await {
            Ok(_) => match line.trim() {
                "y" | "Y" | "yes" => ApprovalOutcome::Approved,
                _ => ApprovalOutcome::Denied,
            },
            Err(_) => ApprovalOutcome::Denied,
        }
    }
}

// ---------------------------------------------------------------------------
// Frame encoding
// ---------------------------------------------------------------------------

impl AuthFrame {
    /// Encode to a frame payload.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(128);
        match self {
            AuthFrame::ServerHello {
                host_key,
                challenge,
            } => {
                buf.put_u8(TAG_SERVER_HELLO);
                put_str(&mut buf, host_key);
                put_bytes(&mut buf, challenge);
            }
            AuthFrame::ClientHello {
                user_key,
                challenge,
                signature,
            } => {
                buf.put_u8(TAG_CLIENT_HELLO);
                put_str(&mut buf, user_key);
                put_bytes(&mut buf, challenge);
                put_bytes(&mut buf, signature);
            }
            AuthFrame::Verdict {
                verdict,
                detail,
                signature,
            } => {
                buf.put_u8(TAG_VERDICT);
                buf.put_u8(match verdict {
                    Verdict::Accepted => VERDICT_ACCEPTED,
                    Verdict::Pending => VERDICT_PENDING,
                    Verdict::Denied => VERDICT_DENIED,
                });
                put_str(&mut buf, detail);
                put_bytes(&mut buf, signature);
            }
        }
        buf.freeze()
    }

    /// Decode from a frame payload.
    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut buf = payload;
        match get_u8(&mut buf)? {
            TAG_SERVER_HELLO => Ok(AuthFrame::ServerHello {
                host_key: get_str(&mut buf)?,
                challenge: get_bytes(&mut buf)?,
            }),
            TAG_CLIENT_HELLO => Ok(AuthFrame::ClientHello {
                user_key: get_str(&mut buf)?,
                challenge: get_bytes(&mut buf)?,
                signature: get_bytes(&mut buf)?,
            }),
            TAG_VERDICT => {
                let verdict = match get_u8(&mut buf)? {
                    VERDICT_ACCEPTED => Verdict::Accepted,
                    VERDICT_PENDING => Verdict::Pending,
                    VERDICT_DENIED => Verdict::Denied,
                    tag => {
                        return Err(ProtocolError::UnknownVariant {
                            context: "auth-verdict",
                            tag,
                        })
                    }
                };
                Ok(AuthFrame::Verdict {
                    verdict,
                    detail: get_str(&mut buf)?,
                    signature: get_bytes(&mut buf)?,
                })
            }
            tag => Err(ProtocolError::UnknownVariant {
                context: "auth-frame",
                tag,
            }),
        }
    }
}

fn put_bytes(buf: &mut BytesMut, data: &[u8]) {
    buf.put_u32(data.len() as u32);
    buf.put_slice(data);
}

fn get_bytes(buf: &mut &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let len = crate::protocol::codec::get_u32(buf)? as usize;
    need(buf, len)?;
    let (head, rest) = buf.split_at(len);
    let out = head.to_vec();
    *buf = rest;
    Ok(out)
}

fn challenge_message(challenge: &[u8]) -> Vec<u8> {
    let mut message = Vec::with_capacity(SIGN_CONTEXT.len() + challenge.len());
    message.extend_from_slice(SIGN_CONTEXT);
    message.extend_from_slice(challenge);
    message
}

fn random_challenge() -> Vec<u8> {
    let mut challenge = vec![0u8; 32];
    OsRng.fill_bytes(&mut challenge);
    challenge
}

// ---------------------------------------------------------------------------
// Server side
// ---------------------------------------------------------------------------

/// The accepted peer, as the server-side handshake returns it.
#[derive(Debug, Clone)]
pub struct AuthenticatedPeer {
    /// The client's public key.
    pub public_key: PublicKey,
    /// Its SHA-256 fingerprint.
    pub fingerprint: String,
}

/// Run the server side of the handshake on a freshly accepted socket.
pub async fn server_handshake<S>(
    framed: &mut Framed<S, crate::protocol::FrameCodec>,
    host_key: &PrivateKey,
    trust: &TrustStore,
    prompt: &dyn ApprovalPrompt,
    addr: SocketAddr,
) -> Result<AuthenticatedPeer, AuthError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let challenge = random_challenge();
    let hello = AuthFrame::ServerHello {
        host_key: host_key
            .public_key()
            .to_openssh()
            .map_err(KeyError::from)?,
        challenge: challenge.clone(),
    };
    send_frame(framed, &hello).await?;

    let frame = recv_frame_timeout(framed, HANDSHAKE_TIMEOUT).await?;
    let AuthFrame::ClientHello {
        user_key,
        challenge: client_challenge,
        signature,
    } = frame
    else {
        return Err(AuthError::Protocol("expected client hello"));
    };

    let public_key = PublicKey::from_openssh(&user_key)
        .map_err(|_| AuthError::Protocol("unparsable client public key"))?;
    keys::verify_wire_signature(&public_key, &challenge_message(&challenge), &signature)?;

    let fingerprint = keys::fingerprint(&public_key).to_string();
    let peer = PeerClaim {
        fingerprint: fingerprint.clone(),
        addr,
    };

    if !trust.contains(&fingerprint) {
        screen_unknown_key(framed, trust, prompt, &peer).await?;
    }

    // Prove our own key over the client's challenge.
    let host_signature = sign_with_host_key(host_key, &client_challenge)?;
    send_frame(
        framed,
        &AuthFrame::Verdict {
            verdict: Verdict::Accepted,
            detail: fingerprint.clone(),
            signature: host_signature,
        },
    )
    .await?;

    info!(%addr, fingerprint, "client authenticated");
    Ok(AuthenticatedPeer {
        public_key,
        fingerprint,
    })
}

/// Decide about a fingerprint that is not in the trust store.
async fn screen_unknown_key<S>(
    framed: &mut Framed<S, crate::protocol::FrameCodec>,
    trust: &TrustStore,
    prompt: &dyn ApprovalPrompt,
    peer: &PeerClaim,
) -> Result<(), AuthError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    send_frame(
        framed,
        &AuthFrame::Verdict {
            verdict: Verdict::Pending,
            detail: peer.fingerprint.clone(),
            signature: Vec::new(),
        },
    )
    .await?;

    let outcome = match tokio::time::timeout(APPROVAL_TIMEOUT, prompt.request(peer)).await {
        Ok(outcome) => outcome,
        Err(_) => {
            deny(framed, peer, "approval timed out").await?;
            return Err(AuthError::ApprovalTimeout {
                fingerprint: peer.fingerprint.clone(),
            });
        }
    };

    match (outcome, trust.policy()) {
        (ApprovalOutcome::Approved, _) => {
            if let Err(e) = trust.insert(&peer.fingerprint) {
                warn!(error = %e, "could not persist approved fingerprint");
            }
            Ok(())
        }
        (ApprovalOutcome::Unavailable, TrustPolicy::Open) => {
            // First-use trust: no operator available, open policy accepts
            // and records the key.
            warn!(
                fingerprint = %peer.fingerprint,
                "accepting unknown key on first use (trust policy: open)"
            );
            if let Err(e) = trust.insert(&peer.fingerprint) {
                warn!(error = %e, "could not persist first-use fingerprint");
            }
            Ok(())
        }
        (ApprovalOutcome::Unavailable, TrustPolicy::Strict) => {
            deny(framed, peer, "key not in whitelist").await?;
            Err(AuthError::Denied {
                fingerprint: peer.fingerprint.clone(),
            })
        }
        (ApprovalOutcome::Denied, _) => {
            deny(framed, peer, "operator denied").await?;
            Err(AuthError::Denied {
                fingerprint: peer.fingerprint.clone(),
            })
        }
    }
}

async fn deny<S>(
    framed: &mut Framed<S, crate::protocol::FrameCodec>,
    peer: &PeerClaim,
    reason: &str,
) -> Result<(), AuthError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    debug!(fingerprint = %peer.fingerprint, reason, "denying client");
    send_frame(
        framed,
        &AuthFrame::Verdict {
            verdict: Verdict::Denied,
            detail: reason.to_string(),
            signature: Vec::new(),
        },
    )
    .await
}

fn sign_with_host_key(host_key: &PrivateKey, challenge: &[u8]) -> Result<Vec<u8>, AuthError> {
    use signature::Signer;
    let sig = host_key
        .try_sign(&challenge_message(challenge))
        .map_err(KeyError::from)?;
    Ok(keys::encode_wire_signature(
        sig.algorithm().as_str(),
        sig.as_bytes(),
    ))
}

// ---------------------------------------------------------------------------
// Client side
// ---------------------------------------------------------------------------

/// Run the client side of the handshake. Returns the server's verified
/// host key. `on_status` fires when the server parks us pending approval.
pub async fn client_handshake<S>(
    framed: &mut Framed<S, crate::protocol::FrameCodec>,
    user_key: &UserKey,
    mut on_status: impl FnMut(HandshakeStatus),
) -> Result<PublicKey, AuthError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let frame = recv_frame_timeout(framed, HANDSHAKE_TIMEOUT).await?;
    let AuthFrame::ServerHello {
        host_key,
        challenge: server_challenge,
    } = frame
    else {
        return Err(AuthError::Protocol("expected server hello"));
    };

    let host_public = PublicKey::from_openssh(&host_key)
        .map_err(|_| AuthError::Protocol("unparsable host public key"))?;

    let client_challenge = random_challenge();
    let signature = user_key
        .sign(&challenge_message(&server_challenge))
        .await?;
    send_frame(
        framed,
        &AuthFrame::ClientHello {
            user_key: user_key
                .public_key()
                .to_openssh()
                .map_err(KeyError::from)?,
            challenge: client_challenge.clone(),
            signature,
        },
    )
    .await?;

    // Pending may arrive any number of times before the final verdict;
    // the overall wait is bounded by the server's approval window plus
    // slack for the operator's terminal.
    let deadline = tokio::time::Instant::now() + APPROVAL_TIMEOUT + HANDSHAKE_TIMEOUT;
    loop {
        let frame = recv_frame_deadline(framed, deadline).await?;
        let AuthFrame::Verdict {
            verdict,
            detail,
            signature,
        } = frame
        else {
            return Err(AuthError::Protocol("expected verdict"));
        };

        match verdict {
            Verdict::Pending => {
                info!("server is awaiting operator approval of our key");
                on_status(HandshakeStatus::AwaitingApproval);
            }
            Verdict::Accepted => {
                keys::verify_wire_signature(
                    &host_public,
                    &challenge_message(&client_challenge),
                    &signature,
                )?;
                info!(host = %keys::fingerprint(&host_public), "server authenticated");
                return Ok(host_public);
            }
            Verdict::Denied => {
                return Err(AuthError::Denied { fingerprint: detail });
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Frame transport helpers
// ---------------------------------------------------------------------------

async fn send_frame<S>(
    framed: &mut Framed<S, crate::protocol::FrameCodec>,
    frame: &AuthFrame,
) -> Result<(), AuthError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    framed.send(frame.encode()).await.map_err(AuthError::Codec)
}

async fn recv_frame_timeout<S>(
    framed: &mut Framed<S, crate::protocol::FrameCodec>,
    timeout: Duration,
) -> Result<AuthFrame, AuthError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match tokio::time::timeout(timeout, framed.next()).await {
        Err(_) => Err(AuthError::Timeout),
        Ok(None) => Err(AuthError::Closed),
        Ok(Some(payload)) => Ok(AuthFrame::decode(&payload?)?),
    }
}

async fn recv_frame_deadline<S>(
    framed: &mut Framed<S, crate::protocol::FrameCodec>,
    deadline: tokio::time::Instant,
) -> Result<AuthFrame, AuthError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match tokio::time::timeout_at(deadline, framed.next()).await {
        Err(_) => Err(AuthError::Timeout),
        Ok(None) => Err(AuthError::Closed),
        Ok(Some(payload)) => Ok(AuthFrame::decode(&payload?)?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::FrameCodec;
    use ssh_key::Algorithm;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_key() -> PrivateKey {
        PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap()
    }

    struct ScriptedPrompt {
        outcome: ApprovalOutcome,
        calls: AtomicUsize,
    }

    impl ScriptedPrompt {
        fn new(outcome: ApprovalOutcome) -> Self {
            Self {
                outcome,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ApprovalPrompt for ScriptedPrompt {
        async fn request(&self, _peer: &PeerClaim) -> ApprovalOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.outcome
        }
    }

    fn trust_in(dir: &tempfile::TempDir, policy: TrustPolicy) -> TrustStore {
        TrustStore::load(&dir.path().join("known_clients"), policy).unwrap()
    }

    fn addr() -> SocketAddr {
        "10.0.0.2:41000".parse().unwrap()
    }

    #[test]
    fn auth_frames_round_trip() {
        let frames = [
            AuthFrame::ServerHello {
                host_key: "ssh-ed25519 AAAA...".into(),
                challenge: vec![1; 32],
            },
            AuthFrame::ClientHello {
                user_key: "ssh-ed25519 BBBB...".into(),
                challenge: vec![2; 32],
                signature: vec![3; 83],
            },
            AuthFrame::Verdict {
                verdict: Verdict::Pending,
                detail: "SHA256:abc".into(),
                signature: vec![],
            },
        ];
        for frame in frames {
            let decoded = AuthFrame::decode(&frame.encode()).unwrap();
            assert_eq!(decoded, frame);
        }
    }

    async fn run_handshake(
        trust: &TrustStore,
        prompt: &dyn ApprovalPrompt,
    ) -> (
        Result<AuthenticatedPeer, AuthError>,
        Result<PublicKey, AuthError>,
        Vec<HandshakeStatus>,
    ) {
        let host_key = test_key();
        let user_key = UserKey::File(Box::new(test_key()));

        let (server_io, client_io) = tokio::io::duplex(16 * 1024);
        let mut server_framed = Framed::new(server_io, FrameCodec::default());
        let mut client_framed = Framed::new(client_io, FrameCodec::default());

        let mut statuses = Vec::new();
        let (server_result, client_result) = tokio::join!(
            server_handshake(&mut server_framed, &host_key, trust, prompt, addr()),
            client_handshake(&mut client_framed, &user_key, |s| statuses.push(s)),
        );
        (server_result, client_result, statuses)
    }

    #[tokio::test]
    async fn unknown_key_approved_interactively() {
        let dir = tempfile::tempdir().unwrap();
        let trust = trust_in(&dir, TrustPolicy::Strict);
        let prompt = ScriptedPrompt::new(ApprovalOutcome::Approved);

        let (server, client, statuses) = run_handshake(&trust, &prompt).await;
        let peer = server.unwrap();
        client.unwrap();

        assert_eq!(prompt.calls.load(Ordering::SeqCst), 1);
        assert!(trust.contains(&peer.fingerprint));
        assert_eq!(statuses, vec![HandshakeStatus::AwaitingApproval]);
    }

    #[tokio::test]
    async fn unknown_key_denied_leaves_store_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let trust = trust_in(&dir, TrustPolicy::Strict);
        let prompt = ScriptedPrompt::new(ApprovalOutcome::Denied);

        let (server, client, _) = run_handshake(&trust, &prompt).await;
        match server {
            Err(AuthError::Denied { .. }) => {}
            other => panic!("expected Denied, got {other:?}"),
        }
        match client {
            Err(AuthError::Denied { .. }) => {}
            other => panic!("expected Denied on client, got {other:?}"),
        }
        assert!(trust.is_empty());
    }

    #[tokio::test]
    async fn strict_policy_without_approver_denies() {
        let dir = tempfile::tempdir().unwrap();
        let trust = trust_in(&dir, TrustPolicy::Strict);
        let prompt = ScriptedPrompt::new(ApprovalOutcome::Unavailable);

        let (server, client, _) = run_handshake(&trust, &prompt).await;
        assert!(matches!(server, Err(AuthError::Denied { .. })));
        assert!(matches!(client, Err(AuthError::Denied { .. })));
        assert!(trust.is_empty());
    }

    #[tokio::test]
    async fn open_policy_without_approver_accepts_first_use() {
        let dir = tempfile::tempdir().unwrap();
        let trust = trust_in(&dir, TrustPolicy::Open);
        let prompt = ScriptedPrompt::new(ApprovalOutcome::Unavailable);

        let (server, client, _) = run_handshake(&trust, &prompt).await;
        let peer = server.unwrap();
        client.unwrap();
        assert!(trust.contains(&peer.fingerprint));
    }

    #[tokio::test]
    async fn known_key_skips_the_prompt() {
        let dir = tempfile::tempdir().unwrap();
        let trust = trust_in(&dir, TrustPolicy::Strict);

        // First connection, approved.
        let approve = ScriptedPrompt::new(ApprovalOutcome::Approved);
        let (server, _, _) = run_handshake(&trust, &approve).await;
        server.unwrap();

        // This prompt would deny — but it must never be consulted.
        // A fresh user key differs per handshake, so re-add the helper key
        // path: instead verify the call count on a known fingerprint.
        let deny = ScriptedPrompt::new(ApprovalOutcome::Denied);
        let host_key = test_key();
        let user_key = UserKey::File(Box::new(test_key()));
        trust
            .insert(&keys::fingerprint(&user_key.public_key()).to_string())
            .unwrap();

        let (server_io, client_io) = tokio::io::duplex(16 * 1024);
        let mut server_framed = Framed::new(server_io, FrameCodec::default());
        let mut client_framed = Framed::new(client_io, FrameCodec::default());
        let (server, client) = tokio::join!(
            server_handshake(&mut server_framed, &host_key, &trust, &deny, addr()),
            client_handshake(&mut client_framed, &user_key, |_| {}),
        );
        server.unwrap();
        client.unwrap();
        assert_eq!(deny.calls.load(Ordering::SeqCst), 0);
    }
}
