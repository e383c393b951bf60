//! Key Material
//!
//! OpenSSH-compatible key handling for both roles:
//!
//! - **Server host key** — loaded from the configured path; generated on
//!   first run (ed25519, OpenSSH private key format, mode 0600) so a fresh
//!   install works without ceremony.
//! - **Client user key** — discovered in order: the configured path, then
//!   the running SSH agent (`$SSH_AUTH_SOCK`), then the default
//!   `~/.ssh/id_ed25519`. Agent-held keys never leave the agent; signing
//!   is delegated over the agent socket.
//!
//! Signatures travel in SSH wire form (algorithm string + raw signature),
//! which is exactly what the agent protocol produces, so file-backed and
//! agent-backed keys are indistinguishable on the wire.

use bytes::{Buf, BufMut, BytesMut};
use rand_core::OsRng;
use signature::{Signer, Verifier};
use ssh_key::{Algorithm, Fingerprint, HashAlg, PrivateKey, PublicKey};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tracing::{debug, info, warn};

/// Key-material failures.
#[derive(Debug, Error)]
pub enum KeyError {
    /// Reading or writing a key file failed.
    #[error("key file {path}: {source}")]
    File {
        /// The key file involved.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// A key file did not parse as an OpenSSH key.
    #[error("cannot parse key {path}: {source}")]
    Parse {
        /// The key file involved.
        path: PathBuf,
        /// Underlying error.
        source: ssh_key::Error,
    },

    /// Key generation or encoding failed.
    #[error("key operation failed: {0}")]
    Crypto(#[from] ssh_key::Error),

    /// Producing a signature failed.
    #[error("signing failed: {0}")]
    Sign(#[from] signature::Error),

    /// No user key could be discovered anywhere.
    #[error("no user key found: no configured path, no agent identity, no default key")]
    NoUserKey,

    /// Talking to the SSH agent failed.
    #[error("ssh-agent: {0}")]
    Agent(String),

    /// A peer-supplied signature did not verify.
    #[error("signature verification failed")]
    BadSignature,
}

/// Load the host key, generating one on first run.
pub fn load_or_generate_host_key(path: &Path) -> Result<PrivateKey, KeyError> {
    match PrivateKey::read_openssh_file(path) {
        Ok(key) => {
            debug!(path = %path.display(), "host key loaded");
            Ok(key)
        }
        Err(ssh_key::Error::Io(e)) if e == std::io::ErrorKind::NotFound => {
            generate_host_key(path)
        }
        Err(source) => Err(KeyError::Parse {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn generate_host_key(path: &Path) -> Result<PrivateKey, KeyError> {
    info!(path = %path.display(), "generating new ed25519 host key");
    let key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519)?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| KeyError::File {
            path: path.to_path_buf(),
            source,
        })?;
    }
    key.write_openssh_file(path, ssh_key::LineEnding::LF)?;

    // Private key; nobody else gets to read it.
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).map_err(|source| {
        KeyError::File {
            path: path.to_path_buf(),
            source,
        }
    })?;

    Ok(key)
}

/// SHA-256 fingerprint of a public key, in `SHA256:...` form.
pub fn fingerprint(key: &PublicKey) -> Fingerprint {
    key.fingerprint(HashAlg::Sha256)
}

// ---------------------------------------------------------------------------
// User key discovery
// ---------------------------------------------------------------------------

/// A user identity that can sign challenges: either a private key file or
/// a key held by the SSH agent.
#[derive(Debug)]
pub enum UserKey {
    /// Key loaded from disk.
    File(Box<PrivateKey>),
    /// Key resident in the agent; only the public half is local.
    Agent {
        /// Agent socket path.
        socket: PathBuf,
        /// The identity's public key.
        public: Box<PublicKey>,
    },
}

impl UserKey {
    /// Discover the user key: configured path, then agent, then default
    /// location.
    pub async fn discover(configured: Option<&Path>) -> Result<Self, KeyError> {
        if let Some(path) = configured {
            let key = PrivateKey::read_openssh_file(path).map_err(|source| KeyError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
            debug!(path = %path.display(), "user key loaded from configured path");
            return Ok(Self::File(Box::new(key)));
        }

        if let Ok(socket) = std::env::var("SSH_AUTH_SOCK") {
            let socket = PathBuf::from(socket);
            match first_agent_identity(&socket).await {
                Ok(Some(public)) => {
                    debug!(key = %fingerprint(&public), "using ssh-agent identity");
                    return Ok(Self::Agent {
                        socket,
                        public: Box::new(public),
                    });
                }
                Ok(None) => debug!("agent holds no usable identity"),
                Err(e) => warn!(error = %e, "ssh-agent unavailable"),
            }
        }

        let default = dirs::home_dir()
            .map(|home| home.join(".ssh").join("id_ed25519"))
            .filter(|path| path.exists());
        if let Some(path) = default {
            let key = PrivateKey::read_openssh_file(&path).map_err(|source| KeyError::Parse {
                path: path.clone(),
                source,
            })?;
            debug!(path = %path.display(), "user key loaded from default location");
            return Ok(Self::File(Box::new(key)));
        }

        Err(KeyError::NoUserKey)
    }

    /// The public half of the identity.
    pub fn public_key(&self) -> PublicKey {
        match self {
            Self::File(key) => key.public_key().clone(),
            Self::Agent { public, .. } => (**public).clone(),
        }
    }

    /// Sign a challenge, producing an SSH wire-format signature blob.
    pub async fn sign(&self, data: &[u8]) -> Result<Vec<u8>, KeyError> {
        match self {
            Self::File(key) => {
                let sig = key.try_sign(data)?;
                Ok(encode_wire_signature(
                    sig.algorithm().as_str(),
                    sig.as_bytes(),
                ))
            }
            Self::Agent { socket, public } => agent_sign(socket, public, data).await,
        }
    }
}

/// Verify an SSH wire-format signature blob against a public key.
pub fn verify_wire_signature(
    key: &PublicKey,
    data: &[u8],
    blob: &[u8],
) -> Result<(), KeyError> {
    let (algorithm, raw) = decode_wire_signature(blob)?;
    let algorithm: Algorithm = algorithm
        .parse()
        .map_err(|_| KeyError::BadSignature)?;
    let sig =
        ssh_key::Signature::new(algorithm, raw).map_err(|_| KeyError::BadSignature)?;
    key.key_data()
        .verify(data, &sig)
        .map_err(|_| KeyError::BadSignature)
}

pub(crate) fn encode_wire_signature(algorithm: &str, raw: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(8 + algorithm.len() + raw.len());
    buf.put_u32(algorithm.len() as u32);
    buf.put_slice(algorithm.as_bytes());
    buf.put_u32(raw.len() as u32);
    buf.put_slice(raw);
    buf.to_vec()
}

fn decode_wire_signature(blob: &[u8]) -> Result<(String, Vec<u8>), KeyError> {
    let mut buf = blob;
    let algorithm = read_string(&mut buf)?;
    let raw = read_bytes(&mut buf)?;
    let algorithm =
        String::from_utf8(algorithm).map_err(|_| KeyError::BadSignature)?;
    Ok((algorithm, raw))
}

// ---------------------------------------------------------------------------
// Minimal ssh-agent client (RFC draft-miller-ssh-agent)
// ---------------------------------------------------------------------------

const SSH_AGENTC_REQUEST_IDENTITIES: u8 = 11;
const SSH_AGENT_IDENTITIES_ANSWER: u8 = 12;
const SSH_AGENTC_SIGN_REQUEST: u8 = 13;
const SSH_AGENT_SIGN_RESPONSE: u8 = 14;

/// First ed25519 identity held by the agent, if any.
async fn first_agent_identity(socket: &Path) -> Result<Option<PublicKey>, KeyError> {
    let reply = agent_roundtrip(socket, &[SSH_AGENTC_REQUEST_IDENTITIES]).await?;
    let mut buf = reply.as_slice();

    let kind = read_u8(&mut buf)?;
    if kind != SSH_AGENT_IDENTITIES_ANSWER {
        return Err(KeyError::Agent(format!(
            "unexpected reply type {kind} to identity request"
        )));
    }

    let count = read_u32(&mut buf)?;
    for _ in 0..count {
        let blob = read_bytes(&mut buf)?;
        let _comment = read_bytes(&mut buf)?;
        match PublicKey::from_bytes(&blob) {
            Ok(key) if key.algorithm() == Algorithm::Ed25519 => return Ok(Some(key)),
            Ok(key) => debug!(algorithm = %key.algorithm(), "skipping non-ed25519 agent key"),
            Err(e) => debug!(error = %e, "skipping unparsable agent key"),
        }
    }
    Ok(None)
}

/// Ask the agent to sign `data` with the given identity.
async fn agent_sign(
    socket: &Path,
    public: &PublicKey,
    data: &[u8],
) -> Result<Vec<u8>, KeyError> {
    let key_blob = public
        .to_bytes()
        .map_err(|e| KeyError::Agent(format!("cannot encode key blob: {e}")))?;

    let mut request = BytesMut::new();
    request.put_u8(SSH_AGENTC_SIGN_REQUEST);
    request.put_u32(key_blob.len() as u32);
    request.put_slice(&key_blob);
    request.put_u32(data.len() as u32);
    request.put_slice(data);
    request.put_u32(0); // no flags

    let reply = agent_roundtrip(socket, &request).await?;
    let mut buf = reply.as_slice();

    let kind = read_u8(&mut buf)?;
    if kind != SSH_AGENT_SIGN_RESPONSE {
        return Err(KeyError::Agent(format!(
            "agent refused to sign (reply type {kind})"
        )));
    }
    // The agent's signature payload is already SSH wire format.
    read_bytes(&mut buf)
}

async fn agent_roundtrip(socket: &Path, request: &[u8]) -> Result<Vec<u8>, KeyError> {
    let mut stream = UnixStream::connect(socket)
        .await
        .map_err(|e| KeyError::Agent(format!("connect {}: {e}", socket.display())))?;

    let mut framed = Vec::with_capacity(4 + request.len());
    framed.extend_from_slice(&(request.len() as u32).to_be_bytes());
    framed.extend_from_slice(request);
    stream
        .write_all(&framed)
        .await
        .map_err(|e| KeyError::Agent(format!("write: {e}")))?;

    let mut len_bytes = [0u8; 4];
    stream
        .read_exact(&mut len_bytes)
        .await
        .map_err(|e| KeyError::Agent(format!("read: {e}")))?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > 1024 * 1024 {
        return Err(KeyError::Agent(format!("oversized agent reply: {len}")));
    }
    let mut reply = vec![0u8; len];
    stream
        .read_exact(&mut reply)
        .await
        .map_err(|e| KeyError::Agent(format!("read: {e}")))?;
    Ok(reply)
}

// ---------------------------------------------------------------------------
// Wire primitive readers
// ---------------------------------------------------------------------------

fn read_u8(buf: &mut &[u8]) -> Result<u8, KeyError> {
    if buf.remaining() < 1 {
        return Err(KeyError::Agent("truncated message".into()));
    }
    Ok(buf.get_u8())
}

fn read_u32(buf: &mut &[u8]) -> Result<u32, KeyError> {
    if buf.remaining() < 4 {
        return Err(KeyError::Agent("truncated message".into()));
    }
    Ok(buf.get_u32())
}

fn read_bytes(buf: &mut &[u8]) -> Result<Vec<u8>, KeyError> {
    let len = read_u32(buf)? as usize;
    if buf.remaining() < len {
        return Err(KeyError::Agent("truncated message".into()));
    }
    let (head, rest) = buf.split_at(len);
    let out = head.to_vec();
    *buf = rest;
    Ok(out)
}

fn read_string(buf: &mut &[u8]) -> Result<Vec<u8>, KeyError> {
    read_bytes(buf)
}
