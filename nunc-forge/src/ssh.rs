//! Remote script execution on fleet instances.
//!
//! The bootstrap orchestrator only sees the [`RemoteExecutor`] and
//! [`RemoteSession`] traits. [`SshExecutor`] implements them with russh and
//! public-key authentication.

use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::ChannelMsg;
use russh::client::{self, Config, Handle, Handler};
use russh::keys::PrivateKey;
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::ssh_key::PublicKey;
use tracing::debug;

use crate::config::SshAuthConfig;

/// Time allowed for TCP connect plus SSH handshake and auth.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(thiserror::Error, Debug)]
pub enum SshError {
    #[error("Failed to read SSH key {path}: {source}")]
    ReadKey {
        path: String,
        source: std::io::Error,
    },

    #[error("Failed to parse SSH key: {0}")]
    ParseKey(String),

    #[error("Failed to connect to {addr}: {message}")]
    Connect { addr: SocketAddr, message: String },

    #[error("Timed out: {0}")]
    Timeout(&'static str),

    #[error("Authentication failed for user {0}")]
    AuthRejected(String),

    #[error("SSH channel error: {0}")]
    Channel(#[from] russh::Error),
}

/// Result of one remote script run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScriptOutcome {
    /// `None` if the channel closed without reporting an exit status
    pub exit_status: Option<u32>,
    pub stdout: String,
    pub stderr: String,
}

impl ScriptOutcome {
    /// The script ran to completion and exited 0.
    pub fn success(&self) -> bool {
        self.exit_status == Some(0)
    }
}

/// An authenticated session on one host.
#[async_trait]
pub trait RemoteSession: Send {
    /// Run a script and wait for it to finish.
    async fn run(&mut self, script: &str) -> anyhow::Result<ScriptOutcome>;
}

/// Opens sessions to instances. Owns the credential.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    async fn connect(&self, addr: IpAddr) -> anyhow::Result<Box<dyn RemoteSession>>;
}

/// Client handler for russh.
struct SshHandler;

impl Handler for SshHandler {
    type Error = russh::Error;

    fn check_server_key(
        &mut self,
        _server_public_key: &PublicKey,
    ) -> impl std::future::Future<Output = std::result::Result<bool, Self::Error>> + Send {
        // Instances are rebuilt between jobs, so their host keys change
        async { Ok(true) }
    }
}

/// Load an OpenSSH private key from a file.
pub fn load_key(path: &Path) -> Result<PrivateKey, SshError> {
    let key_data = std::fs::read_to_string(path).map_err(|source| SshError::ReadKey {
        path: path.display().to_string(),
        source,
    })?;
    PrivateKey::from_openssh(&key_data).map_err(|e| SshError::ParseKey(e.to_string()))
}

/// russh-backed executor using a single shared key.
pub struct SshExecutor {
    username: String,
    port: u16,
    key: Arc<PrivateKey>,
}

impl SshExecutor {
    pub fn new(username: impl Into<String>, port: u16, key: PrivateKey) -> Self {
        Self {
            username: username.into(),
            port,
            key: Arc::new(key),
        }
    }

    /// Build from configuration, loading the key from disk.
    pub fn from_config(config: &SshAuthConfig) -> Result<Self, SshError> {
        let key = load_key(&config.private_key_path)?;
        Ok(Self::new(config.username.clone(), config.port, key))
    }

    /// Public half of the key in `authorized_keys` format.
    pub fn public_key_openssh(&self) -> Result<String, SshError> {
        self.key
            .public_key()
            .to_openssh()
            .map_err(|e| SshError::ParseKey(e.to_string()))
    }

    async fn open(&self, addr: SocketAddr) -> Result<Handle<SshHandler>, SshError> {
        debug!("Connecting to SSH at {}", addr);

        let connect = client::connect(Arc::new(Config::default()), addr, SshHandler);
        let mut session = match tokio::time::timeout(CONNECT_TIMEOUT, connect).await {
            Ok(Ok(s)) => s,
            Ok(Err(e)) => {
                return Err(SshError::Connect {
                    addr,
                    message: e.to_string(),
                });
            }
            Err(_) => return Err(SshError::Timeout("SSH connection")),
        };

        let key_with_hash = PrivateKeyWithHashAlg::new(self.key.clone(), None);
        let auth_result = session
            .authenticate_publickey(&self.username, key_with_hash)
            .await?;

        if auth_result.success() {
            debug!("SSH authentication successful on {}", addr);
            Ok(session)
        } else {
            Err(SshError::AuthRejected(self.username.clone()))
        }
    }
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    async fn connect(&self, addr: IpAddr) -> anyhow::Result<Box<dyn RemoteSession>> {
        let handle = self.open(SocketAddr::new(addr, self.port)).await?;
        Ok(Box::new(SshSession { handle }))
    }
}

struct SshSession {
    handle: Handle<SshHandler>,
}

#[async_trait]
impl RemoteSession for SshSession {
    async fn run(&mut self, script: &str) -> anyhow::Result<ScriptOutcome> {
        let mut channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(SshError::from)?;

        channel.exec(true, script).await.map_err(SshError::from)?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit_status = None;

        loop {
            match channel.wait().await {
                Some(ChannelMsg::Data { data }) => {
                    stdout.extend_from_slice(&data);
                }
                Some(ChannelMsg::ExtendedData { data, ext }) => {
                    if ext == 1 {
                        stderr.extend_from_slice(&data);
                    }
                }
                Some(ChannelMsg::ExitStatus { exit_status: status }) => {
                    exit_status = Some(status);
                }
                // Exit status may arrive after EOF, keep reading until close
                Some(ChannelMsg::Eof) => {}
                Some(ChannelMsg::Close) | None => break,
                Some(_) => {}
            }
        }

        Ok(ScriptOutcome {
            exit_status,
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        })
    }
}
