use async_trait::async_trait;
use russh::client::{self, Handle};
use russh::{ChannelMsg, Disconnect};
use russh_keys::key;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::core::errors::{ProvisionError, ProvisionResult};
use crate::remote::{CommandOutput, RemoteSession, SshTarget, Transport};

/// Key material for public-key authentication. Passwords are never tried.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshCredentials {
    pub private_key: PathBuf,
    #[serde(default)]
    pub passphrase: Option<String>,
}

impl SshCredentials {
    fn load_key(&self, host: &str) -> ProvisionResult<Arc<key::KeyPair>> {
        russh_keys::load_secret_key(&self.private_key, self.passphrase.as_deref())
            .map(Arc::new)
            .map_err(|e| {
                ProvisionError::ssh(
                    host,
                    format!("cannot load key {}: {}", self.private_key.display(), e),
                )
            })
    }
}

fn default_ssh_port() -> u16 {
    22
}

/// Intermediate host that relays connections to the cluster network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JumpHost {
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub user: String,
    /// Falls back to the node credentials when unset.
    #[serde(default)]
    pub private_key: Option<PathBuf>,
}

impl JumpHost {
    fn target(&self) -> SshTarget {
        SshTarget::new(self.host.clone(), self.user.clone()).with_port(self.port)
    }

    fn credentials(&self, fallback: &SshCredentials) -> SshCredentials {
        match &self.private_key {
            Some(path) => SshCredentials {
                private_key: path.clone(),
                passphrase: fallback.passphrase.clone(),
            },
            None => fallback.clone(),
        }
    }
}

// Freshly imaged nodes come up with host keys nobody has seen yet.
struct AcceptHostKey;

#[async_trait]
impl client::Handler for AcceptHostKey {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &key::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

type SshHandle = Handle<AcceptHostKey>;

fn client_config() -> Arc<client::Config> {
    Arc::new(client::Config::default())
}

async fn connect_tcp(target: &SshTarget, connect_timeout: Duration) -> ProvisionResult<SshHandle> {
    let addr = (target.host.clone(), target.port);
    match timeout(connect_timeout, client::connect(client_config(), addr, AcceptHostKey)).await {
        Ok(Ok(handle)) => Ok(handle),
        Ok(Err(e)) => Err(ProvisionError::ssh(&target.host, e)),
        Err(_) => Err(ProvisionError::ssh(
            &target.host,
            format!("connect timed out after {connect_timeout:?}"),
        )),
    }
}

async fn authenticate(
    handle: &mut SshHandle,
    target: &SshTarget,
    credentials: &SshCredentials,
) -> ProvisionResult<()> {
    let key = credentials.load_key(&target.host)?;
    let accepted = handle
        .authenticate_publickey(target.user.clone(), key)
        .await
        .map_err(|e| ProvisionError::ssh(&target.host, e))?;
    if !accepted {
        return Err(ProvisionError::ssh(
            &target.host,
            format!("public key rejected for {}", target.user),
        ));
    }
    Ok(())
}

async fn disconnect(handle: &SshHandle) {
    if let Err(e) = handle
        .disconnect(Disconnect::ByApplication, "", "en")
        .await
    {
        debug!(error = %e, "ssh disconnect failed");
    }
}

/// A command session, possibly riding on a jump host session.
pub struct SshSession {
    host: String,
    handle: SshHandle,
    jump: Option<SshHandle>,
}

#[async_trait]
impl RemoteSession for SshSession {
    async fn run(&mut self, command: &str) -> ProvisionResult<CommandOutput> {
        let host = self.host.clone();
        let mut channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| ProvisionError::ssh(&host, e))?;
        channel
            .exec(true, command)
            .await
            .map_err(|e| ProvisionError::ssh(&host, e))?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit_status = None;
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { ref data } => stdout.extend_from_slice(data),
                // extended data type 1 is stderr
                ChannelMsg::ExtendedData { ref data, ext } if ext == 1 => {
                    stderr.extend_from_slice(data)
                }
                ChannelMsg::ExitStatus { exit_status: status } => exit_status = Some(status),
                _ => {}
            }
        }

        let exit_status = exit_status.ok_or_else(|| {
            ProvisionError::ssh(&host, "channel closed without an exit status")
        })?;
        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&stdout).to_string(),
            stderr: String::from_utf8_lossy(&stderr).to_string(),
            exit_status,
        })
    }

    async fn close(self: Box<Self>) {
        let SshSession { host, handle, jump } = *self;
        disconnect(&handle).await;
        if let Some(jump) = jump {
            disconnect(&jump).await;
        }
        debug!(host = %host, "ssh session closed");
    }
}

/// Straight TCP to the node's ssh port.
pub struct DirectSsh {
    credentials: SshCredentials,
    connect_timeout: Duration,
}

impl DirectSsh {
    pub fn new(credentials: SshCredentials, connect_timeout: Duration) -> Self {
        Self {
            credentials,
            connect_timeout,
        }
    }
}

#[async_trait]
impl Transport for DirectSsh {
    async fn probe(&self, target: &SshTarget) -> bool {
        let addr = (target.host.as_str(), target.port);
        matches!(
            timeout(self.connect_timeout, TcpStream::connect(addr)).await,
            Ok(Ok(_))
        )
    }

    async fn open(&self, target: &SshTarget) -> ProvisionResult<Box<dyn RemoteSession>> {
        let mut handle = connect_tcp(target, self.connect_timeout).await?;
        if let Err(e) = authenticate(&mut handle, target, &self.credentials).await {
            disconnect(&handle).await;
            return Err(e);
        }
        debug!(%target, "ssh session open");
        Ok(Box::new(SshSession {
            host: target.host.clone(),
            handle,
            jump: None,
        }))
    }
}

/// Two layered sessions: one to the jump host, one to the node over a
/// `direct-tcpip` channel opened from it.
pub struct JumpSsh {
    jump: JumpHost,
    credentials: SshCredentials,
    connect_timeout: Duration,
}

impl JumpSsh {
    pub fn new(jump: JumpHost, credentials: SshCredentials, connect_timeout: Duration) -> Self {
        Self {
            jump,
            credentials,
            connect_timeout,
        }
    }

    async fn open_jump(&self) -> ProvisionResult<SshHandle> {
        let target = self.jump.target();
        let mut handle = connect_tcp(&target, self.connect_timeout).await?;
        if let Err(e) = authenticate(&mut handle, &target, &self.jump.credentials(&self.credentials)).await {
            disconnect(&handle).await;
            return Err(e);
        }
        Ok(handle)
    }

    async fn tunnel_to(&self, jump: &SshHandle, target: &SshTarget) -> ProvisionResult<SshHandle> {
        let channel = timeout(
            self.connect_timeout,
            jump.channel_open_direct_tcpip(target.host.clone(), u32::from(target.port), "127.0.0.1", 0),
        )
        .await
        .map_err(|_| ProvisionError::ssh(&target.host, "tunnel open timed out"))?
        .map_err(|e| ProvisionError::ssh(&target.host, e))?;

        let mut handle = client::connect_stream(client_config(), channel.into_stream(), AcceptHostKey)
            .await
            .map_err(|e| ProvisionError::ssh(&target.host, e))?;
        if let Err(e) = authenticate(&mut handle, target, &self.credentials).await {
            disconnect(&handle).await;
            return Err(e);
        }
        Ok(handle)
    }
}

#[async_trait]
impl Transport for JumpSsh {
    async fn probe(&self, target: &SshTarget) -> bool {
        let jump = match self.open_jump().await {
            Ok(jump) => jump,
            Err(e) => {
                debug!(jump = %self.jump.host, error = %e, "jump host not reachable");
                return false;
            }
        };
        let reachable = matches!(
            timeout(
                self.connect_timeout,
                jump.channel_open_direct_tcpip(target.host.clone(), u32::from(target.port), "127.0.0.1", 0),
            )
            .await,
            Ok(Ok(_))
        );
        disconnect(&jump).await;
        reachable
    }

    async fn open(&self, target: &SshTarget) -> ProvisionResult<Box<dyn RemoteSession>> {
        let jump = self.open_jump().await?;
        let handle = match self.tunnel_to(&jump, target).await {
            Ok(handle) => handle,
            Err(e) => {
                disconnect(&jump).await;
                return Err(e);
            }
        };
        info!(%target, jump = %self.jump.host, "ssh session open via jump host");
        Ok(Box::new(SshSession {
            host: target.host.clone(),
            handle,
            jump: Some(jump),
        }))
    }
}

/// Picks the transport matching the configuration.
pub fn ssh_transport(
    credentials: SshCredentials,
    jump: Option<JumpHost>,
    connect_timeout: Duration,
) -> Arc<dyn Transport> {
    match jump {
        Some(jump) => Arc::new(JumpSsh::new(jump, credentials, connect_timeout)),
        None => Arc::new(DirectSsh::new(credentials, connect_timeout)),
    }
}
