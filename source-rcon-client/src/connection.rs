//! Socket ownership, login and the reconnect policy.

use crate::config::ClientConfig;
use crate::frame::{FrameWriter, PacketType};
use crate::reader::{Answers, LoginAnswer, ResponseReader};
use crate::sequence::next_sequence_id;
use crate::{ErrorKind, RconError};
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::watch;

/// Idle time paid after every failed open, even when no backoff is configured.
const MIN_RECONNECT_IDLE: Duration = Duration::from_millis(100);

/// Lifecycle of a client's connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No server has been set up yet.
    Unconfigured,
    /// A server is set up but no socket is open.
    Disconnected,
    /// The socket is open and the login exchange is running.
    Authenticating,
    /// Logged in and accepting requests.
    Ready,
    /// Disposed, rejected, or out of reconnect attempts. Needs a new setup.
    Closed,
}

#[derive(Debug)]
struct Endpoint {
    host: String,
    port: u16,
    password: String,
}

/// Everything tied to one open socket. Replaced as a whole on reconnect.
#[derive(Debug)]
struct Link {
    writer: FrameWriter<OwnedWriteHalf>,
    reader: ResponseReader,
}

#[derive(Debug)]
pub(crate) struct Connection {
    endpoint: Option<Endpoint>,
    config: ClientConfig,
    link: Option<Link>,
    attempts: u32,
    reconnects: Arc<AtomicU64>,
    state: watch::Sender<ConnectionState>,
}

impl Connection {
    pub fn new() -> (Self, watch::Receiver<ConnectionState>) {
        let (state, state_rx) = watch::channel(ConnectionState::Unconfigured);
        let connection = Connection {
            endpoint: None,
            config: ClientConfig::default(),
            link: None,
            attempts: 0,
            reconnects: Arc::new(AtomicU64::new(0)),
            state,
        };
        (connection, state_rx)
    }

    pub fn reconnects(&self) -> Arc<AtomicU64> {
        self.reconnects.clone()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("Connection state {:?} -> {:?}", previous, state);
        }
    }

    pub fn is_configured(&self) -> bool {
        self.endpoint.is_some()
            && !matches!(
                self.state(),
                ConnectionState::Unconfigured | ConnectionState::Closed
            )
    }

    /// Replaces the target server and policy, dropping any open socket.
    pub async fn configure(&mut self, host: &str, port: u16, password: &str, config: ClientConfig) {
        self.teardown().await;
        self.endpoint = Some(Endpoint {
            host: host.to_string(),
            port,
            password: password.to_string(),
        });
        self.config = config;
        self.attempts = 0;
        self.set_state(ConnectionState::Disconnected);
    }

    /// Makes sure a logged-in socket is available, reconnecting if the old one broke.
    pub async fn ensure_ready(&mut self) -> crate::Result<()> {
        match self.state() {
            ConnectionState::Unconfigured | ConnectionState::Closed => {
                Err(RconError::NotConfigured.into())
            }
            ConnectionState::Ready if self.is_alive() => Ok(()),
            ConnectionState::Ready => {
                self.connection_lost().await?;
                self.open().await
            }
            ConnectionState::Disconnected | ConnectionState::Authenticating => self.open().await,
        }
    }

    fn is_alive(&self) -> bool {
        self.link
            .as_ref()
            .map_or(false, |link| link.reader.is_alive())
    }

    /// Drops a broken socket. Moves to `Disconnected` if the policy allows reconnecting,
    /// otherwise to `Closed`.
    pub async fn connection_lost(&mut self) -> crate::Result<()> {
        self.teardown().await;

        if self.config.retry_connect {
            self.set_state(ConnectionState::Disconnected);
            Ok(())
        } else {
            warn!("Connection lost and reconnecting is disabled");
            self.set_state(ConnectionState::Closed);
            Err(RconError::ConnectionClosed.into())
        }
    }

    /// Opens and logs in, retrying transport failures as the policy allows.
    pub async fn open(&mut self) -> crate::Result<()> {
        loop {
            let err = match self.open_once().await {
                Ok(()) => {
                    self.attempts = 0;
                    return Ok(());
                }
                Err(err) => err,
            };

            self.teardown().await;

            if err.kind() == ErrorKind::Authentication {
                error!("Authentication failed, not reconnecting");
                self.attempts = 0;
                self.set_state(ConnectionState::Closed);
                return Err(err);
            }

            tokio::time::sleep(MIN_RECONNECT_IDLE).await;

            if self.config.retry_connect && self.attempts < self.config.reconnect_attempts {
                self.attempts += 1;
                self.reconnects.fetch_add(1, Ordering::SeqCst);
                warn!(
                    "Connection failed: {}. Reconnecting ({}/{})",
                    err, self.attempts, self.config.reconnect_attempts
                );
                self.set_state(ConnectionState::Disconnected);
                tokio::time::sleep(self.config.reconnect_delay()).await;
                continue;
            }

            error!(
                "Connection failed: {}. Giving up after {} reconnect attempts",
                err, self.attempts
            );
            self.attempts = 0;
            self.set_state(ConnectionState::Closed);
            return Err(err);
        }
    }

    async fn open_once(&mut self) -> crate::Result<()> {
        let endpoint = self.endpoint.as_ref().ok_or(RconError::NotConfigured)?;
        let timeout = self.config.timeout();

        debug!("Connecting to {}:{}", endpoint.host, endpoint.port);
        let connect = TcpStream::connect((endpoint.host.as_str(), endpoint.port));
        let stream = match timeout {
            Some(timeout) => tokio::time::timeout(timeout, connect)
                .await
                .map_err(|_| RconError::Timeout)??,
            None => connect.await?,
        };
        stream.set_nodelay(true).ok();

        let (read, write) = stream.into_split();
        let mut link = Link {
            writer: FrameWriter::new(write),
            reader: ResponseReader::spawn(read),
        };
        self.set_state(ConnectionState::Authenticating);

        if !endpoint.password.is_empty() {
            let id = next_sequence_id();
            debug!("Sending login id={}", id);
            link.writer
                .send(id, PacketType::AUTH, &endpoint.password)
                .await?;

            match link.reader.answers().wait_for_login(id, timeout).await {
                LoginAnswer::Accepted => {}
                LoginAnswer::Rejected => return Err(RconError::AuthenticationFailed.into()),
                LoginAnswer::TimedOut => return Err(RconError::Timeout.into()),
            }
        }

        info!("Connected to {}:{}", endpoint.host, endpoint.port);
        self.link = Some(link);
        self.set_state(ConnectionState::Ready);
        Ok(())
    }

    pub async fn send(&mut self, id: i32, kind: PacketType, payload: &str) -> crate::Result<()> {
        let link = self.link.as_mut().ok_or(RconError::NotConfigured)?;
        debug!("Sending request id={} type={}", id, kind);
        link.writer.send(id, kind, payload).await
    }

    pub fn answers(&self) -> Option<Answers> {
        self.link.as_ref().map(|link| link.reader.answers().clone())
    }

    /// Releases the socket, reader task and writer. Secondary failures are only logged.
    async fn teardown(&mut self) {
        if let Some(mut link) = self.link.take() {
            link.reader.dispose();
            if let Err(err) = link.writer.shutdown().await {
                debug!("Ignoring error while closing connection: {}", err);
            }
        }
    }

    pub async fn dispose(&mut self) {
        self.teardown().await;
        self.endpoint = None;
        self.attempts = 0;
        self.set_state(ConnectionState::Closed);
    }
}
