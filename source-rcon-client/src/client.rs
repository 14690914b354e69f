use crate::config::ClientConfig;
use crate::connection::{Connection, ConnectionState};
use crate::frame::{PacketType, Response};
use crate::reader::Answers;
use crate::sequence::next_sequence_id;
use log::{debug, warn};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

/// A shareable RCON client.
///
/// Cloning is cheap and every clone talks over the same connection. Writes are serialized,
/// answers are matched to requests by sequence id.
#[derive(Debug, Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    /// Guards every write and every reconnect.
    connection: Mutex<Connection>,
    state: watch::Receiver<ConnectionState>,
    reconnects: Arc<AtomicU64>,
}

/// A request on the wire whose answer has not been collected yet.
struct Pending {
    id: i32,
    answers: Answers,
    timeout: Option<Duration>,
    collect_in_background: bool,
}

impl Client {
    /// Creates an unconfigured client. Sends return empty answers until [`Client::setup`]
    /// succeeds.
    pub fn new() -> Self {
        let (connection, state) = Connection::new();
        let reconnects = connection.reconnects();
        Client {
            inner: Arc::new(Inner {
                connection: Mutex::new(connection),
                state,
                reconnects,
            }),
        }
    }

    /// Points the client at a server and connects, logging in if `password` is not empty.
    ///
    /// Any previous connection is dropped first. An authentication failure is terminal and is
    /// never retried; transport failures are retried as `config` allows.
    pub async fn setup(
        &self,
        host: &str,
        port: u16,
        password: &str,
        config: ClientConfig,
    ) -> crate::Result<()> {
        let mut connection = self.inner.connection.lock().await;
        connection.configure(host, port, password, config).await;
        connection.open().await
    }

    /// Runs a console command and returns its output.
    ///
    /// The result is empty when the client is not configured, the request could not be
    /// written, or no answer arrived within the timeout.
    pub async fn send_command(&self, command: &str) -> String {
        self.send_message(PacketType::EXEC_COMMAND, command).await
    }

    /// Sends a packet of any type and returns the payload of its answer.
    pub async fn send_message(&self, kind: PacketType, text: &str) -> String {
        self.request(kind, text).await.payload
    }

    /// Sends a packet and returns the whole answer, [`Response::empty`] if there is none.
    pub async fn request(&self, kind: PacketType, text: &str) -> Response {
        match self.dispatch(kind, text).await {
            Some(pending) => pending.answers.wait_for(pending.id, pending.timeout).await,
            None => Response::empty(),
        }
    }

    /// Sends a packet without waiting for it.
    ///
    /// The answer is only collected (and logged) when the server is configured as supporting
    /// concurrent reads; otherwise it is left to be pruned from the answer table.
    pub fn fire_and_forget(&self, kind: PacketType, text: &str) -> JoinHandle<()> {
        let client = self.clone();
        let text = text.to_string();

        tokio::spawn(async move {
            let pending = match client.dispatch(kind, &text).await {
                Some(pending) => pending,
                None => return,
            };

            if pending.collect_in_background {
                let answer = pending.answers.wait_for(pending.id, pending.timeout).await;
                debug!(
                    "Background request id={} answered with {} bytes",
                    pending.id,
                    answer.payload.len()
                );
            }
        })
    }

    /// Writes one request under the connection lock, reconnecting first if needed.
    async fn dispatch(&self, kind: PacketType, text: &str) -> Option<Pending> {
        let mut connection = self.inner.connection.lock().await;

        if !connection.is_configured() {
            debug!("Dropping request, client is not configured");
            return None;
        }

        if let Err(err) = connection.ensure_ready().await {
            debug!("Dropping request, no connection: {}", err);
            return None;
        }

        let id = next_sequence_id();
        if let Err(err) = connection.send(id, kind, text).await {
            warn!("Failed to send request id={}: {}", id, err);
            connection.connection_lost().await.ok();
            return None;
        }

        Some(Pending {
            id,
            answers: connection.answers()?,
            timeout: connection.config().timeout(),
            collect_in_background: connection.config().server_supports_concurrent_reads,
        })
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Total reconnect attempts made since the client was created.
    pub fn reconnect_count(&self) -> u64 {
        self.inner.reconnects.load(Ordering::SeqCst)
    }

    /// Closes the connection. Later sends return empty answers until a new setup.
    pub async fn dispose(&self) {
        self.inner.connection.lock().await.dispose().await;
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}
