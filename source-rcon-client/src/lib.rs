//! This crate provides a reconnecting client for the [Source RCON protocol], the remote
//! console protocol spoken by Source engine game servers and many others that copied it.
//!
//! A single [`Client`] owns one TCP connection and can be shared between any number of
//! concurrent tasks. Every request is tagged with a fresh sequence id, and a background
//! reader task files each incoming frame under its id, so each caller gets back exactly the
//! answer to its own request, regardless of the order the server replies in.
//!
//! The client is asynchronous and requires a [Tokio](https://tokio.rs/) runtime. A blocking
//! wrapper is available in [`sync`] with the default `sync` feature.
//!
//! # Example
//! ```rust,no_run
//! use source_rcon_client::{connect, ClientConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let client = connect("localhost", 27015, "password123", ClientConfig::default())
//!         .await
//!         .unwrap();
//!
//!     let status = client.send_command("status").await;
//!     println!("{}", status);
//!
//!     client.dispose().await;
//! }
//! ```
//!
//! Sends never fail loudly: when the client is not configured, the write fails or no answer
//! arrives in time, the answer is simply empty. Many commands legitimately answer with empty
//! text as well, so an empty answer means "nothing to show", not necessarily an error.
//!
//! [Source RCON protocol]: https://developer.valvesoftware.com/wiki/Source_RCON_Protocol

mod client;
mod config;
mod connection;
mod frame;
mod reader;
mod sequence;
#[cfg(feature = "sync")]
pub mod sync;

pub use self::client::Client;
pub use self::config::ClientConfig;
pub use self::connection::ConnectionState;
pub use self::frame::{
    deserialize_packet, serialize_packet, PacketType, Response, DEFAULT_PORT, MAX_FRAME_LEN,
};
pub use self::sequence::{next_sequence_id, SequenceGenerator};

/// Error type for RCON operations.
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub struct Error(RconError);

#[derive(Debug, thiserror::Error)]
pub(crate) enum RconError {
    #[error("IO error")]
    Io(#[from] std::io::Error),

    #[error("connection closed by server")]
    ConnectionClosed,

    #[error("malformed frame: {0}")]
    MalformedFrame(&'static str),

    #[error("frame too large: {len} bytes (max {max})")]
    FrameTooLarge { len: usize, max: usize },

    #[error("authentication failed")]
    AuthenticationFailed,

    #[error("client is not configured")]
    NotConfigured,

    #[error("timed out waiting for the server")]
    Timeout,
}

/// Broad classes of failure, used to decide whether retrying makes sense.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The server rejected the password. Retrying will not help.
    Authentication,
    /// Socket-level failure: refused, reset, closed or timed out.
    Transport,
    /// The server sent bytes that do not form a valid frame.
    MalformedFrame,
    /// The client was used before it was set up, or after it gave up.
    UsagePrecondition,
}

/// [`Result`] alias for [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

impl<T> From<T> for Error
where
    T: Into<RconError>,
{
    fn from(inner: T) -> Self {
        Error(inner.into())
    }
}

impl Error {
    /// Classifies this error.
    pub fn kind(&self) -> ErrorKind {
        match &self.0 {
            RconError::Io(_) | RconError::ConnectionClosed | RconError::Timeout => {
                ErrorKind::Transport
            }
            RconError::MalformedFrame(_) | RconError::FrameTooLarge { .. } => {
                ErrorKind::MalformedFrame
            }
            RconError::AuthenticationFailed => ErrorKind::Authentication,
            RconError::NotConfigured => ErrorKind::UsagePrecondition,
        }
    }

    /// Whether the connection policy may retry after this error.
    pub fn is_retriable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transport | ErrorKind::MalformedFrame)
    }
}

/// Asynchronously connect and authenticate to an RCON server.
///
/// This is shorthand for [`Client::new`] followed by [`Client::setup`]. The returned client
/// is [`ConnectionState::Ready`]; on failure nothing is left running.
///
/// # Example
/// ```rust,no_run
/// use source_rcon_client::{connect, ClientConfig, ErrorKind};
///
/// #[tokio::main]
/// async fn main() {
///     match connect("localhost", 27015, "password123", ClientConfig::default()).await {
///         Ok(client) => println!("{}", client.send_command("users").await),
///         Err(err) if err.kind() == ErrorKind::Authentication => panic!("Wrong password"),
///         Err(err) => panic!("Connection failed: {}", err),
///     }
/// }
/// ```
pub async fn connect(
    host: &str,
    port: u16,
    password: &str,
    config: ClientConfig,
) -> Result<Client> {
    let client = Client::new();
    client.setup(host, port, password, config).await?;
    Ok(client)
}
