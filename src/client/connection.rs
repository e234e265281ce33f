//! Connection facade.
//!
//! [`PgConnection`] owns the TCP stream and serializes the startup,
//! authentication and query phases behind one async mutex: the protocol is
//! strictly half-duplex, so concurrent callers queue instead of interleaving
//! frames. A separate `watch` channel carries the close signal, letting
//! `close()` fail an in-flight operation instead of waiting behind it.

use tokio::net::TcpStream;
use tokio::sync::{Mutex, watch};

use crate::client::handshake;
use crate::client::query::{self, QueryResult};
use crate::config::ConnectionConfig;
use crate::error::{PgError, Result};
use crate::protocol::framing::{PROTOCOL_VERSION, write_startup_message};
use crate::protocol::messages::BackendIdentity;

/// Lifecycle state of a [`PgConnection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Authenticating,
    Ready,
    Closing,
    Closed,
    Faulted,
}

struct Inner {
    config: ConnectionConfig,
    state: ConnectionState,
    stream: Option<TcpStream>,
    backend: Option<BackendIdentity>,
    parameters: Vec<(String, String)>,
}

/// A single PostgreSQL connection: connect, execute simple queries, close.
///
/// ```ignore
/// let conn = PgConnection::new(ConnectionConfig {
///     host: "127.0.0.1".into(),
///     user: "postgres".into(),
///     password: "postgres".into(),
///     database: "movie".into(),
///     ..ConnectionConfig::default()
/// });
/// conn.connect().await?;
/// let result = conn.execute("SELECT 1").await?;
/// conn.close().await;
/// ```
pub struct PgConnection {
    inner: Mutex<Inner>,
    close_tx: watch::Sender<bool>,
}

impl PgConnection {
    pub fn new(config: ConnectionConfig) -> Self {
        let (close_tx, _) = watch::channel(false);
        Self {
            inner: Mutex::new(Inner {
                config,
                state: ConnectionState::Disconnected,
                stream: None,
                backend: None,
                parameters: Vec::new(),
            }),
            close_tx,
        }
    }

    /// Open the stream, send the startup frame, and run the authentication
    /// handshake to ReadyForQuery.
    ///
    /// Valid only from `Disconnected`. Any failure leaves the connection
    /// `Faulted`.
    pub async fn connect(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.state != ConnectionState::Disconnected {
            return Err(PgError::ProtocolOrder(format!(
                "connect is only valid when disconnected (state: {:?})",
                inner.state
            )));
        }

        let mut close_rx = self.close_tx.subscribe();
        match Self::do_connect(&mut inner, &mut close_rx).await {
            Ok(()) => {
                inner.state = ConnectionState::Ready;
                tracing::debug!(
                    host = %inner.config.host,
                    database = %inner.config.database,
                    "connection ready"
                );
                Ok(())
            }
            Err(e) => {
                inner.state = ConnectionState::Faulted;
                inner.stream = None;
                Err(e)
            }
        }
    }

    async fn do_connect(inner: &mut Inner, close_rx: &mut watch::Receiver<bool>) -> Result<()> {
        inner.state = ConnectionState::Connecting;

        let addr = (inner.config.host.as_str(), inner.config.port);
        let tcp = interruptible(close_rx, async {
            Ok(TcpStream::connect(addr).await?)
        })
        .await?;
        tcp.set_nodelay(true)?;
        let stream = inner.stream.insert(tcp);

        write_startup_message(stream, PROTOCOL_VERSION, &inner.config.startup_params()).await?;

        inner.state = ConnectionState::Authenticating;
        let summary = interruptible(close_rx, handshake::run(stream, &inner.config)).await?;
        inner.backend = summary.backend;
        inner.parameters = summary.parameters;
        Ok(())
    }

    /// Run one simple query. Valid only when `Ready`.
    ///
    /// A server error leaves the connection `Ready` (the executor drains the
    /// stream to ReadyForQuery); framing, ordering and I/O errors fault it.
    pub async fn execute(&self, sql: &str) -> Result<QueryResult> {
        let mut inner = self.inner.lock().await;
        if inner.state != ConnectionState::Ready {
            return Err(PgError::ProtocolOrder(format!(
                "execute requires a ready connection (state: {:?})",
                inner.state
            )));
        }

        let mut close_rx = self.close_tx.subscribe();
        let stream = inner
            .stream
            .as_mut()
            .ok_or_else(|| PgError::Io("connection has no stream".into()))?;

        let result = interruptible(&mut close_rx, query::execute(stream, sql)).await;
        if let Err(e) = &result {
            if e.faults_connection() {
                inner.state = ConnectionState::Faulted;
                inner.stream = None;
            }
        }
        result
    }

    /// Close the connection. Idempotent.
    ///
    /// Fires the close signal first, so an operation blocked on stream I/O
    /// fails instead of hanging, then releases the stream.
    pub async fn close(&self) {
        self.close_tx.send_replace(true);

        let mut inner = self.inner.lock().await;
        if inner.state == ConnectionState::Closed {
            return;
        }
        inner.state = ConnectionState::Closing;
        inner.stream = None; // dropping the TcpStream closes the socket
        inner.state = ConnectionState::Closed;
        tracing::debug!("connection closed");
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> ConnectionState {
        self.inner.lock().await.state
    }

    /// Backend process id / secret key, once connected.
    pub async fn backend_identity(&self) -> Option<BackendIdentity> {
        self.inner.lock().await.backend
    }

    /// A server parameter reported during the handshake (e.g.
    /// `server_version`).
    pub async fn parameter(&self, name: &str) -> Option<String> {
        self.inner
            .lock()
            .await
            .parameters
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.clone())
    }
}

/// Run `op`, failing early if the close signal fires.
///
/// Suspension only happens between frames (the futures passed here never
/// yield mid-write), so aborting cannot leave a partially written frame.
async fn interruptible<T>(
    close_rx: &mut watch::Receiver<bool>,
    op: impl Future<Output = Result<T>>,
) -> Result<T> {
    if *close_rx.borrow_and_update() {
        return Err(PgError::Io(
            "connection closed while operation in flight".into(),
        ));
    }
    tokio::select! {
        res = op => res,
        _ = close_rx.changed() => Err(PgError::Io(
            "connection closed while operation in flight".into(),
        )),
    }
}
