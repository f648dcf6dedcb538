use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::relay::{direction_rng, relay, RelayStats};
use crate::sniffer::{Direction, SniffResult, Sniffer};
use crate::state::HavocState;

/// Ports tried, starting at the configured one, before giving up
pub const MAX_BIND_ATTEMPTS: u16 = 10;

/// Shown in summaries for metadata that was never sniffed
pub const PLACEHOLDER: &str = "???";

/// How long client -> target may keep running once target -> client is done
pub const UPSTREAM_GRACE: Duration = Duration::from_secs(1);

/// Fatal server errors
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("no available port after {attempts} attempts")]
    NoAvailablePort { attempts: u16 },
}

/// Errors that end a single proxied connection
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("failed to connect to target {target}: {source}")]
    Dial {
        target: String,
        #[source]
        source: io::Error,
    },
}

/// Outcome of one proxied connection
#[derive(Debug)]
pub struct ConnectionSummary {
    pub request: SniffResult,
    pub response: SniffResult,
    pub duration: Duration,
    pub to_target: io::Result<RelayStats>,
    pub to_client: io::Result<RelayStats>,
}

impl ConnectionSummary {
    pub fn method(&self) -> &str {
        self.request.method.as_deref().unwrap_or(PLACEHOLDER)
    }

    pub fn path(&self) -> &str {
        self.request.path.as_deref().unwrap_or(PLACEHOLDER)
    }

    pub fn status(&self) -> &str {
        self.response.status.as_deref().unwrap_or(PLACEHOLDER)
    }

    /// Connection duration rounded to the nearest millisecond
    pub fn rounded_duration(&self) -> Duration {
        round_to_millis(self.duration)
    }

    fn log(&self, conn_id: u64) {
        let up = self.to_target.as_ref().ok().copied().unwrap_or_default();
        let down = self.to_client.as_ref().ok().copied().unwrap_or_default();

        if let Err(e) = &self.to_target {
            warn!("Connection #{} client -> target error: {}", conn_id, e);
        }
        if let Err(e) = &self.to_client {
            warn!("Connection #{} target -> client error: {}", conn_id, e);
        }

        info!(
            conn = conn_id,
            method = %self.method(),
            path = %self.path(),
            status = %self.status(),
            duration = %humantime::format_duration(self.rounded_duration()),
            sent = up.forwarded_bytes,
            received = down.forwarded_bytes,
            chunks = up.forwarded_chunks + down.forwarded_chunks,
            dropped = up.dropped_bytes + down.dropped_bytes,
            dropped_chunks = up.dropped_chunks + down.dropped_chunks,
            "{} {} {}",
            self.method(),
            self.path(),
            self.status(),
        );
    }
}

fn round_to_millis(d: Duration) -> Duration {
    Duration::from_millis(((d.as_nanos() + 500_000) / 1_000_000) as u64)
}

/// Bound listener ready to accept proxied connections
pub struct ProxyServer {
    listener: TcpListener,
    state: Arc<HavocState>,
}

impl ProxyServer {
    /// Bind the configured port, falling back to the following ports.
    ///
    /// The port actually bound is written back into the state.
    pub async fn bind(state: Arc<HavocState>) -> Result<Self, ServerError> {
        let connection = state.connection();

        for attempt in 0..MAX_BIND_ATTEMPTS {
            let Some(port) = connection.listen_port.checked_add(attempt) else {
                break;
            };

            match TcpListener::bind((connection.listen_ip, port)).await {
                Ok(listener) => {
                    let bound = listener.local_addr().map(|a| a.port()).unwrap_or(port);
                    state.set_port(bound);
                    info!("proxy server started on port {} -> {}", bound, connection.target);
                    return Ok(Self { listener, state });
                }
                Err(e) => {
                    error!("failed to bind port {}: {}, trying next port...", port, e);
                }
            }
        }

        Err(ServerError::NoAvailablePort {
            attempts: MAX_BIND_ATTEMPTS,
        })
    }

    #[cfg(test)]
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections forever, one task per connection
    pub async fn serve(self) {
        loop {
            match self.listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let state = Arc::clone(&self.state);
                    tokio::spawn(async move {
                        proxy_connection(&state, stream, peer_addr).await;
                    });
                }
                Err(e) => {
                    warn!("Accept error: {} (continuing)", e);
                    continue;
                }
            }
        }
    }
}

/// Bind and serve until the process exits. Only port exhaustion is fatal.
pub async fn run_proxy(state: Arc<HavocState>) -> Result<(), ServerError> {
    let server = ProxyServer::bind(state).await?;
    server.serve().await;
    Ok(())
}

/// Track, proxy and log one accepted client connection
pub async fn proxy_connection(state: &Arc<HavocState>, stream: TcpStream, peer_addr: SocketAddr) {
    let guard = state.connections().open();
    let conn_id = guard.id();
    debug!("Connection #{} accepted from {}", conn_id, peer_addr);

    match handle_connection(state, stream, conn_id).await {
        Ok(summary) => summary.log(conn_id),
        Err(e) => error!("Connection #{}: {}", conn_id, e),
    }
}

/// Proxy one accepted client connection to the current target.
///
/// Client -> target runs on its own task while target -> client runs here;
/// both are awaited before the summary is built. Once target -> client has
/// finished, client -> target gets [`UPSTREAM_GRACE`] to finish on its own
/// before it is cancelled and reported as timed out. Both sockets are closed
/// when this returns, on every path.
pub async fn handle_connection(
    state: &Arc<HavocState>,
    client: TcpStream,
    conn_id: u64,
) -> Result<ConnectionSummary, ConnectionError> {
    let target = state.target();
    let upstream = TcpStream::connect(&target)
        .await
        .map_err(|source| ConnectionError::Dial {
            target: target.clone(),
            source,
        })?;

    debug!(
        "Connection #{} connected to target {} ({:?})",
        conn_id,
        target,
        upstream.peer_addr()
    );

    let started = Instant::now();
    let seed = state.seed();

    let (client_read, mut client_write) = client.into_split();
    let (target_read, mut target_write) = upstream.into_split();
    let mut client_reader = Sniffer::new(client_read, Direction::Request);
    let mut target_reader = Sniffer::new(target_read, Direction::Response);

    let (cancel_tx, cancel_rx) = oneshot::channel::<()>();
    let upstream_state = Arc::clone(state);
    let mut to_target = tokio::spawn(async move {
        let mut rng = direction_rng(seed, conn_id, Direction::Request);
        let result = tokio::select! {
            result = relay(&upstream_state, &mut client_reader, &mut target_write, &mut rng) => result,
            Ok(()) = cancel_rx => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "client -> target cancelled after target -> client finished",
            )),
        };
        // Dropping the write half closes it when the relay was cancelled
        (client_reader.into_parts().1, result)
    });

    let mut rng = direction_rng(seed, conn_id, Direction::Response);
    let to_client = relay(state, &mut target_reader, &mut client_write, &mut rng).await;

    // An idle client may hold its side open long after the target is gone
    let joined = match tokio::time::timeout(UPSTREAM_GRACE, &mut to_target).await {
        Ok(joined) => joined,
        Err(_) => {
            let _ = cancel_tx.send(());
            to_target.await
        }
    };

    let (request, to_target) = match joined {
        Ok(finished) => finished,
        Err(e) => (SniffResult::default(), Err(io::Error::other(e))),
    };

    Ok(ConnectionSummary {
        request,
        response: target_reader.into_parts().1,
        duration: started.elapsed(),
        to_target,
        to_client,
    })
}
