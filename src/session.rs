//! Server session: the transport collaborator that owns connect/send/recv
//! against the central server. One TCP connection per request, reply
//! framed by the peer closing its write half; a thin struct wrapping a
//! single async entry point per wire operation.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{CoreError, CoreResult};
use crate::wire::{self, ActiveChecksReply, AgentDataReply};

/// Owns the connection parameters; each request opens and closes its own
/// socket, matching the server's expectations for this protocol.
#[derive(Debug, Clone)]
pub struct ServerSession {
    server_host: String,
    server_port: u16,
    source_ip: Option<String>,
    timeout: Duration,
}

impl ServerSession {
    pub fn new(config: &Config) -> Self {
        ServerSession {
            server_host: config.server_host.clone(),
            server_port: config.server_port,
            source_ip: config.source_ip.clone(),
            timeout: config.timeout(),
        }
    }

    /// Open one connection, scoped to the lifetime of a single request and
    /// bounded by `request_timeout`.
    async fn connect(&self, request_timeout: Duration) -> CoreResult<TcpStream> {
        let addr = format!("{}:{}", self.server_host, self.server_port);

        let connect_fut = async {
            if let Some(ref src) = self.source_ip {
                bind_and_connect(src, &addr).await
            } else {
                TcpStream::connect(&addr)
                    .await
                    .map_err(|e| CoreError::Transport(format!("connect {addr}: {e}")))
            }
        };

        timeout(request_timeout, connect_fut)
            .await
            .map_err(|_| CoreError::Transport(format!("connect {addr} timed out")))?
    }

    /// Write `payload` and read the reply until the peer closes the
    /// connection, the whole round-trip bounded by `request_timeout`.
    async fn roundtrip(&self, payload: Vec<u8>, request_timeout: Duration) -> CoreResult<Vec<u8>> {
        let mut stream = self.connect(request_timeout).await?;

        let io = async {
            stream.write_all(&payload).await?;
            stream.shutdown().await?;
            let mut buf = Vec::new();
            stream.read_to_end(&mut buf).await?;
            Ok::<_, std::io::Error>(buf)
        };

        timeout(request_timeout, io)
            .await
            .map_err(|_| CoreError::Transport("round-trip timed out".to_string()))?
            .map_err(CoreError::from)
    }

    /// `getActiveChecks`. Bounded by the configured per-connection timeout.
    pub async fn refresh_active_checks(&self, hostname: &str) -> CoreResult<ActiveChecksReply> {
        let payload = wire::encode_get_active_checks(hostname)?;
        let bytes = self.roundtrip(payload, self.timeout).await?;
        let reply = wire::parse_active_checks_reply(&bytes)?;
        debug!(rows = reply.data.len(), "received active checks reply");
        Ok(reply)
    }

    /// `agentData`. Bounded by `min(entries.len() * timeout, 60s)`, so large
    /// flushes get proportionally more time than a single small send.
    pub async fn send_buffer(
        &self,
        entries: &[crate::buffer::BufferEntry],
        clock: i64,
    ) -> CoreResult<AgentDataReply> {
        let request_timeout = scaled_send_timeout(entries.len(), self.timeout);

        let payload = wire::encode_agent_data(entries, clock)?;
        let bytes = self.roundtrip(payload, request_timeout).await?;
        let reply = wire::parse_agent_data_reply(&bytes)?;
        check_response(&reply.response, reply.info.as_deref())?;
        Ok(reply)
    }
}

/// `min(count * base, 60s)`, floored at 1s so an empty or tiny batch still
/// gets a usable timeout.
fn scaled_send_timeout(count: usize, base: Duration) -> Duration {
    let scaled_secs = (count as u64).saturating_mul(base.as_secs()).min(60);
    Duration::from_secs(scaled_secs.max(1))
}

fn check_response(response: &str, info: Option<&str>) -> CoreResult<()> {
    if wire::is_success(response) {
        Ok(())
    } else {
        let reason = info.unwrap_or("no additional information").to_string();
        warn!(response, reason, "server reported failure");
        Err(CoreError::ServerFailed(reason))
    }
}

async fn bind_and_connect(source_ip: &str, addr: &str) -> CoreResult<TcpStream> {
    use socket2::{Domain, Socket, Type};

    let target: SocketAddr = tokio::net::lookup_host(addr)
        .await
        .map_err(|e| CoreError::Transport(format!("resolve {addr}: {e}")))?
        .next()
        .ok_or_else(|| CoreError::Transport(format!("no addresses for {addr}")))?;

    let bind_addr: SocketAddr = format!("{source_ip}:0")
        .parse()
        .map_err(|e| CoreError::Transport(format!("invalid source_ip {source_ip}: {e}")))?;

    // socket2's blocking connect() needs to run off the async executor.
    let std_stream = tokio::task::spawn_blocking(move || -> std::io::Result<std::net::TcpStream> {
        let domain = if target.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
        let socket = Socket::new(domain, Type::STREAM, None)?;
        socket.bind(&bind_addr.into())?;
        socket.connect(&target.into())?;
        Ok(socket.into())
    })
    .await
    .map_err(|e| CoreError::Transport(format!("join error: {e}")))?
    .map_err(|e| CoreError::Transport(format!("connect {target} from {bind_addr}: {e}")))?;

    std_stream
        .set_nonblocking(true)
        .map_err(|e| CoreError::Transport(e.to_string()))?;
    TcpStream::from_std(std_stream).map_err(|e| CoreError::Transport(e.to_string()))
}
