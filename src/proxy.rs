/*!
 * # Edge Proxy Module
 *
 * The edge proxy terminates client TCP connections and either opens a
 * CONNECT tunnel to the requested origin or relays a plain HTTP request to
 * it. Each connection runs the same state machine: read the header block,
 * apply the firewall and authentication policy, dispatch on the method,
 * then pump bytes until one side finishes.
 *
 * ## Features
 *
 * - Semaphore-bounded admission (a full proxy blocks new clients, it does
 *   not drop them)
 * - CONNECT tunneling with a fresh origin socket per request
 * - Plain-HTTP forwarding with hop-by-hop header rewriting
 * - Per-operation timeouts and graceful Ctrl+C shutdown
 */

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::auth::ProxyAuth;
use crate::error::{ProxyError, Result};
use crate::firewall::Firewall;
use crate::framing;
use crate::response::{self, encode_response, Body};

/// Buffer size for relay pumps and body streaming
const RELAY_CHUNK: usize = 4096;

/// The edge proxy server
///
/// Build one with [`Proxy::new`] and the builder methods, then call
/// [`Proxy::run`], or [`Proxy::bind`] + [`Proxy::serve`] when the caller
/// needs the bound address first (tests bind port 0).
pub struct Proxy {
    host: String,
    port: u16,
    backlog: u32,
    max_connections: usize,
    timeout: Duration,
    auth: Option<ProxyAuth>,
    firewall: Option<Firewall>,
}

impl Proxy {
    /// Create a proxy with default limits (backlog 1000, 1000 concurrent
    /// connections, 15 s timeouts)
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            backlog: 1000,
            max_connections: 1000,
            timeout: Duration::from_secs(15),
            auth: None,
            firewall: None,
        }
    }

    pub fn with_auth(mut self, auth: ProxyAuth) -> Self {
        self.auth = Some(auth);
        self
    }

    pub fn with_firewall(mut self, firewall: Firewall) -> Self {
        self.firewall = Some(firewall);
        self
    }

    pub fn backlog(mut self, backlog: u32) -> Self {
        self.backlog = backlog;
        self
    }

    pub fn max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections;
        self
    }

    /// Timeout applied to every network operation on a connection
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Listen host, port and credentials, used when a manager co-hosts
    /// this proxy as one of its upstreams
    pub(crate) fn endpoint(&self) -> (&str, u16, Option<&ProxyAuth>) {
        (&self.host, self.port, self.auth.as_ref())
    }

    /// Bind the listening socket with the configured backlog
    pub fn bind(&self) -> Result<TcpListener> {
        if self.backlog < self.max_connections as u32 {
            warn!(
                "Backlog ({}) is smaller than max connections ({})",
                self.backlog, self.max_connections
            );
        }

        let addr: SocketAddr = format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|_| {
                ProxyError::Config(format!(
                    "invalid listen address: {}:{}",
                    self.host, self.port
                ))
            })?;
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        Ok(socket.listen(self.backlog)?)
    }

    /// Bind and serve until Ctrl+C
    pub async fn run(self) -> Result<()> {
        info!("Starting proxy server...");
        let listener = self.bind()?;
        self.serve(listener).await
    }

    /// Accept clients on an already-bound listener
    ///
    /// Admission is gated by a semaphore of `max_connections` permits; on
    /// Ctrl+C the loop stops accepting and waits until every in-flight
    /// connection has released its permit.
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        info!("Proxy server started (http://{}:{})", self.host, self.port);
        info!(
            "Accepting ({}) simultaneous connections, backlog: {}",
            self.max_connections, self.backlog
        );

        let max_connections = self.max_connections;
        let semaphore = Arc::new(Semaphore::new(max_connections));
        let proxy = Arc::new(self);

        let shutdown = tokio::signal::ctrl_c();
        tokio::pin!(shutdown);

        loop {
            let permit = match Arc::clone(&semaphore).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };

            let (stream, peer) = tokio::select! {
                accepted = listener.accept() => accepted?,
                _ = &mut shutdown => {
                    drop(permit);
                    info!("Proxy server stopped by Ctrl+C. Ending...");
                    break;
                }
            };
            debug!("Accepted connection from ({})", peer);

            let proxy = Arc::clone(&proxy);
            tokio::spawn(async move {
                let _permit = permit;
                if let Err(e) = proxy.handle_client(stream, peer).await {
                    debug!("Connection from ({}) ended with error: {}", peer, e);
                }
            });
        }

        drop(listener);
        info!("Wait until all open connections are closed...");
        let _ = semaphore.acquire_many(max_connections as u32).await;
        info!("Proxy server shutdown complete");
        Ok(())
    }

    /// The per-connection state machine
    async fn handle_client(&self, mut client: TcpStream, peer: SocketAddr) -> Result<()> {
        let client_host = peer.ip().to_string();

        let request = match framing::read_head(&mut client, self.timeout).await {
            Ok(request) => request,
            Err(ProxyError::ClientHeaderTimeout) => {
                warn!("Timeout reading headers from client ({})", peer);
                let _ = client
                    .write_all(&encode_response(408, Body::Empty, &[("Connection", "close")]))
                    .await;
                return Ok(());
            }
            Err(_) => return Ok(()),
        };

        if let Some(firewall) = &self.firewall {
            if !firewall.verify(&client_host) {
                info!("Connection refused ({}) - (firewall blocked)", peer);
                let _ = client
                    .write_all(&encode_response(403, Body::Empty, &[("Connection", "close")]))
                    .await;
                return Ok(());
            }
        }

        if let Some(auth) = &self.auth {
            let exempt = self
                .firewall
                .as_ref()
                .is_some_and(|firewall| firewall.is_no_auth_required(&client_host));
            if !exempt {
                let headers = framing::parse_headers(&request);
                if !auth.is_authorized(&headers) {
                    info!(
                        "Connection refused ({}) - (reauthentication required)",
                        peer
                    );
                    let _ = client.write_all(&response::proxy_auth_required()).await;
                    return Ok(());
                }
            }
        }

        let (method, target) = match framing::request_line(&request) {
            Ok(parsed) => parsed,
            Err(_) => {
                let _ = client
                    .write_all(&encode_response(400, Body::Empty, &[("Connection", "close")]))
                    .await;
                return Ok(());
            }
        };

        if method == "CONNECT" {
            self.tunnel_connect(client, &request, &target).await
        } else {
            self.forward_plain(client, &request, peer).await
        }
    }

    /// CONNECT: open a raw tunnel to the requested authority
    async fn tunnel_connect(
        &self,
        mut client: TcpStream,
        request: &[u8],
        target: &str,
    ) -> Result<()> {
        let Some((host, port)) = framing::parse_authority(target, 443) else {
            let _ = client
                .write_all(&encode_response(400, Body::Empty, &[("Connection", "close")]))
                .await;
            return Ok(());
        };

        let mut origin = match self.connect(&host, port).await {
            Ok(origin) => origin,
            Err(e) => {
                warn!("Cannot open tunnel to ({}:{}): {}", host, port, e);
                let status = match e {
                    ProxyError::UpstreamTimeout => 504,
                    _ => 502,
                };
                let _ = client
                    .write_all(&encode_response(
                        status,
                        Body::Empty,
                        &[("Connection", "close")],
                    ))
                    .await;
                return Ok(());
            }
        };
        debug!("Tunnel established to ({}:{})", host, port);

        client.write_all(response::CONNECTION_ESTABLISHED).await?;

        // bytes the client pipelined behind its CONNECT head
        let early = framing::body_fragment(request);
        if !early.is_empty() {
            origin.write_all(early).await?;
        }

        relay(client, origin, self.timeout).await;
        Ok(())
    }

    /// Plain HTTP: rewrite the request and pump the origin's response back
    async fn forward_plain(
        &self,
        mut client: TcpStream,
        request: &[u8],
        peer: SocketAddr,
    ) -> Result<()> {
        let headers = framing::parse_headers(request);
        let Some((host, port)) = framing::host_port(&headers) else {
            let _ = client
                .write_all(&encode_response(400, Body::Empty, &[("Connection", "close")]))
                .await;
            return Ok(());
        };

        let mut origin = match self.connect(&host, port).await {
            Ok(origin) => origin,
            Err(e) => {
                warn!("Cannot reach origin ({}:{}): {}", host, port, e);
                let status = match e {
                    ProxyError::UpstreamTimeout => 504,
                    _ => 502,
                };
                let _ = client
                    .write_all(&encode_response(
                        status,
                        Body::Empty,
                        &[("Connection", "close")],
                    ))
                    .await;
                return Ok(());
            }
        };
        info!("Forwarding request from ({}) to ({}:{})", peer, host, port);

        origin
            .write_all(&framing::rewrite_for_origin(request))
            .await?;

        // forward the rest of the declared body beyond what came with the head
        let content_length = framing::content_length(&headers);
        let mut remaining = content_length.saturating_sub(framing::body_fragment(request).len());
        let mut buf = [0u8; RELAY_CHUNK];
        while remaining > 0 {
            let want = remaining.min(buf.len());
            let n = match timeout(self.timeout, client.read(&mut buf[..want])).await {
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => n,
                Ok(Err(e)) => return Err(ProxyError::Io(e)),
                Err(_) => break,
            };
            origin.write_all(&buf[..n]).await?;
            remaining -= n;
        }

        // the response direction is length-agnostic: the rewritten request
        // forced Connection: close, so EOF or inactivity ends the response
        let mut sent_any = false;
        loop {
            match timeout(self.timeout, origin.read(&mut buf)).await {
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => {
                    client.write_all(&buf[..n]).await?;
                    sent_any = true;
                }
                Ok(Err(e)) => {
                    if !sent_any {
                        let _ = client
                            .write_all(&encode_response(
                                502,
                                Body::Empty,
                                &[("Connection", "close")],
                            ))
                            .await;
                    }
                    return Err(ProxyError::Io(e));
                }
                Err(_) => break,
            }
        }
        Ok(())
    }

    /// TCP connect under the configured deadline
    async fn connect(&self, host: &str, port: u16) -> Result<TcpStream> {
        match timeout(self.timeout, TcpStream::connect((host, port))).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(ProxyError::UpstreamUnreachable(e.to_string())),
            Err(_) => Err(ProxyError::UpstreamTimeout),
        }
    }
}

/// Bidirectional relay between two sockets
///
/// Runs one pump per direction; the relay finishes as soon as either
/// direction sees EOF, an error, or its idle deadline, cancelling the
/// other. Dropping the halves closes both sockets.
pub(crate) async fn relay(client: TcpStream, upstream: TcpStream, idle_timeout: Duration) {
    let (mut client_read, mut client_write) = client.into_split();
    let (mut upstream_read, mut upstream_write) = upstream.into_split();

    tokio::select! {
        result = pipe(&mut client_read, &mut upstream_write, idle_timeout) => {
            if let Err(e) = result {
                debug!("client->upstream relay ended: {}", e);
            }
        }
        result = pipe(&mut upstream_read, &mut client_write, idle_timeout) => {
            if let Err(e) = result {
                debug!("upstream->client relay ended: {}", e);
            }
        }
    }
}

/// Pump one direction until EOF or the idle deadline
async fn pipe<R, W>(reader: &mut R, writer: &mut W, idle_timeout: Duration) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = [0u8; RELAY_CHUNK];
    loop {
        let n = match timeout(idle_timeout, reader.read(&mut buf)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Err(e),
            Err(_) => break,
        };
        writer.write_all(&buf[..n]).await?;
    }
    let _ = writer.shutdown().await;
    Ok(())
}
