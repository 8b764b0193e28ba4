/*!
 * # Proxy Manager Module
 *
 * The manager terminates client connections exactly like the edge proxy,
 * but instead of opening origin sockets it forwards every request through
 * one of the configured upstream proxies, chosen per request by the pool's
 * least-loaded selector. A health prober runs alongside the accept loop
 * and keeps the pool order fresh.
 *
 * Upstreams are proxies themselves, so plain requests are forwarded as the
 * original bytes (absolute-form request line and all) and CONNECT is
 * re-issued to the chosen upstream rather than opened directly.
 */

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::auth::ProxyAuth;
use crate::error::Result;
use crate::firewall::Firewall;
use crate::framing;
use crate::health::HealthProber;
use crate::pool::{Upstream, UpstreamPool};
use crate::proxy::{relay, Proxy};
use crate::response::{self, encode_response, Body};

/// Hosts that would loop a co-hosted proxy back into this manager
const LOCAL_HOSTS: [&str; 3] = ["127.0.0.1", "localhost", "0.0.0.0"];

/// The upstream proxy manager server
pub struct ProxyManager {
    host: String,
    port: u16,
    timeout: Duration,
    timeout_test: Duration,
    update_timeout: Duration,
    batch_size: usize,
    auth: Option<ProxyAuth>,
    firewall: Option<Firewall>,
    pool: Arc<UpstreamPool>,
    proxy_server: Option<Proxy>,
}

impl ProxyManager {
    /// Create a manager fronting the given upstream proxies
    ///
    /// Duplicated upstream URLs are dropped, keeping the first occurrence.
    pub fn new(host: impl Into<String>, port: u16, upstreams: Vec<Upstream>) -> Self {
        Self {
            host: host.into(),
            port,
            timeout: Duration::from_secs(15),
            timeout_test: Duration::from_secs(2),
            update_timeout: Duration::from_secs(30),
            batch_size: 1000,
            auth: None,
            firewall: None,
            pool: Arc::new(UpstreamPool::new(upstreams)),
            proxy_server: None,
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

    /// Timeout applied to every network operation on a connection
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Deadline for one health probe connect
    pub fn timeout_test(mut self, timeout_test: Duration) -> Self {
        self.timeout_test = timeout_test;
        self
    }

    /// Pause between health passes
    pub fn update_timeout(mut self, update_timeout: Duration) -> Self {
        self.update_timeout = update_timeout;
        self
    }

    /// Upper bound on concurrent probes within one health pass
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Co-host an edge proxy and register it as an upstream
    ///
    /// The proxy is skipped (with a warning) when its address points back
    /// at this manager, which would forward traffic into an infinite loop.
    pub fn with_proxy_server(mut self, proxy: Proxy) -> Result<Self> {
        let spec = {
            let (host, port, auth) = proxy.endpoint();
            if LOCAL_HOSTS.contains(&host) && port == self.port {
                warn!(
                    "Proxy server on port {} not added as upstream to avoid an infinite loop",
                    port
                );
                None
            } else {
                Some(match auth {
                    Some(auth) => format!(
                        "{}:{}@{}:{}",
                        auth.username(),
                        auth.password(),
                        host,
                        port
                    ),
                    None => format!("{}:{}", host, port),
                })
            }
        };
        if let Some(spec) = spec {
            self.pool.push(Upstream::parse(&spec)?);
        }
        self.proxy_server = Some(proxy);
        Ok(self)
    }

    /// The shared upstream pool
    pub fn pool(&self) -> Arc<UpstreamPool> {
        Arc::clone(&self.pool)
    }

    /// Bind and serve until Ctrl+C
    pub async fn run(self) -> Result<()> {
        info!("Starting ProxyManager");
        let listener = TcpListener::bind((self.host.as_str(), self.port)).await?;
        self.serve(listener).await
    }

    /// Accept clients on an already-bound listener
    ///
    /// Spawns the health prober and, when configured, the co-hosted edge
    /// proxy. In-flight connections are tracked and drained on Ctrl+C.
    pub async fn serve(mut self, listener: TcpListener) -> Result<()> {
        if let Some(proxy) = self.proxy_server.take() {
            tokio::spawn(async move {
                if let Err(e) = proxy.run().await {
                    error!("Error in co-hosted proxy server: {}", e);
                }
            });
        }

        let prober = HealthProber::new(
            Arc::clone(&self.pool),
            self.timeout_test,
            self.update_timeout,
            self.batch_size,
        );
        tokio::spawn(prober.run());

        info!("Proxy server started (http://{}:{})", self.host, self.port);

        let manager = Arc::new(self);
        let mut connections = JoinSet::new();

        let shutdown = tokio::signal::ctrl_c();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = accepted?;
                    debug!("Accepted connection from ({})", peer);
                    let manager = Arc::clone(&manager);
                    connections.spawn(async move {
                        if let Err(e) = manager.handle_client(stream, peer).await {
                            debug!("Connection from ({}) ended with error: {}", peer, e);
                        }
                    });
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                _ = &mut shutdown => {
                    info!("Proxy manager stopped by Ctrl+C. Ending...");
                    break;
                }
            }
        }

        drop(listener);
        info!("Wait until all open connections are closed...");
        while connections.join_next().await.is_some() {}
        Ok(())
    }

    /// The per-connection state machine, dispatching through the pool
    async fn handle_client(&self, mut client: TcpStream, peer: SocketAddr) -> Result<()> {
        let client_host = peer.ip().to_string();

        let request = match framing::read_head(&mut client, self.timeout).await {
            Ok(request) => request,
            Err(e) => {
                warn!("Timeout/error reading headers from client ({}): {}", peer, e);
                return Ok(());
            }
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

        let upstream = match self.pool.choose_upstream() {
            Ok(upstream) => upstream,
            Err(e) => {
                error!("Error choosing upstream: {}", e);
                return Ok(());
            }
        };

        self.pool.increment(upstream.url()).await;
        let outcome = self
            .forward_through(client, &upstream, &request, &method, &target)
            .await;
        self.pool.decrement(upstream.url()).await;
        outcome
    }

    /// Forward one request through the chosen upstream proxy
    async fn forward_through(
        &self,
        mut client: TcpStream,
        upstream: &Upstream,
        request: &[u8],
        method: &str,
        target: &str,
    ) -> Result<()> {
        let mut remote = match timeout(
            self.timeout,
            TcpStream::connect((upstream.host(), upstream.port())),
        )
        .await
        {
            Ok(Ok(remote)) => remote,
            Ok(Err(e)) => {
                warn!("Cannot connect to upstream proxy {}: {}", upstream.url(), e);
                let _ = client
                    .write_all(&encode_response(502, Body::Empty, &[("Connection", "close")]))
                    .await;
                return Ok(());
            }
            Err(_) => {
                warn!("Timeout connecting to upstream proxy {}", upstream.url());
                let _ = client
                    .write_all(&encode_response(504, Body::Empty, &[("Connection", "close")]))
                    .await;
                return Ok(());
            }
        };
        debug!("Forwarding request through {}", upstream.url());

        if method == "CONNECT" {
            remote.write_all(&response::connect_line(target)).await?;

            let reply = match framing::read_head(&mut remote, self.timeout).await {
                Ok(reply) => reply,
                Err(e) => {
                    warn!(
                        "Upstream proxy {} failed the CONNECT handshake: {}",
                        upstream.url(),
                        e
                    );
                    let _ = client
                        .write_all(&encode_response(
                            502,
                            Body::Empty,
                            &[("Connection", "close")],
                        ))
                        .await;
                    return Ok(());
                }
            };
            client.write_all(&reply).await?;

            // bytes the client pipelined behind its CONNECT head
            let early = framing::body_fragment(request);
            if !early.is_empty() {
                remote.write_all(early).await?;
            }
        } else {
            // the upstream is a proxy: it gets the original request bytes
            remote.write_all(request).await?;
        }

        relay(client, remote, self.timeout).await;
        Ok(())
    }
}
