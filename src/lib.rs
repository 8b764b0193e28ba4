/*!
 * # Fleetproxy
 *
 * An HTTP/1.1 forward proxy with two cooperating roles: an edge proxy that
 * tunnels (CONNECT) or relays plain HTTP straight to origins, and a proxy
 * manager that fronts a fleet of upstream proxies with health probing and
 * least-loaded selection.
 *
 * ## Features
 *
 * - **CONNECT Tunneling**: raw bidirectional tunnels for HTTPS traffic
 * - **Plain-HTTP Forwarding**: hop-by-hop header rewriting and fresh
 *   origin sockets per request
 * - **Basic Authentication**: `Proxy-Authorization` against a configured
 *   credential pair
 * - **Firewall**: allow/block host lists plus auth exemptions
 * - **Upstream Pool**: least-loaded selection with per-URL concurrency
 *   accounting
 * - **Health Probing**: periodic TCP probes reorder the pool by latency
 * - **Async I/O**: built on Tokio, one task per connection
 *
 * ## Modules
 *
 * - `auth`: proxy authentication
 * - `config`: command line surface for both roles
 * - `error`: error types and handling
 * - `firewall`: client host classification
 * - `framing`: request head reading, parsing and rewriting
 * - `health`: periodic upstream health prober
 * - `manager`: the upstream proxy manager server
 * - `pool`: upstream descriptors, counters and selection
 * - `proxy`: the edge proxy server
 * - `response`: HTTP response building and protocol constants
 */

/// Proxy authentication against a fixed credential pair
pub mod auth;
/// Command line configuration for both server roles
pub mod config;
/// Error handling module with the crate-wide error type
pub mod error;
/// Host allow/block firewall
pub mod firewall;
/// Request framing: head reading, parsing, hop-by-hop rewriting
pub mod framing;
/// Periodic TCP health probing of the upstream pool
pub mod health;
/// The upstream proxy manager server
pub mod manager;
/// Upstream pool, concurrency accounting and least-loaded selection
pub mod pool;
/// The edge proxy server
pub mod proxy;
/// HTTP response building and protocol constants
pub mod response;

pub use auth::ProxyAuth;
pub use error::{ProxyError, Result};
pub use firewall::Firewall;
pub use health::HealthProber;
pub use manager::ProxyManager;
pub use pool::{Upstream, UpstreamPool};
pub use proxy::Proxy;
