/*!
 * # Error Handling Module
 *
 * This module defines the unified error type for the fleetproxy application.
 * Connection-level errors are caught at the end of each connection task and
 * never propagate out of it; accept-loop errors terminate the server.
 */

use std::io;
use thiserror::Error;

/// Custom error type for the fleetproxy application
///
/// This enum represents all possible errors that can occur while serving
/// proxy traffic, from request framing up to upstream selection.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The request line could not be parsed into at least a method
    #[error("malformed request")]
    MalformedRequest,

    /// The client did not finish sending its header block in time
    #[error("timed out reading request headers from client")]
    ClientHeaderTimeout,

    /// The client closed the connection before the header block was complete
    #[error("client closed connection before finishing headers")]
    ClientClosed,

    /// Credential construction with an empty username or password
    #[error("username and password are required")]
    InvalidCredential,

    /// A host appears in more than one firewall list
    #[error("host {0} appears in more than one firewall list")]
    FirewallConflict(String),

    /// The upstream pool is empty at selection time
    #[error("no upstream proxy available")]
    NoUpstream,

    /// Connecting to the upstream failed
    #[error("upstream unreachable: {0}")]
    UpstreamUnreachable(String),

    /// An upstream connect or read deadline was exceeded
    #[error("upstream timed out")]
    UpstreamTimeout,

    /// Invalid startup configuration
    #[error("invalid configuration: {0}")]
    Config(String),

    /// IO errors from the standard library
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// URL parsing errors from the url crate
    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    /// JSON serialization errors from serde_json
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias using our custom error
pub type Result<T> = std::result::Result<T, ProxyError>;
