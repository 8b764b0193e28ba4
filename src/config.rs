/*!
 * # Configuration Module
 *
 * Command line surface for the two server roles. The `proxy` subcommand
 * runs the edge proxy, `manager` runs the upstream proxy manager; both
 * validate their policy options (credential pair, firewall lists) before a
 * server is built.
 */

use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use crate::auth::ProxyAuth;
use crate::error::{ProxyError, Result};
use crate::firewall::Firewall;
use crate::manager::ProxyManager;
use crate::pool::Upstream;
use crate::proxy::Proxy;

/// Command line interface for fleetproxy
#[derive(Parser, Debug)]
#[command(name = "fleetproxy", version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the edge proxy
    Proxy(ProxyArgs),
    /// Run the upstream proxy manager
    Manager(ManagerArgs),
}

impl Command {
    pub fn debug(&self) -> bool {
        match self {
            Command::Proxy(args) => args.debug,
            Command::Manager(args) => args.debug,
        }
    }
}

/// Authentication and firewall options shared by both roles
#[derive(Args, Debug, Clone, Default)]
pub struct PolicyArgs {
    /// Username for proxy authentication
    #[arg(long)]
    pub username: Option<String>,

    /// Password for proxy authentication
    #[arg(long)]
    pub password: Option<String>,

    /// Host allowed through the firewall (repeatable)
    #[arg(long)]
    pub allow: Vec<String>,

    /// Host blocked by the firewall (repeatable)
    #[arg(long)]
    pub block: Vec<String>,

    /// Host exempt from proxy authentication (repeatable)
    #[arg(long)]
    pub no_auth_required: Vec<String>,
}

impl PolicyArgs {
    /// Build the authenticator, requiring the full credential pair
    pub fn auth(&self) -> Result<Option<ProxyAuth>> {
        match (&self.username, &self.password) {
            (Some(username), Some(password)) => {
                Ok(Some(ProxyAuth::new(username.clone(), password.clone())?))
            }
            (None, None) => Ok(None),
            _ => Err(ProxyError::Config(
                "both --username and --password are required for authentication".to_string(),
            )),
        }
    }

    /// Build the firewall when any host list was given
    pub fn firewall(&self) -> Result<Option<Firewall>> {
        if self.allow.is_empty() && self.block.is_empty() && self.no_auth_required.is_empty() {
            return Ok(None);
        }
        Ok(Some(Firewall::new(
            self.allow.clone(),
            self.block.clone(),
            self.no_auth_required.clone(),
        )?))
    }
}

/// Options for the edge proxy role
#[derive(Args, Debug, Clone)]
pub struct ProxyArgs {
    /// Host to bind
    #[arg(long, default_value = "0.0.0.0")]
    pub host: String,

    /// Port to listen on
    #[arg(long, default_value_t = 8888)]
    pub port: u16,

    /// Listen backlog
    #[arg(long, default_value_t = 1000)]
    pub backlog: u32,

    /// Maximum number of requests processed simultaneously
    #[arg(long, default_value_t = 1000)]
    pub max_connections: usize,

    /// Timeout for network operations, in seconds
    #[arg(long, default_value_t = 15)]
    pub timeout: u64,

    #[command(flatten)]
    pub policy: PolicyArgs,

    /// Enable debug logging
    #[arg(long)]
    pub debug: bool,
}

impl ProxyArgs {
    /// Validate the options and build the server
    pub fn build(&self) -> Result<Proxy> {
        let mut proxy = Proxy::new(self.host.clone(), self.port)
            .backlog(self.backlog)
            .max_connections(self.max_connections)
            .timeout(Duration::from_secs(self.timeout));
        if let Some(auth) = self.policy.auth()? {
            proxy = proxy.with_auth(auth);
        }
        if let Some(firewall) = self.policy.firewall()? {
            proxy = proxy.with_firewall(firewall);
        }
        Ok(proxy)
    }
}

/// Options for the proxy manager role
#[derive(Args, Debug, Clone)]
pub struct ManagerArgs {
    /// Host to bind
    #[arg(long, default_value = "0.0.0.0")]
    pub host: String,

    /// Port to listen on
    #[arg(long, default_value_t = 8889)]
    pub port: u16,

    /// Upstream proxy as `[scheme://][user:pass@]host[:port]` (repeatable)
    #[arg(long)]
    pub upstream: Vec<String>,

    /// Timeout for network operations, in seconds
    #[arg(long, default_value_t = 15)]
    pub timeout: u64,

    /// Timeout for one health probe connect, in seconds
    #[arg(long, default_value_t = 2)]
    pub timeout_test: u64,

    /// Pause between health passes, in seconds
    #[arg(long, default_value_t = 30)]
    pub update_timeout: u64,

    /// Upper bound on concurrent health probes
    #[arg(long, default_value_t = 1000)]
    pub batch_size: usize,

    #[command(flatten)]
    pub policy: PolicyArgs,

    /// Enable debug logging
    #[arg(long)]
    pub debug: bool,
}

impl ManagerArgs {
    /// Validate the options and build the server
    pub fn build(&self) -> Result<ProxyManager> {
        let upstreams = self
            .upstream
            .iter()
            .map(|spec| Upstream::parse(spec))
            .collect::<Result<Vec<_>>>()?;

        let mut manager = ProxyManager::new(self.host.clone(), self.port, upstreams)
            .timeout(Duration::from_secs(self.timeout))
            .timeout_test(Duration::from_secs(self.timeout_test))
            .update_timeout(Duration::from_secs(self.update_timeout))
            .batch_size(self.batch_size);
        if let Some(auth) = self.policy.auth()? {
            manager = manager.with_auth(auth);
        }
        if let Some(firewall) = self.policy.firewall()? {
            manager = manager.with_firewall(firewall);
        }
        Ok(manager)
    }
}
