/*!
 * # Firewall Module
 *
 * Classifies client hosts as allowed, blocked, or exempt from
 * authentication. The three lists must be pairwise disjoint and at least
 * one must be non-empty.
 */

use std::collections::HashSet;

use crate::error::{ProxyError, Result};

/// Host allow/block firewall with an auth-exemption list
#[derive(Debug, Clone)]
pub struct Firewall {
    allowlist: HashSet<String>,
    blocklist: HashSet<String>,
    no_auth_required: HashSet<String>,
}

impl Firewall {
    /// Create a firewall from the three host lists
    ///
    /// Fails with `FirewallConflict` when a host appears in more than one
    /// list, and with a configuration error when all three lists are empty.
    pub fn new(
        allowlist: Vec<String>,
        blocklist: Vec<String>,
        no_auth_required: Vec<String>,
    ) -> Result<Self> {
        let allowlist: HashSet<String> = allowlist.into_iter().collect();
        let blocklist: HashSet<String> = blocklist.into_iter().collect();
        let no_auth_required: HashSet<String> = no_auth_required.into_iter().collect();

        if allowlist.is_empty() && blocklist.is_empty() && no_auth_required.is_empty() {
            return Err(ProxyError::Config(
                "firewall needs at least one non-empty host list".to_string(),
            ));
        }

        if let Some(host) = allowlist.intersection(&blocklist).next() {
            return Err(ProxyError::FirewallConflict(host.clone()));
        }
        if let Some(host) = allowlist.intersection(&no_auth_required).next() {
            return Err(ProxyError::FirewallConflict(host.clone()));
        }
        if let Some(host) = blocklist.intersection(&no_auth_required).next() {
            return Err(ProxyError::FirewallConflict(host.clone()));
        }

        Ok(Self {
            allowlist,
            blocklist,
            no_auth_required,
        })
    }

    /// Classify a client host
    ///
    /// Blocked hosts are refused; when an allowlist is configured only its
    /// members pass; otherwise everyone passes.
    pub fn verify(&self, host: &str) -> bool {
        if self.is_blocked(host) {
            return false;
        }
        if !self.allowlist.is_empty() {
            return self.is_allowed(host);
        }
        true
    }

    pub fn is_allowed(&self, host: &str) -> bool {
        self.allowlist.contains(host)
    }

    pub fn is_blocked(&self, host: &str) -> bool {
        self.blocklist.contains(host)
    }

    /// True when the host may skip proxy authentication
    ///
    /// Exemption never bypasses `verify`; it only skips the authenticator.
    pub fn is_no_auth_required(&self, host: &str) -> bool {
        self.no_auth_required.contains(host)
    }
}
