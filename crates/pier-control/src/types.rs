//! Request and response types exchanged with the control plane.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Capabilities a node declares on every ping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingRequest {
    /// Node secret issued by the control plane.
    pub secret: String,
    /// Port clients reach the node on.
    pub port: u16,
    /// Declared cache size in bytes.
    pub disk_space: u64,
    /// Declared upstream bandwidth in bytes per second (0 = unlimited).
    pub network_speed: u64,
    /// Build number of this node.
    pub build_version: u32,
    /// Creation time of the TLS material the node currently holds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_created_at: Option<String>,
}

/// TLS material handed out by the control plane.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsMaterial {
    /// Creation time, echoed back on later pings.
    pub created_at: String,
    /// PEM private key.
    pub private_key: String,
    /// PEM certificate chain.
    pub certificate: String,
}

impl fmt::Debug for TlsMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsMaterial")
            .field("created_at", &self.created_at)
            .field("private_key", &"<redacted>")
            .field("certificate", &format_args!("{} bytes", self.certificate.len()))
            .finish()
    }
}

/// What the control plane currently wants this node to do.
///
/// Replaced as a whole on every successful ping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    /// Upstream origin images are fetched from.
    pub image_server: String,
    /// Public URL the node is reachable at.
    #[serde(default)]
    pub url: String,
    /// Key used to verify client tokens.
    #[serde(default)]
    pub token_key: Option<String>,
    /// Latest node build known to the control plane.
    #[serde(default)]
    pub latest_build: u32,
    /// Whether the node is paused.
    #[serde(default)]
    pub paused: bool,
    /// Whether the node's secret is considered compromised.
    #[serde(default)]
    pub compromised: bool,
    /// Whether clients must present tokens.
    #[serde(default)]
    pub force_tokens: bool,
    /// TLS material, only present when it changed.
    #[serde(default)]
    pub tls: Option<TlsMaterial>,
}

impl Assignment {
    /// Replace the upstream origin, keeping every other field.
    pub fn with_upstream(mut self, upstream: Option<&str>) -> Self {
        if let Some(upstream) = upstream.filter(|u| !u.is_empty()) {
            self.image_server = upstream.to_string();
        }
        self
    }
}
