use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WeirConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub webrtc: WebrtcConfig,
    /// Stream name -> source descriptor. Declares the stream names that
    /// signaling may attach to; sources themselves are fed by WebRTC
    /// producers publishing with `dst=<name>`.
    #[serde(default)]
    pub streams: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address for the HTTP/WebSocket API
    #[serde(default = "default_bind")]
    pub bind: String,
    /// API port
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebrtcConfig {
    /// ICE listen address, optionally suffixed with `/udp` or `/tcp`.
    /// Empty string disables the fixed-port mux (ephemeral ports).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Extra `host:port` addresses advertised as host candidates,
    /// optionally prefixed with `udp:` or `tcp:`.
    #[serde(default)]
    pub candidates: Vec<String>,
    /// STUN/TURN servers offered to peers (default: Google STUN)
    #[serde(default = "default_ice_servers")]
    pub ice_servers: Vec<IceServerConfig>,
    /// Local candidate filter rules
    #[serde(default)]
    pub filters: FiltersConfig,
}

/// ICE server URL/credential triple, in the shape WebRTC clients expect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

/// Rules applied to local ICE candidates before they are trickled to the
/// remote. Empty lists allow everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FiltersConfig {
    /// Allowed transports: subset of "udp", "tcp"
    #[serde(default)]
    pub networks: Vec<String>,
    /// Allowed candidate addresses
    #[serde(default)]
    pub candidates: Vec<String>,
}

/// Parsed form of `webrtc.listen`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenSpec {
    /// Socket address, host defaulted to `0.0.0.0` when the config
    /// only gives a `:port`.
    pub addr: String,
    pub network: ListenNetwork,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenNetwork {
    Udp,
    Tcp,
}

impl ListenSpec {
    /// Parse a `listen` value. Returns `Ok(None)` for the empty string,
    /// which disables the fixed listen port entirely.
    pub fn parse(s: &str) -> Result<Option<Self>, String> {
        if s.is_empty() {
            return Ok(None);
        }
        let (addr, network) = match s.rsplit_once('/') {
            Some((addr, "udp")) => (addr, ListenNetwork::Udp),
            Some((addr, "tcp")) => (addr, ListenNetwork::Tcp),
            Some((_, suffix)) => {
                return Err(format!(
                    "unknown network suffix '/{suffix}' (expected /udp or /tcp)"
                ));
            }
            None => (s, ListenNetwork::Udp),
        };
        let (host, port) = addr
            .rsplit_once(':')
            .ok_or_else(|| format!("'{addr}' is not a host:port address"))?;
        port.parse::<u16>()
            .map_err(|_| format!("'{port}' is not a valid port"))?;
        let host = if host.is_empty() { "0.0.0.0" } else { host };
        Ok(Some(Self {
            addr: format!("{host}:{port}"),
            network,
        }))
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
        }
    }
}

impl Default for WebrtcConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            candidates: Vec::new(),
            ice_servers: default_ice_servers(),
            filters: FiltersConfig::default(),
        }
    }
}

impl WeirConfig {
    /// Validate the configuration, returning a list of issues found.
    ///
    /// Issues are prefixed with "ERROR:" (fatal, server should not start) or
    /// "WARNING:" (advisory, server can start but the config is likely wrong).
    ///
    /// Returns `Ok(())` if no issues, or `Err(issues)` with all found problems.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut issues = Vec::new();

        // --- API port ---
        if self.server.port == 0 {
            issues.push("ERROR: server.port must be between 1 and 65535, got 0.".to_string());
        }

        // --- ICE listen address ---
        match ListenSpec::parse(&self.webrtc.listen) {
            Ok(Some(spec)) if spec.network == ListenNetwork::Tcp => {
                issues.push(format!(
                    "WARNING: webrtc.listen '{}' requests TCP, but the engine only \
                     muxes UDP. Falling back to ephemeral UDP ports.",
                    self.webrtc.listen
                ));
            }
            Ok(_) => {}
            Err(e) => {
                issues.push(format!(
                    "ERROR: webrtc.listen '{}' is invalid: {e}. \
                     Example: \":8555\" or \"192.168.1.10:8555/udp\".",
                    self.webrtc.listen
                ));
            }
        }

        // --- Advertised candidates ---
        for candidate in &self.webrtc.candidates {
            let addr = candidate
                .strip_prefix("udp:")
                .or_else(|| candidate.strip_prefix("tcp:"))
                .unwrap_or(candidate);
            let port_ok = addr
                .rsplit_once(':')
                .is_some_and(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok());
            if !port_ok {
                issues.push(format!(
                    "ERROR: webrtc.candidates entry '{candidate}' must be host:port, \
                     optionally prefixed with udp: or tcp:."
                ));
            }
        }

        // --- ICE servers ---
        for server in &self.webrtc.ice_servers {
            for url in &server.urls {
                if !url.starts_with("stun:")
                    && !url.starts_with("stuns:")
                    && !url.starts_with("turn:")
                    && !url.starts_with("turns:")
                {
                    issues.push(format!(
                        "ERROR: ICE server URL '{url}' must start with stun:, stuns:, \
                         turn: or turns:. Example: stun:stun.l.google.com:19302"
                    ));
                }
                if (url.starts_with("turn:") || url.starts_with("turns:"))
                    && (server.username.is_none() || server.credential.is_none())
                {
                    issues.push(format!(
                        "WARNING: TURN server '{url}' has no username/credential. \
                         Most TURN deployments require the long-term credential mechanism."
                    ));
                }
            }
        }

        // --- Candidate filters ---
        for network in &self.webrtc.filters.networks {
            if network != "udp" && network != "tcp" {
                issues.push(format!(
                    "ERROR: webrtc.filters.networks entry '{network}' is not a known \
                     transport (expected \"udp\" or \"tcp\")."
                ));
            }
        }

        if issues.is_empty() { Ok(()) } else { Err(issues) }
    }
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    1984
}
fn default_listen() -> String {
    ":8555".to_string()
}
fn default_ice_servers() -> Vec<IceServerConfig> {
    vec![IceServerConfig {
        urls: vec!["stun:stun.l.google.com:19302".to_string()],
        username: None,
        credential: None,
    }]
}
