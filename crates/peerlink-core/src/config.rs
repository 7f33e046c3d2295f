//! Session and negotiation configuration.
//!
//! Defaults are usable out of the box; deployments override them through
//! `PEERLINK_*` environment variables or CLI flags.

use std::time::Duration;

use peerlink_common::{Error, PeerRole, Result};

pub const ICE_SERVERS_ENV: &str = "PEERLINK_ICE_SERVERS";
pub const NEGOTIATION_TIMEOUT_ENV: &str = "PEERLINK_NEGOTIATION_TIMEOUT_SECS";

/// Public STUN servers used when nothing else is configured.
pub const DEFAULT_ICE_SERVERS: &[&str] = &["stun:stun.l.google.com:19302", "stun:stun.stunprotocol.org"];

pub const DEFAULT_NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(30);

const ICE_URI_SCHEMES: &[&str] = &["stun:", "stuns:", "turn:", "turns:"];

pub(crate) fn env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(value) => matches!(
            value.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => default,
    }
}

/// Which local tracks the media backend attaches before negotiating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalMedia {
    pub audio: bool,
    pub video: bool,
}

impl Default for LocalMedia {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiationConfig {
    pub ice_servers: Vec<String>,
    /// Upper bound for a round to reach `Stable`. `None` waits forever.
    pub negotiation_timeout: Option<Duration>,
    pub local_media: LocalMedia,
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            ice_servers: DEFAULT_ICE_SERVERS.iter().map(|s| s.to_string()).collect(),
            negotiation_timeout: Some(DEFAULT_NEGOTIATION_TIMEOUT),
            local_media: LocalMedia::default(),
        }
    }
}

impl NegotiationConfig {
    /// Defaults overlaid with `PEERLINK_ICE_SERVERS` and
    /// `PEERLINK_NEGOTIATION_TIMEOUT_SECS`.
    pub fn from_env() -> Result<Self> {
        let ice_servers = std::env::var(ICE_SERVERS_ENV).ok();
        let timeout = std::env::var(NEGOTIATION_TIMEOUT_ENV).ok();
        Self::default().with_overrides(ice_servers.as_deref(), timeout.as_deref())
    }

    pub fn with_overrides(mut self, ice_servers: Option<&str>, timeout_secs: Option<&str>) -> Result<Self> {
        if let Some(value) = ice_servers.filter(|v| !v.trim().is_empty()) {
            self.ice_servers = parse_ice_servers(value)?;
        }
        if let Some(value) = timeout_secs.filter(|v| !v.trim().is_empty()) {
            self.negotiation_timeout = parse_timeout_secs(value)?;
        }
        Ok(self)
    }
}

/// Parse a `,`/`;` separated list of STUN/TURN URIs.
pub fn parse_ice_servers(value: &str) -> Result<Vec<String>> {
    let mut servers = Vec::new();
    for raw in value.split([',', ';']) {
        let uri = raw.trim();
        if uri.is_empty() {
            continue;
        }
        let lower = uri.to_ascii_lowercase();
        if !ICE_URI_SCHEMES.iter().any(|scheme| lower.starts_with(scheme)) {
            return Err(Error::config(format!(
                "invalid ICE server URI {uri:?}: expected one of {ICE_URI_SCHEMES:?}"
            )));
        }
        servers.push(uri.to_string());
    }

    if servers.is_empty() {
        return Err(Error::config(format!(
            "{ICE_SERVERS_ENV} is set but no usable ICE server URIs were found"
        )));
    }
    Ok(servers)
}

/// Parse a timeout in whole seconds; `0` disables the timeout.
pub fn parse_timeout_secs(value: &str) -> Result<Option<Duration>> {
    let secs: u64 = value
        .trim()
        .parse()
        .map_err(|e| Error::config(format!("invalid negotiation timeout {value:?}: {e}")))?;
    Ok((secs > 0).then(|| Duration::from_secs(secs)))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub role: PeerRole,
    pub signaling_url: String,
    pub negotiation: NegotiationConfig,
}

impl SessionConfig {
    pub fn new(role: PeerRole, signaling_url: impl Into<String>) -> Self {
        Self {
            role,
            signaling_url: signaling_url.into(),
            negotiation: NegotiationConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        let production = env_bool("PEERLINK_ENVIRONMENT_PRODUCTION", false)
            || std::env::var("PEERLINK_ENVIRONMENT")
                .map(|v| v.eq_ignore_ascii_case("production"))
                .unwrap_or(false);
        let allow_insecure = env_bool("PEERLINK_ALLOW_INSECURE_SIGNALING", false);
        check_signaling_url(&self.signaling_url, production, allow_insecure)
    }
}

fn check_signaling_url(url: &str, production: bool, allow_insecure: bool) -> Result<()> {
    let lower = url.trim().to_ascii_lowercase();
    let insecure = lower.starts_with("ws://");
    if !insecure && !lower.starts_with("wss://") {
        return Err(Error::config(format!(
            "signaling URL must use ws:// or wss://, got {url:?}"
        )));
    }

    if insecure && production && !allow_insecure {
        return Err(Error::config(
            "refusing insecure ws:// signaling URL in production; use wss:// or set PEERLINK_ALLOW_INSECURE_SIGNALING=1",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_use_public_stun_servers() {
        let config = NegotiationConfig::default();
        assert_eq!(config.ice_servers.len(), 2);
        assert!(config.ice_servers.iter().all(|s| s.starts_with("stun:")));
        assert_eq!(config.negotiation_timeout, Some(DEFAULT_NEGOTIATION_TIMEOUT));
    }

    #[test]
    fn test_parse_ice_servers_multiple_entries() {
        let servers =
            parse_ice_servers("stun:a.example:3478; turn:b.example:3478?transport=udp,").unwrap();
        assert_eq!(servers, vec!["stun:a.example:3478", "turn:b.example:3478?transport=udp"]);
    }

    #[test]
    fn test_parse_ice_servers_rejects_unknown_scheme() {
        assert!(parse_ice_servers("http://stun.example").is_err());
        assert!(parse_ice_servers(" , ;").is_err());
    }

    #[test]
    fn test_timeout_zero_disables() {
        assert_eq!(parse_timeout_secs("0").unwrap(), None);
        assert_eq!(parse_timeout_secs(" 12 ").unwrap(), Some(Duration::from_secs(12)));
        assert!(parse_timeout_secs("soon").is_err());
    }

    #[test]
    fn test_overrides_ignore_blank_values() {
        let config = NegotiationConfig::default()
            .with_overrides(Some("  "), Some(""))
            .unwrap();
        assert_eq!(config, NegotiationConfig::default());

        let config = NegotiationConfig::default()
            .with_overrides(Some("stun:only.example"), Some("5"))
            .unwrap();
        assert_eq!(config.ice_servers, vec!["stun:only.example"]);
        assert_eq!(config.negotiation_timeout, Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_signaling_url_policy() {
        assert!(check_signaling_url("ws://127.0.0.1:5520/websocket", false, false).is_ok());
        assert!(check_signaling_url("wss://signal.example/websocket", true, false).is_ok());
        assert!(check_signaling_url("ws://signal.example/websocket", true, false).is_err());
        assert!(check_signaling_url("ws://signal.example/websocket", true, true).is_ok());
        assert!(check_signaling_url("http://signal.example", false, false).is_err());
    }
}
