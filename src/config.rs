//! Session configuration. Read once at connect time; not hot-reloadable.

use std::time::Duration;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::error::SessionError;

/// Environment variable overriding the signaling endpoint.
pub const SIGNALING_URL_ENV: &str = "AVATARLINK_WS_URL";

/// Fallback STUN set used when the caller configures no servers of its own.
static DEFAULT_ICE_SERVERS: Lazy<Vec<IceServerConfig>> = Lazy::new(|| {
    vec![
        IceServerConfig::stun("stun:stun.l.google.com:19302"),
        IceServerConfig::stun("stun:stun1.l.google.com:19302"),
    ]
});

/// Microphone processing options, all enabled by default.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MediaConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum IceServerKind {
    Stun,
    Turn,
}

/// One STUN or TURN entry. TURN requires credentials.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IceServerConfig {
    pub kind: IceServerKind,
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

impl IceServerConfig {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            kind: IceServerKind::Stun,
            url: url.into(),
            username: None,
            credential: None,
        }
    }

    pub fn turn(
        url: impl Into<String>,
        username: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        Self {
            kind: IceServerKind::Turn,
            url: url.into(),
            username: Some(username.into()),
            credential: Some(credential.into()),
        }
    }

    pub fn validate(&self) -> Result<(), SessionError> {
        if self.url.is_empty() {
            return Err(SessionError::ChannelUnavailable(
                "ICE server URL cannot be empty".into(),
            ));
        }
        if self.kind == IceServerKind::Turn
            && (self.username.is_none() || self.credential.is_none())
        {
            return Err(SessionError::ChannelUnavailable(
                "TURN servers require username and credential".into(),
            ));
        }
        Ok(())
    }
}

/// Everything `connect()` needs. Constructed by the embedding application.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub signaling_url: String,
    #[serde(default)]
    pub media: MediaConstraints,
    #[serde(default = "default_ice_servers")]
    pub ice_servers: Vec<IceServerConfig>,
    /// How long a connect attempt may sit in `Connecting` before it fails.
    #[serde(default = "default_negotiation_timeout", with = "duration_secs")]
    pub negotiation_timeout: Duration,
    /// How long a transient transport loss may last before it becomes `Failed`.
    #[serde(default = "default_grace_period", with = "duration_secs")]
    pub grace_period: Duration,
}

fn default_ice_servers() -> Vec<IceServerConfig> {
    DEFAULT_ICE_SERVERS.clone()
}

fn default_negotiation_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_grace_period() -> Duration {
    Duration::from_secs(10)
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

impl SessionConfig {
    pub fn new(signaling_url: impl Into<String>) -> Self {
        Self {
            signaling_url: signaling_url.into(),
            media: MediaConstraints::default(),
            ice_servers: default_ice_servers(),
            negotiation_timeout: default_negotiation_timeout(),
            grace_period: default_grace_period(),
        }
    }

    /// Like [`SessionConfig::new`], but lets `AVATARLINK_WS_URL` override the
    /// endpoint.
    pub fn from_env(default_url: impl Into<String>) -> Self {
        let url = std::env::var(SIGNALING_URL_ENV)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| default_url.into());
        Self::new(url)
    }

    pub fn validate(&self) -> Result<(), SessionError> {
        if self.signaling_url.is_empty() {
            return Err(SessionError::ChannelUnavailable(
                "signaling URL cannot be empty".into(),
            ));
        }
        for server in &self.ice_servers {
            server.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_enable_all_processing() {
        let c = MediaConstraints::default();
        assert!(c.echo_cancellation && c.noise_suppression && c.auto_gain_control);
    }

    #[test]
    fn default_config_validates() {
        let cfg = SessionConfig::new("ws://localhost:8000/ws/rtc");
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.ice_servers.len(), 2);
        assert_eq!(cfg.negotiation_timeout, Duration::from_secs(30));
    }

    #[test]
    fn turn_without_credentials_is_rejected() {
        let mut server = IceServerConfig::turn("turn.example.org", "user", "pass");
        assert!(server.validate().is_ok());

        server.credential = None;
        let mut cfg = SessionConfig::new("ws://localhost:8000/ws/rtc");
        cfg.ice_servers = vec![server];
        assert!(matches!(
            cfg.validate(),
            Err(SessionError::ChannelUnavailable(_))
        ));
    }

    #[test]
    fn empty_url_is_rejected() {
        let mut cfg = SessionConfig::new("ws://localhost:8000/ws/rtc");
        cfg.ice_servers = vec![IceServerConfig::stun("")];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn config_round_trips_through_json() {
        let cfg = SessionConfig::new("ws://localhost:8000/ws/rtc");
        let json = serde_json::to_string(&cfg).unwrap();
        let back: SessionConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.signaling_url, cfg.signaling_url);
        assert_eq!(back.grace_period, cfg.grace_period);
    }
}
