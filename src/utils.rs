use crate::config::{IceServerConfig, IceServerKind};
use rand::Rng;

/// Short hex tag for correlating one connect attempt across log lines.
pub fn random_id() -> String {
    hex::encode(rand::rng().random::<[u8; 8]>())
}

/// Prepends the protocol scheme to an ICE server URL if it is missing.
pub fn add_ice_url_scheme(config: &IceServerConfig) -> String {
    if config.url.starts_with("turn:") || config.url.starts_with("stun:") {
        config.url.clone()
    } else {
        let scheme = match config.kind {
            IceServerKind::Turn => "turn:",
            IceServerKind::Stun => "stun:",
        };
        format!("{}{}", scheme, config.url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_id_is_unique_hex() {
        let a = random_id();
        let b = random_id();
        assert_eq!(a.len(), 16);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn scheme_added_by_kind() {
        let stun = IceServerConfig::stun("stun.example.org:3478");
        assert_eq!(add_ice_url_scheme(&stun), "stun:stun.example.org:3478");

        let turn = IceServerConfig::turn("turn.example.org:3478", "user", "pass");
        assert_eq!(add_ice_url_scheme(&turn), "turn:turn.example.org:3478");
    }

    #[test]
    fn existing_scheme_is_kept() {
        let cfg = IceServerConfig::stun("stun:stun.l.google.com:19302");
        assert_eq!(add_ice_url_scheme(&cfg), "stun:stun.l.google.com:19302");
    }
}
