//! Host-key verification policies.
//!
//! A [`Connector`](crate::transport::Connector) calls
//! [`HostKeyPolicy::verify`] with the raw public key the server presented
//! during the handshake. Fingerprints are the hex SHA-256 of that raw key.

use serde::{Deserialize, Deserializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::{RexError, RexResult};

const FINGERPRINT_PREFIX: &str = "sha256:";

/// Compute the full hex-encoded SHA-256 fingerprint of a raw host key.
pub fn fingerprint(host_key: &[u8]) -> String {
    hex::encode(Sha256::digest(host_key))
}

/// Custom verification: receives the host address and raw key.
pub type HostKeyCallback = Arc<dyn Fn(&str, &[u8]) -> RexResult<()> + Send + Sync>;

#[derive(Clone)]
pub enum HostKeyPolicy {
    /// Accept any host key. Only suitable for tests and throwaway hosts.
    InsecureIgnore,
    /// Accept exactly one key, identified by its fingerprint.
    Fixed(String),
    Callback(HostKeyCallback),
}

impl HostKeyPolicy {
    /// Pin the given raw key.
    pub fn fixed_key(host_key: &[u8]) -> Self {
        HostKeyPolicy::Fixed(fingerprint(host_key))
    }

    pub fn callback<F>(f: F) -> Self
    where
        F: Fn(&str, &[u8]) -> RexResult<()> + Send + Sync + 'static,
    {
        HostKeyPolicy::Callback(Arc::new(f))
    }

    pub fn verify(&self, host: &str, host_key: &[u8]) -> RexResult<()> {
        match self {
            HostKeyPolicy::InsecureIgnore => Ok(()),
            HostKeyPolicy::Fixed(expected) => {
                let got = fingerprint(host_key);
                let expected = expected.strip_prefix(FINGERPRINT_PREFIX).unwrap_or(expected);
                if got.eq_ignore_ascii_case(expected) {
                    Ok(())
                } else {
                    Err(RexError::HostKey {
                        host: host.to_string(),
                        reason: format!("expected {expected}, got {got}"),
                    })
                }
            }
            HostKeyPolicy::Callback(f) => f(host, host_key),
        }
    }
}

impl fmt::Debug for HostKeyPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostKeyPolicy::InsecureIgnore => f.write_str("InsecureIgnore"),
            HostKeyPolicy::Fixed(fp) => f.debug_tuple("Fixed").field(fp).finish(),
            HostKeyPolicy::Callback(_) => f.write_str("Callback(..)"),
        }
    }
}

/// Parses the config-file form: `insecure` or `sha256:<hex>`.
impl FromStr for HostKeyPolicy {
    type Err = RexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("insecure") {
            return Ok(HostKeyPolicy::InsecureIgnore);
        }
        let hex_part = s
            .strip_prefix(FINGERPRINT_PREFIX)
            .ok_or_else(|| RexError::Config(format!("unrecognized host key policy: {s}")))?;
        if hex_part.len() != 64 || hex::decode(hex_part).is_err() {
            return Err(RexError::Config(format!(
                "host key fingerprint must be 64 hex characters: {s}"
            )));
        }
        Ok(HostKeyPolicy::Fixed(hex_part.to_ascii_lowercase()))
    }
}

impl<'de> Deserialize<'de> for HostKeyPolicy {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_hex_sha256() {
        let fp = fingerprint(b"key");
        assert_eq!(fp.len(), 64);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(fp, fingerprint(b"key"));
        assert_ne!(fp, fingerprint(b"other"));
    }

    #[test]
    fn fixed_accepts_only_its_key() {
        let policy = HostKeyPolicy::fixed_key(b"server-key");
        assert!(policy.verify("host:22", b"server-key").is_ok());
        match policy.verify("host:22", b"attacker-key") {
            Err(RexError::HostKey { host, .. }) => assert_eq!(host, "host:22"),
            other => panic!("expected host key error, got {other:?}"),
        }
    }

    #[test]
    fn insecure_accepts_anything() {
        assert!(HostKeyPolicy::InsecureIgnore.verify("h", b"").is_ok());
    }

    #[test]
    fn callback_decides() {
        let policy = HostKeyPolicy::callback(|host, _| {
            if host.starts_with("trusted") {
                Ok(())
            } else {
                Err(RexError::HostKey {
                    host: host.into(),
                    reason: "untrusted".into(),
                })
            }
        });
        assert!(policy.verify("trusted:22", b"k").is_ok());
        assert!(policy.verify("other:22", b"k").is_err());
    }

    #[test]
    fn parse_config_forms() {
        assert!(matches!(
            "insecure".parse::<HostKeyPolicy>().unwrap(),
            HostKeyPolicy::InsecureIgnore
        ));

        let fp = fingerprint(b"k");
        let parsed: HostKeyPolicy = format!("sha256:{}", fp.to_uppercase()).parse().unwrap();
        assert!(parsed.verify("h", b"k").is_ok());

        assert!("sha256:abc".parse::<HostKeyPolicy>().is_err());
        assert!("md5:00".parse::<HostKeyPolicy>().is_err());
    }
}
