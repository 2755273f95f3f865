//! Agent identity
//!
//! Every agent carries a stable 16-byte identifier, generated once and
//! persisted to disk. The identifier is what peers, routes, and stream paths
//! refer to; the file on disk is the only persistent state the agent keeps.

use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Length of an agent identifier in bytes.
pub const AGENT_ID_LEN: usize = 16;

/// Stable 16-byte agent identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AgentId(pub [u8; AGENT_ID_LEN]);

impl AgentId {
    /// Generate a fresh random identifier.
    pub fn generate() -> Self {
        let mut bytes = [0u8; AGENT_ID_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; AGENT_ID_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; AGENT_ID_LEN] {
        &self.0
    }

    /// Short form for log lines: first four bytes as hex.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }

    /// Load the identity from `path`, or generate and persist a new one if
    /// the file does not exist yet.
    pub async fn load_or_generate(path: &Path) -> std::io::Result<Self> {
        match tokio::fs::read(path).await {
            Ok(bytes) => {
                let arr: [u8; AGENT_ID_LEN] = bytes.as_slice().try_into().map_err(|_| {
                    std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        format!(
                            "identity file {} is {} bytes, expected {}",
                            path.display(),
                            bytes.len(),
                            AGENT_ID_LEN
                        ),
                    )
                })?;
                Ok(Self(arr))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let id = Self::generate();
                if let Some(parent) = path.parent() {
                    if !parent.as_os_str().is_empty() {
                        tokio::fs::create_dir_all(parent).await?;
                    }
                }
                tokio::fs::write(path, id.as_bytes()).await?;
                log::info!("[identity] generated new agent id {} at {}", id, path.display());
                Ok(id)
            }
            Err(e) => Err(e),
        }
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AgentId({})", self.short())
    }
}

impl FromStr for AgentId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|e| format!("invalid agent id hex: {}", e))?;
        let arr: [u8; AGENT_ID_LEN] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| format!("agent id must be {} bytes, got {}", AGENT_ID_LEN, bytes.len()))?;
        Ok(Self(arr))
    }
}

impl Serialize for AgentId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for AgentId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_hex() {
        let id = AgentId::generate();
        let parsed: AgentId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_short_form() {
        let id = AgentId::from_bytes([0xab; 16]);
        assert_eq!(id.short(), "abababab");
        assert_eq!(id.to_string().len(), 32);
    }

    #[test]
    fn test_reject_bad_hex() {
        assert!("xyz".parse::<AgentId>().is_err());
        assert!("abcd".parse::<AgentId>().is_err());
    }

    #[tokio::test]
    async fn test_load_or_generate_persists() {
        let dir = std::env::temp_dir().join(format!("overmesh-id-{}", std::process::id()));
        let path = dir.join("agent.id");
        let first = AgentId::load_or_generate(&path).await.unwrap();
        let second = AgentId::load_or_generate(&path).await.unwrap();
        assert_eq!(first, second);
        tokio::fs::remove_dir_all(&dir).await.ok();
    }

    #[tokio::test]
    async fn test_reject_truncated_file() {
        let dir = std::env::temp_dir().join(format!("overmesh-id-bad-{}", std::process::id()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let path = dir.join("agent.id");
        tokio::fs::write(&path, b"short").await.unwrap();
        assert!(AgentId::load_or_generate(&path).await.is_err());
        tokio::fs::remove_dir_all(&dir).await.ok();
    }
}
