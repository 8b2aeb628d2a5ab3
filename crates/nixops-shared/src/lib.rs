//! Primitives shared between the resource store, the reconcile engine and the
//! command layer: the fingerprint hash type, the canonical hardware-facts
//! rendering, and small reference types that appear in both CRD specs and
//! internal engine state.

use std::fmt::{self, Display};
use std::str::FromStr;

use serde::{de::Error as _, Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

/// A 256-bit fingerprint over the fully resolved desired state of a
/// NixosConfiguration (spec §4.7). Always rendered as lowercase hex, same as
/// a git commit hash, so the two read uniformly in status fields and events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FingerprintParseError {
    #[error("fingerprint must be 64 hex characters, got {0}")]
    WrongLength(usize),
    #[error("invalid hex in fingerprint: {0}")]
    Hex(#[from] hex::FromHexError),
}

impl FromStr for Fingerprint {
    type Err = FingerprintParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 64 {
            return Err(FingerprintParseError::WrongLength(s.len()));
        }
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes)?;
        Ok(Self(bytes))
    }
}

impl Serialize for Fingerprint {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.to_hex().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

/// One entry of the ordered, canonicalized file list that feeds the
/// fingerprint calculator (spec §4.7): path, content hash and mode, never the
/// content itself, so secret bytes never have to travel through the
/// fingerprint pipeline twice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InjectedFileRecord {
    pub path: String,
    pub sha256: [u8; 32],
    pub mode: u32,
}

impl InjectedFileRecord {
    pub fn new(path: impl Into<String>, content: &[u8], mode: u32) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(content);
        let sha256: [u8; 32] = hasher.finalize().into();
        Self {
            path: path.into(),
            sha256,
            mode,
        }
    }

    /// Canonical encoding used as fingerprint input: length-prefixed fields
    /// so that no ambiguity can arise from concatenating variable-length
    /// strings (spec §4.7 "length-prefixed or sorted-key encoding").
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.path.len() + 32 + 4 + 16);
        out.extend_from_slice(&(self.path.len() as u64).to_le_bytes());
        out.extend_from_slice(self.path.as_bytes());
        out.extend_from_slice(&self.sha256);
        out.extend_from_slice(&self.mode.to_le_bytes());
        out
    }
}

/// Reference to a key within a Secret object (spec §3 `additionalFiles`
/// `secretRef`, and the SSH/Git credential references).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
pub struct SecretKeyRef {
    pub name: String,
    pub key: String,
}

/// The fixed set of hardware fact keys enumerated in spec §6. Kept as a
/// constant slice so the file injector and the status writer agree on what
/// "canonical" means without duplicating the list.
pub const HARDWARE_FACT_KEYS: &[&str] = &[
    "os.name",
    "os.id",
    "kernel.version",
    "architecture",
    "hostname",
    "uptime.days",
    "cpu.model",
    "cpu.cores",
    "memory.mb",
    "virtualization.type",
    "container.engine",
    "system.serial",
    "system.uuid",
    "system.timezone",
];

/// Renders a fact map as sorted `key=value\n` lines, the canonical format
/// used both for `additionalFiles[].hardwareFacts` injection (spec §4.6) and
/// for display purposes. `BTreeMap`'s iteration order already sorts by key,
/// matching the existing convention of storing fleet-style text files with a
/// deterministic line order.
pub fn render_facts_sorted<'a>(facts: impl IntoIterator<Item = (&'a str, &'a str)>) -> String {
    let mut pairs: Vec<(&str, &str)> = facts.into_iter().collect();
    pairs.sort_unstable_by(|a, b| a.0.cmp(b.0));
    let mut out = String::new();
    for (k, v) in pairs {
        out.push_str(k);
        out.push('=');
        out.push_str(v);
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_roundtrip() {
        let fp = Fingerprint::from_bytes([7u8; 32]);
        let s = fp.to_string();
        assert_eq!(s.len(), 64);
        let parsed: Fingerprint = s.parse().unwrap();
        assert_eq!(fp, parsed);
    }

    #[test]
    fn fingerprint_rejects_bad_length() {
        assert!(matches!(
            "abcd".parse::<Fingerprint>(),
            Err(FingerprintParseError::WrongLength(4))
        ));
    }

    #[test]
    fn facts_render_sorted_regardless_of_input_order() {
        let a = render_facts_sorted([("b", "2"), ("a", "1")]);
        let b = render_facts_sorted([("a", "1"), ("b", "2")]);
        assert_eq!(a, b);
        assert_eq!(a, "a=1\nb=2\n");
    }

    #[test]
    fn injected_file_record_hashes_content_not_path() {
        let a = InjectedFileRecord::new("etc/a.conf", b"hello", 0o644);
        let b = InjectedFileRecord::new("etc/b.conf", b"hello", 0o644);
        assert_eq!(a.sha256, b.sha256);
        assert_ne!(a.canonical_bytes(), b.canonical_bytes());
    }
}
