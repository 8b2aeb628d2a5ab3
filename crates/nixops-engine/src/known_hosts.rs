//! C3: trust-on-first-use host key manager. Maintains a single OpenSSH
//! `known_hosts`-format file that both this process consults directly
//! (`verify_or_learn`) and that C4 hands to `openssh::SessionBuilder` as
//! `user_known_hosts_file`, so the TOFU decision and the SSH client's own
//! enforcement are always looking at the same data (spec §4.3).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt};
use tokio::sync::RwLock;
use tracing::info;

use crate::errors::SshError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TofuOutcome {
    Learned,
    Matched,
}

/// `host keytype base64key` plus its derived `SHA256:...` fingerprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostKey {
    pub host: String,
    pub keytype: String,
    pub base64_key: String,
}

impl HostKey {
    pub fn fingerprint(&self) -> String {
        let decoded = base64_decode(&self.base64_key);
        let digest = Sha256::digest(&decoded);
        format!("SHA256:{}", base64_nopad(&digest))
    }

    fn line(&self) -> String {
        format!("{} {} {}", self.host, self.keytype, self.base64_key)
    }
}

/// Reads concurrently; writes (learning a new host) serialize through the
/// inner lock: concurrent readers allowed, writes serialize through a
/// process-wide lock (spec §4.3).
pub struct KnownHosts {
    path: PathBuf,
    entries: RwLock<HashMap<String, HostKey>>,
}

impl KnownHosts {
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self, SshError> {
        let path = path.into();
        let entries = if tokio::fs::try_exists(&path)
            .await
            .map_err(|e| SshError::Io(e.to_string()))?
        {
            parse_known_hosts(&path).await?
        } else {
            HashMap::new()
        };
        Ok(Self {
            path,
            entries: RwLock::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Compares `observed` against any stored key for `host`. Learns
    /// (appends + persists) on first sight; returns `HostKeyMismatch` if the
    /// stored key differs from what was just observed. Never overwrites a
    /// mismatched entry automatically — that always requires an operator to
    /// clear the stale line.
    pub async fn verify_or_learn(&self, observed: HostKey) -> Result<TofuOutcome, SshError> {
        {
            let entries = self.entries.read().await;
            if let Some(existing) = entries.get(&observed.host) {
                return if existing.fingerprint() == observed.fingerprint() {
                    Ok(TofuOutcome::Matched)
                } else {
                    Err(SshError::HostKeyMismatch(
                        observed.host.clone(),
                        existing.fingerprint(),
                        observed.fingerprint(),
                    ))
                };
            }
        }
        let mut entries = self.entries.write().await;
        // Re-check under the write lock in case of a race with another
        // learner for the same host.
        if let Some(existing) = entries.get(&observed.host) {
            return if existing.fingerprint() == observed.fingerprint() {
                Ok(TofuOutcome::Matched)
            } else {
                Err(SshError::HostKeyMismatch(
                    observed.host.clone(),
                    existing.fingerprint(),
                    observed.fingerprint(),
                ))
            };
        }
        append_line(&self.path, &observed.line())
            .await
            .map_err(|e| SshError::Io(e.to_string()))?;
        info!(host = %observed.host, fingerprint = %observed.fingerprint(), "learned new host key (TOFU)");
        entries.insert(observed.host.clone(), observed);
        Ok(TofuOutcome::Learned)
    }
}

async fn parse_known_hosts(path: &Path) -> Result<HashMap<String, HostKey>, SshError> {
    let file = tokio::fs::File::open(path)
        .await
        .map_err(|e| SshError::Io(e.to_string()))?;
    let mut lines = tokio::io::BufReader::new(file).lines();
    let mut map = HashMap::new();
    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| SshError::Io(e.to_string()))?
    {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut parts = line.splitn(3, ' ');
        if let (Some(host), Some(keytype), Some(key)) = (parts.next(), parts.next(), parts.next())
        {
            map.insert(
                host.to_owned(),
                HostKey {
                    host: host.to_owned(),
                    keytype: keytype.to_owned(),
                    base64_key: key.to_owned(),
                },
            );
        }
    }
    Ok(map)
}

async fn append_line(path: &Path, line: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(line.as_bytes()).await?;
    file.write_all(b"\n").await?;
    file.flush().await
}

const B64_TABLE: &[u8; 64] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

fn base64_nopad(bytes: &[u8]) -> String {
    let mut out = String::new();
    for chunk in bytes.chunks(3) {
        let b0 = chunk[0];
        let b1 = *chunk.get(1).unwrap_or(&0);
        let b2 = *chunk.get(2).unwrap_or(&0);
        let n = ((b0 as u32) << 16) | ((b1 as u32) << 8) | (b2 as u32);
        out.push(B64_TABLE[((n >> 18) & 0x3f) as usize] as char);
        out.push(B64_TABLE[((n >> 12) & 0x3f) as usize] as char);
        if chunk.len() > 1 {
            out.push(B64_TABLE[((n >> 6) & 0x3f) as usize] as char);
        }
        if chunk.len() > 2 {
            out.push(B64_TABLE[(n & 0x3f) as usize] as char);
        }
    }
    out
}

fn base64_decode(s: &str) -> Vec<u8> {
    let mut rev = [255u8; 256];
    for (i, &c) in B64_TABLE.iter().enumerate() {
        rev[c as usize] = i as u8;
    }
    let clean: Vec<u8> = s.bytes().filter(|&b| b != b'=').collect();
    let mut out = Vec::with_capacity(clean.len() * 3 / 4);
    for chunk in clean.chunks(4) {
        let vals: Vec<u32> = chunk.iter().map(|&b| rev[b as usize] as u32).collect();
        let n = vals
            .iter()
            .enumerate()
            .fold(0u32, |acc, (i, v)| acc | (v << (18 - 6 * i)));
        out.push((n >> 16) as u8);
        if chunk.len() > 2 {
            out.push((n >> 8) as u8);
        }
        if chunk.len() > 3 {
            out.push(n as u8);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_key(host: &str, byte: u8) -> HostKey {
        HostKey {
            host: host.to_owned(),
            keytype: "ssh-ed25519".to_owned(),
            base64_key: base64_nopad(&[byte; 32]),
        }
    }

    #[test]
    fn base64_roundtrips() {
        let bytes = b"the quick brown fox jumps";
        let encoded = base64_nopad(bytes);
        assert_eq!(base64_decode(&encoded), bytes);
    }

    #[tokio::test]
    async fn first_sighting_learns_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("known_hosts");
        let kh = KnownHosts::load(&path).await.unwrap();
        let outcome = kh.verify_or_learn(sample_key("10.0.0.1", 1)).await.unwrap();
        assert_eq!(outcome, TofuOutcome::Learned);
        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(contents.contains("10.0.0.1 ssh-ed25519"));

        let kh2 = KnownHosts::load(&path).await.unwrap();
        let outcome2 = kh2.verify_or_learn(sample_key("10.0.0.1", 1)).await.unwrap();
        assert_eq!(outcome2, TofuOutcome::Matched);
    }

    #[tokio::test]
    async fn changed_key_is_a_mismatch_not_an_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("known_hosts");
        let kh = KnownHosts::load(&path).await.unwrap();
        kh.verify_or_learn(sample_key("10.0.0.2", 9)).await.unwrap();
        let err = kh
            .verify_or_learn(sample_key("10.0.0.2", 200))
            .await
            .unwrap_err();
        assert!(matches!(err, SshError::HostKeyMismatch(_, _, _)));
        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(contents.lines().count(), 1);
    }
}
