//! C6: resolves `additionalFiles` entries to bytes and writes them into the
//! prepared git workspace, validating paths before anything touches disk
//! (spec §4.6).

use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

use nixops_resource::AdditionalFile;
use nixops_shared::{render_facts_sorted, InjectedFileRecord};

use crate::errors::InjectError;
use crate::vault::Vault;

pub struct ResolvedFile {
    pub path: String,
    pub content: Vec<u8>,
    pub sensitive: bool,
}

/// Resolves each `additionalFiles[]` entry's declared source (`inline`,
/// `secretRef`, `hardwareFacts`) to concrete bytes. Exactly one source must
/// be set per entry; this is validated here rather than at the CRD schema
/// layer (see `nixops_resource::types::AdditionalFile`'s doc comment).
pub async fn resolve_files(
    vault: &Vault,
    namespace: &str,
    entries: &[AdditionalFile],
    facts: &std::collections::BTreeMap<String, String>,
) -> Result<Vec<ResolvedFile>, InjectError> {
    let mut resolved = Vec::with_capacity(entries.len());
    for (idx, entry) in entries.iter().enumerate() {
        let set_count = [
            entry.inline.is_some(),
            entry.secret_ref.is_some(),
            entry.hardware_facts.unwrap_or(false),
        ]
        .into_iter()
        .filter(|b| *b)
        .count();
        if set_count != 1 {
            return Err(InjectError::AmbiguousSource(idx, entry.path.clone()));
        }
        let (content, sensitive) = if let Some(inline) = &entry.inline {
            (inline.clone().into_bytes(), false)
        } else if let Some(secret_ref) = &entry.secret_ref {
            (vault.read_secret_value(namespace, secret_ref).await?, true)
        } else {
            let rendered = render_facts_sorted(facts.iter().map(|(k, v)| (k.as_str(), v.as_str())));
            (rendered.into_bytes(), false)
        };
        resolved.push(ResolvedFile {
            path: entry.path.clone(),
            content,
            sensitive,
        });
    }
    Ok(resolved)
}

/// Rejects absolute paths, `..` components, and empty paths; a path is safe
/// only if it stays within the workspace once joined and normalized (spec
/// §4.6 "path validation against `..`, absolute paths, and collisions").
fn validate_path(path: &str) -> Result<(), InjectError> {
    if path.is_empty() {
        return Err(InjectError::UnsafePath(path.to_owned()));
    }
    let p = Path::new(path);
    if p.is_absolute() {
        return Err(InjectError::UnsafePath(path.to_owned()));
    }
    for component in p.components() {
        match component {
            Component::Normal(_) => {}
            _ => return Err(InjectError::UnsafePath(path.to_owned())),
        }
    }
    Ok(())
}

/// Validates every declared path before a single byte is written: a path
/// colliding with a file the clone already ships, or with another entry
/// earlier in the same batch, is `PathCollision` (spec §4.6 (d) and
/// "duplicates of the same path are `PathCollision`"). Returns the
/// destination for each entry in order.
async fn validate_batch(workdir: &Path, files: &[ResolvedFile]) -> Result<Vec<PathBuf>, InjectError> {
    let mut seen = BTreeSet::new();
    let mut dests = Vec::with_capacity(files.len());
    for file in files {
        validate_path(&file.path)?;
        if !seen.insert(file.path.clone()) {
            return Err(InjectError::PathCollision(file.path.clone()));
        }
        let dest = workdir.join(&file.path);
        if tokio::fs::try_exists(&dest).await? {
            return Err(InjectError::PathCollision(file.path.clone()));
        }
        dests.push(dest);
    }
    Ok(dests)
}

/// Validates a batch exactly as `inject` would and returns the
/// `InjectedFileRecord`s it would produce, without writing anything. Used to
/// pre-compute a fingerprint against cached facts before deciding whether
/// real application (and the facts re-gather/session it needs) is required
/// at all (spec §4.9 step 5, P3).
pub async fn would_produce(
    workdir: &Path,
    files: &[ResolvedFile],
) -> Result<Vec<InjectedFileRecord>, InjectError> {
    validate_batch(workdir, files).await?;
    Ok(files
        .iter()
        .map(|file| {
            let mode = if file.sensitive { 0o600 } else { 0o644 };
            InjectedFileRecord::new(&file.path, &file.content, mode)
        })
        .collect())
}

/// Writes every resolved file under `workdir`, in declared order, and
/// returns the `InjectedFileRecord`s used by the fingerprint calculator
/// (C7). Mode 0600 for anything sourced from a Secret, 0644 otherwise. All
/// paths are validated against each other and the pre-existing clone tree
/// before any write lands, so a rejected batch never leaves a partial write
/// behind.
pub async fn inject(
    workdir: &Path,
    files: &[ResolvedFile],
) -> Result<Vec<InjectedFileRecord>, InjectError> {
    let dests = validate_batch(workdir, files).await?;
    let mut records = Vec::with_capacity(files.len());
    for (file, dest) in files.iter().zip(dests.iter()) {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(dest, &file.content).await?;
        let mode = if file.sensitive { 0o600 } else { 0o644 };
        #[cfg(unix)]
        {
            let mut perms = tokio::fs::metadata(dest).await?.permissions();
            perms.set_mode(mode);
            tokio::fs::set_permissions(dest, perms).await?;
        }
        records.push(InjectedFileRecord::new(&file.path, &file.content, mode));
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_absolute_and_traversal_paths() {
        assert!(validate_path("/etc/passwd").is_err());
        assert!(validate_path("../escape").is_err());
        assert!(validate_path("a/../../b").is_err());
        assert!(validate_path("").is_err());
        assert!(validate_path("etc/app.conf").is_ok());
    }

    #[tokio::test]
    async fn inject_writes_files_and_rejects_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let files = vec![
            ResolvedFile {
                path: "etc/a.conf".into(),
                content: b"alpha".to_vec(),
                sensitive: false,
            },
            ResolvedFile {
                path: "secrets/token".into(),
                content: b"s3cr3t".to_vec(),
                sensitive: true,
            },
        ];
        let records = inject(dir.path(), &files).await.unwrap();
        assert_eq!(records.len(), 2);
        let written = tokio::fs::read(dir.path().join("etc/a.conf")).await.unwrap();
        assert_eq!(written, b"alpha");

        #[cfg(unix)]
        {
            let mode = tokio::fs::metadata(dir.path().join("secrets/token"))
                .await
                .unwrap()
                .permissions()
                .mode()
                & 0o777;
            assert_eq!(mode, 0o600);
        }

        let dup = vec![
            ResolvedFile {
                path: "etc/a.conf".into(),
                content: b"one".to_vec(),
                sensitive: false,
            },
            ResolvedFile {
                path: "etc/a.conf".into(),
                content: b"two".to_vec(),
                sensitive: false,
            },
        ];
        let err = inject(dir.path(), &dup).await.unwrap_err();
        assert!(matches!(err, InjectError::PathCollision(_)));
    }

    #[tokio::test]
    async fn collision_with_a_file_the_clone_already_has_is_rejected_before_any_write() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("flake.nix"), b"existing").await.unwrap();
        let files = vec![
            ResolvedFile {
                path: "etc/new.conf".into(),
                content: b"fresh".to_vec(),
                sensitive: false,
            },
            ResolvedFile {
                path: "flake.nix".into(),
                content: b"overwrite".to_vec(),
                sensitive: false,
            },
        ];
        let err = inject(dir.path(), &files).await.unwrap_err();
        assert!(matches!(err, InjectError::PathCollision(_)));
        // Nothing from the rejected batch landed, not even the entry that
        // validated fine before the collision was found.
        assert!(!dir.path().join("etc/new.conf").exists());
        let untouched = tokio::fs::read(dir.path().join("flake.nix")).await.unwrap();
        assert_eq!(untouched, b"existing");
    }

    #[tokio::test]
    async fn would_produce_matches_inject_but_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let files = vec![ResolvedFile {
            path: "etc/a.conf".into(),
            content: b"alpha".to_vec(),
            sensitive: false,
        }];
        let preview = would_produce(dir.path(), &files).await.unwrap();
        assert!(!dir.path().join("etc/a.conf").exists());
        let written = inject(dir.path(), &files).await.unwrap();
        assert_eq!(preview, written);
    }
}
