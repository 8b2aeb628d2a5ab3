//! C5: materializes a per-configuration working tree by cloning at a
//! resolved revision into a scratch directory (spec §4.5). Runs `git2`
//! (blocking) on a `spawn_blocking` thread so the async reconcile loop never
//! stalls on libgit2's synchronous network I/O.

use std::path::{Path, PathBuf};

use git2::{Cred, FetchOptions, RemoteCallbacks, Repository};

use crate::errors::GitError;
use crate::vault::GitCredential;

/// Owns the scratch clone directory; removed on drop (spec §5 "scratch
/// directory cleanup"), matching `tempfile::TempDir`'s guarantee that
/// removal happens on unwind as well as on the success path.
pub struct GitWorkspace {
    dir: tempfile::TempDir,
    pub resolved_commit: String,
}

impl GitWorkspace {
    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}

fn is_commit_sha(s: &str) -> bool {
    s.len() == 40 && s.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Clones `repo_url` into a fresh scratch directory under `base_dir` and
/// checks out `git_ref`, which may be `HEAD`, a branch name, a tag name or a
/// 40-character commit SHA. Depth-1 fetch is used whenever the ref names a
/// branch or tag directly; an arbitrary commit SHA requires a full fetch of
/// history since shallow clones can't address commits outside the
/// negotiated tip.
pub async fn prepare(
    base_dir: &Path,
    repo_url: String,
    git_ref: String,
    credentials: Option<OwnedGitCredential>,
) -> Result<GitWorkspace, GitError> {
    tokio::fs::create_dir_all(base_dir).await?;
    let dir = tempfile::Builder::new()
        .prefix("nixops-clone-")
        .tempdir_in(base_dir)?;
    let path = dir.path().to_path_buf();
    let resolved = tokio::task::spawn_blocking(move || clone_and_resolve(&path, &repo_url, &git_ref, credentials))
        .await
        .expect("git worker panicked")?;
    Ok(GitWorkspace {
        dir,
        resolved_commit: resolved,
    })
}

/// `git2::Cred` closures aren't `Send`-friendly across the async/blocking
/// boundary in their borrowed form, so credentials cross into the blocking
/// task as owned bytes and a kind tag.
pub enum OwnedGitCredential {
    Token(Vec<u8>),
    SshKey(Vec<u8>),
}

impl OwnedGitCredential {
    pub fn from_vault(cred: &GitCredential) -> Self {
        match cred {
            GitCredential::Token(c) => OwnedGitCredential::Token(c.as_bytes().to_vec()),
            GitCredential::SshKey(c) => OwnedGitCredential::SshKey(c.as_bytes().to_vec()),
        }
    }
}

fn clone_and_resolve(
    path: &Path,
    repo_url: &str,
    git_ref: &str,
    credentials: Option<OwnedGitCredential>,
) -> Result<String, GitError> {
    let repo = Repository::init(path)?;
    let mut remote = repo.remote("origin", repo_url)?;

    let refspecs: Vec<String> = if git_ref == "HEAD" {
        vec!["+HEAD:refs/remotes/origin/HEAD".to_owned()]
    } else if is_commit_sha(git_ref) {
        // Arbitrary commit: no refspec can name it directly, fetch the
        // default branch's full history and hope the commit is reachable
        // from it (the documented limitation of this ref form, spec §4.5
        // "Edge cases").
        vec!["+refs/heads/*:refs/remotes/origin/*".to_owned()]
    } else {
        vec![
            format!("+refs/heads/{git_ref}:refs/remotes/origin/{git_ref}"),
            format!("+refs/tags/{git_ref}:refs/tags/{git_ref}"),
        ]
    };

    let shallow = git_ref != "HEAD" && !is_commit_sha(git_ref);

    let mut callbacks = RemoteCallbacks::new();
    if let Some(creds) = credentials {
        callbacks.credentials(move |_url, username_from_url, _allowed| match &creds {
            OwnedGitCredential::Token(token) => Cred::userpass_plaintext(
                "x-access-token",
                std::str::from_utf8(token).unwrap_or_default(),
            ),
            OwnedGitCredential::SshKey(key) => Cred::ssh_key_from_memory(
                username_from_url.unwrap_or("git"),
                None,
                std::str::from_utf8(key).unwrap_or_default(),
                None,
            ),
        });
    }

    let mut fetch_opts = FetchOptions::new();
    fetch_opts.remote_callbacks(callbacks);
    if shallow {
        fetch_opts.depth(1);
    }

    let mut fetched_any = false;
    let mut last_err = None;
    for refspec in &refspecs {
        match remote.fetch(&[refspec.as_str()], Some(&mut fetch_opts), None) {
            Ok(()) => {
                fetched_any = true;
                break;
            }
            Err(e) => last_err = Some(e),
        }
    }
    if !fetched_any {
        let e = last_err.expect("at least one refspec attempted");
        return Err(classify_git_error(e));
    }

    let commit_oid = if git_ref == "HEAD" {
        repo.refname_to_id("refs/remotes/origin/HEAD")
            .or_else(|_| repo.find_reference("FETCH_HEAD").and_then(|r| r.peel_to_commit().map(|c| c.id())))
    } else if is_commit_sha(git_ref) {
        git2::Oid::from_str(git_ref).and_then(|oid| repo.find_commit(oid).map(|c| c.id()))
    } else {
        repo.refname_to_id(&format!("refs/remotes/origin/{git_ref}"))
            .or_else(|_| repo.refname_to_id(&format!("refs/tags/{git_ref}")))
    }
    .map_err(|_| GitError::RefNotFound(git_ref.to_owned()))?;

    let commit = repo.find_commit(commit_oid)?;
    repo.checkout_tree(commit.as_object(), None)?;
    repo.set_head_detached(commit_oid)?;

    Ok(commit_oid.to_string())
}

fn classify_git_error(e: git2::Error) -> GitError {
    use git2::ErrorClass;
    match e.class() {
        ErrorClass::Net | ErrorClass::Ssh => GitError::NetworkError(e.message().to_owned()),
        ErrorClass::Http if e.message().to_lowercase().contains("auth") => {
            GitError::AuthFailed(e.message().to_owned())
        }
        _ => GitError::Git(e),
    }
}

pub fn resolve_subdir(workdir: &Path, subdir: Option<&str>) -> PathBuf {
    match subdir {
        Some(sub) => workdir.join(sub),
        None => workdir.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_sha_detection() {
        assert!(is_commit_sha(&"a".repeat(40)));
        assert!(!is_commit_sha("main"));
        assert!(!is_commit_sha(&"g".repeat(40)));
    }

    #[test]
    fn subdir_resolution() {
        let base = Path::new("/tmp/clone");
        assert_eq!(resolve_subdir(base, None), base);
        assert_eq!(
            resolve_subdir(base, Some("hosts/web1")),
            base.join("hosts/web1")
        );
    }
}
