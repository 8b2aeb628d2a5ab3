//! C7: a pure function from resolved desired state to a single 256-bit
//! fingerprint (spec §4.7). No I/O here — every input is already resolved
//! bytes or scalars, which is what makes P4 ("same effective inputs always
//! produce the same fingerprint, file order independent") checkable as a
//! plain unit test.

use nixops_shared::{Fingerprint, InjectedFileRecord};
use sha2::{Digest, Sha256};

pub struct DesiredState<'a> {
    pub resolved_commit: &'a str,
    pub flake: &'a str,
    pub configuration_subdir: Option<&'a str>,
    pub full_install: bool,
    pub files: &'a [InjectedFileRecord],
}

/// Computes the fingerprint. `files` is sorted by path internally so that
/// declaration order in `additionalFiles` (which controls injection order on
/// disk) never affects the hash — only the resolved set does (spec §4.7,
/// P4).
pub fn compute(state: &DesiredState<'_>) -> Fingerprint {
    let mut sorted: Vec<&InjectedFileRecord> = state.files.iter().collect();
    sorted.sort_unstable_by(|a, b| a.path.cmp(&b.path));

    let mut hasher = Sha256::new();
    hash_field(&mut hasher, state.resolved_commit.as_bytes());
    hash_field(&mut hasher, state.flake.as_bytes());
    hash_field(
        &mut hasher,
        state.configuration_subdir.unwrap_or("").as_bytes(),
    );
    hasher.update([state.full_install as u8]);
    hasher.update((sorted.len() as u64).to_le_bytes());
    for record in sorted {
        hasher.update(record.canonical_bytes());
    }
    Fingerprint::from_bytes(hasher.finalize().into())
}

fn hash_field(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state<'a>(files: &'a [InjectedFileRecord]) -> DesiredState<'a> {
        DesiredState {
            resolved_commit: "a".repeat(40).leak(),
            flake: ".#machine",
            configuration_subdir: None,
            full_install: false,
            files,
        }
    }

    #[test]
    fn file_order_does_not_affect_fingerprint() {
        let a = InjectedFileRecord::new("a.conf", b"1", 0o644);
        let b = InjectedFileRecord::new("b.conf", b"2", 0o644);
        let forward = compute(&state(&[a.clone(), b.clone()]));
        let reversed = compute(&state(&[b, a]));
        assert_eq!(forward, reversed);
    }

    #[test]
    fn content_change_changes_fingerprint() {
        let a = InjectedFileRecord::new("a.conf", b"1", 0o644);
        let a_changed = InjectedFileRecord::new("a.conf", b"2", 0o644);
        assert_ne!(compute(&state(&[a])), compute(&state(&[a_changed])));
    }

    #[test]
    fn different_commit_changes_fingerprint_even_with_same_files() {
        let files = [InjectedFileRecord::new("a.conf", b"1", 0o644)];
        let mut s1 = state(&files);
        let mut s2 = state(&files);
        s1.resolved_commit = "1111111111111111111111111111111111111111";
        s2.resolved_commit = "2222222222222222222222222222222222222222";
        assert_ne!(compute(&s1), compute(&s2));
    }
}
