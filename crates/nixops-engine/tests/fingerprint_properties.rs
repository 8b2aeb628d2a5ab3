//! Black-box coverage of P4 ("same effective inputs always produce the
//! same fingerprint; only the resolved file set matters, not declaration
//! order or any other incidental detail").

use nixops_engine::fingerprint::{compute, DesiredState};
use nixops_shared::InjectedFileRecord;

fn base_state<'a>(commit: &'a str, files: &'a [InjectedFileRecord]) -> DesiredState<'a> {
    DesiredState {
        resolved_commit: commit,
        flake: ".#web01",
        configuration_subdir: Some("hosts/web01"),
        full_install: false,
        files,
    }
}

#[test]
fn identical_inputs_always_hash_the_same() {
    let commit = "b".repeat(40);
    let files = vec![
        InjectedFileRecord::new("etc/ssh/keys/id1.pub", b"ssh-ed25519 AAA", 0o644),
        InjectedFileRecord::new("etc/app/secret.env", b"TOKEN=xyz", 0o600),
    ];
    let first = compute(&base_state(&commit, &files));
    let second = compute(&base_state(&commit, &files));
    assert_eq!(first, second);
}

#[test]
fn full_install_flag_changes_the_fingerprint() {
    let commit = "c".repeat(40);
    let files: Vec<InjectedFileRecord> = Vec::new();
    let mut without_install = base_state(&commit, &files);
    let mut with_install = base_state(&commit, &files);
    without_install.full_install = false;
    with_install.full_install = true;
    assert_ne!(compute(&without_install), compute(&with_install));
}

#[test]
fn configuration_subdir_is_part_of_the_fingerprint() {
    let commit = "d".repeat(40);
    let files: Vec<InjectedFileRecord> = Vec::new();
    let mut a = base_state(&commit, &files);
    let mut b = base_state(&commit, &files);
    a.configuration_subdir = Some("hosts/a");
    b.configuration_subdir = Some("hosts/b");
    assert_ne!(compute(&a), compute(&b));
}

#[test]
fn adding_a_file_always_changes_the_fingerprint() {
    let commit = "e".repeat(40);
    let one_file = vec![InjectedFileRecord::new("etc/foo", b"bar", 0o644)];
    let two_files = vec![
        InjectedFileRecord::new("etc/foo", b"bar", 0o644),
        InjectedFileRecord::new("etc/baz", b"qux", 0o644),
    ];
    assert_ne!(
        compute(&base_state(&commit, &one_file)),
        compute(&base_state(&commit, &two_files))
    );
}
