//! Integration test: unpack and save a real image from Docker Hub.
//!
//! ## Running
//!
//! ```bash
//! cargo build -p layerfold-cli
//! cargo test -p layerfold-cli --test registry_integration -- --ignored --nocapture
//! ```
//!
//! Tests are `#[ignore]` by default because they need a built binary and network access.

use std::path::Path;
use std::process::Command;

/// Find the layerfold binary in the target directory.
fn find_binary() -> String {
    let manifest_dir = env!("CARGO_MANIFEST_DIR");
    let workspace_root = Path::new(manifest_dir)
        .parent()
        .expect("cli crate should be inside workspace");

    for profile in ["debug", "release"] {
        let bin = workspace_root.join("target").join(profile).join("layerfold");
        if bin.exists() {
            return bin.to_string_lossy().to_string();
        }
    }

    "layerfold".to_string()
}

/// Run a layerfold command and return (stdout, stderr, success).
fn layerfold(args: &[&str]) -> (String, String, bool) {
    let output = Command::new(find_binary())
        .args(args)
        .output()
        .expect("failed to run layerfold");
    (
        String::from_utf8_lossy(&output.stdout).to_string(),
        String::from_utf8_lossy(&output.stderr).to_string(),
        output.status.success(),
    )
}

#[test]
#[ignore]
fn test_alpine_unpack_save_and_offline_unpack() {
    let scratch = tempfile::TempDir::new().unwrap();
    let online = scratch.path().join("online");
    let bundles = scratch.path().join("bundles");
    let offline = scratch.path().join("offline");

    let (stdout, stderr, ok) = layerfold(&["digest", "alpine:3.19"]);
    assert!(ok, "digest failed: {stderr}");
    let name = stdout.trim().to_string();
    assert!(name.starts_with("sha256-"), "unexpected digest name {name}");

    let (_, stderr, ok) = layerfold(&["unpack", "alpine:3.19", online.to_str().unwrap()]);
    assert!(ok, "unpack failed: {stderr}");
    assert!(online.join("etc/alpine-release").exists());
    assert!(online.join("bin/busybox").exists());

    let (_, stderr, ok) = layerfold(&["save", "alpine:3.19", bundles.to_str().unwrap()]);
    assert!(ok, "save failed: {stderr}");
    let bundle = bundles.join(&name);
    assert!(bundle.exists());

    let (_, stderr, ok) = layerfold(&[
        "unpack",
        "alpine:3.19",
        offline.to_str().unwrap(),
        "--bundle",
        bundle.to_str().unwrap(),
    ]);
    assert!(ok, "offline unpack failed: {stderr}");
    assert_eq!(
        std::fs::read(online.join("etc/alpine-release")).unwrap(),
        std::fs::read(offline.join("etc/alpine-release")).unwrap()
    );
}

#[test]
#[ignore]
fn test_manifest_lists_layers() {
    let (stdout, stderr, ok) = layerfold(&["manifest", "alpine:3.19"]);
    assert!(ok, "manifest failed: {stderr}");
    assert!(stdout.contains("config"));
    assert!(stdout.contains("layer 0"));
}
