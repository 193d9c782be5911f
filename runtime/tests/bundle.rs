//! Bundle targets and offline materialization from a saved bundle.

mod common;

use std::path::Path;
use std::sync::Arc;

use common::{Layer, LayerBuilder, MemoryRegistry};
use layerfold_core::{FoldError, MaterializeConfig};
use layerfold_runtime::oci::bundle_file_name;
use layerfold_runtime::{resolve_digest_name, BundleSource, MaterializationTarget, Materializer};
use tempfile::TempDir;

fn image() -> Vec<Layer> {
    vec![
        Layer::gzip(
            LayerBuilder::new()
                .dir("srv")
                .file("srv/index.html", b"<h1>hello</h1>")
                .symlink("srv/current", "index.html"),
        ),
        Layer::tar(LayerBuilder::new().file("srv/index.html", b"<h1>hello again</h1>")),
    ]
}

fn snapshot(root: &Path) -> Vec<(String, Vec<u8>)> {
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir).unwrap() {
            let entry = entry.unwrap();
            let path = entry.path();
            let rel = path.strip_prefix(root).unwrap().to_string_lossy().into_owned();
            let meta = std::fs::symlink_metadata(&path).unwrap();
            if meta.file_type().is_symlink() {
                let target = std::fs::read_link(&path).unwrap();
                out.push((rel, target.to_string_lossy().into_owned().into_bytes()));
            } else if meta.is_dir() {
                out.push((rel, Vec::new()));
                stack.push(path);
            } else {
                out.push((rel, std::fs::read(&path).unwrap()));
            }
        }
    }
    out.sort();
    out
}

#[tokio::test]
async fn test_bundle_twice_is_byte_identical() {
    let registry = Arc::new(MemoryRegistry::new(image()));
    let out = TempDir::new().unwrap();
    let materializer = Materializer::from_source(registry.clone(), MaterializeConfig::default());
    let target = MaterializationTarget::bundle(out.path(), Some("web".to_string()));

    let first = materializer
        .materialize(&registry.reference(), target.clone())
        .await
        .unwrap();
    let first_bytes = std::fs::read(&first.target).unwrap();
    let second = materializer
        .materialize(&registry.reference(), target)
        .await
        .unwrap();

    assert_eq!(first.target, second.target);
    assert_eq!(
        first.target.file_name().unwrap().to_string_lossy(),
        bundle_file_name(&registry.manifest.digest)
    );
    assert_eq!(first_bytes, std::fs::read(&second.target).unwrap());
    assert_eq!(first.bundled_blobs, 3);
    assert!(first.layers.is_empty());
}

#[tokio::test]
async fn test_bundle_fetch_failure_leaves_nothing() {
    let registry = Arc::new(MemoryRegistry::new(image()).fail_layer(1));
    let out = TempDir::new().unwrap();

    let err = Materializer::from_source(registry.clone(), MaterializeConfig::default())
        .materialize(&registry.reference(), MaterializationTarget::bundle(out.path(), None))
        .await
        .unwrap_err();

    match err {
        FoldError::IncompleteBundle { digest, .. } => {
            assert_eq!(digest, registry.layer_digest(1).to_string())
        }
        other => panic!("expected IncompleteBundle, got {}", other),
    }
    assert_eq!(std::fs::read_dir(out.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_offline_materialization_matches_registry() {
    let registry = Arc::new(MemoryRegistry::new(image()));
    let scratch = TempDir::new().unwrap();

    let online_root = scratch.path().join("online");
    Materializer::from_source(registry.clone(), MaterializeConfig::default())
        .materialize(&registry.reference(), MaterializationTarget::directory(&online_root))
        .await
        .unwrap();

    let saved = Materializer::from_source(registry.clone(), MaterializeConfig::default())
        .materialize(
            &registry.reference(),
            MaterializationTarget::bundle(scratch.path().join("bundles"), None),
        )
        .await
        .unwrap();

    let source = Arc::new(BundleSource::open(&saved.target).unwrap());
    let reference = source.reference().unwrap();
    let offline_root = scratch.path().join("offline");
    let report = Materializer::from_source(source, MaterializeConfig::default())
        .materialize(&reference, MaterializationTarget::directory(&offline_root))
        .await
        .unwrap();

    assert_eq!(report.manifest_digest, registry.manifest.digest);
    assert_eq!(snapshot(&online_root), snapshot(&offline_root));
}

#[tokio::test]
async fn test_resolve_digest_name() {
    let registry = MemoryRegistry::new(image());
    let expected = registry.manifest.digest.sanitize_for_filesystem();

    let by_reference = resolve_digest_name(&registry, "registry.test/layerfold/fixture:v1")
        .await
        .unwrap();
    assert_eq!(by_reference, expected);

    let by_digest = resolve_digest_name(&registry, &registry.manifest.digest.to_string())
        .await
        .unwrap();
    assert_eq!(by_digest, expected);
    assert!(!by_digest.contains(':'));
}
