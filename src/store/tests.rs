//! Unit tests for object-store helpers and tarball hashing.

use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use rstest::{fixture, rstest};
use tempfile::TempDir;

use super::*;
use crate::mount::FilterRules;
use crate::test_support::{MemoryStore, ScriptedRunner};

struct Tree {
    _temp: TempDir,
    root: Utf8PathBuf,
    out: Utf8PathBuf,
}

#[fixture]
fn tree() -> Tree {
    let temp = tempfile::tempdir().expect("tempdir");
    let base = Utf8Path::from_path(temp.path()).expect("utf8").to_path_buf();
    let root = base.join("src");
    let out = base.join("out");
    fs::create_dir_all(root.join("pkg")).expect("mkdir pkg");
    fs::create_dir_all(root.join("data")).expect("mkdir data");
    fs::create_dir_all(&out).expect("mkdir out");
    fs::write(root.join("pkg/module.py"), "VALUE = 1\n").expect("write module");
    fs::write(root.join("pkg/module.pyc"), "bytecode").expect("write pyc");
    fs::write(root.join("data/big.bin"), "ignored").expect("write data");
    Tree {
        _temp: temp,
        root,
        out,
    }
}

#[rstest]
fn identical_trees_hash_identically(tree: Tree) {
    let first = write_tarball(&tree.root, &FilterRules::default(), &tree.out).expect("tar");
    let second = write_tarball(&tree.root, &FilterRules::default(), &tree.out).expect("tar");

    assert_eq!(first.digest, second.digest);
    assert_eq!(first.object_name(), format!("{}.tar.gz", first.digest));
}

#[rstest]
fn changing_one_byte_changes_digest(tree: Tree) {
    let before = write_tarball(&tree.root, &FilterRules::default(), &tree.out).expect("tar");
    fs::write(tree.root.join("pkg/module.py"), "VALUE = 2\n").expect("rewrite");
    let after = write_tarball(&tree.root, &FilterRules::default(), &tree.out).expect("tar");

    assert_ne!(before.digest, after.digest);
}

#[rstest]
fn filtered_entries_do_not_affect_digest(tree: Tree) {
    let before = write_tarball(&tree.root, &FilterRules::default(), &tree.out).expect("tar");
    fs::write(tree.root.join("pkg/other.pyc"), "more bytecode").expect("write pyc");
    fs::write(tree.root.join("data/extra.bin"), "more data").expect("write data");
    let after = write_tarball(&tree.root, &FilterRules::default(), &tree.out).expect("tar");

    assert_eq!(before.digest, after.digest);
}

#[rstest]
fn tarball_excludes_filtered_entries(tree: Tree) {
    let bytes = pack_directory(&tree.root, &FilterRules::default()).expect("pack");
    let decoder = flate2::read::GzDecoder::new(bytes.as_slice());
    let mut archive = tar::Archive::new(decoder);
    let names: Vec<String> = archive
        .entries()
        .expect("entries")
        .map(|entry| {
            entry
                .expect("entry")
                .path()
                .expect("path")
                .to_string_lossy()
                .into_owned()
        })
        .collect();

    assert!(names.iter().any(|name| name == "pkg/module.py"), "{names:?}");
    assert!(!names.iter().any(|name| name.ends_with(".pyc")), "{names:?}");
    assert!(!names.iter().any(|name| name.starts_with("data")), "{names:?}");
}

#[rstest]
fn second_upload_of_same_content_transfers_nothing(tree: Tree) {
    let store = MemoryStore::new(StoreKind::S3);
    let location = StoreLocation::s3("bucket");
    let tarball = write_tarball(&tree.root, &FilterRules::default(), &tree.out).expect("tar");
    let uri = location.mount_uri(&tarball.object_name());

    let first = upload_if_absent(&store, &tarball.path, &uri).expect("upload");
    let second = upload_if_absent(&store, &tarball.path, &uri).expect("upload");

    assert_eq!(first, UploadOutcome::Uploaded);
    assert_eq!(second, UploadOutcome::AlreadyPresent);
    assert_eq!(store.uploads(), vec![uri]);
}

#[rstest]
#[case(StoreLocation::s3("logs"), "exp/run", "s3://logs/exp/run")]
#[case(StoreLocation::gcs("logs"), "/exp/run", "gs://logs/exp/run")]
#[case(StoreLocation::s3("logs"), "", "s3://logs")]
fn uri_joins_bucket_and_path(
    #[case] location: StoreLocation,
    #[case] path: &str,
    #[case] expected: &str,
) {
    assert_eq!(location.uri(path), expected);
}

#[test]
fn mount_uri_uses_shared_prefix() {
    assert_eq!(
        StoreLocation::s3("b").mount_uri("abc.tar.gz"),
        "s3://b/satchel/mount/abc.tar.gz"
    );
}

#[rstest]
#[case(StoreKind::S3, "aws s3 sync --quiet /satchel 's3://b/logs'")]
#[case(StoreKind::Gcs, "gsutil -m -q rsync -r /satchel 'gs://b/logs'")]
fn sync_command_matches_provider(#[case] kind: StoreKind, #[case] expected: &str) {
    let dest = format!("{}://b/logs", kind.scheme());
    assert_eq!(kind.sync_command("/satchel", &dest), expected);
}

#[test]
fn s3_exists_maps_ls_exit_codes() {
    let runner = ScriptedRunner::new();
    runner.push_output(Some(0), "2024-01-01 12:00 10 abc.tar.gz\n", "");
    runner.push_exit_code(1);
    runner.push_failure(255);
    let store = S3Store::new(runner.clone(), Some(String::from("us-west-1")));

    assert!(store.exists("s3://b/k").expect("present"));
    assert!(!store.exists("s3://b/k").expect("absent"));
    assert!(store.exists("s3://b/k").is_err());

    let first = runner.invocations().into_iter().next().expect("invocation");
    assert_eq!(first.command_string(), "aws s3 ls s3://b/k --region us-west-1");
}

#[test]
fn gcs_upload_uses_gsutil_cp() {
    let runner = ScriptedRunner::new();
    runner.push_success();
    let store = GcsStore::new(runner.clone());

    store
        .upload(Utf8Path::new("/tmp/file.sh"), "gs://b/satchel/mount/file.sh")
        .expect("upload");

    let invocations = runner.invocations();
    assert_eq!(
        invocations.first().map(crate::test_support::CommandInvocation::command_string),
        Some(String::from("gsutil -q cp /tmp/file.sh gs://b/satchel/mount/file.sh"))
    );
}
