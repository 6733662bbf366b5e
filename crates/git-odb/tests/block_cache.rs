//! Verifies the opt-in block cache (C8) wired into packed-object reads.

use std::process::Command;
use std::sync::Arc;

use git_hash::ObjectId;
use git_object::Object;
use git_odb::ObjectDatabase;
use git_pack::block_cache::{BlockCache, PackExt};

/// Create a temporary bare git repository and return (tempdir, objects_dir).
fn setup_git_repo() -> (tempfile::TempDir, std::path::PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let status = Command::new("git")
        .args(["init", "--bare"])
        .current_dir(dir.path())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .unwrap();
    assert!(status.success(), "git init failed");
    let objects_dir = dir.path().join("objects");
    (dir, objects_dir)
}

/// Use C git to write a blob and return the hex OID.
fn git_hash_object(repo_dir: &std::path::Path, content: &[u8]) -> String {
    let mut child = Command::new("git")
        .args(["hash-object", "-w", "--stdin"])
        .current_dir(repo_dir)
        .env("GIT_DIR", repo_dir)
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .spawn()
        .unwrap();

    use std::io::Write;
    child.stdin.take().unwrap().write_all(content).unwrap();
    let output = child.wait_with_output().unwrap();
    assert!(output.status.success(), "git hash-object failed");
    String::from_utf8(output.stdout).unwrap().trim().to_string()
}

/// Use C git to repack all objects.
fn git_repack(repo_dir: &std::path::Path) {
    let status = Command::new("git")
        .args(["repack", "-a", "-d"])
        .current_dir(repo_dir)
        .env("GIT_DIR", repo_dir)
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .unwrap();
    assert!(status.success(), "git repack failed");
}

#[test]
fn disabled_by_default() {
    let (_dir, objects_dir) = setup_git_repo();
    let odb = ObjectDatabase::open(&objects_dir).unwrap();
    assert!(odb.block_cache().is_none());
}

#[test]
fn repeated_reads_of_packed_object_hit_cache() {
    let (dir, objects_dir) = setup_git_repo();

    let content = b"cached read test\n";
    let oid_hex = git_hash_object(dir.path(), content);
    let oid = ObjectId::from_hex(&oid_hex).unwrap();

    git_repack(dir.path());

    let mut odb = ObjectDatabase::open(&objects_dir).unwrap();
    let cache = Arc::new(BlockCache::new(1024 * 1024, 4));
    odb.set_block_cache(cache.clone());

    for _ in 0..5 {
        let obj = odb.read(&oid).unwrap().expect("object should exist");
        match obj {
            Object::Blob(blob) => assert_eq!(blob.data, content),
            other => panic!("expected blob, got {:?}", other.object_type()),
        }
    }

    let stats = cache.stats();
    let pack_stats = stats.get(&PackExt::Pack).expect("pack-ext stats recorded");
    assert_eq!(pack_stats.miss_count, 1, "first read should miss");
    assert_eq!(pack_stats.hit_count, 4, "remaining reads should hit");
}

#[test]
fn cached_and_uncached_reads_agree() {
    let (dir, objects_dir) = setup_git_repo();

    let mut oids = Vec::new();
    let mut contents = Vec::new();
    for i in 0..10 {
        let content = format!("block cache parity object {}\n", i);
        let oid_hex = git_hash_object(dir.path(), content.as_bytes());
        oids.push(ObjectId::from_hex(&oid_hex).unwrap());
        contents.push(content.into_bytes());
    }
    git_repack(dir.path());

    let plain_odb = ObjectDatabase::open(&objects_dir).unwrap();
    let mut cached_odb = ObjectDatabase::open(&objects_dir).unwrap();
    cached_odb.set_block_cache(Arc::new(BlockCache::new(1024 * 1024, 4)));

    for (oid, expected) in oids.iter().zip(contents.iter()) {
        let plain = plain_odb.read(oid).unwrap().unwrap();
        let cached = cached_odb.read(oid).unwrap().unwrap();
        assert_eq!(plain, cached);
        match cached {
            Object::Blob(blob) => assert_eq!(&blob.data, expected),
            other => panic!("expected blob, got {:?}", other.object_type()),
        }
    }
}
