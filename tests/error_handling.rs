//! Error handling and edge case tests.

use std::fs::OpenOptions;
use std::io::Write;

use tempfile::TempDir;
use wasmstore::{ErrorKind, Hash, ModulePath, Store, StoreConfig, StoreError};

fn test_config(dir: &TempDir) -> StoreConfig {
    StoreConfig {
        path: dir.path().join("store"),
        blob_cache_size: 100,
        ..Default::default()
    }
}

fn test_store(dir: &TempDir) -> Store {
    Store::create(test_config(dir)).unwrap()
}

// --- Not Found ---

#[test]
fn test_missing_things_are_not_found() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);
    let unknown = Hash::from_bytes(b"unknown");

    let errors = [
        store.snapshot("ghost").unwrap_err(),
        store.restore("main", &unknown, &ModulePath::root()).unwrap_err(),
        store.commit_info(&unknown).unwrap_err(),
        store.delete_branch("ghost").unwrap_err(),
        store.merge("ghost", "main").unwrap_err(),
        store.rollback("main", &ModulePath::root()).unwrap_err(),
    ];

    for err in errors {
        assert_eq!(err.kind(), ErrorKind::NotFound, "{err}");
        assert_eq!(err.status_code(), 404);
    }
}

#[test]
fn test_find_missing_path_is_none() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);

    // Absence is a value, not an error.
    assert!(store.find("main", &ModulePath::parse("nope").unwrap()).unwrap().is_none());
    assert!(store.hash("main", &ModulePath::parse("nope").unwrap()).unwrap().is_none());
}

// --- Conflict ---

#[test]
fn test_protected_and_duplicate_branches_conflict() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);

    let err = store.delete_branch("main").unwrap_err();
    assert!(matches!(err, StoreError::ProtectedBranch(_)));
    assert_eq!(err.status_code(), 409);

    store.create_branch("feature", None).unwrap();
    let err = store.create_branch("feature", None).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
}

#[test]
fn test_custom_default_branch_is_protected() {
    let dir = TempDir::new().unwrap();
    let store = Store::create(StoreConfig {
        default_branch: "trunk".to_string(),
        ..test_config(&dir)
    })
    .unwrap();

    assert_eq!(store.branch_names(), vec!["trunk"]);
    assert!(matches!(
        store.delete_branch("trunk"),
        Err(StoreError::ProtectedBranch(_))
    ));
}

// --- Malformed ---

#[test]
fn test_malformed_inputs() {
    for bad in ["a//b", "a/../b", "./a"] {
        let err = ModulePath::parse(bad).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Malformed, "{bad}");
    }

    let err = "xyz".parse::<Hash>().unwrap_err();
    assert_eq!(err.status_code(), 400);

    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);
    for bad in ["", "has space", "slash/name"] {
        let err = store.create_branch(bad, None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Malformed, "{bad:?}");
    }
}

#[test]
fn test_operations_on_deleted_branch_handle_fail() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);

    store.create_branch("temp", None).unwrap();
    store.add("temp", &ModulePath::parse("a").unwrap(), b"a").unwrap();
    store.delete_branch("temp").unwrap();

    assert!(matches!(
        store.add("temp", &ModulePath::parse("b").unwrap(), b"b"),
        Err(StoreError::BranchNotFound(_))
    ));
}

// --- Internal / Corruption ---

#[test]
fn test_corrupt_manifest() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    {
        test_store(&dir);
    }

    std::fs::write(config.path.join("MANIFEST"), b"JUNK\x01").unwrap();
    let err = Store::open(config).unwrap_err();
    assert!(matches!(err, StoreError::InvalidFormat(_)));
    assert_eq!(err.kind(), ErrorKind::Internal);
}

#[test]
fn test_corrupt_module_detected_on_read() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);

    let hash = {
        let store = test_store(&dir);
        store
            .add("main", &ModulePath::parse("a").unwrap(), b"pristine module bytes")
            .unwrap()
    };

    // Flip a byte in the stored content file.
    let file = walk(&config.path.join("objects"))
        .into_iter()
        .find(|f| f.file_name().map_or(false, |n| n.to_string_lossy() == hash.to_hex()))
        .expect("content file present");
    let mut bytes = std::fs::read(&file).unwrap();
    let mid = bytes.len() / 2;
    bytes[mid] ^= 0xFF;
    std::fs::write(&file, bytes).unwrap();

    // Reopen so the read misses the cache.
    let store = Store::open(config).unwrap();
    let err = store.find_by_hash(&hash).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Internal);
}

#[test]
fn test_torn_wal_tail_is_ignored() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    {
        let store = test_store(&dir);
        store.add("main", &ModulePath::parse("kept").unwrap(), b"k").unwrap();
    }

    let mut wal = OpenOptions::new()
        .append(true)
        .open(config.path.join("staging.wal"))
        .unwrap();
    wal.write_all(&64u32.to_le_bytes()).unwrap();
    wal.write_all(b"half an entry").unwrap();
    drop(wal);

    {
        let store = Store::open(config.clone()).unwrap();
        assert!(store.contains("main", &ModulePath::parse("kept").unwrap()).unwrap());
        store.add("main", &ModulePath::parse("later").unwrap(), b"l").unwrap();
    }

    // Entries written after the torn tail are still replayed.
    let store = Store::open(config).unwrap();
    assert!(store.contains("main", &ModulePath::parse("kept").unwrap()).unwrap());
    assert!(store.contains("main", &ModulePath::parse("later").unwrap()).unwrap());
}

fn walk(dir: &std::path::Path) -> Vec<std::path::PathBuf> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir).unwrap() {
        let path = entry.unwrap().path();
        if path.is_dir() {
            files.extend(walk(&path));
        } else {
            files.push(path);
        }
    }
    files
}
