//! Property tests for store invariants.

use std::collections::BTreeMap;

use proptest::prelude::*;
use tempfile::TempDir;
use wasmstore::{Hash, ModulePath, Store, StoreConfig};

fn test_store(dir: &TempDir) -> Store {
    Store::create(StoreConfig {
        path: dir.path().join("store"),
        blob_cache_size: 16,
        ..Default::default()
    })
    .unwrap()
}

fn segment() -> impl Strategy<Value = String> {
    "[a-z0-9_][a-z0-9_.-]{0,7}"
}

fn module_path() -> impl Strategy<Value = ModulePath> {
    prop::collection::vec(segment(), 1..4).prop_map(|segments| ModulePath::new(segments).unwrap())
}

fn bytes() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..128)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn add_hash_is_content_digest(content in bytes(), a in module_path(), b in module_path()) {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);

        let first = store.add("main", &a, &content).unwrap();
        let second = store.add("main", &b, &content).unwrap();

        prop_assert_eq!(first, Hash::from_bytes(&content));
        prop_assert_eq!(first, second);
        prop_assert_eq!(store.stats().unwrap().module_count, 1);
    }

    #[test]
    fn snapshot_then_find_returns_content(entries in prop::collection::btree_map(module_path(), bytes(), 1..6)) {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);

        let mut hashes = BTreeMap::new();
        for (path, content) in &entries {
            hashes.insert(path.clone(), store.add("main", path, content).unwrap());
        }
        store.snapshot("main").unwrap();

        for (path, hash) in &hashes {
            let (found, found_hash) = store.find("main", path).unwrap().unwrap();
            prop_assert_eq!(found_hash, *hash);
            prop_assert_eq!(found, store.find_by_hash(hash).unwrap().unwrap());
        }
    }

    #[test]
    fn versions_head_is_current_hash(
        values in prop::collection::vec(bytes(), 1..8),
        stage_last in any::<bool>(),
    ) {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);
        let path = ModulePath::parse("mod/a").unwrap();

        for (i, value) in values.iter().enumerate() {
            store.add("main", &path, value).unwrap();
            if !(stage_last && i + 1 == values.len()) {
                store.snapshot("main").unwrap();
            }
        }

        let versions = store.versions("main", &path).unwrap();
        prop_assert_eq!(Some(versions[0].content), store.hash("main", &path).unwrap());

        // Distinct contents only.
        let mut seen = std::collections::HashSet::new();
        for version in &versions {
            prop_assert!(seen.insert(version.content));
        }

        // Only the head may be uncommitted.
        prop_assert!(versions[1..].iter().all(|v| v.commit.is_some()));
    }

    #[test]
    fn merge_of_disjoint_paths_keeps_both(
        xs in prop::collection::btree_map(segment(), bytes(), 1..5),
        ys in prop::collection::btree_map(segment(), bytes(), 1..5),
    ) {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);
        store.snapshot("main").unwrap();
        store.create_branch("a", None).unwrap();
        store.create_branch("b", None).unwrap();

        for (name, content) in &xs {
            store.add("a", &ModulePath::new(["x", name.as_str()]).unwrap(), content).unwrap();
        }
        for (name, content) in &ys {
            store.add("b", &ModulePath::new(["y", name.as_str()]).unwrap(), content).unwrap();
        }

        store.merge("a", "b").unwrap();

        for (name, content) in &xs {
            let path = ModulePath::new(["x", name.as_str()]).unwrap();
            prop_assert_eq!(store.hash("b", &path).unwrap(), Some(Hash::from_bytes(content)));
        }
        for (name, content) in &ys {
            let path = ModulePath::new(["y", name.as_str()]).unwrap();
            prop_assert_eq!(store.hash("b", &path).unwrap(), Some(Hash::from_bytes(content)));
        }
    }

    #[test]
    fn gc_never_removes_reachable_content(
        ops in prop::collection::vec((0usize..3, module_path(), bytes(), any::<bool>()), 1..12)
    ) {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);
        let branches = ["main", "left", "right"];
        store.create_branch("left", None).unwrap();
        store.create_branch("right", None).unwrap();

        for (branch, path, content, snapshot) in &ops {
            let branch = branches[*branch];
            store.add(branch, path, content).unwrap();
            if *snapshot {
                store.snapshot(branch).unwrap();
            }
        }
        store.delete_branch("right").unwrap();
        store.gc().unwrap();

        let root = ModulePath::root();
        for branch in ["main", "left"] {
            for hash in store.list(branch, &root).unwrap().values() {
                prop_assert!(store.find_by_hash(hash).unwrap().is_some());
            }
            // Every historical tree stays readable.
            for commit in store.history(branch).unwrap() {
                store.restore(branch, &commit.hash, &root).unwrap();
                for hash in store.list(branch, &root).unwrap().values() {
                    prop_assert!(store.find_by_hash(hash).unwrap().is_some());
                }
            }
        }
    }
}
