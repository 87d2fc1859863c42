use ctp_core::manifest::{Manifest, MANIFEST_FILENAME};
use ctp_store::{ManifestStore, StoreError};
use tempfile::tempdir;

#[test]
fn merge_persists_and_reports_new_names() {
    let dir = tempdir().unwrap();
    let store = ManifestStore::open(dir.path()).unwrap();
    assert!(store.load().unwrap().is_empty());
    assert_eq!(store.current_digest().unwrap(), None);

    let remote = Manifest::from_names(["a.txt", "b.txt"]).unwrap();
    let added = store.merge(&remote, 100).unwrap();
    assert_eq!(added, vec!["a.txt", "b.txt"]);

    let local = store.load().unwrap();
    assert_eq!(local.names(), ["a.txt", "b.txt"]);
    assert_eq!(store.current_digest().unwrap(), Some(local.digest()));
}

#[test]
fn merge_is_idempotent_and_append_only() {
    let dir = tempdir().unwrap();
    let store = ManifestStore::open(dir.path()).unwrap();
    let remote = Manifest::from_names(["a.txt", "b.txt"]).unwrap();

    store.merge(&remote, 100).unwrap();
    assert!(store.merge(&remote, 200).unwrap().is_empty());

    // a second merge never removes existing entries
    let shorter = Manifest::from_names(["b.txt"]).unwrap();
    assert!(store.merge(&shorter, 300).unwrap().is_empty());
    assert_eq!(store.load().unwrap().names(), ["a.txt", "b.txt"]);
}

#[test]
fn descriptor_regenerated_after_merge() {
    let dir = tempdir().unwrap();
    let store = ManifestStore::open(dir.path()).unwrap();
    assert!(matches!(
        store.manifest_info(),
        Err(StoreError::NotFound(_))
    ));

    store
        .merge(&Manifest::from_names(["a.txt"]).unwrap(), 100)
        .unwrap();
    let info1 = store.manifest_info().unwrap();
    assert_eq!(info1.filename, MANIFEST_FILENAME);
    assert_eq!(info1.created_at, 100);
    assert_eq!(
        info1.content_hash,
        store.current_digest().unwrap().unwrap()
    );

    store
        .merge(&Manifest::from_names(["a.txt", "b.txt"]).unwrap(), 200)
        .unwrap();
    let info2 = store.manifest_info().unwrap();
    assert_ne!(info1.content_hash, info2.content_hash);
    assert_eq!(
        store.manifest_bytes().unwrap(),
        Manifest::from_names(["a.txt", "b.txt"]).unwrap().encode()
    );
}

#[test]
fn survives_reopen() {
    let dir = tempdir().unwrap();
    {
        let store = ManifestStore::open(dir.path()).unwrap();
        store
            .merge(&Manifest::from_names(["a.txt"]).unwrap(), 1)
            .unwrap();
    }
    let store = ManifestStore::open(dir.path()).unwrap();
    assert_eq!(store.load().unwrap().names(), ["a.txt"]);
}
