// SPDX-FileCopyrightText: 2026 Jörg Thalheim
// SPDX-License-Identifier: MIT

use std::collections::BTreeSet;
use std::time::SystemTime;

use crucible_store_db::{BuildLogEntry, OpenMode, RegisterObjectParams, StoreDb};

fn object(path: &str, references: BTreeSet<String>) -> RegisterObjectParams {
    RegisterObjectParams {
        path: path.to_string(),
        ca: "fixed:r:sha256:1b8m03r63zqhnjf7l5wnldhh7c134ap5vpj0850ymkq1iyzicy5s".into(),
        nar_hash: "sha256:1b8m03r63zqhnjf7l5wnldhh7c134ap5vpj0850ymkq1iyzicy5s".into(),
        nar_size: 120,
        references,
    }
}

const DEP: &str = "/nix/store/00000000000000000000000000000000-dep";
const TOP: &str = "/nix/store/11111111111111111111111111111111-top";
const DRV: &str = "/nix/store/22222222222222222222222222222222-top.drv";

#[test]
fn register_and_query() {
    let mut db = StoreDb::open_memory().unwrap();

    assert!(!db.is_valid_path(DEP).unwrap());
    db.register_object(&object(DEP, BTreeSet::new())).unwrap();
    assert!(db.is_valid_path(DEP).unwrap());

    db.register_object(&object(TOP, BTreeSet::from([DEP.to_string()])))
        .unwrap();
    assert_eq!(db.references_of(TOP).unwrap(), BTreeSet::from([DEP.to_string()]));

    let info = db.query_object(TOP).unwrap().unwrap();
    assert_eq!(info.nar_size, 120);
    assert!(info.ca.starts_with("fixed:r:sha256:"));
}

#[test]
fn duplicate_registration_fails() {
    let mut db = StoreDb::open_memory().unwrap();
    db.register_object(&object(DEP, BTreeSet::new())).unwrap();
    assert!(db.register_object(&object(DEP, BTreeSet::new())).is_err());
}

#[test]
fn self_reference_registers() {
    let mut db = StoreDb::open_memory().unwrap();
    db.register_object(&object(TOP, BTreeSet::from([TOP.to_string()])))
        .unwrap();
    assert_eq!(db.references_of(TOP).unwrap(), BTreeSet::from([TOP.to_string()]));
}

#[test]
fn dangling_reference_rejected() {
    let mut db = StoreDb::open_memory().unwrap();
    assert!(
        db.register_object(&object(TOP, BTreeSet::from([DEP.to_string()])))
            .is_err(),
        "references must point at registered objects"
    );
}

#[test]
fn realizations_roundtrip() {
    let mut db = StoreDb::open_memory().unwrap();
    db.register_object(&object(TOP, BTreeSet::new())).unwrap();
    db.record_realization(DRV, "out", TOP).unwrap();

    assert_eq!(
        db.query_realization(DRV, "out").unwrap(),
        Some(TOP.to_string())
    );
    assert_eq!(db.query_realization(DRV, "dev").unwrap(), None);

    let all = db.realizations_for(DRV).unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].store_path, TOP);
}

#[test]
fn invalidation_cascades_to_realizations() {
    let mut db = StoreDb::open_memory().unwrap();
    db.register_object(&object(TOP, BTreeSet::new())).unwrap();
    db.record_realization(DRV, "out", TOP).unwrap();

    assert!(db.invalidate_path(TOP).unwrap());
    assert!(!db.is_valid_path(TOP).unwrap());
    assert_eq!(db.query_realization(DRV, "out").unwrap(), None);
}

#[test]
fn build_log_rows_append() {
    let mut db = StoreDb::open_memory().unwrap();
    db.record_build_log(&BuildLogEntry {
        drv_path: DRV.into(),
        started_at: SystemTime::now(),
        ended_at: SystemTime::now(),
        status: "failed".into(),
        log_blob_ref: Some("/nix/var/crucible/log/abc.log".into()),
    })
    .unwrap();
}

#[test]
fn migrations_apply_in_order_and_persist() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("db.sqlite");

    let db = StoreDb::open(&path, OpenMode::Create).unwrap();
    let version = db.schema_version().unwrap();
    assert!(version >= 2);
    drop(db);

    // Re-opening an up-to-date database is a no-op.
    let db = StoreDb::open(&path, OpenMode::ReadWrite).unwrap();
    assert_eq!(db.schema_version().unwrap(), version);
}
