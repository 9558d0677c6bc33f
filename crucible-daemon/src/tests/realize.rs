// SPDX-FileCopyrightText: 2026 Jörg Thalheim
// SPDX-License-Identifier: MIT

use std::collections::{BTreeMap, BTreeSet};

use bytes::Bytes;

use crucible_archive::single_file_nar;
use crucible_protocol::BuildOutcome;
use crucible_protocol::export::{ExportTrailer, write_end, write_record};
use crucible_store_core::content_address::{ContentAddress, ContentAddressMethodAlgorithm};
use crucible_store_core::derivation::{Derivation, DerivationOutput, OutputName};
use crucible_store_core::placeholder::Placeholder;
use crucible_store_core::store_path::StorePath;
use crucible_utils_hash::Algorithm;

use crate::import::handle_import;
use crate::tests::test_store::TestStore;

/// Write a derivation into the store as a text object, the way the client
/// does, and return its store path.
async fn import_derivation(ts: &TestStore, drv: &Derivation) -> StorePath {
    let store_dir = ts.store.store_dir();
    let text = drv.to_aterm(store_dir);
    let drv_path = drv.store_path(store_dir).unwrap();

    let nar = single_file_nar(Bytes::from(text.into_bytes()), false);
    let references: Vec<String> = drv
        .input_references()
        .others
        .iter()
        .map(|r| store_dir.display(r).to_string())
        .collect();
    let trailer = ExportTrailer {
        path: store_dir.display(&drv_path).to_string(),
        references,
        deriver: None,
    };
    let mut stream = Vec::new();
    write_record(&mut stream, &nar, &trailer).await.unwrap();
    write_end(&mut stream).await.unwrap();
    handle_import(&ts.store, &mut &stream[..]).await.unwrap();
    drv_path
}

/// A floating-output derivation running a shell snippet.
fn shell_drv(name: &str, script: &str) -> Derivation {
    let out = OutputName::default();
    Derivation {
        name: name.parse().unwrap(),
        system: "x86_64-linux".into(),
        builder: "/bin/sh".into(),
        args: vec!["-c".into(), script.into()],
        env: BTreeMap::from([("out".into(), Placeholder::output(&out).render())]),
        input_sources: BTreeSet::new(),
        input_derivations: BTreeMap::new(),
        outputs: BTreeMap::from([(
            out,
            DerivationOutput::CAFloating(ContentAddressMethodAlgorithm::Recursive(
                Algorithm::SHA256,
            )),
        )]),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn realize_floating_output() {
    let ts = TestStore::new();
    let scheduler = ts.scheduler();

    let drv = shell_drv("hello", "printf 'Hello\\n' > \"$out\"");
    let drv_path = import_derivation(&ts, &drv).await;

    let build_id = scheduler.realize(&drv_path).await.unwrap();
    let outcome = scheduler.wait(build_id).await.unwrap();

    let BuildOutcome::Built { outputs } = outcome else {
        panic!("expected Built, got {outcome:?}");
    };
    let out = ts.store.parse_path(&outputs["out"]).unwrap();
    assert!(ts.store.exists(&out).await.unwrap());
    assert_eq!(
        std::fs::read(ts.store.object_path(&out)).unwrap(),
        b"Hello\n"
    );

    // The realized output is recorded for cache hits.
    let rendered_drv = ts.store.store_dir().display(&drv_path).to_string();
    let cached = ts
        .store
        .db()
        .lock()
        .await
        .query_realization(&rendered_drv, "out")
        .unwrap();
    assert_eq!(cached.as_deref(), Some(outputs["out"].as_str()));
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_realize_builds_once() {
    let ts = TestStore::new();
    let scheduler = ts.scheduler();

    // The builder appends to a side file; a deduped build appends once.
    let counter = ts.scratch("invocations");
    let drv = shell_drv(
        "dedup",
        &format!("echo run >> {}; printf 'done\\n' > \"$out\"", counter.display()),
    );
    let drv_path = import_derivation(&ts, &drv).await;

    let first = scheduler.realize(&drv_path).await.unwrap();
    let second = scheduler.realize(&drv_path).await.unwrap();
    assert_ne!(first, second, "each request gets its own handle");

    let (a, b) = tokio::join!(scheduler.wait(first), scheduler.wait(second));
    assert!(matches!(a.unwrap(), BuildOutcome::Built { .. }));
    assert!(matches!(b.unwrap(), BuildOutcome::Built { .. }));

    let runs = std::fs::read_to_string(&counter).unwrap();
    assert_eq!(runs.lines().count(), 1, "builder ran more than once");
}

#[tokio::test(flavor = "multi_thread")]
async fn realization_cache_short_circuits() {
    let ts = TestStore::new();
    let scheduler = ts.scheduler();

    let counter = ts.scratch("invocations");
    let drv = shell_drv(
        "cached",
        &format!("echo run >> {}; printf 'x\\n' > \"$out\"", counter.display()),
    );
    let drv_path = import_derivation(&ts, &drv).await;

    let first = scheduler.realize(&drv_path).await.unwrap();
    scheduler.wait(first).await.unwrap();
    let second = scheduler.realize(&drv_path).await.unwrap();
    scheduler.wait(second).await.unwrap();

    let runs = std::fs::read_to_string(&counter).unwrap();
    assert_eq!(runs.lines().count(), 1, "cache hit should skip the builder");
}

#[tokio::test(flavor = "multi_thread")]
async fn failing_builder_reports_exit_code() {
    let ts = TestStore::new();
    let scheduler = ts.scheduler();

    let drv = shell_drv("boom", "exit 3");
    let drv_path = import_derivation(&ts, &drv).await;

    let build_id = scheduler.realize(&drv_path).await.unwrap();
    let outcome = scheduler.wait(build_id).await.unwrap();
    assert!(
        matches!(outcome, BuildOutcome::Failed { exit: 3, .. }),
        "{outcome:?}"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn fixed_output_mismatch_is_rejected() {
    let ts = TestStore::new();
    let scheduler = ts.scheduler();

    // Declares the hash of "expected" but builds "surprise". The output
    // placeholder in the env resolves to the declared fixed path.
    let declared = ContentAddress::Flat(Algorithm::SHA256.digest("expected"));
    let mut drv = shell_drv("fixed", "printf 'surprise' > \"$out\"");
    drv.outputs = BTreeMap::from([(OutputName::default(), DerivationOutput::CAFixed(declared))]);
    let drv_path = import_derivation(&ts, &drv).await;

    let build_id = scheduler.realize(&drv_path).await.unwrap();
    let err = scheduler.wait(build_id).await.unwrap_err();
    assert_eq!(err.kind, crucible_protocol::ErrorKind::ContentMismatch);
}

#[tokio::test(flavor = "multi_thread")]
async fn realize_with_input_derivation() {
    let ts = TestStore::new();
    let scheduler = ts.scheduler();

    // dep writes a file; top copies it, referencing dep's output through
    // an upstream placeholder.
    let dep = shell_drv("dep", "printf 'payload\\n' > \"$out\"");
    let dep_path = import_derivation(&ts, &dep).await;

    let out = OutputName::default();
    let upstream = Placeholder::upstream_output(&dep_path, &out).render();
    let mut top = shell_drv("top", "cat \"$dep\" > \"$out\"");
    top.env.insert("PATH".into(), "/usr/bin:/bin".into());
    top.env.insert("dep".into(), upstream);
    top.input_derivations
        .insert(dep_path.clone(), BTreeSet::from([out.clone()]));
    let top_path = import_derivation(&ts, &top).await;

    let build_id = scheduler.realize(&top_path).await.unwrap();
    let outcome = scheduler.wait(build_id).await.unwrap();
    let BuildOutcome::Built { outputs } = outcome else {
        panic!("expected Built, got {outcome:?}");
    };
    let built = ts.store.parse_path(&outputs["out"]).unwrap();
    assert_eq!(
        std::fs::read(ts.store.object_path(&built)).unwrap(),
        b"payload\n"
    );

    // The dependency itself was realized along the way.
    let rendered_dep = ts.store.store_dir().display(&dep_path).to_string();
    assert!(
        ts.store
            .db()
            .lock()
            .await
            .query_realization(&rendered_dep, "out")
            .unwrap()
            .is_some()
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn self_referential_output_is_rewritten() {
    let ts = TestStore::new();
    let scheduler = ts.scheduler();

    // The output embeds its own path, which forces the temp-digest rewrite.
    let drv = shell_drv("selfref", "printf 'i live at %s\\n' \"$out\" > \"$out\"");
    let drv_path = import_derivation(&ts, &drv).await;

    let build_id = scheduler.realize(&drv_path).await.unwrap();
    let outcome = scheduler.wait(build_id).await.unwrap();
    let BuildOutcome::Built { outputs } = outcome else {
        panic!("expected Built, got {outcome:?}");
    };

    let final_rendered = &outputs["out"];
    let built = ts.store.parse_path(final_rendered).unwrap();
    let contents = std::fs::read_to_string(ts.store.object_path(&built)).unwrap();
    assert_eq!(contents, format!("i live at {final_rendered}\n"));

    // The self-reference is recorded.
    let refs = ts
        .store
        .db()
        .lock()
        .await
        .references_of(final_rendered)
        .unwrap();
    assert!(refs.contains(final_rendered.as_str()));
}

#[tokio::test(flavor = "multi_thread")]
async fn expand_returns_substituted_environment() {
    let ts = TestStore::new();
    let scheduler = ts.scheduler();

    let drv = shell_drv("expandme", "true");
    let drv_path = import_derivation(&ts, &drv).await;

    let temp_dir = ts.scratch("expand");
    std::fs::create_dir_all(&temp_dir).unwrap();

    let build_id = scheduler
        .expand(&drv_path, temp_dir.clone())
        .await
        .unwrap();
    let outcome = scheduler.wait(build_id).await.unwrap();
    let BuildOutcome::Expanded { builder, env, .. } = outcome else {
        panic!("expected Expanded, got {outcome:?}");
    };
    assert_eq!(builder, "/bin/sh");
    // The output placeholder resolves to a scratch path in temp_dir.
    assert_eq!(
        env.get("out").map(String::as_str),
        Some(temp_dir.join("out").to_str().unwrap())
    );
    assert_eq!(env.get("HOME").map(String::as_str), Some("/homeless-shelter"));
}
