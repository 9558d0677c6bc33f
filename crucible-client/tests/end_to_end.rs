// SPDX-FileCopyrightText: 2026 Jörg Thalheim
// SPDX-License-Identifier: MIT

//! Client ↔ daemon over a real socket: import sources and derivations,
//! realize builds, exercise the eval cache.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use bytes::Bytes;
use tempfile::TempDir;

use crucible_client::{DaemonClient, EvalCache, SourceImport};
use crucible_daemon::build_users::BuildUserPool;
use crucible_daemon::config::Config;
use crucible_daemon::scheduler::Scheduler;
use crucible_daemon::server::Server;
use crucible_daemon::store::LocalStore;
use crucible_protocol::BuildOutcome;
use crucible_store_core::content_address::ContentAddressMethodAlgorithm;
use crucible_store_core::derivation::{Derivation, DerivationOutput, OutputName};
use crucible_store_core::placeholder::Placeholder;
use crucible_store_core::store_path::StoreDir;
use crucible_utils_hash::Algorithm;

struct Harness {
    _root: TempDir,
    store_dir: StoreDir,
    socket: PathBuf,
    _server: tokio::task::JoinHandle<()>,
}

async fn start_daemon() -> Harness {
    let root = TempDir::new().unwrap();
    let store_path = root.path().join("store");
    let store_dir = StoreDir::new(store_path.to_str().unwrap()).unwrap();
    let store = LocalStore::open_ephemeral(store_dir.clone()).unwrap();

    let build_dir = root.path().join("builds");
    std::fs::create_dir_all(&build_dir).unwrap();
    let config = Config {
        store_dir: store_path,
        build_dir,
        log_dir: None,
        max_jobs: 2,
        ..Config::default()
    };

    let socket = root.path().join("daemon.sock");
    let scheduler = Scheduler::new(store.clone(), config, BuildUserPool::disabled());
    let server = Server::new(store, scheduler);
    let server_socket = socket.clone();
    let server = tokio::spawn(async move {
        let _ = server.run(&server_socket).await;
    });

    // Wait for the socket to appear.
    for _ in 0..100 {
        if socket.exists() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }

    Harness {
        _root: root,
        store_dir,
        socket,
        _server: server,
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn import_then_exists() {
    let harness = start_daemon().await;
    let mut client = DaemonClient::connect(&harness.socket).await.unwrap();

    let src = harness._root.path().join("src");
    std::fs::create_dir(&src).unwrap();
    std::fs::write(src.join("data"), b"bytes").unwrap();

    let path = crucible_client::import_source(
        &mut client,
        &harness.store_dir,
        &src,
        SourceImport::new("my-src".parse().unwrap()),
    )
    .await
    .unwrap();

    let rendered = harness.store_dir.display(&path).to_string();
    assert!(client.exists(&rendered).await.unwrap());
    assert!(
        !client
            .exists(
                &harness
                    .store_dir
                    .display(&"00000000000000000000000000000000-nope".parse().unwrap())
                    .to_string()
            )
            .await
            .unwrap()
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn import_is_deterministic_across_connections() {
    let harness = start_daemon().await;

    let src = harness._root.path().join("tree");
    std::fs::create_dir(&src).unwrap();
    std::fs::write(src.join("file"), b"same bytes").unwrap();

    let mut first_client = DaemonClient::connect(&harness.socket).await.unwrap();
    let first = crucible_client::import_source(
        &mut first_client,
        &harness.store_dir,
        &src,
        SourceImport::new("tree".parse().unwrap()),
    )
    .await
    .unwrap();

    let mut second_client = DaemonClient::connect(&harness.socket).await.unwrap();
    let second = crucible_client::import_source(
        &mut second_client,
        &harness.store_dir,
        &src,
        SourceImport::new("tree".parse().unwrap()),
    )
    .await
    .unwrap();

    assert_eq!(first, second);
}

#[tokio::test(flavor = "multi_thread")]
async fn text_import_and_realize() {
    let harness = start_daemon().await;
    let mut client = DaemonClient::connect(&harness.socket).await.unwrap();
    let store_dir = &harness.store_dir;

    // toFile-style text object.
    let text_path = crucible_client::import_bytes(
        &mut client,
        store_dir,
        &"greeting.txt".parse().unwrap(),
        Bytes::from_static(b"Hello, World!\n"),
        &BTreeSet::new(),
    )
    .await
    .unwrap();
    assert!(
        client
            .exists(&store_dir.display(&text_path).to_string())
            .await
            .unwrap()
    );

    // A derivation that reads the text object.
    let out = OutputName::default();
    let greeting_path_str = store_dir.display(&text_path).to_string();
    let drv = Derivation {
        name: "shout".parse().unwrap(),
        system: "x86_64-linux".into(),
        builder: "/bin/sh".into(),
        args: vec![
            "-c".into(),
            "tr 'a-z' 'A-Z' < \"$greeting\" > \"$out\"".into(),
        ],
        env: BTreeMap::from([
            ("PATH".into(), "/usr/bin:/bin".into()),
            ("out".into(), Placeholder::output(&out).render()),
            ("greeting".into(), greeting_path_str),
        ]),
        input_sources: BTreeSet::from([text_path]),
        input_derivations: BTreeMap::new(),
        outputs: BTreeMap::from([(
            out,
            DerivationOutput::CAFloating(ContentAddressMethodAlgorithm::Recursive(
                Algorithm::SHA256,
            )),
        )]),
    };

    let drv_path = crucible_client::import_derivation(&mut client, store_dir, &drv)
        .await
        .unwrap();
    let outcome = client
        .realize_and_wait(&store_dir.display(&drv_path).to_string())
        .await
        .unwrap();

    let BuildOutcome::Built { outputs } = outcome else {
        panic!("expected Built, got {outcome:?}");
    };
    let built = &outputs["out"];
    let disk = PathBuf::from(built);
    assert_eq!(std::fs::read(&disk).unwrap(), b"HELLO, WORLD!\n");
}

#[tokio::test(flavor = "multi_thread")]
async fn eval_cache_skips_reimport() {
    let harness = start_daemon().await;
    let mut client = DaemonClient::connect(&harness.socket).await.unwrap();
    let mut cache = EvalCache::open_memory().unwrap();

    let src = harness._root.path().join("cached-src");
    std::fs::create_dir(&src).unwrap();
    std::fs::write(src.join("file"), b"v1").unwrap();

    let first = crucible_client::import_source_cached(
        &mut client,
        &mut cache,
        &harness.store_dir,
        &src,
        SourceImport::new("cached-src".parse().unwrap()),
    )
    .await
    .unwrap();

    // Unchanged tree: same path, served from the cache.
    let second = crucible_client::import_source_cached(
        &mut client,
        &mut cache,
        &harness.store_dir,
        &src,
        SourceImport::new("cached-src".parse().unwrap()),
    )
    .await
    .unwrap();
    assert_eq!(first, second);

    // Changed tree: a new path.
    std::fs::write(src.join("file"), b"v2-with-longer-content").unwrap();
    let third = crucible_client::import_source_cached(
        &mut client,
        &mut cache,
        &harness.store_dir,
        &src,
        SourceImport::new("cached-src".parse().unwrap()),
    )
    .await
    .unwrap();
    assert_ne!(first, third);
}
