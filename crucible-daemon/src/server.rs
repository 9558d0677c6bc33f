// SPDX-FileCopyrightText: 2026 Jörg Thalheim
// SPDX-License-Identifier: MIT

//! The daemon's socket front end.
//!
//! One task per connection; requests on a connection are handled in order
//! (the client blocks on each call). An `Import` request is special: its
//! body — the export stream — follows the JSON record on the same
//! connection. Build handles issued to a connection are released when it
//! closes, which cancels builds nobody else is waiting on.

use std::path::Path;

use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, warn};

use crucible_protocol::framing;
use crucible_protocol::{
    BuildHandle, ExistsResult, ImportResult, Request, RequestBody, Response,
};

use crate::error::{DaemonError, DaemonResult, IoContext as _};
use crate::import;
use crate::scheduler::Scheduler;
use crate::store::LocalStore;

pub struct Server {
    store: LocalStore,
    scheduler: Scheduler,
}

impl Server {
    pub fn new(store: LocalStore, scheduler: Scheduler) -> Self {
        Server { store, scheduler }
    }

    /// Bind the socket and serve until the future is dropped.
    pub async fn run(self, socket_path: &Path) -> DaemonResult<()> {
        // A previous daemon may have left its socket behind.
        if socket_path.exists() {
            std::fs::remove_file(socket_path)
                .io_context(|| format!("removing stale socket {}", socket_path.display()))?;
        }
        let listener = UnixListener::bind(socket_path)
            .io_context(|| format!("binding socket {}", socket_path.display()))?;
        info!(socket = %socket_path.display(), "listening");

        loop {
            let (stream, _addr) = listener
                .accept()
                .await
                .io_context(|| "accepting connection".to_string())?;
            let store = self.store.clone();
            let scheduler = self.scheduler.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, store, scheduler).await {
                    debug!("connection ended with error: {e}");
                }
            });
        }
    }
}

async fn handle_connection(
    stream: UnixStream,
    store: LocalStore,
    scheduler: Scheduler,
) -> DaemonResult<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut issued_handles: Vec<u64> = Vec::new();

    let result = serve_requests(
        &mut reader,
        &mut write_half,
        &store,
        &scheduler,
        &mut issued_handles,
    )
    .await;

    // Whatever happened, the connection's handles go away with it.
    scheduler.release_handles(&issued_handles);
    result
}

async fn serve_requests<R, W>(
    reader: &mut R,
    writer: &mut W,
    store: &LocalStore,
    scheduler: &Scheduler,
    issued_handles: &mut Vec<u64>,
) -> DaemonResult<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let request: Request = match framing::read_record(reader).await {
            Ok(Some(request)) => request,
            Ok(None) => return Ok(()),
            Err(e) => {
                warn!("malformed request: {e}");
                return Err(DaemonError::io(
                    "reading request",
                    std::io::Error::other(e),
                ));
            }
        };

        debug!(id = request.id, method = request.body.method(), "request");
        let is_import = matches!(request.body, RequestBody::Import {});
        let response = dispatch(request, reader, store, scheduler, issued_handles).await;
        let failed = response.error.is_some();
        framing::write_record(writer, &response)
            .await
            .map_err(|e| DaemonError::io("writing response", std::io::Error::other(e)))?;

        // A failed import leaves the connection mid-stream; there is no
        // way to resynchronize, so close it.
        if is_import && failed {
            return Ok(());
        }
    }
}

async fn dispatch<R>(
    request: Request,
    reader: &mut R,
    store: &LocalStore,
    scheduler: &Scheduler,
    issued_handles: &mut Vec<u64>,
) -> Response
where
    R: AsyncRead + Unpin,
{
    let id = request.id;
    match request.body {
        RequestBody::Exists { path } => match exists(store, &path).await {
            Ok(exists) => Response::ok(id, &ExistsResult { exists }),
            Err(e) => Response::err(id, e.to_error_body()),
        },
        RequestBody::Import {} => match import::handle_import(store, reader).await {
            Ok(paths) => Response::ok(id, &ImportResult { paths }),
            Err(e) => Response::err(id, e.to_error_body()),
        },
        RequestBody::Realize { drv_path } => match realize(store, scheduler, &drv_path).await {
            Ok(build_id) => {
                issued_handles.push(build_id);
                Response::ok(id, &BuildHandle { build_id })
            }
            Err(e) => Response::err(id, e.to_error_body()),
        },
        RequestBody::Expand { drv_path, temp_dir } => {
            match expand(store, scheduler, &drv_path, &temp_dir).await {
                Ok(build_id) => {
                    issued_handles.push(build_id);
                    Response::ok(id, &BuildHandle { build_id })
                }
                Err(e) => Response::err(id, e.to_error_body()),
            }
        }
        RequestBody::Wait { build_id } => match scheduler.wait(build_id).await {
            Ok(outcome) => Response::ok(id, &outcome),
            Err(body) => Response::err(id, body),
        },
    }
}

async fn exists(store: &LocalStore, path: &str) -> DaemonResult<bool> {
    let parsed = store.parse_path(path)?;
    store.exists(&parsed).await
}

async fn realize(store: &LocalStore, scheduler: &Scheduler, drv_path: &str) -> DaemonResult<u64> {
    let parsed = store.parse_path(drv_path)?;
    scheduler.realize(&parsed).await
}

async fn expand(
    store: &LocalStore,
    scheduler: &Scheduler,
    drv_path: &str,
    temp_dir: &str,
) -> DaemonResult<u64> {
    let parsed = store.parse_path(drv_path)?;
    if !Path::new(temp_dir).is_absolute() {
        return Err(DaemonError::InvalidPath(format!(
            "expand temp dir '{temp_dir}' is not absolute"
        )));
    }
    scheduler.expand(&parsed, temp_dir.into()).await
}

#[cfg(test)]
mod unittests {
    use super::*;
    use crate::tests::test_store::TestStore;
    use crucible_protocol::ErrorKind;

    async fn dispatch_one(ts: &TestStore, body: RequestBody) -> Response {
        let scheduler = ts.scheduler();
        let mut empty: &[u8] = &[];
        let mut handles = Vec::new();
        dispatch(
            Request { id: 9, body },
            &mut empty,
            &ts.store,
            &scheduler,
            &mut handles,
        )
        .await
    }

    #[tokio::test]
    async fn exists_on_absent_path() {
        let ts = TestStore::new();
        let path = ts
            .store
            .store_dir()
            .display(&"00000000000000000000000000000000-x".parse().unwrap())
            .to_string();
        let response = dispatch_one(&ts, RequestBody::Exists { path }).await;
        assert_eq!(response.id, 9);
        let result: ExistsResult = serde_json::from_value(response.result.unwrap()).unwrap();
        assert!(!result.exists);
    }

    #[tokio::test]
    async fn malformed_path_maps_to_invalid_path() {
        let ts = TestStore::new();
        let response = dispatch_one(
            &ts,
            RequestBody::Exists {
                path: "/not/in/the/store".into(),
            },
        )
        .await;
        assert_eq!(response.error.unwrap().kind, ErrorKind::InvalidPath);
    }

    #[tokio::test]
    async fn wait_on_unknown_handle() {
        let ts = TestStore::new();
        let response = dispatch_one(&ts, RequestBody::Wait { build_id: 404 }).await;
        assert_eq!(response.error.unwrap().kind, ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn realize_of_non_derivation_rejected() {
        let ts = TestStore::new();
        let drv_path = ts
            .store
            .store_dir()
            .display(&"00000000000000000000000000000000-not-a-drv".parse().unwrap())
            .to_string();
        let response = dispatch_one(&ts, RequestBody::Realize { drv_path }).await;
        assert_eq!(response.error.unwrap().kind, ErrorKind::InvalidPath);
    }
}
