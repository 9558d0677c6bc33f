// SPDX-FileCopyrightText: 2026 Jörg Thalheim
// SPDX-License-Identifier: MIT

//! The RPC connection to the daemon.
//!
//! Calls are sequential: each request is written, then its response read,
//! before the next call starts. `Import` additionally streams its body
//! between the request and the response.

use std::path::Path;

use thiserror::Error;
use tokio::io::{AsyncWriteExt as _, BufReader, BufWriter};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tracing::debug;

use crucible_protocol::export::ExportTrailer;
use crucible_protocol::framing::{self, FrameError};
use crucible_protocol::{
    BuildHandle, BuildOutcome, ErrorBody, ExistsResult, ImportResult, Request, RequestBody,
    Response,
};

/// Default daemon socket on POSIX systems.
pub const DEFAULT_SOCKET: &str = "/run/crucible-daemon.sock";

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("io error talking to daemon: {0}")]
    Io(#[from] std::io::Error),
    #[error("protocol error: {0}")]
    Frame(#[from] FrameError),
    #[error("daemon error: {0}")]
    Daemon(ErrorBody),
    #[error("malformed response: {0}")]
    BadResponse(String),
}

pub struct DaemonClient {
    reader: BufReader<OwnedReadHalf>,
    writer: BufWriter<OwnedWriteHalf>,
    next_id: u64,
}

impl DaemonClient {
    /// Connect to the daemon socket, `STORE_SOCKET` or the default.
    pub async fn connect_default() -> Result<Self, ClientError> {
        let socket = std::env::var("STORE_SOCKET").unwrap_or_else(|_| DEFAULT_SOCKET.to_string());
        Self::connect(Path::new(&socket)).await
    }

    pub async fn connect(socket_path: &Path) -> Result<Self, ClientError> {
        let stream = UnixStream::connect(socket_path).await?;
        let (read_half, write_half) = stream.into_split();
        debug!(socket = %socket_path.display(), "connected to daemon");
        Ok(DaemonClient {
            reader: BufReader::new(read_half),
            writer: BufWriter::new(write_half),
            next_id: 1,
        })
    }

    async fn call(&mut self, body: RequestBody) -> Result<serde_json::Value, ClientError> {
        let id = self.next_id;
        self.next_id += 1;
        framing::write_record(&mut self.writer, &Request { id, body }).await?;
        self.read_response(id).await
    }

    async fn read_response(&mut self, id: u64) -> Result<serde_json::Value, ClientError> {
        let response: Response = framing::read_record(&mut self.reader)
            .await?
            .ok_or_else(|| ClientError::BadResponse("connection closed mid-call".into()))?;
        if response.id != id {
            return Err(ClientError::BadResponse(format!(
                "response id {} does not match request id {id}",
                response.id
            )));
        }
        if let Some(error) = response.error {
            return Err(ClientError::Daemon(error));
        }
        response
            .result
            .ok_or_else(|| ClientError::BadResponse("response carries neither result nor error".into()))
    }

    fn parse<T: serde::de::DeserializeOwned>(
        value: serde_json::Value,
    ) -> Result<T, ClientError> {
        serde_json::from_value(value).map_err(|e| ClientError::BadResponse(e.to_string()))
    }

    /// Is `path` materialized and registered?
    pub async fn exists(&mut self, path: &str) -> Result<bool, ClientError> {
        let result = self
            .call(RequestBody::Exists {
                path: path.to_string(),
            })
            .await?;
        Ok(Self::parse::<ExistsResult>(result)?.exists)
    }

    /// Import one serialized object. The daemon responds with the imported
    /// paths once the stream ends.
    pub async fn import(
        &mut self,
        nar: &[u8],
        trailer: &ExportTrailer,
    ) -> Result<Vec<String>, ClientError> {
        let id = self.next_id;
        self.next_id += 1;
        framing::write_record(
            &mut self.writer,
            &Request {
                id,
                body: RequestBody::Import {},
            },
        )
        .await?;
        crucible_protocol::export::write_record(&mut self.writer, nar, trailer).await?;
        crucible_protocol::export::write_end(&mut self.writer).await?;
        self.writer.flush().await?;

        let result = self.read_response(id).await?;
        Ok(Self::parse::<ImportResult>(result)?.paths)
    }

    /// Begin realizing a derivation; returns the build handle.
    pub async fn realize(&mut self, drv_path: &str) -> Result<u64, ClientError> {
        let result = self
            .call(RequestBody::Realize {
                drv_path: drv_path.to_string(),
            })
            .await?;
        Ok(Self::parse::<BuildHandle>(result)?.build_id)
    }

    /// Begin expanding a derivation's environment against `temp_dir`.
    pub async fn expand(&mut self, drv_path: &str, temp_dir: &str) -> Result<u64, ClientError> {
        let result = self
            .call(RequestBody::Expand {
                drv_path: drv_path.to_string(),
                temp_dir: temp_dir.to_string(),
            })
            .await?;
        Ok(Self::parse::<BuildHandle>(result)?.build_id)
    }

    /// Block until the build behind `build_id` finishes.
    pub async fn wait(&mut self, build_id: u64) -> Result<BuildOutcome, ClientError> {
        let result = self.call(RequestBody::Wait { build_id }).await?;
        Self::parse(result)
    }

    /// Convenience: realize and wait in one call.
    pub async fn realize_and_wait(&mut self, drv_path: &str) -> Result<BuildOutcome, ClientError> {
        let build_id = self.realize(drv_path).await?;
        self.wait(build_id).await
    }
}
