// SPDX-FileCopyrightText: 2026 Jörg Thalheim
// SPDX-License-Identifier: MIT

//! RPC message shapes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A request record: `{"method": …, "id": …, "params": {…}}`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub id: u64,
    #[serde(flatten)]
    pub body: RequestBody,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "method", content = "params")]
pub enum RequestBody {
    /// Is this absolute store path materialized and registered?
    Exists { path: String },
    /// Announces an export stream following this record on the connection.
    /// Responds with the list of imported paths once the stream ends.
    Import {},
    /// Begin realizing a derivation's outputs; responds with a build handle.
    Realize { drv_path: String },
    /// Produce the substituted environment a build would run with, without
    /// running it; responds with a build handle.
    Expand { drv_path: String, temp_dir: String },
    /// Block until the build behind the handle reaches a terminal state.
    Wait { build_id: u64 },
}

impl RequestBody {
    /// Method name as it appears on the wire, for logging.
    pub fn method(&self) -> &'static str {
        match self {
            RequestBody::Exists { .. } => "Exists",
            RequestBody::Import {} => "Import",
            RequestBody::Realize { .. } => "Realize",
            RequestBody::Expand { .. } => "Expand",
            RequestBody::Wait { .. } => "Wait",
        }
    }
}

/// A response record: `{"id": …, "result": …}` or `{"id": …, "error": …}`.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Response {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl Response {
    pub fn ok<T: Serialize>(id: u64, result: &T) -> Self {
        Response {
            id,
            result: Some(serde_json::to_value(result).expect("results serialize to JSON")),
            error: None,
        }
    }

    pub fn err(id: u64, error: ErrorBody) -> Self {
        Response {
            id,
            result: None,
            error: Some(error),
        }
    }
}

/// The error taxonomy surfaced across the protocol.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    InvalidPath,
    NotFound,
    ContentMismatch,
    NameTooLong,
    NameTooShort,
    NameBadChars,
    DerivationParse,
    BuildFailed,
    TimedOut,
    Canceled,
    Conflict,
    SandboxError,
    Io,
}

#[derive(Serialize, Deserialize, Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind:?}: {message}")]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
}

impl ErrorBody {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        ErrorBody {
            kind,
            message: message.into(),
        }
    }
}

/// Result payload of `Exists`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ExistsResult {
    pub exists: bool,
}

/// Result payload of `Import`: the imported paths in stream order.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ImportResult {
    pub paths: Vec<String>,
}

/// Result payload of `Realize` and `Expand`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct BuildHandle {
    pub build_id: u64,
}

/// Terminal state delivered by `Wait`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum BuildOutcome {
    /// All requested outputs were realized.
    Built { outputs: BTreeMap<String, String> },
    /// The builder exited with a non-zero status.
    Failed { exit: i32, message: String },
    /// The watchdog killed the build.
    TimedOut,
    /// Every waiter detached before the build finished.
    Canceled,
    /// `Expand`: the substituted build environment.
    Expanded {
        builder: String,
        args: Vec<String>,
        env: BTreeMap<String, String>,
    },
}

#[cfg(test)]
mod unittests {
    use super::*;

    #[test]
    fn request_wire_shape() {
        let request = Request {
            id: 7,
            body: RequestBody::Exists {
                path: "/nix/store/00000000000000000000000000000000-x".into(),
            },
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "id": 7,
                "method": "Exists",
                "params": {"path": "/nix/store/00000000000000000000000000000000-x"},
            })
        );
        let back: Request = serde_json::from_value(json).unwrap();
        assert_eq!(back, request);
    }

    #[test]
    fn response_carries_result_xor_error() {
        let ok = Response::ok(1, &ExistsResult { exists: true });
        let json = serde_json::to_value(&ok).unwrap();
        assert!(json.get("result").is_some());
        assert!(json.get("error").is_none());

        let err = Response::err(2, ErrorBody::new(ErrorKind::NotFound, "no such path"));
        let json = serde_json::to_value(&err).unwrap();
        assert!(json.get("result").is_none());
        assert_eq!(json["error"]["kind"], "notFound");
    }

    #[test]
    fn outcome_status_tags() {
        let outcome = BuildOutcome::TimedOut;
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["status"], "timedOut");

        let built = BuildOutcome::Built {
            outputs: BTreeMap::from([(
                "out".to_string(),
                "/nix/store/00000000000000000000000000000000-x".to_string(),
            )]),
        };
        let json = serde_json::to_value(&built).unwrap();
        assert_eq!(json["status"], "built");
        assert!(json["outputs"].is_object());
    }
}
