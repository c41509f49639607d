//! JSON-RPC shaped messages exchanged with the analysis engine.
//!
//! The byte transport is not part of this crate: a launcher hands the client
//! a pair of channels carrying `serde_json::Value` messages. This module
//! defines what travels on them.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::region::{NavigationTarget, OverriddenMember, Region, RegionPayload};

pub const METHOD_UPDATE_CONTENT: &str = "analysis.updateContent";
pub const METHOD_SET_ROOTS: &str = "analysis.setAnalysisRoots";
pub const METHOD_GET_ERRORS: &str = "analysis.getErrors";
pub const METHOD_GET_FIXES: &str = "edit.getFixes";
pub const METHOD_FORMAT: &str = "edit.format";
pub const METHOD_SHUTDOWN: &str = "server.shutdown";

pub const NOTIFY_CONNECTED: &str = "server.connected";
pub const NOTIFY_ERROR: &str = "server.error";
pub const NOTIFY_HIGHLIGHTS: &str = "analysis.highlights";
pub const NOTIFY_NAVIGATION: &str = "analysis.navigation";
pub const NOTIFY_OVERRIDES: &str = "analysis.overrides";
pub const NOTIFY_IMPLEMENTED: &str = "analysis.implemented";
pub const NOTIFY_FLUSHED: &str = "analysis.flushResults";

/// JSON-RPC request ID.
///
/// Wraps `i64` so request IDs cannot be confused with offsets or versions.
/// The client generates them, so only numeric IDs are supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(i64);

impl RequestId {
    #[inline]
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    #[inline]
    pub fn as_i64(self) -> i64 {
        self.0
    }

    /// Extract the numeric "id" of a message, `None` for notifications.
    pub fn from_json(message: &Value) -> Option<Self> {
        message.get("id")?.as_i64().map(Self)
    }
}

impl From<i64> for RequestId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Standard error codes carried in engine error responses.
pub struct ErrorCodes;

impl ErrorCodes {
    pub const INVALID_PARAMS: i32 = -32602;
    pub const INTERNAL_ERROR: i32 = -32603;
    pub const REQUEST_FAILED: i32 = -32803;
}

/// Error object of an engine response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ResponseError {
    pub fn request_failed(message: impl Into<String>) -> Self {
        Self {
            code: ErrorCodes::REQUEST_FAILED,
            message: message.into(),
            data: None,
        }
    }
}

pub fn build_request(id: RequestId, method: &str, params: Value) -> Value {
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": id.as_i64(),
        "method": method,
        "params": params
    })
}

pub fn build_notification(method: &str, params: Value) -> Value {
    serde_json::json!({
        "jsonrpc": "2.0",
        "method": method,
        "params": params
    })
}

pub fn build_response(id: RequestId, result: Value) -> Value {
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": id.as_i64(),
        "result": result
    })
}

pub fn build_error_response(id: RequestId, error: &ResponseError) -> Value {
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": id.as_i64(),
        "error": error
    })
}

// ============================================================================
// Outbound
// ============================================================================

/// New in-memory state of one file for `analysis.updateContent`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentOverlay {
    /// Analyze this content instead of the file on disk
    Add { content: String },
    /// Go back to the file on disk
    Remove,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateContentParams {
    pub files: BTreeMap<PathBuf, ContentOverlay>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetRootsParams {
    pub included: Vec<PathBuf>,
    pub excluded: Vec<PathBuf>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub package_roots: BTreeMap<PathBuf, PathBuf>,
}

/// The kinds of requests that wait for an answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Errors,
    Fixes,
    Format,
    SetRoots,
}

/// A request that expects a response from the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineRequest {
    GetErrors {
        file: PathBuf,
    },
    GetFixes {
        file: PathBuf,
        offset: usize,
    },
    Format {
        file: PathBuf,
        selection_offset: usize,
        selection_length: usize,
    },
    SetRoots(SetRootsParams),
}

impl EngineRequest {
    pub fn kind(&self) -> RequestKind {
        match self {
            EngineRequest::GetErrors { .. } => RequestKind::Errors,
            EngineRequest::GetFixes { .. } => RequestKind::Fixes,
            EngineRequest::Format { .. } => RequestKind::Format,
            EngineRequest::SetRoots(_) => RequestKind::SetRoots,
        }
    }

    pub fn method(&self) -> &'static str {
        match self.kind() {
            RequestKind::Errors => METHOD_GET_ERRORS,
            RequestKind::Fixes => METHOD_GET_FIXES,
            RequestKind::Format => METHOD_FORMAT,
            RequestKind::SetRoots => METHOD_SET_ROOTS,
        }
    }

    /// The file a request is about, if any.
    pub fn file(&self) -> Option<&Path> {
        match self {
            EngineRequest::GetErrors { file }
            | EngineRequest::GetFixes { file, .. }
            | EngineRequest::Format { file, .. } => Some(file),
            EngineRequest::SetRoots(_) => None,
        }
    }

    /// Fails if a path is not valid UTF-8.
    pub fn params(&self) -> Result<Value, serde_json::Error> {
        Ok(match self {
            EngineRequest::GetErrors { file } => {
                serde_json::json!({ "file": serde_json::to_value(file)? })
            }
            EngineRequest::GetFixes { file, offset } => {
                serde_json::json!({ "file": serde_json::to_value(file)?, "offset": offset })
            }
            EngineRequest::Format {
                file,
                selection_offset,
                selection_length,
            } => serde_json::json!({
                "file": serde_json::to_value(file)?,
                "selectionOffset": selection_offset,
                "selectionLength": selection_length
            }),
            EngineRequest::SetRoots(params) => serde_json::to_value(params)?,
        })
    }

    pub fn to_message(&self, id: RequestId) -> Result<Value, serde_json::Error> {
        Ok(build_request(id, self.method(), self.params()?))
    }
}

// ============================================================================
// Request results
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ErrorSeverity {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub file: PathBuf,
    pub offset: usize,
    pub length: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisError {
    pub severity: ErrorSeverity,
    #[serde(rename = "type")]
    pub error_type: String,
    pub location: Location,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correction: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceEdit {
    pub offset: usize,
    pub length: usize,
    pub replacement: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFileEdit {
    pub file: PathBuf,
    pub edits: Vec<SourceEdit>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceChange {
    pub message: String,
    pub edits: Vec<SourceFileEdit>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisErrorFixes {
    pub error: AnalysisError,
    pub fixes: Vec<SourceChange>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormatResult {
    pub edits: Vec<SourceEdit>,
    pub selection_offset: usize,
    pub selection_length: usize,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ErrorsResult {
    pub errors: Vec<AnalysisError>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct FixesResult {
    pub fixes: Vec<AnalysisErrorFixes>,
}

// ============================================================================
// Inbound notifications
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HighlightRegion {
    pub offset: usize,
    pub length: usize,
    #[serde(rename = "type")]
    pub highlight_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NavigationRegion {
    pub offset: usize,
    pub length: usize,
    pub targets: Vec<NavigationTarget>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverrideMember {
    pub offset: usize,
    pub length: usize,
    #[serde(default)]
    pub superclass_member: Option<OverriddenMember>,
    #[serde(default)]
    pub interface_members: Vec<OverriddenMember>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImplementedRegion {
    pub offset: usize,
    pub length: usize,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConnectedParams {
    #[serde(default)]
    version: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerErrorParams {
    is_fatal: bool,
    message: String,
    #[serde(default)]
    stack_trace: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HighlightsParams {
    file: PathBuf,
    regions: Vec<HighlightRegion>,
}

#[derive(Debug, Deserialize)]
struct NavigationParams {
    file: PathBuf,
    regions: Vec<NavigationRegion>,
}

#[derive(Debug, Deserialize)]
struct OverridesParams {
    file: PathBuf,
    overrides: Vec<OverrideMember>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImplementedParams {
    file: PathBuf,
    classes: Vec<ImplementedRegion>,
    members: Vec<ImplementedRegion>,
}

#[derive(Debug, Deserialize)]
struct FlushedParams {
    files: Vec<PathBuf>,
}

/// Unsolicited message from the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineNotification {
    Connected {
        version: Option<String>,
    },
    ServerError {
        fatal: bool,
        message: String,
        stack_trace: Option<String>,
    },
    Highlights {
        file: PathBuf,
        regions: Vec<HighlightRegion>,
    },
    Navigation {
        file: PathBuf,
        regions: Vec<NavigationRegion>,
    },
    Overrides {
        file: PathBuf,
        overrides: Vec<OverrideMember>,
    },
    Implemented {
        file: PathBuf,
        classes: Vec<ImplementedRegion>,
        members: Vec<ImplementedRegion>,
    },
    Flushed {
        files: Vec<PathBuf>,
    },
}

/// Why an inbound notification could not be decoded.
#[derive(Debug, thiserror::Error)]
pub enum NotificationParseError {
    #[error("message has no method")]
    MissingMethod,
    #[error("unknown notification {0}")]
    UnknownMethod(String),
    #[error("invalid params for {method}: {source}")]
    InvalidParams {
        method: String,
        source: serde_json::Error,
    },
}

impl EngineNotification {
    /// Decode a JSON-RPC notification.
    pub fn from_message(message: &Value) -> Result<Self, NotificationParseError> {
        let method = message
            .get("method")
            .and_then(Value::as_str)
            .ok_or(NotificationParseError::MissingMethod)?;
        let params = message.get("params").cloned().unwrap_or(Value::Null);

        fn decode<T: serde::de::DeserializeOwned>(
            method: &str,
            params: Value,
        ) -> Result<T, NotificationParseError> {
            serde_json::from_value(params).map_err(|source| NotificationParseError::InvalidParams {
                method: method.to_string(),
                source,
            })
        }

        let notification = match method {
            NOTIFY_CONNECTED => {
                let params = if params.is_null() {
                    ConnectedParams { version: None }
                } else {
                    decode::<ConnectedParams>(method, params)?
                };
                EngineNotification::Connected {
                    version: params.version,
                }
            }
            NOTIFY_ERROR => {
                let params: ServerErrorParams = decode(method, params)?;
                EngineNotification::ServerError {
                    fatal: params.is_fatal,
                    message: params.message,
                    stack_trace: params.stack_trace,
                }
            }
            NOTIFY_HIGHLIGHTS => {
                let params: HighlightsParams = decode(method, params)?;
                EngineNotification::Highlights {
                    file: params.file,
                    regions: params.regions,
                }
            }
            NOTIFY_NAVIGATION => {
                let params: NavigationParams = decode(method, params)?;
                EngineNotification::Navigation {
                    file: params.file,
                    regions: params.regions,
                }
            }
            NOTIFY_OVERRIDES => {
                let params: OverridesParams = decode(method, params)?;
                EngineNotification::Overrides {
                    file: params.file,
                    overrides: params.overrides,
                }
            }
            NOTIFY_IMPLEMENTED => {
                let params: ImplementedParams = decode(method, params)?;
                EngineNotification::Implemented {
                    file: params.file,
                    classes: params.classes,
                    members: params.members,
                }
            }
            NOTIFY_FLUSHED => {
                let params: FlushedParams = decode(method, params)?;
                EngineNotification::Flushed {
                    files: params.files,
                }
            }
            other => return Err(NotificationParseError::UnknownMethod(other.to_string())),
        };
        Ok(notification)
    }
}

impl From<HighlightRegion> for Region {
    fn from(region: HighlightRegion) -> Self {
        Region::highlight(region.offset, region.length, region.highlight_type)
    }
}

impl From<NavigationRegion> for Region {
    fn from(region: NavigationRegion) -> Self {
        Region::navigation(region.offset, region.length, region.targets)
    }
}

impl From<OverrideMember> for Region {
    fn from(member: OverrideMember) -> Self {
        Region::new(
            member.offset,
            member.length,
            RegionPayload::Override {
                superclass_member: member.superclass_member,
                interface_members: member.interface_members,
            },
        )
    }
}

impl From<ImplementedRegion> for Region {
    fn from(region: ImplementedRegion) -> Self {
        Region::implemented(region.offset, region.length)
    }
}
