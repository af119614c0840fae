//! Wire format of an API call.
//!
//! A call travels as an HTTP POST whose body is an encoded [`RemoteRequest`]
//! and whose headers carry the RPC endpoint/method pair, the payload content
//! type and the deadline in seconds. The reply body is an encoded
//! [`RemoteResponse`] with the same content type.

use harbor_core::HarborError;
use prost::Message;

pub const CONTENT_TYPE: &str = "application/octet-stream";

pub const HEADER_RPC_ENDPOINT: &str = "X-Harbor-RPC-Service-Endpoint";
pub const HEADER_RPC_METHOD: &str = "X-Harbor-RPC-Service-Method";
pub const HEADER_DEADLINE: &str = "X-Harbor-RPC-Service-Deadline";

pub const DEFAULT_RPC_ENDPOINT: &str = "harbor-apis";
pub const DEFAULT_RPC_METHOD: &str = "/RemoteApi.CallRemoteApi";

#[derive(Clone, PartialEq, Message)]
pub struct RemoteRequest {
    #[prost(string, tag = "2")]
    pub service_name: String,
    #[prost(string, tag = "3")]
    pub method: String,
    #[prost(bytes = "vec", tag = "4")]
    pub request: Vec<u8>,
    #[prost(string, tag = "5")]
    pub request_id: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct ApplicationError {
    #[prost(int32, tag = "1")]
    pub code: i32,
    #[prost(string, tag = "2")]
    pub detail: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct RpcError {
    #[prost(int32, tag = "1")]
    pub code: i32,
    #[prost(string, tag = "2")]
    pub detail: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct RemoteResponse {
    #[prost(bytes = "vec", tag = "1")]
    pub response: Vec<u8>,
    #[prost(bytes = "vec", optional, tag = "2")]
    pub exception: Option<Vec<u8>>,
    #[prost(message, optional, tag = "3")]
    pub application_error: Option<ApplicationError>,
    #[prost(message, optional, tag = "5")]
    pub rpc_error: Option<RpcError>,
}

/// Failure codes a backend can attach to [`RpcError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum RpcErrorCode {
    Unknown = 0,
    CallNotFound = 1,
    ParseError = 2,
    SecurityViolation = 3,
    OverQuota = 4,
    RequestTooLarge = 5,
    CapabilityDisabled = 6,
    FeatureDisabled = 7,
    BadRequest = 8,
    ResponseTooLarge = 9,
    Cancelled = 10,
    ReplayError = 11,
    DeadlineExceeded = 12,
}

impl RpcErrorCode {
    pub fn from_code(code: i32) -> Self {
        match code {
            1 => Self::CallNotFound,
            2 => Self::ParseError,
            3 => Self::SecurityViolation,
            4 => Self::OverQuota,
            5 => Self::RequestTooLarge,
            6 => Self::CapabilityDisabled,
            7 => Self::FeatureDisabled,
            8 => Self::BadRequest,
            9 => Self::ResponseTooLarge,
            10 => Self::Cancelled,
            11 => Self::ReplayError,
            12 => Self::DeadlineExceeded,
            _ => Self::Unknown,
        }
    }
}

impl RemoteRequest {
    pub fn decode_bytes(bytes: &[u8]) -> Result<Self, HarborError> {
        Self::decode(bytes).map_err(|e| HarborError::Codec(format!("bad request message: {e}")))
    }
}

impl RemoteResponse {
    pub fn ok(payload: Vec<u8>) -> Self {
        Self {
            response: payload,
            ..Default::default()
        }
    }

    pub fn rpc_failure(code: RpcErrorCode, detail: impl Into<String>) -> Self {
        Self {
            rpc_error: Some(RpcError {
                code: code as i32,
                detail: detail.into(),
            }),
            ..Default::default()
        }
    }

    pub fn application_failure(code: i32, detail: impl Into<String>) -> Self {
        Self {
            application_error: Some(ApplicationError {
                code,
                detail: detail.into(),
            }),
            ..Default::default()
        }
    }

    pub fn decode_bytes(bytes: &[u8]) -> Result<Self, HarborError> {
        Self::decode(bytes).map_err(|e| HarborError::Codec(format!("bad response message: {e}")))
    }

    /// Unwrap the payload, translating embedded failures into the error taxonomy.
    pub fn into_payload(self, call: &str) -> Result<Vec<u8>, HarborError> {
        if let Some(err) = self.rpc_error {
            return Err(match RpcErrorCode::from_code(err.code) {
                RpcErrorCode::CallNotFound => {
                    HarborError::NotFound(format!("{call}: {}", err.detail))
                }
                RpcErrorCode::DeadlineExceeded => HarborError::DeadlineExceeded {
                    call: format!("{call} (backend: {})", err.detail),
                    elapsed_ms: 0,
                },
                RpcErrorCode::Cancelled => {
                    HarborError::Cancelled(format!("{call}: {}", err.detail))
                }
                other => HarborError::Transport(format!(
                    "{call}: rpc error {other:?} ({}): {}",
                    err.code, err.detail
                )),
            });
        }
        if let Some(err) = self.application_error {
            return Err(HarborError::Application {
                code: err.code,
                detail: err.detail,
            });
        }
        if self.exception.is_some() {
            return Err(HarborError::Transport(format!(
                "{call}: backend raised an exception"
            )));
        }
        Ok(self.response)
    }
}
