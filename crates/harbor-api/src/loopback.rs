//! In-process API backend.
//!
//! `LoopbackTransport` decodes each call and dispatches it to a registered
//! [`ApiService`], encoding the result exactly as a remote API server would.
//! It backs local development and the echo self-test.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use harbor_core::HarborError;
use prost::Message;

use crate::transport::{Transport, WireCall, WireReply};
use crate::wire::{CONTENT_TYPE, RemoteRequest, RemoteResponse, RpcErrorCode};

/// Failure reported by a service implementation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceFault {
    /// The service has no such method.
    UnknownMethod,
    /// Service-defined error code, delivered as an application error.
    Application { code: i32, detail: String },
}

/// A backend service reachable through the call proxy.
pub trait ApiService: Send + Sync {
    fn call<'a>(
        &'a self,
        method: &'a str,
        payload: &'a [u8],
    ) -> Pin<Box<dyn Future<Output = Result<Vec<u8>, ServiceFault>> + Send + 'a>>;
}

/// Answers every `Echo` call with the payload it was sent.
pub struct EchoService;

impl ApiService for EchoService {
    fn call<'a>(
        &'a self,
        method: &'a str,
        payload: &'a [u8],
    ) -> Pin<Box<dyn Future<Output = Result<Vec<u8>, ServiceFault>> + Send + 'a>> {
        Box::pin(async move {
            match method {
                "Echo" => Ok(payload.to_vec()),
                _ => Err(ServiceFault::UnknownMethod),
            }
        })
    }
}

pub struct LoopbackTransport {
    services: HashMap<String, Arc<dyn ApiService>>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self {
            services: HashMap::new(),
        }
    }

    /// Loopback with the `echo` service registered.
    pub fn with_echo() -> Self {
        let mut transport = Self::new();
        transport.register("echo", Arc::new(EchoService));
        transport
    }

    pub fn register(&mut self, name: impl Into<String>, service: Arc<dyn ApiService>) {
        self.services.insert(name.into(), service);
    }

    async fn dispatch(&self, body: &[u8]) -> Result<RemoteResponse, HarborError> {
        let request = RemoteRequest::decode_bytes(body)?;
        let call = format!("{}.{}", request.service_name, request.method);

        let Some(service) = self.services.get(&request.service_name) else {
            tracing::debug!(call, "Loopback call to unregistered service");
            return Ok(RemoteResponse::rpc_failure(
                RpcErrorCode::CallNotFound,
                format!("unknown service {:?}", request.service_name),
            ));
        };

        let response = match service.call(&request.method, &request.request).await {
            Ok(payload) => RemoteResponse::ok(payload),
            Err(ServiceFault::UnknownMethod) => RemoteResponse::rpc_failure(
                RpcErrorCode::CallNotFound,
                format!("unknown method {call}"),
            ),
            Err(ServiceFault::Application { code, detail }) => {
                RemoteResponse::application_failure(code, detail)
            }
        };
        Ok(response)
    }
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for LoopbackTransport {
    fn round_trip<'a>(
        &'a self,
        call: &'a WireCall,
    ) -> Pin<Box<dyn Future<Output = Result<WireReply, HarborError>> + Send + 'a>> {
        Box::pin(async move {
            let response = self.dispatch(&call.body).await?;
            Ok(WireReply {
                content_type: CONTENT_TYPE.into(),
                body: response.encode_to_vec(),
            })
        })
    }

    fn name(&self) -> &str {
        "loopback"
    }
}
