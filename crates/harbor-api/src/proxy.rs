use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use harbor_core::{ExecutionContext, HarborError, WorkHandle};
use prost::Message;

use crate::deadline::DeadlinePolicy;
use crate::metrics::{CallMetrics, CallMetricsSnapshot};
use crate::transport::{Transport, WireCall, expect_octet_stream};
use crate::wire::{CONTENT_TYPE, DEFAULT_RPC_ENDPOINT, DEFAULT_RPC_METHOD, RemoteRequest, RemoteResponse};

/// A call ready to be issued. Its deadline is fixed at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRequest {
    service: String,
    method: String,
    payload: Vec<u8>,
    deadline: Duration,
}

impl CallRequest {
    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    fn label(&self) -> String {
        format!("{}.{}", self.service, self.method)
    }
}

/// Bridges application calls to backend services.
///
/// Cloning is cheap; clones share the transport and the metrics.
#[derive(Clone)]
pub struct ApiProxy {
    inner: Arc<ProxyInner>,
}

struct ProxyInner {
    transport: Arc<dyn Transport>,
    policy: DeadlinePolicy,
    rpc_endpoint: String,
    rpc_method: String,
    metrics: CallMetrics,
}

impl ApiProxy {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::with_options(transport, ProxyOptions::default())
    }

    pub fn with_options(transport: Arc<dyn Transport>, options: ProxyOptions) -> Self {
        tracing::debug!(
            transport = transport.name(),
            default_deadline_ms = options.policy.default_deadline().as_millis() as u64,
            max_deadline_ms = options.policy.max_deadline().as_millis() as u64,
            "API proxy initialized"
        );
        Self {
            inner: Arc::new(ProxyInner {
                transport,
                policy: options.policy,
                rpc_endpoint: options.rpc_endpoint,
                rpc_method: options.rpc_method,
                metrics: options.metrics,
            }),
        }
    }

    pub fn deadline_policy(&self) -> &DeadlinePolicy {
        &self.inner.policy
    }

    pub fn metrics(&self) -> CallMetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Freeze a call, resolving its deadline against the policy.
    pub fn prepare(
        &self,
        service: &str,
        method: &str,
        payload: Vec<u8>,
        deadline_secs: Option<f64>,
    ) -> CallRequest {
        CallRequest {
            service: service.to_string(),
            method: method.to_string(),
            payload,
            deadline: self.inner.policy.resolve(deadline_secs),
        }
    }

    /// Issue a call and wait for its response or its deadline.
    pub async fn call(
        &self,
        service: &str,
        method: &str,
        payload: Vec<u8>,
        deadline_secs: Option<f64>,
    ) -> Result<Vec<u8>, HarborError> {
        let request = self.prepare(service, method, payload, deadline_secs);
        self.execute(&request).await
    }

    /// Issue a call without waiting.
    ///
    /// The call runs as a unit of `ctx`'s work group, so it is interrupted if
    /// the request finishes before the call does.
    pub fn call_async(
        &self,
        ctx: &ExecutionContext,
        service: &str,
        method: &str,
        payload: Vec<u8>,
        deadline_secs: Option<f64>,
    ) -> PendingCall {
        let request = self.prepare(service, method, payload, deadline_secs);
        let proxy = self.clone();
        let handle = ctx.spawn(async move { proxy.execute(&request).await });
        PendingCall { handle }
    }

    pub async fn execute(&self, request: &CallRequest) -> Result<Vec<u8>, HarborError> {
        let started = Instant::now();
        self.inner.metrics.record_issued();

        let outcome = self.round_trip(request, started).await;

        let elapsed = started.elapsed();
        self.inner
            .metrics
            .record_outcome(&outcome, elapsed.as_secs_f64() * 1000.0);
        match &outcome {
            Ok(payload) => tracing::debug!(
                call = %request.label(),
                bytes = payload.len(),
                elapsed_ms = elapsed.as_millis() as u64,
                "API call completed"
            ),
            Err(e) => tracing::warn!(
                call = %request.label(),
                error = %e,
                elapsed_ms = elapsed.as_millis() as u64,
                "API call failed"
            ),
        }
        outcome
    }

    async fn round_trip(
        &self,
        request: &CallRequest,
        started: Instant,
    ) -> Result<Vec<u8>, HarborError> {
        let body = RemoteRequest {
            service_name: request.service.clone(),
            method: request.method.clone(),
            request: request.payload.clone(),
            request_id: uuid::Uuid::new_v4().to_string(),
        }
        .encode_to_vec();

        let wire = WireCall {
            body,
            content_type: CONTENT_TYPE.into(),
            rpc_endpoint: self.inner.rpc_endpoint.clone(),
            rpc_method: self.inner.rpc_method.clone(),
            deadline: request.deadline,
        };

        // Dropping the transport future on timeout discards any late reply.
        let reply = tokio::time::timeout(request.deadline, self.inner.transport.round_trip(&wire))
            .await
            .map_err(|_| HarborError::DeadlineExceeded {
                call: request.label(),
                elapsed_ms: started.elapsed().as_millis() as u64,
            })??;

        expect_octet_stream(&reply)?;
        RemoteResponse::decode_bytes(&reply.body)?.into_payload(&request.label())
    }
}

/// Proxy construction options.
pub struct ProxyOptions {
    pub policy: DeadlinePolicy,
    pub rpc_endpoint: String,
    pub rpc_method: String,
    pub metrics: CallMetrics,
}

impl Default for ProxyOptions {
    fn default() -> Self {
        Self {
            policy: DeadlinePolicy::default(),
            rpc_endpoint: DEFAULT_RPC_ENDPOINT.into(),
            rpc_method: DEFAULT_RPC_METHOD.into(),
            metrics: CallMetrics::new(),
        }
    }
}

/// An outstanding asynchronous call.
pub struct PendingCall {
    handle: WorkHandle<Result<Vec<u8>, HarborError>>,
}

impl PendingCall {
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Future for PendingCall {
    type Output = Result<Vec<u8>, HarborError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.handle).poll(cx).map(|r| r.and_then(|inner| inner))
    }
}
