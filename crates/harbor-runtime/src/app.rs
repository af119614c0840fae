use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use harbor_api::{ApiProxy, PendingCall};
use harbor_core::{
    Capabilities, ExecutionContext, HarborError, InstanceKey, Request, Response, SharedPool,
    WorkHandle,
};

/// Entry points of a hosted application.
///
/// `handle` serves one routed request. `start` and `reset` run when an
/// instance enters `RUNNING` and leaves it.
pub trait Application: Send + Sync {
    fn handle<'a>(
        &'a self,
        ctx: &'a AppContext,
        request: &'a Request,
        response: &'a mut Response,
    ) -> Pin<Box<dyn Future<Output = Result<(), HarborError>> + Send + 'a>>;

    fn start<'a>(
        &'a self,
        _instance: &'a InstanceKey,
    ) -> Pin<Box<dyn Future<Output = Result<(), HarborError>> + Send + 'a>> {
        Box::pin(async { Ok(()) })
    }

    fn reset<'a>(
        &'a self,
        _instance: &'a InstanceKey,
    ) -> Pin<Box<dyn Future<Output = Result<(), HarborError>> + Send + 'a>> {
        Box::pin(async { Ok(()) })
    }
}

/// What application code can reach while serving a request.
pub struct AppContext {
    exec: ExecutionContext,
    api: ApiProxy,
    instance: InstanceKey,
    capabilities: Arc<Capabilities>,
}

impl AppContext {
    pub fn new(
        exec: ExecutionContext,
        api: ApiProxy,
        instance: InstanceKey,
        capabilities: Arc<Capabilities>,
    ) -> Self {
        Self {
            exec,
            api,
            instance,
            capabilities,
        }
    }

    /// The instance the router picked for this request.
    pub fn instance(&self) -> &InstanceKey {
        &self.instance
    }

    pub fn execution(&self) -> &ExecutionContext {
        &self.exec
    }

    pub async fn call(
        &self,
        service: &str,
        method: &str,
        payload: Vec<u8>,
        deadline_secs: Option<f64>,
    ) -> Result<Vec<u8>, HarborError> {
        self.api.call(service, method, payload, deadline_secs).await
    }

    pub fn call_async(
        &self,
        service: &str,
        method: &str,
        payload: Vec<u8>,
        deadline_secs: Option<f64>,
    ) -> PendingCall {
        self.api
            .call_async(&self.exec, service, method, payload, deadline_secs)
    }

    /// Spawn work bound to this request.
    pub fn spawn<F>(&self, fut: F) -> WorkHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.exec.spawn(fut)
    }

    pub fn shared_pool(&self) -> &SharedPool {
        self.exec.shared_pool()
    }

    /// Look up an optional collaborator. `None` is a normal answer.
    pub fn capability<T: ?Sized + Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.capabilities.get::<T>()
    }
}

/// Answers every request with a fixed status and body.
pub struct StaticApplication {
    status: u16,
    body: Vec<u8>,
}

impl StaticApplication {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }
}

impl Application for StaticApplication {
    fn handle<'a>(
        &'a self,
        ctx: &'a AppContext,
        _request: &'a Request,
        response: &'a mut Response,
    ) -> Pin<Box<dyn Future<Output = Result<(), HarborError>> + Send + 'a>> {
        Box::pin(async move {
            response.status = self.status;
            response.set_header("X-Harbor-Instance", ctx.instance().to_string());
            response.body = self.body.clone();
            Ok(())
        })
    }
}
