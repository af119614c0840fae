use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use harbor_api::{ApiProxy, HttpTransport, LoopbackTransport, Transport};
use harbor_core::{
    Capabilities, HarborError, Request, Response, SharedPool, Supervisor, TeardownReport,
};
use tokio::time::MissedTickBehavior;

use crate::app::Application;
use crate::config::HarborConfig;
use crate::lifecycle::BackendManager;
use crate::router::{ModuleRoute, RouteKey, Router};
use crate::sessions::{FileSessionStore, SessionStore};

/// Everything a listener needs to serve requests: backends, routes, the
/// request supervisor and the API proxy.
pub struct Host {
    manager: Arc<BackendManager>,
    router: Router,
    supervisor: Supervisor,
    api: ApiProxy,
    capabilities: Arc<Capabilities>,
}

impl Host {
    pub fn builder(config: HarborConfig) -> HostBuilder {
        HostBuilder::new(config)
    }

    pub fn manager(&self) -> &Arc<BackendManager> {
        &self.manager
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    pub fn api(&self) -> &ApiProxy {
        &self.api
    }

    pub fn capabilities(&self) -> &Arc<Capabilities> {
        &self.capabilities
    }

    pub async fn start(&self) -> Result<(), HarborError> {
        self.manager.start_all().await
    }

    /// Stop every backend, then drain the shared pool.
    pub async fn shutdown(&self) -> Result<(), HarborError> {
        let stopped = self.manager.stop_all().await;
        self.supervisor.shutdown().await;
        stopped
    }

    /// Route `request` and run it in its own execution context.
    ///
    /// On success the response has been filled in by the application.
    pub async fn dispatch(
        &self,
        key: &RouteKey,
        request: Request,
        response: &mut Response,
    ) -> Result<(), HarborError> {
        self.dispatch_reported(key, request, response).await.0
    }

    /// [`dispatch`](Self::dispatch), also returning what teardown found.
    pub async fn dispatch_reported(
        &self,
        key: &RouteKey,
        request: Request,
        response: &mut Response,
    ) -> (Result<(), HarborError>, TeardownReport) {
        let (result, report) = self
            .supervisor
            .run(move |exec| {
                self.router.forward(
                    exec,
                    self.api.clone(),
                    Arc::clone(&self.capabilities),
                    key,
                    request,
                    response,
                )
            })
            .await;

        if !report.is_clean() {
            tracing::debug!(
                request_id = %report.request_id,
                interrupted = report.interrupted,
                drained = report.drained,
                "Request left work behind"
            );
        }
        (result, report)
    }

    /// Like [`dispatch`](Self::dispatch), rendering failures as a status
    /// response instead of returning them.
    pub async fn handle(&self, key: &RouteKey, request: Request) -> Response {
        let mut response = Response::default();
        if let Err(e) = self.dispatch(key, request, &mut response).await {
            let status = e.status_code();
            if status >= 500 {
                tracing::warn!(module = %key.module, error = %e, status, "Request failed");
            } else {
                tracing::debug!(module = %key.module, error = %e, status, "Request rejected");
            }
            response = Response::default();
            response.error(status, &e.to_string());
        }
        response
    }
}

pub struct HostBuilder {
    config: HarborConfig,
    applications: HashMap<String, Arc<dyn Application>>,
    transport: Option<Arc<dyn Transport>>,
    capabilities: Capabilities,
}

impl HostBuilder {
    pub fn new(config: HarborConfig) -> Self {
        Self {
            config,
            applications: HashMap::new(),
            transport: None,
            capabilities: Capabilities::new(),
        }
    }

    /// The application every instance of `backend` runs.
    pub fn application(mut self, backend: impl Into<String>, app: Arc<dyn Application>) -> Self {
        self.applications.insert(backend.into(), app);
        self
    }

    /// Override the transport picked from `[api].endpoint`.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn capability<T>(mut self, value: Arc<T>) -> Self
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.capabilities.register(value);
        self
    }

    /// Register backends and routes. Instances are left `STOPPED`.
    pub async fn build(mut self) -> Result<Host, HarborError> {
        self.config.validate()?;

        let transport = match (self.transport.take(), &self.config.api.endpoint) {
            (Some(t), _) => t,
            (None, Some(url)) => Arc::new(HttpTransport::new(url.clone())) as Arc<dyn Transport>,
            (None, None) => Arc::new(LoopbackTransport::with_echo()),
        };
        let api = ApiProxy::with_options(transport, self.config.api.proxy_options());

        let sessions = &self.config.sessions;
        if sessions.enabled && !self.capabilities.has::<dyn SessionStore>() {
            let store = FileSessionStore::new(sessions.resolved_dir()).with_ttl(sessions.ttl());
            store.init().await?;
            tracing::info!(
                dir = %store.base_dir().display(),
                ttl_secs = sessions.ttl_secs,
                "File session store enabled"
            );
            self.capabilities
                .register::<dyn SessionStore>(Arc::new(store));
        }

        let supervisor = Supervisor::new();
        if sessions.enabled {
            if let Some(store) = self.capabilities.get::<dyn SessionStore>() {
                spawn_session_sweep(supervisor.shared_pool(), store, sessions.purge_interval());
            }
        }

        let lifecycle = &self.config.lifecycle;
        let manager = Arc::new(
            BackendManager::new(lifecycle.stop_policy)
                .with_drain_timeout(lifecycle.drain_timeout()),
        );
        for backend in &self.config.backends {
            let app = self.applications.get(&backend.name).cloned().ok_or_else(|| {
                HarborError::Config(format!("no application bound to backend {}", backend.name))
            })?;
            manager.register_backend(backend.clone(), app).await?;
        }

        let router = Router::new(Arc::clone(&manager));
        for route in &self.config.routes {
            router
                .add_route(
                    &route.module,
                    ModuleRoute::new(&route.version, &route.backend),
                )
                .await?;
        }

        Ok(Host {
            manager,
            router,
            supervisor,
            api,
            capabilities: Arc::new(self.capabilities),
        })
    }
}

/// Purge expired sessions every `every` until the shared pool shuts down.
fn spawn_session_sweep(pool: &SharedPool, store: Arc<dyn SessionStore>, every: Duration) {
    let shutdown = pool.clone();
    let _sweep = pool.spawn(async move {
        let mut ticks = tokio::time::interval(every);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.closing() => break,
                _ = ticks.tick() => {
                    if let Err(e) = store.purge_expired(Utc::now()).await {
                        tracing::warn!(store = store.backend_name(), error = %e, "Session sweep failed");
                    }
                }
            }
        }
    });
}
