use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use harbor_core::{
    BackendState, HarborError, InstanceKey, InstanceSnapshot, InstanceState, StepFailure,
};
use tokio::sync::{Mutex, Notify, RwLock};

use crate::app::Application;
use crate::config::{BackendConfig, StopPolicy};

/// How long `stop` waits for admitted requests before running `reset`.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy)]
struct Status {
    state: InstanceState,
    started_at: Option<DateTime<Utc>>,
}

/// One hosted instance of a backend.
///
/// The status lock orders admission against transitions: a request is
/// admitted only while the instance reads `RUNNING`, and `stop` takes the
/// write side to move it to `STOPPING`. Once its backend is removed an
/// instance is retired and never starts again.
pub struct Instance {
    backend: String,
    key: InstanceKey,
    port: u16,
    app: Arc<dyn Application>,
    status: RwLock<Status>,
    /// Serializes transitions on this instance.
    transition: Mutex<()>,
    in_flight: AtomicUsize,
    /// Signalled when `in_flight` drops to zero.
    idle: Notify,
    retired: AtomicBool,
}

impl Instance {
    fn new(backend: &str, key: InstanceKey, port: u16, app: Arc<dyn Application>) -> Self {
        Self {
            backend: backend.to_string(),
            key,
            port,
            app,
            status: RwLock::new(Status {
                state: InstanceState::Stopped,
                started_at: None,
            }),
            transition: Mutex::new(()),
            in_flight: AtomicUsize::new(0),
            idle: Notify::new(),
            retired: AtomicBool::new(false),
        }
    }

    pub fn key(&self) -> &InstanceKey {
        &self.key
    }

    pub fn number(&self) -> u32 {
        self.key.number
    }

    pub fn backend(&self) -> &str {
        &self.backend
    }

    pub fn application(&self) -> &Arc<dyn Application> {
        &self.app
    }

    pub async fn state(&self) -> InstanceState {
        self.status.read().await.state
    }

    /// Requests currently admitted and not yet finished.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub async fn snapshot(&self, host: &str) -> InstanceSnapshot {
        let status = *self.status.read().await;
        InstanceSnapshot {
            number: self.key.number,
            address: format!("{host}:{}", self.port),
            state: status.state,
            started_at: status.started_at,
        }
    }

    /// Admit one request, or refuse with `ServiceUnavailable` unless `RUNNING`.
    pub async fn admit(self: &Arc<Self>) -> Result<AdmitGuard, HarborError> {
        let status = self.status.read().await;
        if !status.state.is_serving() {
            return Err(HarborError::ServiceUnavailable(format!(
                "instance {} is {}",
                self.key, status.state
            )));
        }
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        drop(status);
        Ok(AdmitGuard {
            instance: Arc::clone(self),
        })
    }

    async fn set_state(&self, next: InstanceState, started_at: Option<DateTime<Utc>>) {
        let mut status = self.status.write().await;
        debug_assert!(
            status.state.can_transition_to(next),
            "illegal transition {} -> {next}",
            status.state
        );
        status.state = next;
        status.started_at = started_at;
    }

    fn failure(&self, error: HarborError) -> StepFailure {
        StepFailure {
            target: format!("{}#{}", self.backend, self.key.number),
            reason: error.to_string(),
        }
    }

    /// Wait up to `limit` for admitted requests to finish.
    async fn drain(&self, limit: Duration) -> bool {
        tokio::time::timeout(limit, async {
            loop {
                let idle = self.idle.notified();
                if self.in_flight() == 0 {
                    return;
                }
                idle.await;
            }
        })
        .await
        .is_ok()
    }

    async fn start(&self) -> Result<(), StepFailure> {
        let _turn = self.transition.lock().await;
        if self.retired.load(Ordering::Acquire) {
            return Err(self.failure(HarborError::NotFound(format!(
                "backend {} was removed",
                self.backend
            ))));
        }
        if self.state().await != InstanceState::Stopped {
            return Ok(());
        }

        self.set_state(InstanceState::Starting, None).await;
        match self.app.start(&self.key).await {
            Ok(()) => {
                self.set_state(InstanceState::Running, Some(Utc::now())).await;
                tracing::debug!(instance = %self.key, port = self.port, "Instance running");
                Ok(())
            }
            Err(e) => {
                self.set_state(InstanceState::Stopped, None).await;
                tracing::warn!(instance = %self.key, error = %e, "Instance failed to start");
                Err(self.failure(e))
            }
        }
    }

    async fn stop(&self, drain: Duration) -> Result<(), StepFailure> {
        let _turn = self.transition.lock().await;
        if self.state().await != InstanceState::Running {
            return Ok(());
        }

        self.set_state(InstanceState::Stopping, None).await;
        let in_flight = self.in_flight();
        if in_flight > 0 {
            tracing::debug!(instance = %self.key, in_flight, "Waiting for admitted requests");
            if !self.drain(drain).await {
                tracing::warn!(
                    instance = %self.key,
                    in_flight = self.in_flight(),
                    "Resetting with requests still in flight"
                );
            }
        }
        let reset = self.app.reset(&self.key).await;
        self.set_state(InstanceState::Stopped, None).await;

        match reset {
            Ok(()) => {
                tracing::debug!(instance = %self.key, "Instance stopped");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(instance = %self.key, error = %e, "Instance reset failed");
                Err(self.failure(e))
            }
        }
    }
}

/// Proof that a request was admitted to an instance. Dropping it ends the
/// request's in-flight accounting.
pub struct AdmitGuard {
    instance: Arc<Instance>,
}

impl AdmitGuard {
    pub fn instance(&self) -> &Arc<Instance> {
        &self.instance
    }
}

impl Drop for AdmitGuard {
    fn drop(&mut self) {
        if self.instance.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.instance.idle.notify_waiters();
        }
    }
}

/// A named group of instances sharing one configuration.
pub struct Backend {
    config: BackendConfig,
    instances: Vec<Arc<Instance>>,
}

impl Backend {
    fn new(config: BackendConfig, app: Arc<dyn Application>) -> Self {
        let instances = (0..config.instances)
            .map(|n| {
                let key = InstanceKey::new(&config.module, &config.version, n);
                let port = if config.port == 0 {
                    0
                } else {
                    config.port.saturating_add(n as u16)
                };
                Arc::new(Instance::new(&config.name, key, port, Arc::clone(&app)))
            })
            .collect();
        Self { config, instances }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    /// Sorted by instance number.
    pub fn instances(&self) -> &[Arc<Instance>] {
        &self.instances
    }

    pub fn instance(&self, number: u32) -> Option<&Arc<Instance>> {
        self.instances.get(number as usize)
    }

    pub fn serves(&self, module: &str, version: &str) -> bool {
        self.config.module == module && self.config.version == version
    }

    async fn start(&self) -> Vec<StepFailure> {
        let results =
            futures::future::join_all(self.instances.iter().map(|i| i.start())).await;
        results.into_iter().filter_map(Result::err).collect()
    }

    async fn stop(&self, drain: Duration) -> Vec<StepFailure> {
        let results =
            futures::future::join_all(self.instances.iter().map(|i| i.stop(drain))).await;
        results.into_iter().filter_map(Result::err).collect()
    }

    /// Refuse every later start. A start already holding an instance's
    /// transition lock finishes first, and the following stop undoes it.
    fn retire(&self) {
        for instance in &self.instances {
            instance.retired.store(true, Ordering::Release);
        }
    }

    pub async fn state(&self, host: &str) -> BackendState {
        let mut instances = Vec::with_capacity(self.instances.len());
        for instance in &self.instances {
            instances.push(instance.snapshot(host).await);
        }
        BackendState {
            name: self.config.name.clone(),
            address: format!("{host}:{}", self.config.port),
            state: InstanceState::aggregate(instances.iter().map(|i| i.state)),
            instances,
        }
    }
}

/// Owns every hosted backend and drives their instance lifecycles.
///
/// # Threading
///
/// `BackendManager` is `Send + Sync` and is typically wrapped in `Arc`.
/// The registry sits behind an `RwLock`; transitions on different instances
/// run concurrently while each instance serializes its own.
pub struct BackendManager {
    backends: RwLock<HashMap<String, Arc<Backend>>>,
    stop_policy: StopPolicy,
    drain_timeout: Duration,
}

impl BackendManager {
    pub fn new(stop_policy: StopPolicy) -> Self {
        Self {
            backends: RwLock::new(HashMap::new()),
            stop_policy,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }

    /// Bound on how long a stopping instance waits for admitted requests.
    pub fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }

    pub fn stop_policy(&self) -> StopPolicy {
        self.stop_policy
    }

    /// Create a backend with all of its instances `STOPPED`.
    pub async fn register_backend(
        &self,
        config: BackendConfig,
        app: Arc<dyn Application>,
    ) -> Result<(), HarborError> {
        config.validate()?;
        let mut guard = self.backends.write().await;
        if guard.contains_key(&config.name) {
            return Err(HarborError::AlreadyExists(format!(
                "backend {}",
                config.name
            )));
        }
        tracing::info!(
            backend = %config.name,
            module = %config.module,
            version = %config.version,
            instances = config.instances,
            "Backend registered"
        );
        guard.insert(config.name.clone(), Arc::new(Backend::new(config, app)));
        Ok(())
    }

    /// Unregister a backend, then stop it with its instances.
    ///
    /// The entry leaves the registry before any instance stops, so no later
    /// start can find it. The backend is gone even when stopping reports
    /// failures; those are still returned under the strict policy.
    pub async fn remove_backend(&self, name: &str) -> Result<(), HarborError> {
        let backend = self
            .backends
            .write()
            .await
            .remove(name)
            .ok_or_else(|| HarborError::NotFound(format!("backend {name}")))?;
        backend.retire();
        let stopped = self.finish_stop(
            &format!("removeBackend({name})"),
            backend.stop(self.drain_timeout).await,
        );
        tracing::info!(backend = name, "Backend removed");
        stopped
    }

    /// Backend configurations sorted by name.
    pub async fn list_backends(&self) -> Vec<BackendConfig> {
        let guard = self.backends.read().await;
        let mut list: Vec<_> = guard.values().map(|b| b.config.clone()).collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        list
    }

    pub async fn backend(&self, name: &str) -> Result<Arc<Backend>, HarborError> {
        self.backends
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| HarborError::NotFound(format!("backend {name}")))
    }

    /// Bring every `STOPPED` instance of `name` to `RUNNING`.
    pub async fn start_backend(&self, name: &str) -> Result<(), HarborError> {
        let backend = self.backend(name).await?;
        let failures = backend.start().await;
        if !failures.is_empty() {
            return Err(HarborError::PartialFailure {
                operation: format!("startBackend({name})"),
                failures,
            });
        }
        tracing::info!(backend = name, "Backend started");
        Ok(())
    }

    /// Bring every `RUNNING` instance of `name` to `STOPPED`.
    pub async fn stop_backend(&self, name: &str) -> Result<(), HarborError> {
        let backend = self.backend(name).await?;
        let failures = backend.stop(self.drain_timeout).await;
        self.finish_stop(&format!("stopBackend({name})"), failures)?;
        tracing::info!(backend = name, "Backend stopped");
        Ok(())
    }

    pub async fn start_all(&self) -> Result<(), HarborError> {
        let backends = self.snapshot_backends().await;
        let runs = backends.iter().map(|b| b.start());
        let failures: Vec<_> = futures::future::join_all(runs)
            .await
            .into_iter()
            .flatten()
            .collect();
        if !failures.is_empty() {
            return Err(HarborError::PartialFailure {
                operation: "startAll".into(),
                failures,
            });
        }
        tracing::info!(backends = backends.len(), "All backends started");
        Ok(())
    }

    pub async fn stop_all(&self) -> Result<(), HarborError> {
        let backends = self.snapshot_backends().await;
        let runs = backends.iter().map(|b| b.stop(self.drain_timeout));
        let failures: Vec<_> = futures::future::join_all(runs)
            .await
            .into_iter()
            .flatten()
            .collect();
        self.finish_stop("stopAll", failures)?;
        tracing::info!(backends = backends.len(), "All backends stopped");
        Ok(())
    }

    /// Read-only view of every backend, keyed by name.
    pub async fn get_state(&self, host: &str) -> BTreeMap<String, BackendState> {
        let mut states = BTreeMap::new();
        for backend in self.snapshot_backends().await {
            states.insert(backend.config.name.clone(), backend.state(host).await);
        }
        states
    }

    async fn snapshot_backends(&self) -> Vec<Arc<Backend>> {
        self.backends.read().await.values().cloned().collect()
    }

    fn finish_stop(&self, operation: &str, failures: Vec<StepFailure>) -> Result<(), HarborError> {
        if failures.is_empty() {
            return Ok(());
        }
        match self.stop_policy {
            StopPolicy::Strict => Err(HarborError::PartialFailure {
                operation: operation.to_string(),
                failures,
            }),
            StopPolicy::Lenient => {
                for failure in &failures {
                    tracing::warn!(
                        operation,
                        instance = %failure.target,
                        reason = %failure.reason,
                        "Ignoring reset failure under lenient stop policy"
                    );
                }
                Ok(())
            }
        }
    }
}
