use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use harbor_api::ApiProxy;
use harbor_core::{Capabilities, ExecutionContext, HarborError, Request, Response};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::app::AppContext;
use crate::lifecycle::{AdmitGuard, Backend, BackendManager};

/// The version and backend currently serving a module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleRoute {
    pub version: String,
    pub backend: String,
}

impl ModuleRoute {
    pub fn new(version: impl Into<String>, backend: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            backend: backend.into(),
        }
    }
}

/// Where an inbound request wants to go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteKey {
    pub module: String,
    /// `None` lets the router pick any running instance.
    pub instance: Option<u32>,
    pub host: String,
}

impl RouteKey {
    pub fn new(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            instance: None,
            host: String::new(),
        }
    }

    pub fn with_instance(mut self, number: u32) -> Self {
        self.instance = Some(number);
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Parse `<instance>.<module>.<domain>` or `<module>.<domain>`.
    ///
    /// A port suffix is ignored. IP literals and single-label hosts carry no
    /// module and yield `None`.
    pub fn from_host(host: &str) -> Option<Self> {
        let name = match host.rsplit_once(':') {
            Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
            _ => host,
        };
        if name.parse::<IpAddr>().is_ok() {
            return None;
        }

        let labels: Vec<&str> = name.split('.').collect();
        if labels.len() < 2 || labels.iter().any(|l| l.is_empty()) {
            return None;
        }

        let key = match labels[0].parse::<u32>() {
            Ok(number) if labels.len() >= 3 => Self::new(labels[1]).with_instance(number),
            _ => Self::new(labels[0]),
        };
        Some(key.with_host(host))
    }
}

struct RouteEntry {
    route: ModuleRoute,
    cursor: AtomicUsize,
}

/// Maps modules to their serving version and picks live instances.
pub struct Router {
    manager: Arc<BackendManager>,
    /// module → current route
    routes: RwLock<HashMap<String, Arc<RouteEntry>>>,
}

impl Router {
    pub fn new(manager: Arc<BackendManager>) -> Self {
        Self {
            manager,
            routes: RwLock::new(HashMap::new()),
        }
    }

    /// Install the route for `module`. A module has at most one route.
    pub async fn add_route(&self, module: &str, route: ModuleRoute) -> Result<(), HarborError> {
        let backend = self.manager.backend(&route.backend).await?;
        if !backend.serves(module, &route.version) {
            return Err(HarborError::PreconditionFailed(format!(
                "backend {} does not serve {module} version {}",
                route.backend, route.version
            )));
        }

        let mut guard = self.routes.write().await;
        if let Some(existing) = guard.get(module) {
            return Err(HarborError::AlreadyExists(format!(
                "route for {module} (version {})",
                existing.route.version
            )));
        }
        tracing::info!(
            module,
            version = %route.version,
            backend = %route.backend,
            "Route added"
        );
        guard.insert(
            module.to_string(),
            Arc::new(RouteEntry {
                route,
                cursor: AtomicUsize::new(0),
            }),
        );
        Ok(())
    }

    /// Remove `module`'s route, which must equal `expected`.
    pub async fn remove_route(
        &self,
        module: &str,
        expected: &ModuleRoute,
    ) -> Result<(), HarborError> {
        let mut guard = self.routes.write().await;
        let Some(existing) = guard.get(module) else {
            return Err(HarborError::NotFound(format!("route for {module}")));
        };
        if existing.route != *expected {
            return Err(HarborError::PreconditionFailed(format!(
                "route for {module} is version {} on {}, not version {} on {}",
                existing.route.version,
                existing.route.backend,
                expected.version,
                expected.backend
            )));
        }
        guard.remove(module);
        tracing::info!(module, version = %expected.version, "Route removed");
        Ok(())
    }

    pub async fn current_route(&self, module: &str) -> Option<ModuleRoute> {
        self.routes
            .read()
            .await
            .get(module)
            .map(|e| e.route.clone())
    }

    pub async fn routes(&self) -> BTreeMap<String, ModuleRoute> {
        self.routes
            .read()
            .await
            .iter()
            .map(|(module, e)| (module.clone(), e.route.clone()))
            .collect()
    }

    /// Resolve `key` to one running instance and admit the request to it.
    pub async fn resolve(&self, key: &RouteKey) -> Result<AdmitGuard, HarborError> {
        let entry = self
            .routes
            .read()
            .await
            .get(&key.module)
            .cloned()
            .ok_or_else(|| HarborError::NotFound(format!("no route for module {}", key.module)))?;
        let backend = self.manager.backend(&entry.route.backend).await?;

        match key.instance {
            Some(number) => {
                let instance = backend.instance(number).ok_or_else(|| {
                    HarborError::NotFound(format!(
                        "instance {number} of {} (backend has {})",
                        key.module,
                        backend.instances().len()
                    ))
                })?;
                instance.admit().await
            }
            None => Self::pick_running(&backend, &entry).await,
        }
    }

    /// Round-robin over instances, skipping any that are not `RUNNING`.
    async fn pick_running(backend: &Backend, entry: &RouteEntry) -> Result<AdmitGuard, HarborError> {
        let instances = backend.instances();
        let start = entry.cursor.fetch_add(1, Ordering::Relaxed);
        for offset in 0..instances.len() {
            let instance = &instances[(start + offset) % instances.len()];
            if let Ok(guard) = instance.admit().await {
                return Ok(guard);
            }
        }
        Err(HarborError::ServiceUnavailable(format!(
            "no running instance of backend {}",
            backend.name()
        )))
    }

    /// Resolve `key` and hand `request` to the chosen instance.
    ///
    /// Caller-supplied routing attributes are stripped first; the instance
    /// key reaches the application only through [`AppContext::instance`].
    pub async fn forward(
        &self,
        exec: ExecutionContext,
        api: ApiProxy,
        capabilities: Arc<Capabilities>,
        key: &RouteKey,
        mut request: Request,
        response: &mut Response,
    ) -> Result<(), HarborError> {
        let admitted = self.resolve(key).await?;
        let stripped = request.strip_routing_attributes();
        if stripped > 0 {
            tracing::debug!(stripped, "Dropped caller-supplied routing attributes");
        }

        let instance = admitted.instance();
        tracing::debug!(
            instance = %instance.key(),
            method = %request.method,
            path = %request.path,
            "Forwarding request"
        );
        let ctx = AppContext::new(exec, api, instance.key().clone(), capabilities);
        instance.application().handle(&ctx, &request, response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_with_instance() {
        let key = RouteKey::from_host("2.worker.apps.example.com").unwrap();
        assert_eq!(key.module, "worker");
        assert_eq!(key.instance, Some(2));
        assert_eq!(key.host, "2.worker.apps.example.com");
    }

    #[test]
    fn host_without_instance() {
        let key = RouteKey::from_host("worker.localhost:8080").unwrap();
        assert_eq!(key.module, "worker");
        assert_eq!(key.instance, None);
    }

    #[test]
    fn numeric_module_needs_a_domain() {
        let key = RouteKey::from_host("7.localhost").unwrap();
        assert_eq!(key.module, "7");
        assert_eq!(key.instance, None);
    }

    #[test]
    fn hosts_without_module() {
        assert!(RouteKey::from_host("localhost").is_none());
        assert!(RouteKey::from_host("127.0.0.1:8080").is_none());
        assert!(RouteKey::from_host("a..b").is_none());
    }
}
