//! Lifecycle and routing behavior through the `Host` facade.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use harbor_core::{HarborError, InstanceKey, InstanceState, Request, Response};
use harbor_runtime::{
    AppContext, Application, HarborConfig, Host, MemorySessionStore, ModuleRoute, RouteKey,
    SessionStore,
};

type HookFuture<'a> = Pin<Box<dyn Future<Output = Result<(), HarborError>> + Send + 'a>>;

/// Records hook calls and what each routed request looked like.
#[derive(Default)]
struct Recorder {
    starts: AtomicU32,
    resets: AtomicU32,
    fail_start: Option<u32>,
    fail_reset: Option<u32>,
    handle_delay: Option<Duration>,
    seen: Mutex<Vec<(u32, BTreeMap<String, String>)>>,
}

impl Recorder {
    fn seen_instances(&self) -> Vec<u32> {
        self.seen.lock().unwrap().iter().map(|(n, _)| *n).collect()
    }
}

impl Application for Recorder {
    fn handle<'a>(
        &'a self,
        ctx: &'a AppContext,
        request: &'a Request,
        response: &'a mut Response,
    ) -> HookFuture<'a> {
        Box::pin(async move {
            if let Some(delay) = self.handle_delay {
                tokio::time::sleep(delay).await;
            }
            let number = ctx.instance().number;
            self.seen
                .lock()
                .unwrap()
                .push((number, request.attributes.clone()));
            response.body = number.to_string().into_bytes();
            Ok(())
        })
    }

    fn start<'a>(&'a self, instance: &'a InstanceKey) -> HookFuture<'a> {
        Box::pin(async move {
            self.starts.fetch_add(1, Ordering::SeqCst);
            if self.fail_start == Some(instance.number) {
                return Err(HarborError::PreconditionFailed("warmup failed".into()));
            }
            Ok(())
        })
    }

    fn reset<'a>(&'a self, instance: &'a InstanceKey) -> HookFuture<'a> {
        Box::pin(async move {
            self.resets.fetch_add(1, Ordering::SeqCst);
            if self.fail_reset == Some(instance.number) {
                return Err(HarborError::PreconditionFailed("state not released".into()));
            }
            Ok(())
        })
    }
}

async fn host_with(app: Arc<dyn Application>, instances: u32, policy: &str) -> Host {
    let config = HarborConfig::from_toml_str(&format!(
        r#"
[lifecycle]
stop_policy = "{policy}"

[[backends]]
name = "web"
module = "default"
version = "v1"
instances = {instances}
port = 8080

[[routes]]
module = "default"
version = "v1"
backend = "web"
"#
    ))
    .unwrap();
    Host::builder(config)
        .application("web", app)
        .build()
        .await
        .unwrap()
}

fn any_instance() -> RouteKey {
    RouteKey::new("default")
}

#[tokio::test]
async fn start_brings_every_instance_to_running() {
    let app = Arc::new(Recorder::default());
    let host = host_with(app.clone(), 3, "strict").await;

    host.manager().start_backend("web").await.unwrap();

    let states = host.manager().get_state("localhost").await;
    let state = &states["web"];
    assert_eq!(state.state, InstanceState::Running);
    assert_eq!(state.instances.len(), 3);
    assert!(state.instances.iter().all(|i| i.state == InstanceState::Running));

    let json = serde_json::to_value(state).unwrap();
    assert_eq!(json["state"], "RUNNING");
    assert_eq!(json["instances"][2]["address"], "localhost:8082");
}

#[tokio::test]
async fn starting_twice_is_the_same_as_once() {
    let app = Arc::new(Recorder::default());
    let host = host_with(app.clone(), 2, "strict").await;

    host.manager().start_backend("web").await.unwrap();
    let first = host.manager().get_state("h").await;
    host.manager().start_backend("web").await.unwrap();
    let second = host.manager().get_state("h").await;

    assert_eq!(app.starts.load(Ordering::SeqCst), 2);
    assert_eq!(first, second);
}

#[tokio::test]
async fn stopped_backend_refuses_requests() {
    let app = Arc::new(Recorder::default());
    let host = host_with(app.clone(), 2, "strict").await;
    host.start().await.unwrap();

    let mut response = Response::default();
    host.dispatch(&any_instance(), Request::new("GET", "/"), &mut response)
        .await
        .unwrap();

    host.manager().stop_backend("web").await.unwrap();

    let states = host.manager().get_state("h").await;
    let state = &states["web"];
    assert!(state.instances.iter().all(|i| i.state == InstanceState::Stopped));

    let mut response = Response::default();
    let err = host
        .dispatch(&any_instance(), Request::new("GET", "/"), &mut response)
        .await
        .unwrap_err();
    assert!(matches!(err, HarborError::ServiceUnavailable(_)));

    let rendered = host.handle(&any_instance(), Request::new("GET", "/")).await;
    assert_eq!(rendered.status, 503);
    assert_eq!(app.seen_instances().len(), 1);
}

#[tokio::test]
async fn failed_reset_is_reported_under_strict_policy() {
    let app = Arc::new(Recorder {
        fail_reset: Some(1),
        ..Recorder::default()
    });
    let host = host_with(app.clone(), 3, "strict").await;
    host.start().await.unwrap();

    let err = host.manager().stop_backend("web").await.unwrap_err();
    match err {
        HarborError::PartialFailure { failures, .. } => {
            assert_eq!(failures.len(), 1);
            assert_eq!(failures[0].target, "web#1");
        }
        other => panic!("expected PartialFailure, got {other:?}"),
    }

    // The failing instance still ends up stopped.
    let states = host.manager().get_state("h").await;
    let state = &states["web"];
    assert!(state.instances.iter().all(|i| i.state == InstanceState::Stopped));
    assert_eq!(app.resets.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn failed_reset_is_logged_under_lenient_policy() {
    let app = Arc::new(Recorder {
        fail_reset: Some(0),
        ..Recorder::default()
    });
    let host = host_with(app, 2, "lenient").await;
    host.start().await.unwrap();

    host.manager().stop_backend("web").await.unwrap();
    assert_eq!(
        host.manager().get_state("h").await["web"].state,
        InstanceState::Stopped
    );
}

#[tokio::test]
async fn failed_start_leaves_instance_stopped() {
    let app = Arc::new(Recorder {
        fail_start: Some(1),
        ..Recorder::default()
    });
    let host = host_with(app.clone(), 3, "strict").await;

    let err = host.manager().start_backend("web").await.unwrap_err();
    assert!(matches!(err, HarborError::PartialFailure { .. }));

    let states = host.manager().get_state("h").await;
    let state = &states["web"];
    let per_instance: Vec<_> = state.instances.iter().map(|i| i.state).collect();
    assert_eq!(
        per_instance,
        vec![
            InstanceState::Running,
            InstanceState::Stopped,
            InstanceState::Running
        ]
    );
    assert_eq!(state.state, InstanceState::Running);
}

#[tokio::test]
async fn round_robin_skips_instances_that_are_not_running() {
    let app = Arc::new(Recorder {
        fail_start: Some(1),
        ..Recorder::default()
    });
    let host = host_with(app.clone(), 3, "strict").await;
    let _ = host.manager().start_backend("web").await;

    for _ in 0..9 {
        let response = host.handle(&any_instance(), Request::new("GET", "/")).await;
        assert_eq!(response.status, 200);
    }

    let seen = app.seen_instances();
    assert_eq!(seen.len(), 9);
    assert!(!seen.contains(&1));
    assert!(seen.contains(&0));
    assert!(seen.contains(&2));
}

#[tokio::test]
async fn explicit_instance_must_exist_and_run() {
    let app = Arc::new(Recorder {
        fail_start: Some(1),
        ..Recorder::default()
    });
    let host = host_with(app.clone(), 3, "strict").await;
    let _ = host.manager().start_backend("web").await;

    let ok = host
        .handle(&any_instance().with_instance(2), Request::new("GET", "/"))
        .await;
    assert_eq!(ok.body, b"2");

    let mut response = Response::default();
    let stopped = host
        .dispatch(
            &any_instance().with_instance(1),
            Request::new("GET", "/"),
            &mut response,
        )
        .await;
    assert!(matches!(stopped, Err(HarborError::ServiceUnavailable(_))));

    let missing = host
        .handle(&any_instance().with_instance(7), Request::new("GET", "/"))
        .await;
    assert_eq!(missing.status, 404);
}

#[tokio::test]
async fn routing_attributes_never_reach_the_application() {
    let app = Arc::new(Recorder::default());
    let host = host_with(app.clone(), 1, "strict").await;
    host.start().await.unwrap();

    let request = Request::new("POST", "/submit")
        .with_header("X-Trace", "abc")
        .with_attribute("harbor.route.instance", "9.v1.default")
        .with_attribute("app.tag", "kept");
    let response = host.handle(&any_instance(), request).await;
    assert_eq!(response.status, 200);

    let seen = app.seen.lock().unwrap();
    let (_, attributes) = &seen[0];
    assert_eq!(attributes.get("app.tag").map(String::as_str), Some("kept"));
    assert!(!attributes.keys().any(|k| k.starts_with("harbor.route.")));
}

#[tokio::test]
async fn admitted_request_finishes_while_backend_stops() {
    let app = Arc::new(Recorder {
        handle_delay: Some(Duration::from_millis(50)),
        ..Recorder::default()
    });
    let host = host_with(app.clone(), 1, "strict").await;
    host.start().await.unwrap();

    let key = any_instance();
    let mut response = Response::default();
    let (served, stopped) = tokio::join!(
        host.dispatch(&key, Request::new("GET", "/"), &mut response),
        async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            host.manager().stop_backend("web").await
        }
    );
    served.unwrap();
    stopped.unwrap();
    assert_eq!(response.body, b"0");

    let after = host.handle(&any_instance(), Request::new("GET", "/")).await;
    assert_eq!(after.status, 503);
}

#[tokio::test]
async fn route_table_rules() {
    let app = Arc::new(Recorder::default());
    let host = host_with(app, 1, "strict").await;
    let router = host.router();

    let current = router.current_route("default").await.unwrap();
    assert_eq!(current, ModuleRoute::new("v1", "web"));

    let dup = router.add_route("default", ModuleRoute::new("v1", "web")).await;
    assert!(matches!(dup, Err(HarborError::AlreadyExists(_))));

    let wrong_version = router.add_route("other", ModuleRoute::new("v2", "web")).await;
    assert!(matches!(wrong_version, Err(HarborError::PreconditionFailed(_))));

    let no_backend = router.add_route("other", ModuleRoute::new("v1", "ghost")).await;
    assert!(matches!(no_backend, Err(HarborError::NotFound(_))));

    let mismatch = router
        .remove_route("default", &ModuleRoute::new("v2", "web"))
        .await;
    assert!(matches!(mismatch, Err(HarborError::PreconditionFailed(_))));

    router
        .remove_route("default", &current)
        .await
        .unwrap();
    assert!(router.routes().await.is_empty());
    assert!(matches!(
        router.remove_route("default", &current).await,
        Err(HarborError::NotFound(_))
    ));

    let unrouted = host.handle(&any_instance(), Request::new("GET", "/")).await;
    assert_eq!(unrouted.status, 404);
}

/// Fires ten echo calls and reports how many units the request still owns.
struct FanOut;

impl Application for FanOut {
    fn handle<'a>(
        &'a self,
        ctx: &'a AppContext,
        _request: &'a Request,
        response: &'a mut Response,
    ) -> HookFuture<'a> {
        Box::pin(async move {
            let pending: Vec<_> = (0..10)
                .map(|_| ctx.call_async("echo", "Echo", Vec::new(), None))
                .collect();
            for reply in futures::future::join_all(pending).await {
                reply?;
            }
            response.set_header("X-Units", ctx.execution().active_units().to_string());
            Ok(())
        })
    }
}

#[tokio::test]
async fn fan_out_leaves_only_the_handler() {
    let host = host_with(Arc::new(FanOut), 1, "strict").await;
    host.start().await.unwrap();

    let mut response = Response::default();
    let (served, report) = host
        .dispatch_reported(&any_instance(), Request::new("GET", "/"), &mut response)
        .await;
    served.unwrap();
    assert_eq!(response.header("X-Units"), Some("1"));
    assert_eq!(report.units_at_return, 1);
    assert!(report.is_clean());
    assert_eq!(host.api().metrics().succeeded, 10);
}

/// Leaves a long unit behind, then fails hard.
struct Crashes;

impl Application for Crashes {
    fn handle<'a>(
        &'a self,
        ctx: &'a AppContext,
        _request: &'a Request,
        _response: &'a mut Response,
    ) -> HookFuture<'a> {
        Box::pin(async move {
            ctx.spawn(tokio::time::sleep(Duration::from_secs(30)));
            tokio::task::yield_now().await;
            let empty: Vec<u32> = Vec::new();
            let _ = empty[0];
            Ok(())
        })
    }
}

#[tokio::test]
async fn crashed_handler_releases_its_instance() {
    let host = Arc::new(host_with(Arc::new(Crashes), 1, "strict").await);
    host.start().await.unwrap();

    let crashed = tokio::spawn({
        let host = Arc::clone(&host);
        async move { host.handle(&any_instance(), Request::new("GET", "/")).await }
    })
    .await;
    assert!(crashed.unwrap_err().is_panic());

    assert_eq!(host.supervisor().in_flight(), 0);
    let backend = host.manager().backend("web").await.unwrap();
    assert_eq!(backend.instance(0).unwrap().in_flight(), 0);
    tokio::time::timeout(Duration::from_secs(1), host.manager().stop_backend("web"))
        .await
        .unwrap()
        .unwrap();
}

/// Counts visits per session cookie when a session store is available.
struct Visits;

impl Application for Visits {
    fn handle<'a>(
        &'a self,
        ctx: &'a AppContext,
        request: &'a Request,
        response: &'a mut Response,
    ) -> HookFuture<'a> {
        Box::pin(async move {
            let Some(store) = ctx.capability::<dyn SessionStore>() else {
                response.body = b"no-sessions".to_vec();
                return Ok(());
            };
            let id = request.header("Cookie").unwrap_or("anonymous");
            let mut record = match store.load(id).await? {
                Some(record) => record,
                None => store.new_record(),
            };
            let visits = record.get::<u32>("visits")?.unwrap_or(0) + 1;
            record.set("visits", &visits)?;
            store.save(id, &record).await?;
            response.body = visits.to_string().into_bytes();
            Ok(())
        })
    }
}

#[tokio::test]
async fn session_store_is_an_optional_capability() {
    let without = host_with(Arc::new(Visits), 1, "strict").await;
    without.start().await.unwrap();
    let response = without.handle(&any_instance(), Request::new("GET", "/")).await;
    assert_eq!(response.body, b"no-sessions");

    let config = HarborConfig::from_toml_str(
        r#"
[[backends]]
name = "web"

[[routes]]
module = "default"
version = "1"
backend = "web"
"#,
    )
    .unwrap();
    let with = Host::builder(config)
        .application("web", Arc::new(Visits))
        .capability::<dyn SessionStore>(Arc::new(MemorySessionStore::new()))
        .build()
        .await
        .unwrap();
    with.start().await.unwrap();

    for expected in ["1", "2", "3"] {
        let request = Request::new("GET", "/").with_header("Cookie", "s-1");
        let response = with.handle(&any_instance(), request).await;
        assert_eq!(response.body, expected.as_bytes());
    }
    with.shutdown().await.unwrap();
}

#[tokio::test]
async fn configured_sessions_expire_and_get_swept() {
    let dir = tempfile::tempdir().unwrap();
    let config = HarborConfig::from_toml_str(&format!(
        r#"
[sessions]
enabled = true
dir = "{}"
ttl_secs = 600
purge_interval_secs = 0.02

[[backends]]
name = "web"
"#,
        dir.path().display()
    ))
    .unwrap();
    let host = Host::builder(config)
        .application("web", Arc::new(Visits))
        .build()
        .await
        .unwrap();

    let store = host.capabilities().get::<dyn SessionStore>().unwrap();
    assert_eq!(store.backend_name(), "file");
    let before = Utc::now();
    let fresh = store.new_record();
    assert!(fresh.expires_at() >= before + chrono::Duration::seconds(600));

    let mut stale = store.new_record();
    stale.extend_to(Utc::now() - chrono::Duration::seconds(1));
    store.save("stale", &stale).await.unwrap();
    store.save("fresh", &fresh).await.unwrap();

    tokio::time::timeout(Duration::from_secs(2), async {
        while std::fs::read_dir(dir.path()).unwrap().count() > 1 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(store.load("fresh").await.unwrap(), Some(fresh));

    host.shutdown().await.unwrap();
    assert!(host.supervisor().shared_pool().is_empty());
}

#[tokio::test]
async fn missing_application_binding_is_a_config_error() {
    let config = HarborConfig::from_toml_str("[[backends]]\nname = \"web\"\n").unwrap();
    let err = Host::builder(config).build().await.err().unwrap();
    assert!(matches!(err, HarborError::Config(_)));
}
