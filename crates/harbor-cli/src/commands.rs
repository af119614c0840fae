use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use harbor_api::{ApiProxy, HttpTransport, LoopbackTransport, Transport};
use harbor_core::Request;
use harbor_runtime::{HarborConfig, Host, RouteKey, StaticApplication};

fn load_config(path: &Path) -> Result<HarborConfig> {
    HarborConfig::from_file(path).with_context(|| format!("loading {}", path.display()))
}

/// Host whose backends all answer with a fixed 200.
async fn probe_host(config: HarborConfig) -> Result<Host> {
    let mut builder = Host::builder(config.clone());
    for backend in &config.backends {
        let body = format!("{} ok", backend.name);
        builder = builder.application(&backend.name, Arc::new(StaticApplication::new(200, body)));
    }
    Ok(builder.build().await?)
}

pub async fn backends(config_path: &Path) -> Result<()> {
    let host = probe_host(load_config(config_path)?).await?;
    let listing = serde_json::json!({
        "backends": host.manager().list_backends().await,
        "routes": host.router().routes().await,
    });
    println!("{}", serde_json::to_string_pretty(&listing)?);
    Ok(())
}

pub async fn check(config_path: &Path, host_name: &str) -> Result<()> {
    let host = probe_host(load_config(config_path)?).await?;
    let mut failures = 0;

    if let Err(e) = host.start().await {
        tracing::error!(error = %e, "Start failed");
        failures += 1;
    }
    let state = host.manager().get_state(host_name).await;
    println!("{}", serde_json::to_string_pretty(&state)?);

    for (module, route) in host.router().routes().await {
        let key = RouteKey::new(&module).with_host(host_name);
        let response = host.handle(&key, Request::new("GET", "/_harbor/check")).await;
        println!(
            "{module}\tversion={}\tbackend={}\tstatus={}\tinstance={}",
            route.version,
            route.backend,
            response.status,
            response.header("X-Harbor-Instance").unwrap_or("-")
        );
        if response.status != 200 {
            failures += 1;
        }
    }

    host.shutdown().await.context("stopping backends")?;
    if failures > 0 {
        bail!("{failures} check(s) failed");
    }
    Ok(())
}

pub async fn echo(endpoint: Option<String>, deadline: f64, payload: Vec<u8>) -> Result<()> {
    let transport: Arc<dyn Transport> = match endpoint {
        Some(url) => Arc::new(HttpTransport::new(url)),
        None => Arc::new(LoopbackTransport::with_echo()),
    };
    tracing::info!(transport = transport.name(), deadline, "Running echo self-test");
    let proxy = ApiProxy::new(transport);

    let reply = proxy
        .call("echo", "Echo", payload.clone(), Some(deadline))
        .await
        .context("echo call failed")?;
    let matches = reply == payload;

    let report = serde_json::json!({
        "sent": payload,
        "reply": reply,
        "matches": matches,
        "metrics": proxy.metrics(),
    });
    println!("{report}");
    if !matches {
        bail!("echo reply differs from the payload sent");
    }
    Ok(())
}
