//! Hosting runtime for Harbor.
//!
//! A [`Host`] owns the [`BackendManager`] (instance lifecycles), the
//! [`Router`] (module → version → live instance) and the request
//! [`Supervisor`](harbor_core::Supervisor). A listener hands it a parsed
//! request plus a [`RouteKey`] and gets back a response.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use harbor_core::Request;
//! use harbor_runtime::{HarborConfig, Host, RouteKey, StaticApplication};
//!
//! # async fn run() -> Result<(), harbor_core::HarborError> {
//! let config = HarborConfig::from_toml_str(r#"
//! [[backends]]
//! name = "web"
//! module = "default"
//! version = "1"
//! instances = 2
//!
//! [[routes]]
//! module = "default"
//! version = "1"
//! backend = "web"
//! "#)?;
//!
//! let host = Host::builder(config)
//!     .application("web", Arc::new(StaticApplication::new(200, "hello")))
//!     .build()
//!     .await?;
//! host.start().await?;
//!
//! let response = host.handle(&RouteKey::new("default"), Request::new("GET", "/")).await;
//! assert_eq!(response.body, b"hello");
//!
//! host.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod app;
pub mod config;
pub mod host;
pub mod lifecycle;
pub mod router;
pub mod sessions;

pub use app::{AppContext, Application, StaticApplication};
pub use config::{BackendConfig, HarborConfig, RouteConfig, StopPolicy};
pub use host::{Host, HostBuilder};
pub use lifecycle::{AdmitGuard, Backend, BackendManager, Instance};
pub use router::{ModuleRoute, RouteKey, Router};
pub use sessions::{FileSessionStore, MemorySessionStore, SessionStore};
