//! API call proxy for Harbor.
//!
//! Application code reaches backend services through an [`ApiProxy`]. Every
//! call is framed as (service, method, payload), carries a deadline resolved
//! by the [`DeadlinePolicy`], and travels over a [`Transport`]:
//!
//! - [`HttpTransport`] posts to a remote API server.
//! - [`LoopbackTransport`] dispatches to in-process [`ApiService`]s.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use harbor_api::{ApiProxy, LoopbackTransport};
//!
//! # async fn run() -> Result<(), harbor_core::HarborError> {
//! let proxy = ApiProxy::new(Arc::new(LoopbackTransport::with_echo()));
//! let reply = proxy.call("echo", "Echo", vec![1, 2, 3, 4], Some(60.0)).await?;
//! assert_eq!(reply, vec![1, 2, 3, 4]);
//! # Ok(())
//! # }
//! ```

pub mod deadline;
pub mod loopback;
pub mod metrics;
pub mod proxy;
pub mod transport;
pub mod wire;

pub use deadline::DeadlinePolicy;
pub use loopback::{ApiService, EchoService, LoopbackTransport, ServiceFault};
pub use metrics::{CallMetrics, CallMetricsSnapshot, LoggingMetricsBackend, MetricsBackend};
pub use proxy::{ApiProxy, CallRequest, PendingCall, ProxyOptions};
pub use transport::{HttpTransport, Transport, WireCall, WireReply};
