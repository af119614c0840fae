use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use harbor_core::HarborError;

use crate::deadline;
use crate::wire::{CONTENT_TYPE, HEADER_DEADLINE, HEADER_RPC_ENDPOINT, HEADER_RPC_METHOD};

/// One framed call on its way to the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireCall {
    /// Encoded `RemoteRequest`.
    pub body: Vec<u8>,
    pub content_type: String,
    pub rpc_endpoint: String,
    pub rpc_method: String,
    pub deadline: Duration,
}

/// The backend's reply, still encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireReply {
    pub content_type: String,
    /// Encoded `RemoteResponse`.
    pub body: Vec<u8>,
}

/// Moves framed calls to the API backend and back.
///
/// Implementations do not interpret the body. Uses Pin<Box<dyn Future>>
/// so the proxy can hold an `Arc<dyn Transport>`.
pub trait Transport: Send + Sync {
    fn round_trip<'a>(
        &'a self,
        call: &'a WireCall,
    ) -> Pin<Box<dyn Future<Output = Result<WireReply, HarborError>> + Send + 'a>>;

    /// Transport name for logging.
    fn name(&self) -> &str;
}

/// Talks to an API server over HTTP.
pub struct HttpTransport {
    http: reqwest::Client,
    url: String,
}

impl HttpTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            url: url.into(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Transport for HttpTransport {
    fn round_trip<'a>(
        &'a self,
        call: &'a WireCall,
    ) -> Pin<Box<dyn Future<Output = Result<WireReply, HarborError>> + Send + 'a>> {
        Box::pin(async move {
            let resp = self
                .http
                .post(&self.url)
                .header(HEADER_RPC_ENDPOINT, &call.rpc_endpoint)
                .header(HEADER_RPC_METHOD, &call.rpc_method)
                .header(reqwest::header::CONTENT_TYPE, &call.content_type)
                .header(HEADER_DEADLINE, deadline::header_value(call.deadline))
                .timeout(call.deadline)
                .body(call.body.clone())
                .send()
                .await
                .map_err(|e| {
                    if e.is_timeout() {
                        HarborError::DeadlineExceeded {
                            call: format!("POST {}", self.url),
                            elapsed_ms: call.deadline.as_millis() as u64,
                        }
                    } else {
                        HarborError::Transport(format!("HTTP request failed: {e}"))
                    }
                })?;

            if !resp.status().is_success() {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                return Err(HarborError::Transport(format!(
                    "API server returned {status}: {body}"
                )));
            }

            let content_type = resp
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string();

            let body = resp
                .bytes()
                .await
                .map_err(|e| HarborError::Transport(format!("Failed to read response: {e}")))?;

            Ok(WireReply {
                content_type,
                body: body.to_vec(),
            })
        })
    }

    fn name(&self) -> &str {
        "http"
    }
}

/// Check that a reply carries the payload encoding we sent.
pub(crate) fn expect_octet_stream(reply: &WireReply) -> Result<(), HarborError> {
    let essence = reply
        .content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim();
    if essence.eq_ignore_ascii_case(CONTENT_TYPE) {
        Ok(())
    } else {
        Err(HarborError::Transport(format!(
            "unexpected response content type {:?}",
            reply.content_type
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call() -> WireCall {
        WireCall {
            body: vec![],
            content_type: CONTENT_TYPE.into(),
            rpc_endpoint: "harbor-apis".into(),
            rpc_method: "/RemoteApi.CallRemoteApi".into(),
            deadline: Duration::from_secs(2),
        }
    }

    #[tokio::test]
    async fn unreachable_server_is_a_transport_error() {
        let transport = HttpTransport::new("http://127.0.0.1:9/rpc_http");
        let err = transport.round_trip(&call()).await.unwrap_err();
        assert!(matches!(
            err,
            HarborError::Transport(_) | HarborError::DeadlineExceeded { .. }
        ));
    }

    #[test]
    fn content_type_parameters_are_ignored() {
        let reply = WireReply {
            content_type: "application/octet-stream; charset=binary".into(),
            body: vec![],
        };
        assert!(expect_octet_stream(&reply).is_ok());
    }

    #[test]
    fn foreign_content_type_is_rejected() {
        let reply = WireReply {
            content_type: "text/html".into(),
            body: vec![],
        };
        assert!(matches!(
            expect_octet_stream(&reply),
            Err(HarborError::Transport(_))
        ));
    }
}
