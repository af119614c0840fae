use std::collections::BTreeMap;

/// Attribute names under this prefix belong to the router.
pub const ROUTING_ATTRIBUTE_PREFIX: &str = "harbor.route.";

/// An inbound request as handed over by the HTTP listener.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Request {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    /// Server-side attributes attached by the listener or the runtime.
    pub attributes: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

impl Request {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// First header value matching `name`, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Drop every routing-internal attribute. Returns how many were removed.
    pub fn strip_routing_attributes(&mut self) -> usize {
        let before = self.attributes.len();
        self.attributes
            .retain(|k, _| !k.starts_with(ROUTING_ATTRIBUTE_PREFIX));
        before - self.attributes.len()
    }
}

/// The response written by the application, mutated in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Default for Response {
    fn default() -> Self {
        Self {
            status: 200,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }
}

impl Response {
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.headers.retain(|(k, _)| !k.eq_ignore_ascii_case(&name));
        self.headers.push((name, value.into()));
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Replace the response with a plain-text error page.
    pub fn error(&mut self, status: u16, message: &str) {
        self.status = status;
        self.headers.clear();
        self.set_header("Content-Type", "text/plain; charset=utf-8");
        self.body = message.as_bytes().to_vec();
    }
}
