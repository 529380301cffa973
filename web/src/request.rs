use crate::route::HttpMethod;
use crate::translator::{DefaultResponseTranslator, ResponseTranslator};
use serde_json::Value;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

pub const CONTENT_TYPE_JSON: &str = "application/json";

/// An inbound request as seen by user handlers.
#[derive(Debug, Clone)]
pub struct Request {
    method: HttpMethod,
    path: String,
    query: Option<String>,
    /// Header names are stored lower-cased.
    headers: HashMap<String, String>,
    body: String,
    peer: Option<SocketAddr>,
}

impl Request {
    pub fn new(method: HttpMethod, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: None,
            headers: HashMap::new(),
            body: String::new(),
            peer: None,
        }
    }

    pub fn with_query(mut self, query: Option<String>) -> Self {
        self.query = query.filter(|q| !q.is_empty());
        self
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_peer(mut self, peer: Option<SocketAddr>) -> Self {
        self.peer = peer;
        self
    }

    pub fn method(&self) -> HttpMethod {
        self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    /// `path[?query]`, as reported in error bodies.
    pub fn uri(&self) -> String {
        match &self.query {
            Some(query) => format!("{}?{}", self.path, query),
            None => self.path.clone(),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Decoded query parameters. Later duplicates win.
    pub fn query_params(&self) -> HashMap<String, String> {
        self.query
            .as_deref()
            .map(|query| {
                url::form_urlencoded::parse(query.as_bytes())
                    .into_owned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Query parameters merged with the members of a JSON object body.
    ///
    /// String members are taken as-is, arrays of strings are joined with `,`. Query
    /// parameters take precedence.
    pub fn params(&self) -> HashMap<String, String> {
        let mut params = HashMap::new();
        if let Ok(Value::Object(members)) = serde_json::from_str::<Value>(&self.body) {
            for (key, value) in members {
                match value {
                    Value::String(text) => {
                        params.insert(key, text);
                    }
                    Value::Array(items) => {
                        let joined: Vec<&str> = items.iter().filter_map(Value::as_str).collect();
                        params.insert(key, joined.join(","));
                    }
                    _ => {}
                }
            }
        }
        params.extend(self.query_params());
        params
    }
}

/// The response a user handler builds. Defaults to `200` with a JSON content type.
pub struct Response {
    code: u16,
    headers: Vec<(String, String)>,
    body: String,
    translator: Arc<dyn ResponseTranslator>,
}

impl Response {
    pub fn new(translator: Arc<dyn ResponseTranslator>) -> Self {
        Self {
            code: 200,
            headers: vec![("content-type".to_string(), CONTENT_TYPE_JSON.to_string())],
            body: String::new(),
            translator,
        }
    }

    pub fn code(&self) -> u16 {
        self.code
    }

    pub fn set_code(&mut self, code: u16) {
        self.code = code;
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// Sets a header, replacing any previous value for the same (case-insensitive) name.
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        let name = name.to_ascii_lowercase();
        self.headers.retain(|(existing, _)| *existing != name);
        self.headers.push((name, value.into()));
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn set_body(&mut self, body: impl Into<String>) {
        self.body = body.into();
    }

    /// Wraps `payload` with the server's response translator and serializes it as the body.
    pub fn set_payload(&mut self, payload: Value) {
        let document = self.translator.make_response(payload);
        self.body = document.to_string();
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::new(Arc::new(DefaultResponseTranslator))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn uri_includes_query_when_present() {
        let request = Request::new(HttpMethod::Get, "/api/x").with_query(Some("a=1".into()));

        assert_eq!(request.uri(), "/api/x?a=1");
        assert_eq!(Request::new(HttpMethod::Get, "/api/x").uri(), "/api/x");
    }

    #[test]
    fn empty_query_is_treated_as_absent() {
        let request = Request::new(HttpMethod::Get, "/x").with_query(Some(String::new()));

        assert_eq!(request.query(), None);
        assert!(request.query_params().is_empty());
    }

    #[test]
    fn query_params_are_url_decoded() {
        let request = Request::new(HttpMethod::Get, "/restsse/")
            .with_query(Some("subjects=ras%2Ctelemetry&x=a+b".into()));

        let params = request.query_params();
        assert_eq!(params.get("subjects").unwrap(), "ras,telemetry");
        assert_eq!(params.get("x").unwrap(), "a b");
    }

    #[test]
    fn params_merge_json_body_with_query_precedence() {
        let request = Request::new(HttpMethod::Get, "/restsse/")
            .with_query(Some("mode=query".into()))
            .with_body(r#"{"subjects":["a","b"],"mode":"body","n":1}"#);

        let params = request.params();
        assert_eq!(params.get("subjects").unwrap(), "a,b");
        assert_eq!(params.get("mode").unwrap(), "query");
        assert!(!params.contains_key("n"));
    }

    #[test]
    fn headers_are_case_insensitive() {
        let request = Request::new(HttpMethod::Get, "/").with_header("Last-Event-ID", "7");

        assert_eq!(request.header("last-event-id"), Some("7"));
        assert_eq!(request.header("LAST-EVENT-ID"), Some("7"));
    }

    #[test]
    fn response_defaults_to_ok_json() {
        let response = Response::default();

        assert_eq!(response.code(), 200);
        assert_eq!(
            response.headers(),
            &[("content-type".to_string(), CONTENT_TYPE_JSON.to_string())]
        );
    }

    #[test]
    fn set_header_replaces_existing_value() {
        let mut response = Response::default();

        response.set_header("Content-Type", "text/plain");

        assert_eq!(
            response.headers(),
            &[("content-type".to_string(), "text/plain".to_string())]
        );
    }

    #[test]
    fn set_payload_wraps_with_ok_status() {
        let mut response = Response::default();

        response.set_payload(json!({"nodes": 3}));

        let body: Value = serde_json::from_str(response.body()).unwrap();
        assert_eq!(body, json!({"status": "ok", "payload": {"nodes": 3}}));
    }
}
