use crate::handler::RequestHandler;
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

const WILDCARD_SUFFIX: &str = "/*";

/// HTTP methods a route can be registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HttpMethod {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Options,
    Patch,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Head => "HEAD",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Options => "OPTIONS",
            HttpMethod::Patch => "PATCH",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, PartialEq)]
pub struct UnsupportedMethod(pub String);

impl fmt::Display for UnsupportedMethod {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "unsupported HTTP method '{}'", self.0)
    }
}

impl std::error::Error for UnsupportedMethod {}

impl FromStr for HttpMethod {
    type Err = UnsupportedMethod;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(HttpMethod::Get),
            "HEAD" => Ok(HttpMethod::Head),
            "POST" => Ok(HttpMethod::Post),
            "PUT" => Ok(HttpMethod::Put),
            "DELETE" => Ok(HttpMethod::Delete),
            "OPTIONS" => Ok(HttpMethod::Options),
            "PATCH" => Ok(HttpMethod::Patch),
            _ => Err(UnsupportedMethod(s.to_string())),
        }
    }
}

/// What a matched request is handed to.
#[derive(Clone)]
pub enum RouteKind {
    /// An ordinary route served by a user handler.
    Handler(Arc<dyn RequestHandler>),
    /// An SSE subscription route. An empty set accepts every event type.
    Sse { allowed_event_types: HashSet<String> },
}

impl RouteKind {
    pub fn sse<I, S>(allowed_event_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        RouteKind::Sse {
            allowed_event_types: allowed_event_types.into_iter().map(Into::into).collect(),
        }
    }
}

impl fmt::Debug for RouteKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RouteKind::Handler(_) => f.write_str("Handler"),
            RouteKind::Sse {
                allowed_event_types,
            } => f
                .debug_struct("Sse")
                .field("allowed_event_types", allowed_event_types)
                .finish(),
        }
    }
}

/// One registered (path, method) mapping.
#[derive(Debug, Clone)]
pub struct Route {
    /// Lookup key. For wildcard routes this is the prefix, ending in `/`.
    pub path: String,
    pub wildcard: bool,
    pub method: HttpMethod,
    pub kind: RouteKind,
}

impl Route {
    pub fn new(path: &str, method: HttpMethod, kind: RouteKind) -> Self {
        let (path, wildcard) = normalize(path);
        Self {
            path,
            wildcard,
            method,
            kind,
        }
    }

    pub fn is_sse(&self) -> bool {
        matches!(self.kind, RouteKind::Sse { .. })
    }

    pub fn handler(&self) -> Option<Arc<dyn RequestHandler>> {
        match &self.kind {
            RouteKind::Handler(handler) => Some(Arc::clone(handler)),
            RouteKind::Sse { .. } => None,
        }
    }

    pub fn allowed_event_types(&self) -> Option<&HashSet<String>> {
        match &self.kind {
            RouteKind::Sse {
                allowed_event_types,
            } => Some(allowed_event_types),
            RouteKind::Handler(_) => None,
        }
    }

    /// Whether `path` (no query component) is served by this route.
    pub fn matches(&self, path: &str) -> bool {
        if self.wildcard {
            path.starts_with(&self.path)
        } else {
            path == self.path
        }
    }
}

/// Strips a trailing `*` from a `/*` path. Returns the stored key and whether it was a
/// wildcard.
pub fn normalize(path: &str) -> (String, bool) {
    match path.strip_suffix('*') {
        Some(prefix) if path.ends_with(WILDCARD_SUFFIX) => (prefix.to_string(), true),
        _ => (path.to_string(), false),
    }
}

pub fn is_wildcard(path: &str) -> bool {
    path.ends_with(WILDCARD_SUFFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn methods_parse_case_insensitively() {
        assert_eq!("get".parse::<HttpMethod>().unwrap(), HttpMethod::Get);
        assert_eq!("Patch".parse::<HttpMethod>().unwrap(), HttpMethod::Patch);
        assert_eq!(
            "TRACE".parse::<HttpMethod>(),
            Err(UnsupportedMethod("TRACE".to_string()))
        );
        assert_eq!(HttpMethod::Options.to_string(), "OPTIONS");
    }

    #[test]
    fn wildcard_suffix_is_stripped_to_prefix() {
        assert_eq!(normalize("/api/*"), ("/api/".to_string(), true));
        assert_eq!(normalize("/api"), ("/api".to_string(), false));
        assert_eq!(normalize("/api*"), ("/api*".to_string(), false));
    }

    #[test]
    fn wildcard_route_matches_by_prefix() {
        let route = Route::new("/api/*", HttpMethod::Get, RouteKind::sse(Vec::<String>::new()));

        assert!(route.wildcard);
        assert!(route.matches("/api/anything"));
        assert!(route.matches("/api/"));
        assert!(!route.matches("/api"));
        assert!(!route.matches("/api2/x"));
    }

    #[test]
    fn exact_route_matches_only_itself() {
        let route = Route::new("/api/func1", HttpMethod::Get, RouteKind::sse(["a"]));

        assert!(route.matches("/api/func1"));
        assert!(!route.matches("/api/func1/sub"));
        assert!(route.is_sse());
        assert!(route.handler().is_none());
        assert!(route.allowed_event_types().unwrap().contains("a"));
    }
}
