use crate::error::{route_error, Result, RouteErrorKind};
use crate::route::{is_wildcard, normalize, HttpMethod, Route, RouteKind};
use log::*;
use sse::manager::EventTypeLookup;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Outcome of a route registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Added,
    /// The (path, method) pair was already registered; the existing route was kept.
    AlreadyMapped,
}

/// Registered routes keyed by path, then method.
///
/// Paths are kept sorted and consulted in descending order at lookup, so a lexicographically
/// later (usually longer) path is tried before a shorter prefix of it.
#[derive(Debug, Default)]
pub struct RouteTable {
    routes: BTreeMap<String, HashMap<HttpMethod, Route>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_route(
        &mut self,
        path: &str,
        method: HttpMethod,
        kind: RouteKind,
    ) -> Result<Registration> {
        if matches!(kind, RouteKind::Sse { .. }) {
            if is_wildcard(path) {
                return Err(route_error(
                    RouteErrorKind::WildcardSse,
                    &format!("SSE route '{path}' cannot be a wildcard"),
                ));
            }
            if method != HttpMethod::Get {
                return Err(route_error(
                    RouteErrorKind::SseMethod,
                    &format!("SSE route '{path}' must be GET, not {method}"),
                ));
            }
        }

        let route = Route::new(path, method, kind);
        let methods = self.routes.entry(route.path.clone()).or_default();
        if methods.contains_key(&method) {
            warn!("Route already mapped: {method} {path}");
            return Ok(Registration::AlreadyMapped);
        }

        debug!("Adding route {method} {path} ({:?})", route.kind);
        methods.insert(method, route);
        Ok(Registration::Added)
    }

    /// Removes the route for `(path, method)`. A trailing `/*` addresses the wildcard route.
    pub fn remove_route(&mut self, path: &str, method: HttpMethod) -> Result<Route> {
        let (key, _) = normalize(path);
        let methods = self.routes.get_mut(&key).ok_or_else(|| not_mapped(path, method))?;
        let route = methods
            .remove(&method)
            .ok_or_else(|| not_mapped(path, method))?;
        if methods.is_empty() {
            self.routes.remove(&key);
        }
        debug!("Removed route {method} {path}");
        Ok(route)
    }

    /// Resolves an incoming request path. First structural match in descending key order wins.
    pub fn lookup(&self, path: &str, method: HttpMethod) -> Option<&Route> {
        self.routes
            .values()
            .rev()
            .filter_map(|methods| methods.get(&method))
            .find(|route| route.matches(path))
    }

    /// The route registered for exactly `(path, method)`, without wildcard matching.
    pub fn get(&self, path: &str, method: HttpMethod) -> Result<&Route> {
        let (key, _) = normalize(path);
        self.routes
            .get(&key)
            .and_then(|methods| methods.get(&method))
            .ok_or_else(|| not_mapped(path, method))
    }

    /// Allowed event types of the GET SSE route stored at `path`, if there is one.
    pub fn event_types_for_path(&self, path: &str) -> Option<HashSet<String>> {
        self.routes
            .get(path)
            .and_then(|methods| methods.get(&HttpMethod::Get))
            .and_then(Route::allowed_event_types)
            .cloned()
    }

    /// Number of registered (path, method) pairs.
    pub fn len(&self) -> usize {
        self.routes.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

fn not_mapped(path: &str, method: HttpMethod) -> crate::error::Error {
    route_error(
        RouteErrorKind::NotMapped,
        &format!("no route mapped for {method} {path}"),
    )
}

/// A `RouteTable` shared between dispatch, the server façade and the SSE manager.
///
/// One lock covers lookup and registration. Lookups hand out clones so the lock is never
/// held across a user handler.
#[derive(Debug, Clone, Default)]
pub struct SharedRouteTable(Arc<Mutex<RouteTable>>);

impl SharedRouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self) -> MutexGuard<'_, RouteTable> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn lookup(&self, path: &str, method: HttpMethod) -> Option<Route> {
        self.lock().lookup(path, method).cloned()
    }
}

impl EventTypeLookup for SharedRouteTable {
    fn event_types_for_path(&self, path: &str) -> Option<HashSet<String>> {
        self.lock().event_types_for_path(path)
    }
}
