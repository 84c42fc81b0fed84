//! URL path routing.
//!
//! The router holds a tree of nodes, one per path element. A `*` element
//! matches any single element and collects it as a positional variable
//! handed to the handler. Constant matches are preferred over variables.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::{Request, Response};

pub type HttpResponse = Response<Full<Bytes>>;

/// A route handler: the request plus the positional path variables.
pub type Handler =
    Arc<dyn Fn(Request<Incoming>, Vec<String>) -> BoxFuture<'static, HttpResponse> + Send + Sync>;

#[derive(Default)]
struct RouteNode {
    constants: HashMap<String, RouteNode>,
    variable: Option<Box<RouteNode>>,
    handler: Option<Handler>,
}

impl RouteNode {
    fn add(&mut self, elements: &[String], index: usize, handler: Handler) {
        if index == elements.len() {
            self.handler = Some(handler);
            return;
        }
        let element = &elements[index];
        if element == "*" {
            self.variable
                .get_or_insert_with(Default::default)
                .add(elements, index + 1, handler);
        } else {
            self.constants
                .entry(element.clone())
                .or_default()
                .add(elements, index + 1, handler);
        }
    }

    fn find(
        &self,
        elements: &[String],
        index: usize,
        variables: &mut Vec<String>,
    ) -> Option<Handler> {
        if index == elements.len() {
            return self.handler.clone();
        }
        let element = &elements[index];
        if let Some(next) = self.constants.get(element) {
            return next.find(elements, index + 1, variables);
        }
        if let Some(variable) = &self.variable {
            variables.push(element.clone());
            return variable.find(elements, index + 1, variables);
        }
        None
    }
}

/// One per HTTP method; paths map to handlers, unmapped paths fall through
/// to the caller.
#[derive(Default)]
pub struct UrlRouter {
    root: RouteNode,
}

impl UrlRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, path: &str, handler: Handler) {
        self.root.add(&split_path(path), 0, handler);
    }

    /// Resolves a path to its handler and collected variables.
    pub fn find(&self, path: &str) -> Option<(Handler, Vec<String>)> {
        let mut variables = Vec::new();
        let handler = self.root.find(&split_path(path), 0, &mut variables)?;
        Some((handler, variables))
    }
}

/// Splits a path at `/`, ignoring leading, trailing and repeated slashes.
pub fn split_path(path: &str) -> Vec<String> {
    path.split('/')
        .filter(|e| !e.is_empty())
        .map(ToOwned::to_owned)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> Handler {
        Arc::new(|_req, _vars| -> BoxFuture<'static, HttpResponse> {
            Box::pin(async { Response::new(Full::new(Bytes::new())) })
        })
    }

    #[test]
    fn test_split_path_ignores_extra_slashes() {
        assert_eq!(split_path("/node/1/health"), vec!["node", "1", "health"]);
        assert_eq!(split_path("node/1/health/"), vec!["node", "1", "health"]);
        assert_eq!(split_path("//node//1"), vec!["node", "1"]);
        assert!(split_path("").is_empty());
    }

    #[test]
    fn test_constant_route_match() {
        let mut router = UrlRouter::new();
        router.add("node/1/health", noop());
        assert!(router.find("/node/1/health").is_some());
        assert!(router.find("/node/1/status").is_none());
        assert!(router.find("/node/1").is_none());
        assert!(router.find("/node/1/health/extra").is_none());
    }

    #[test]
    fn test_wildcard_collects_variable() {
        let mut router = UrlRouter::new();
        router.add("node/1/sessions/*/status", noop());

        let (_, vars) = router.find("/node/1/sessions/abc-123/status").unwrap();
        assert_eq!(vars, vec!["abc-123"]);
        assert!(router.find("/node/1/sessions/abc-123").is_none());
    }

    #[test]
    fn test_constant_preferred_over_variable() {
        let mut router = UrlRouter::new();
        router.add("sessions/modify", noop());
        router.add("sessions/*", noop());

        let (_, vars) = router.find("/sessions/modify").unwrap();
        assert!(vars.is_empty());

        let (_, vars) = router.find("/sessions/xyz").unwrap();
        assert_eq!(vars, vec!["xyz"]);
    }

    #[test]
    fn test_multiple_variables() {
        let mut router = UrlRouter::new();
        router.add("a/*/b/*", noop());
        let (_, vars) = router.find("/a/one/b/two").unwrap();
        assert_eq!(vars, vec!["one", "two"]);
    }
}
