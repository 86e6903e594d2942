//! Route Table
//!
//! Pure selection logic over the configured route list. The table is
//! immutable after construction; a configuration reload builds a new one.
//!
//! A route matches when it is enabled, its method set admits the request
//! method (or contains `*`), and its path pattern matches the request path.
//! Among all matches the highest priority wins; ties break toward the
//! earlier position in the configured list.

use crate::domain::entities::RouteConfig;

/// Outcome of a match attempt.
#[derive(Debug, PartialEq)]
pub enum MatchOutcome<'a> {
    /// The winning route.
    Matched(&'a RouteConfig),
    /// An enabled route matched the path, but none admitted the method.
    MethodNotAllowed,
    /// No enabled route matched the path at all.
    NotFound,
}

/// Priority-ordered route matcher.
#[derive(Debug, Default)]
pub struct RouteTable {
    routes: Vec<RouteConfig>,
}

impl RouteTable {
    pub fn new(routes: Vec<RouteConfig>) -> Self {
        Self { routes }
    }

    /// Select the best route for a (path, method) pair.
    pub fn find(&self, path: &str, method: &str) -> MatchOutcome<'_> {
        let mut best: Option<&RouteConfig> = None;
        let mut path_matched = false;

        for route in &self.routes {
            if !route.enabled || !route.matches_path(path) {
                continue;
            }
            path_matched = true;
            if !route.matches_method(method) {
                continue;
            }
            // Strictly-greater keeps the earlier route on priority ties.
            match best {
                Some(current) if route.priority <= current.priority => {}
                _ => best = Some(route),
            }
        }

        match best {
            Some(route) => MatchOutcome::Matched(route),
            None if path_matched => MatchOutcome::MethodNotAllowed,
            None => MatchOutcome::NotFound,
        }
    }

    /// All configured routes, in declaration order.
    pub fn routes(&self) -> &[RouteConfig] {
        &self.routes
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
