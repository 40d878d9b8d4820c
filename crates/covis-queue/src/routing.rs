//! Task-name to queue routing.

use globset::{Glob, GlobMatcher};

use crate::error::{QueueError, QueueResult};

/// Queue used when no route matches.
pub const DEFAULT_QUEUE: &str = "default";

#[derive(Debug, Clone)]
struct Route {
    pattern: String,
    matcher: GlobMatcher,
    queue: String,
}

/// Ordered glob patterns over task names; the first match wins.
#[derive(Debug, Clone)]
pub struct RoutingTable {
    routes: Vec<Route>,
    fallback: String,
}

impl Default for RoutingTable {
    fn default() -> Self {
        Self::empty()
            .with_route("relocation.*", "relocate")
            .and_then(|table| table.with_route("postprocess.*", "process"))
            .unwrap_or_else(|_| Self::empty())
    }
}

impl RoutingTable {
    /// Table with no routes; everything lands on [`DEFAULT_QUEUE`].
    #[must_use]
    pub fn empty() -> Self {
        Self {
            routes: Vec::new(),
            fallback: DEFAULT_QUEUE.to_string(),
        }
    }

    /// Append a route.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::InvalidRoute`] when `pattern` is not a valid glob.
    pub fn with_route(mut self, pattern: &str, queue: impl Into<String>) -> QueueResult<Self> {
        let matcher = Glob::new(pattern)
            .map_err(|source| QueueError::InvalidRoute {
                pattern: pattern.to_string(),
                source,
            })?
            .compile_matcher();
        self.routes.push(Route {
            pattern: pattern.to_string(),
            matcher,
            queue: queue.into(),
        });
        Ok(self)
    }

    /// Queue for `task`.
    #[must_use]
    pub fn queue_for(&self, task: &str) -> &str {
        self.routes
            .iter()
            .find(|route| route.matcher.is_match(task))
            .map_or(self.fallback.as_str(), |route| route.queue.as_str())
    }

    /// Every queue a worker should consume, in route order, fallback last.
    #[must_use]
    pub fn queues(&self) -> Vec<String> {
        let mut queues: Vec<String> = Vec::new();
        for queue in self
            .routes
            .iter()
            .map(|route| &route.queue)
            .chain(std::iter::once(&self.fallback))
        {
            if !queues.contains(queue) {
                queues.push(queue.clone());
            }
        }
        queues
    }

    /// Configured `(pattern, queue)` pairs.
    pub fn routes(&self) -> impl Iterator<Item = (&str, &str)> {
        self.routes
            .iter()
            .map(|route| (route.pattern.as_str(), route.queue.as_str()))
    }
}
