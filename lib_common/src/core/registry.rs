//! # Route Registry
//!
//! Validates the static route list once at startup and drives every route's
//! one-time initializer. Each route gets its own readiness signal, a
//! `watch` channel that moves from `Pending` to either `Ready` or `Failed`
//! exactly once.
//!
//! Initializers run concurrently and independently: a slow or hung `init`
//! only holds back its own route. A failed (or timed out, or panicking)
//! `init` disables the route for the lifetime of the process. There is no
//! retry.

use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use tokio::sync::watch;

use crate::core::error::StreamError;
use crate::core::route::{Route, RouteSpec};

/// Readiness of a single route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// `init` is still running.
    Pending,
    /// Dispatch may proceed.
    Ready,
    /// `init` failed; the route never receives events.
    Failed,
}

/// A validated route plus its readiness signal.
#[derive(Clone)]
pub struct RegisteredRoute {
    pub route: Route,
    readiness: watch::Receiver<Readiness>,
}

impl RegisteredRoute {
    pub fn name(&self) -> &str {
        &self.route.name
    }

    /// Current readiness, without waiting.
    pub fn readiness(&self) -> Readiness {
        *self.readiness.borrow()
    }

    /// Waits until `init` settled. A vanished initializer counts as failed.
    pub async fn wait_ready(&self) -> Readiness {
        let mut rx = self.readiness.clone();
        let settled = match rx.wait_for(|r| *r != Readiness::Pending).await {
            Ok(r) => *r,
            Err(_) => Readiness::Failed,
        };
        settled
    }
}

/// # Route Registry
pub struct RouteRegistry {
    routes: Vec<RegisteredRoute>,
}

impl RouteRegistry {
    /// Validates `specs` and launches every valid route's `init`.
    ///
    /// Invalid specs are logged and left out. Must run inside a tokio runtime.
    pub fn load(specs: Vec<RouteSpec>, init_timeout: Option<Duration>) -> Self {
        let mut seen = HashSet::new();
        let mut routes = Vec::with_capacity(specs.len());

        for spec in specs {
            match validate(spec, &seen) {
                Ok(route) => {
                    seen.insert(route.name.to_string());
                    let readiness = launch_init(&route, init_timeout);
                    routes.push(RegisteredRoute { route, readiness });
                }
                Err(e) => log::error!("Route rejected: {}", e),
            }
        }

        log::info!(
            "Route registry loaded {} route(s): {}",
            routes.len(),
            routes.iter().map(|r| r.name()).collect::<Vec<_>>().join(", ")
        );
        Self { routes }
    }

    pub fn routes(&self) -> &[RegisteredRoute] {
        &self.routes
    }

    pub fn get(&self, name: &str) -> Option<&RegisteredRoute> {
        self.routes.iter().find(|r| r.name() == name)
    }

    pub fn readiness(&self, name: &str) -> Option<Readiness> {
        self.get(name).map(RegisteredRoute::readiness)
    }

    /// Routes that have not failed (ready or still initializing).
    pub fn active_count(&self) -> usize {
        self.routes
            .iter()
            .filter(|r| r.readiness() != Readiness::Failed)
            .count()
    }
}

/// Rejects blank or duplicate names and specs without a filter or worker.
pub fn validate(spec: RouteSpec, seen: &HashSet<String>) -> Result<Route, StreamError> {
    let name = spec.name.trim();
    if name.is_empty() {
        return Err(StreamError::InvalidRoute("route name must not be empty".to_string()));
    }
    if seen.contains(name) {
        return Err(StreamError::InvalidRoute(format!("duplicate route name '{}'", name)));
    }
    let Some(filter) = spec.filter else {
        return Err(StreamError::InvalidRoute(format!("route '{}' has no filter", name)));
    };
    let Some(worker) = spec.worker else {
        return Err(StreamError::InvalidRoute(format!("route '{}' has no worker", name)));
    };

    Ok(Route {
        name: Arc::from(name),
        filter,
        worker,
        init: spec.init,
    })
}

fn launch_init(route: &Route, init_timeout: Option<Duration>) -> watch::Receiver<Readiness> {
    let Some(init) = route.init.clone() else {
        let (_tx, rx) = watch::channel(Readiness::Ready);
        return rx;
    };

    let (tx, rx) = watch::channel(Readiness::Pending);
    let name = Arc::clone(&route.name);

    tokio::spawn(async move {
        let guarded = AssertUnwindSafe(init()).catch_unwind();
        let outcome = match init_timeout {
            Some(limit) => match tokio::time::timeout(limit, guarded).await {
                Ok(result) => result,
                Err(_) => Ok(Err(anyhow::anyhow!("init did not finish within {}s", limit.as_secs()))),
            },
            None => guarded.await,
        };

        let state = match outcome {
            Ok(Ok(())) => {
                log::info!("Route '{}' initialized", name);
                Readiness::Ready
            }
            Ok(Err(e)) => {
                let err = StreamError::RouteInit {
                    route: name.to_string(),
                    reason: format!("{:#}", e),
                };
                log::error!("{}; route disabled", err);
                Readiness::Failed
            }
            Err(_) => {
                log::error!("Route '{}' panicked during init; route disabled", name);
                Readiness::Failed
            }
        };
        let _ = tx.send(state);
    });

    rx
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid(name: &str) -> RouteSpec {
        RouteSpec::new(name).filter(|_| true).worker(|_| async { Ok(()) })
    }

    #[tokio::test]
    async fn invalid_specs_are_excluded() {
        let registry = RouteRegistry::load(
            vec![
                valid("alpha"),
                RouteSpec::new("   ").filter(|_| true).worker(|_| async { Ok(()) }),
                RouteSpec::new("no_worker").filter(|_| true),
                RouteSpec::new("no_filter").worker(|_| async { Ok(()) }),
                valid("alpha"),
                valid("beta"),
            ],
            None,
        );

        let names: Vec<_> = registry.routes().iter().map(|r| r.name().to_string()).collect();
        assert_eq!(names, vec!["alpha", "beta"]);
    }

    #[tokio::test]
    async fn route_without_init_is_ready_immediately() {
        let registry = RouteRegistry::load(vec![valid("plain")], None);
        assert_eq!(registry.readiness("plain"), Some(Readiness::Ready));
        assert_eq!(registry.get("plain").unwrap().wait_ready().await, Readiness::Ready);
    }

    #[tokio::test]
    async fn init_success_and_failure_settle_independently() {
        let registry = RouteRegistry::load(
            vec![
                valid("good").init(|| async { Ok(()) }),
                valid("bad").init(|| async { Err(anyhow::anyhow!("database unreachable")) }),
                valid("boom").init(|| async {
                    let handle: Option<u8> = None;
                    handle.expect("init exploded");
                    Ok(())
                }),
            ],
            None,
        );

        assert_eq!(registry.get("good").unwrap().wait_ready().await, Readiness::Ready);
        assert_eq!(registry.get("bad").unwrap().wait_ready().await, Readiness::Failed);
        assert_eq!(registry.get("boom").unwrap().wait_ready().await, Readiness::Failed);
        assert_eq!(registry.active_count(), 1);
    }

    #[tokio::test]
    async fn hung_init_only_blocks_its_own_route() {
        let registry = RouteRegistry::load(
            vec![
                valid("slow").init(|| async {
                    std::future::pending::<()>().await;
                    Ok(())
                }),
                valid("fast").init(|| async { Ok(()) }),
            ],
            None,
        );

        assert_eq!(registry.get("fast").unwrap().wait_ready().await, Readiness::Ready);
        assert_eq!(registry.readiness("slow"), Some(Readiness::Pending));
    }

    #[tokio::test(start_paused = true)]
    async fn init_timeout_marks_route_failed() {
        let registry = RouteRegistry::load(
            vec![valid("slow").init(|| async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            })],
            Some(Duration::from_secs(5)),
        );

        assert_eq!(registry.get("slow").unwrap().wait_ready().await, Readiness::Failed);
    }
}
