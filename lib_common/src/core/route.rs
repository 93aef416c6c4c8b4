//! # Route Definitions
//!
//! A route is any named bundle of a filter, a worker and an optional
//! one-time initializer. There is no trait to implement: hosts build a
//! `RouteSpec` from closures and hand a list of them to the engine.
//!
//! ```rust
//! use lib_common::core::route::RouteSpec;
//!
//! let spec = RouteSpec::new("edits")
//!     .filter(|ev| ev.kind == "edit")
//!     .worker(|ev| async move {
//!         log::info!("edit on {}", ev.title);
//!         Ok(())
//!     });
//! assert_eq!(spec.name(), "edits");
//! ```
//!
//! ## Idempotence
//! Reconnects replay recent events, so a worker can see the same logical
//! event more than once. Workers must tolerate that without corrupting
//! external state (upsert rather than append, key on
//! `ChangeEvent::dedup_key`).

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;

use crate::core::event::ChangeEvent;

/// Pure predicate deciding whether a route wants an event.
pub type FilterFn = Arc<dyn Fn(&ChangeEvent) -> bool + Send + Sync>;
/// Effectful handler, awaited by the route driver for every accepted event.
pub type WorkerFn = Arc<dyn Fn(Arc<ChangeEvent>) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;
/// One-time asynchronous setup run before the first dispatch.
pub type InitFn = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// # Route Spec
///
/// Static registration entry. Validation happens in `RouteRegistry::load`,
/// which is why filter and worker are optional here.
#[derive(Clone)]
pub struct RouteSpec {
    pub(crate) name: String,
    pub(crate) filter: Option<FilterFn>,
    pub(crate) worker: Option<WorkerFn>,
    pub(crate) init: Option<InitFn>,
}

impl RouteSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            filter: None,
            worker: None,
            init: None,
        }
    }

    pub fn filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&ChangeEvent) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(filter));
        self
    }

    pub fn worker<F, Fut>(mut self, worker: F) -> Self
    where
        F: Fn(Arc<ChangeEvent>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.worker = Some(Arc::new(move |ev| worker(ev).boxed()));
        self
    }

    pub fn init<F, Fut>(mut self, init: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.init = Some(Arc::new(move || init().boxed()));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for RouteSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteSpec")
            .field("name", &self.name)
            .field("filter", &self.filter.is_some())
            .field("worker", &self.worker.is_some())
            .field("init", &self.init.is_some())
            .finish()
    }
}

/// A route that passed validation: filter and worker are guaranteed present.
#[derive(Clone)]
pub struct Route {
    pub name: Arc<str>,
    pub filter: FilterFn,
    pub worker: WorkerFn,
    pub init: Option<InitFn>,
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("name", &self.name)
            .field("init", &self.init.is_some())
            .finish()
    }
}
