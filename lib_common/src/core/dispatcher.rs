//! # Route Dispatcher
//!
//! Fans every accepted `ChangeEvent` out to all registered routes.
//!
//! ## Core Design Principles:
//!
//! 1.  **Zero-Copy Fan-out**: an event is wrapped in an `Arc` once; each route
//!     receives a pointer to the same allocation.
//!
//! 2.  **One queue per route**: every route owns an unbounded MPSC queue and a
//!     driver task. `dispatch` only pushes into queues, so the connector never
//!     waits on a route, and route A never waits on route B.
//!
//! 3.  **Readiness gate**: a driver waits for its route's `init` before
//!     draining the queue, so events arriving during initialization are
//!     delivered afterwards, in order. A route whose `init` failed drops its
//!     queue; the next `dispatch` notices the closed channel and removes it.
//!
//! 4.  **Per-route order**: the driver runs one worker invocation at a time,
//!     so a route sees its events in arrival order on any runtime flavor.
//!
//! 5.  **Failure isolation**: filter panics, worker errors and worker panics
//!     are caught per route and logged with the route name. Nothing
//!     propagates to other routes, other events or the process.
//!
//! Queues are unbounded: a slow worker accumulates frames in its own queue.
//! This is a known trade-off of never back-pressuring the stream.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use tokio::sync::mpsc;

use crate::core::event::{CategoryChange, ChangeEvent};
use crate::core::registry::{Readiness, RegisteredRoute, RouteRegistry};
use crate::core::route::Route;

/// # Dispatch Frame
///
/// What travels through a route queue: the shared event and the instant the
/// connector handed it over, for queue latency diagnostics.
#[derive(Debug, Clone)]
pub struct DispatchFrame {
    pub event: Arc<ChangeEvent>,
    pub ts_library_in: Instant,
}

/// Sending side of one route's queue.
struct RouteHandle {
    name: Arc<str>,
    sender: mpsc::UnboundedSender<DispatchFrame>,
    /// Frames pushed but not yet picked up by the driver.
    queue_size: Arc<AtomicUsize>,
}

/// # Core Dispatcher
pub struct Dispatcher {
    routes: Mutex<Vec<RouteHandle>>,
    /// Worker tasks currently running, across all routes.
    in_flight: Arc<AtomicUsize>,
}

impl Dispatcher {
    /// Creates a dispatcher with a queue and a driver for every registered route.
    ///
    /// Must run inside a tokio runtime.
    pub fn new(registry: &RouteRegistry) -> Self {
        let dispatcher = Self {
            routes: Mutex::new(Vec::new()),
            in_flight: Arc::new(AtomicUsize::new(0)),
        };
        for registered in registry.routes() {
            dispatcher.add_route(registered.clone());
        }
        dispatcher
    }

    /// Attaches one route and spawns its driver task.
    pub fn add_route(&self, registered: RegisteredRoute) {
        let (tx, rx) = mpsc::unbounded_channel();
        let queue_size = Arc::new(AtomicUsize::new(0));
        let name = Arc::clone(&registered.route.name);

        tokio::spawn(drive_route(
            registered,
            rx,
            Arc::clone(&queue_size),
            Arc::clone(&self.in_flight),
        ));

        let mut routes = self.routes.lock().unwrap_or_else(PoisonError::into_inner);
        routes.push(RouteHandle {
            name: Arc::clone(&name),
            sender: tx,
            queue_size,
        });
        log::debug!("Route '{}' attached to dispatcher", name);
    }

    /// Hands one event to every live route. Never waits on a route.
    pub fn dispatch(&self, event: ChangeEvent) {
        let frame = DispatchFrame {
            event: Arc::new(event),
            ts_library_in: Instant::now(),
        };

        let mut routes = self.routes.lock().unwrap_or_else(PoisonError::into_inner);
        routes.retain(|route| match route.sender.send(frame.clone()) {
            Ok(()) => {
                route.queue_size.fetch_add(1, Ordering::AcqRel);
                true
            }
            Err(_) => {
                // The driver is gone: the route failed to initialize.
                log::warn!("Route '{}' is disabled. Removing from dispatcher.", route.name);
                false
            }
        });
        log::trace!(
            "Event {} fanned out to {} route(s)",
            frame.event.dedup_key(),
            routes.len()
        );
    }

    pub fn route_names(&self) -> Vec<String> {
        let routes = self.routes.lock().unwrap_or_else(PoisonError::into_inner);
        routes.iter().map(|r| r.name.to_string()).collect()
    }

    /// Frames waiting in a route's queue.
    pub fn queue_len(&self, name: &str) -> Option<usize> {
        let routes = self.routes.lock().unwrap_or_else(PoisonError::into_inner);
        routes
            .iter()
            .find(|r| &*r.name == name)
            .map(|r| r.queue_size.load(Ordering::Acquire))
    }

    /// Worker invocations still running.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Waits until no worker runs and no ready route has queued frames, or
    /// until `limit` elapses.
    ///
    /// # Returns
    /// `true` when the dispatcher went idle in time.
    pub async fn wait_idle(&self, limit: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            let queued: usize = {
                let routes = self.routes.lock().unwrap_or_else(PoisonError::into_inner);
                routes
                    .iter()
                    .filter(|r| !r.sender.is_closed())
                    .map(|r| r.queue_size.load(Ordering::Acquire))
                    .sum()
            };
            if queued == 0 && self.in_flight() == 0 {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

/// Per-route driver: wait for readiness, then deliver queued frames in order.
async fn drive_route(
    registered: RegisteredRoute,
    mut rx: mpsc::UnboundedReceiver<DispatchFrame>,
    queue_size: Arc<AtomicUsize>,
    in_flight: Arc<AtomicUsize>,
) {
    if registered.wait_ready().await != Readiness::Ready {
        log::warn!(
            "Route '{}' did not initialize; dropping {} queued event(s)",
            registered.name(),
            queue_size.load(Ordering::Acquire)
        );
        return;
    }

    while let Some(frame) = rx.recv().await {
        log::trace!(
            "[{}] picked up {} after {:?} in queue",
            registered.name(),
            frame.event.dedup_key(),
            frame.ts_library_in.elapsed()
        );
        deliver(&registered.route, frame.event, &in_flight).await;
        // After `deliver` so `wait_idle` never sees the frame as neither queued nor in flight.
        queue_size.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Evaluates the filter and, on a match, runs the worker to completion.
async fn deliver(route: &Route, event: Arc<ChangeEvent>, in_flight: &AtomicUsize) {
    let accepted = match std::panic::catch_unwind(AssertUnwindSafe(|| (route.filter)(&event))) {
        Ok(accepted) => accepted,
        Err(_) => {
            log::error!(
                "[{}] filter panicked on {} '{}'; event skipped for this route",
                route.name,
                event.kind,
                event.title
            );
            return;
        }
    };
    if !accepted {
        return;
    }

    log_routing_decision(&route.name, &event);

    let key = event.dedup_key();
    let worker = Arc::clone(&route.worker);
    in_flight.fetch_add(1, Ordering::AcqRel);
    // The worker is called inside the guarded future so a panic before its
    // first await is caught as well.
    let outcome = AssertUnwindSafe(async move { worker(event).await })
        .catch_unwind()
        .await;
    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(e)) => log::error!("[{}] worker failed on {}: {:#}", route.name, key, e),
        Err(_) => log::error!("[{}] worker panicked on {}", route.name, key),
    }
    in_flight.fetch_sub(1, Ordering::AcqRel);
}

fn log_routing_decision(route: &str, event: &ChangeEvent) {
    match event.category_change() {
        Some(CategoryChange::Added(subject)) => log::info!(
            "[{}] {}: '{}' added to '{}' by {}",
            route,
            event.wiki,
            subject,
            event.title,
            event.user
        ),
        Some(CategoryChange::Removed(subject)) => log::info!(
            "[{}] {}: '{}' removed from '{}' by {}",
            route,
            event.wiki,
            subject,
            event.title,
            event.user
        ),
        None => log::info!(
            "[{}] {}: {} '{}' by {}",
            route,
            event.wiki,
            event.kind,
            event.title,
            event.user
        ),
    }
}
