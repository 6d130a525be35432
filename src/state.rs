//! Process-wide server state shared by every request.

use crate::dispatcher::RouteTable;
use crate::template::TemplateEngine;
use arc_swap::ArcSwap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// State owned by the lifecycle controller and read by the dispatcher.
///
/// The route table is swapped as a whole, so a request sees either the
/// old table or the new one.
#[derive(Debug)]
pub struct ServerState {
    shutting_down: AtomicBool,
    routes: ArcSwap<RouteTable>,
    engine: TemplateEngine,
    stats: ServerStats,
}

impl ServerState {
    pub fn new(routes: RouteTable) -> Self {
        Self {
            shutting_down: AtomicBool::new(false),
            routes: ArcSwap::from_pointee(routes),
            engine: TemplateEngine::new(),
            stats: ServerStats::default(),
        }
    }

    /// Check if the server is draining.
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Flip into shutdown. Returns `false` if shutdown had already begun.
    pub fn begin_shutdown(&self) -> bool {
        !self.shutting_down.swap(true, Ordering::SeqCst)
    }

    /// Snapshot of the active route table.
    pub fn route_table(&self) -> Arc<RouteTable> {
        self.routes.load_full()
    }

    /// Replace the active route table.
    pub fn swap_routes(&self, routes: RouteTable) {
        self.routes.store(Arc::new(routes));
    }

    pub fn engine(&self) -> &TemplateEngine {
        &self.engine
    }

    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }
}

/// Request and reload counters.
#[derive(Debug, Default)]
pub struct ServerStats {
    requests_total: AtomicU64,
    requests_matched: AtomicU64,
    requests_unmatched: AtomicU64,
    reloads_applied: AtomicU64,
    reloads_rejected: AtomicU64,
}

impl ServerStats {
    pub fn total_requests(&self) -> u64 {
        self.requests_total.load(Ordering::Relaxed)
    }

    pub fn total_matched(&self) -> u64 {
        self.requests_matched.load(Ordering::Relaxed)
    }

    pub fn total_unmatched(&self) -> u64 {
        self.requests_unmatched.load(Ordering::Relaxed)
    }

    pub fn reloads_applied(&self) -> u64 {
        self.reloads_applied.load(Ordering::Relaxed)
    }

    pub fn reloads_rejected(&self) -> u64 {
        self.reloads_rejected.load(Ordering::Relaxed)
    }

    pub(crate) fn record_request(&self) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_matched(&self) {
        self.requests_matched.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_unmatched(&self) {
        self.requests_unmatched.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_reload(&self, applied: bool) {
        if applied {
            self.reloads_applied.fetch_add(1, Ordering::Relaxed);
        } else {
            self.reloads_rejected.fetch_add(1, Ordering::Relaxed);
        }
    }
}
