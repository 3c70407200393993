//! Endpoint registration and dispatch.
//!
//! Endpoints declare themselves against a [`Registry`] before the worker
//! starts; the dispatcher orders them by descending priority (declaration
//! order breaks ties) and runs them until one dirties the response.

use crate::http::request::Request;
use crate::http::response::Output;
use log::{error, warn};
use std::panic::{catch_unwind, AssertUnwindSafe};

type HandlerFn = Box<dyn Fn(&mut Request, &mut Output) + Send + Sync>;
type RoutePredicate = Box<dyn Fn(&Request) -> bool + Send + Sync>;
type HookFn = Box<dyn Fn() + Send + Sync>;

/// A registered handler.
///
/// Handlers come in three parameter shapes; the constructors adapt them all
/// to one uniform closure type. Route predicates are OR-combined: an
/// endpoint is skipped only when every predicate rejects the request.
pub struct Endpoint {
    id: String,
    priority: i32,
    routes: Vec<RoutePredicate>,
    run: HandlerFn,
}

impl Endpoint {
    /// Handler taking both the request and the response.
    pub fn new(
        id: impl Into<String>,
        handler: impl Fn(&mut Request, &mut Output) + Send + Sync + 'static,
    ) -> Self {
        Self {
            id: id.into(),
            priority: 0,
            routes: Vec::new(),
            run: Box::new(handler),
        }
    }

    /// Handler interested only in the request.
    pub fn request_only(
        id: impl Into<String>,
        handler: impl Fn(&mut Request) + Send + Sync + 'static,
    ) -> Self {
        Self::new(id, move |request, _| handler(request))
    }

    /// Handler interested only in the response.
    pub fn output_only(
        id: impl Into<String>,
        handler: impl Fn(&mut Output) + Send + Sync + 'static,
    ) -> Self {
        Self::new(id, move |_, output| handler(output))
    }

    /// Dispatch priority; higher runs earlier. Default `0`.
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Attaches a route predicate.
    pub fn route(mut self, predicate: impl Fn(&Request) -> bool + Send + Sync + 'static) -> Self {
        self.routes.push(Box::new(predicate));
        self
    }

    /// Route predicate comparing the normalized path to a literal.
    pub fn route_equals(self, path: impl Into<String>) -> Self {
        let path = path.into();
        self.route(move |request| request.uri() == path)
    }

    #[inline]
    fn accepts(&self, request: &Request) -> bool {
        self.routes.is_empty() || self.routes.iter().any(|predicate| predicate(request))
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .field("routes", &self.routes.len())
            .finish()
    }
}

/// The set of endpoints and lifecycle hooks a worker serves.
#[derive(Default)]
pub struct Registry {
    tagged: Vec<Endpoint>,
    untagged: Vec<Endpoint>,
    startup: Vec<HookFn>,
    shutdown: Vec<HookFn>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a tagged endpoint, eligible for prioritized dispatch.
    pub fn register(&mut self, endpoint: Endpoint) {
        self.tagged.push(endpoint);
    }

    /// Registers an untagged fallback. Dispatch uses it only when no tagged
    /// endpoint exists and exactly one fallback is present.
    pub fn register_fallback(&mut self, endpoint: Endpoint) {
        self.untagged.push(endpoint);
    }

    /// Hook run once before the request loop starts.
    pub fn on_startup(&mut self, hook: impl Fn() + Send + Sync + 'static) {
        self.startup.push(Box::new(hook));
    }

    /// Hook run on every self-terminating exit path. The watchdog's forced
    /// exit does not run these.
    pub fn on_shutdown(&mut self, hook: impl Fn() + Send + Sync + 'static) {
        self.shutdown.push(Box::new(hook));
    }

    /// Orders tagged endpoints by descending priority. The sort is stable,
    /// so declaration order breaks ties.
    pub(crate) fn seal(&mut self) {
        self.tagged.sort_by(|a, b| b.priority.cmp(&a.priority));
    }

    pub(crate) fn run_startup_hooks(&self) {
        for hook in &self.startup {
            hook();
        }
    }

    pub(crate) fn run_shutdown_hooks(&self) {
        for hook in &self.shutdown {
            if catch_unwind(AssertUnwindSafe(hook)).is_err() {
                warn!("a shutdown hook panicked; continuing shutdown");
            }
        }
    }

    /// Runs endpoints against the request until one dirties the response.
    ///
    /// A panicking handler resets the response to `500` with the body
    /// suppressed and ends the chain; the keep-alive decision made before
    /// dispatch is retained.
    pub(crate) fn dispatch(&self, request: &mut Request, output: &mut Output) {
        let chain: &[Endpoint] = if !self.tagged.is_empty() {
            &self.tagged
        } else if self.untagged.len() == 1 {
            &self.untagged
        } else {
            if !self.untagged.is_empty() {
                warn!(
                    "{} untagged handlers registered; refusing to pick one",
                    self.untagged.len()
                );
            }
            &[]
        };

        for endpoint in chain {
            if !endpoint.accepts(request) {
                continue;
            }

            request.route.push(endpoint.id.clone());

            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| (endpoint.run)(request, output))) {
                error!(
                    "endpoint {} failed: {}",
                    endpoint.id,
                    panic_message(panic.as_ref())
                );
                output.reset_to_status(500);
                return;
            }

            if output.dirty() {
                break;
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn request_for(target: &str) -> Request {
        let mut request = Request::new();
        request.parse(
            format!("GET {target} HTTP/1.1\r\nHost: t\r\n\r\n").as_bytes(),
            1024,
        );
        request
    }

    #[test]
    fn priority_orders_dispatch() {
        let mut registry = Registry::new();
        registry.register(Endpoint::new("low", |_, o| o.add_header("x-ran", "low")).priority(-5));
        registry.register(Endpoint::new("high", |_, o| o.add_header("x-ran", "high")).priority(9));
        registry.register(Endpoint::new("mid", |_, o| o.add_header("x-ran", "mid")));
        registry.seal();

        let mut request = request_for("/");
        let mut output = Output::new();
        registry.dispatch(&mut request, &mut output);

        // "high" ran first and dirtied the response; the chain stopped there.
        assert_eq!(request.route(), ["high"]);
    }

    #[test]
    fn ties_keep_declaration_order() {
        let mut registry = Registry::new();
        registry.register(Endpoint::request_only("first", |_| {}));
        registry.register(Endpoint::request_only("second", |_| {}));
        registry.register(Endpoint::request_only("third", |_| {}));
        registry.seal();

        let mut request = request_for("/");
        let mut output = Output::new();
        registry.dispatch(&mut request, &mut output);

        // nothing dirties the response, so every endpoint observes it
        assert_eq!(request.route(), ["first", "second", "third"]);
        assert!(!output.dirty());
    }

    #[test]
    fn route_predicates_are_or_combined() {
        let mut registry = Registry::new();
        registry.register(
            Endpoint::new("api", |_, o| o.write("api"))
                .route_equals("/a")
                .route_equals("/b"),
        );
        registry.seal();

        for (target, expected) in [("/a", true), ("/b", true), ("/c", false)] {
            let mut request = request_for(target);
            let mut output = Output::new();
            registry.dispatch(&mut request, &mut output);
            assert_eq!(output.dirty(), expected, "{target}");
        }
    }

    #[test]
    fn rejected_endpoint_is_not_logged_in_route() {
        let mut registry = Registry::new();
        registry.register(Endpoint::new("guarded", |_, o| o.write("x")).route_equals("/only"));
        registry.register(Endpoint::new("open", |_, o| o.write("y")));
        registry.seal();

        let mut request = request_for("/other");
        let mut output = Output::new();
        registry.dispatch(&mut request, &mut output);

        assert_eq!(request.route(), ["open"]);
    }

    #[test]
    fn dispatch_stops_at_first_dirty() {
        let ran = Arc::new(AtomicUsize::new(0));

        let mut registry = Registry::new();
        for id in ["a", "b"] {
            let ran = ran.clone();
            registry.register(Endpoint::new(id, move |_, o| {
                ran.fetch_add(1, Ordering::Relaxed);
                o.write("done");
            }));
        }
        registry.seal();

        let mut request = request_for("/");
        let mut output = Output::new();
        registry.dispatch(&mut request, &mut output);

        assert_eq!(ran.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn untagged_fallback_needs_to_be_alone() {
        // single fallback runs
        let mut registry = Registry::new();
        registry.register_fallback(Endpoint::new("only", |_, o| o.write("f")));
        registry.seal();

        let mut request = request_for("/");
        let mut output = Output::new();
        registry.dispatch(&mut request, &mut output);
        assert!(output.dirty());

        // two fallbacks: neither runs
        let mut registry = Registry::new();
        registry.register_fallback(Endpoint::new("one", |_, o| o.write("1")));
        registry.register_fallback(Endpoint::new("two", |_, o| o.write("2")));
        registry.seal();

        let mut request = request_for("/");
        let mut output = Output::new();
        registry.dispatch(&mut request, &mut output);
        assert!(!output.dirty());
    }

    #[test]
    fn tagged_presence_disables_fallback() {
        let mut registry = Registry::new();
        registry.register(Endpoint::new("tagged", |_, o| o.write("t")).route_equals("/t"));
        registry.register_fallback(Endpoint::new("fallback", |_, o| o.write("f")));
        registry.seal();

        let mut request = request_for("/not-t");
        let mut output = Output::new();
        registry.dispatch(&mut request, &mut output);

        assert!(!output.dirty());
        assert!(request.route().is_empty());
    }

    #[test]
    fn panicking_handler_becomes_500() {
        let mut registry = Registry::new();
        registry.register(Endpoint::new("boom", |_, _| panic!("kaboom")).priority(1));
        registry.register(Endpoint::new("after", |_, o| o.write("never")));
        registry.seal();

        let mut request = request_for("/");
        let mut output = Output::new();
        output.set_keep_alive(false);
        registry.dispatch(&mut request, &mut output);

        assert_eq!(output.status(), 500);
        assert!(!output.send_body());
        assert!(!output.keep_alive(), "pre-error keep-alive decision retained");
        assert_eq!(request.route(), ["boom"]);
    }

    #[test]
    fn adapters_cover_both_shapes() {
        let mut registry = Registry::new();
        registry.register(Endpoint::request_only("peek", |r| {
            assert_eq!(r.uri(), "/");
        }));
        registry.register(Endpoint::output_only("answer", |o| o.write("done")));
        registry.seal();

        let mut request = request_for("/");
        let mut output = Output::new();
        registry.dispatch(&mut request, &mut output);

        assert_eq!(request.route(), ["peek", "answer"]);
        assert!(output.dirty());
    }

    #[test]
    fn hooks_run() {
        let counter = Arc::new(AtomicUsize::new(0));

        let mut registry = Registry::new();
        let c = counter.clone();
        registry.on_startup(move || {
            c.fetch_add(1, Ordering::Relaxed);
        });
        let c = counter.clone();
        registry.on_shutdown(move || {
            c.fetch_add(10, Ordering::Relaxed);
        });
        registry.on_shutdown(|| panic!("shutdown hook panic is contained"));

        registry.run_startup_hooks();
        registry.run_shutdown_hooks();
        assert_eq!(counter.load(Ordering::Relaxed), 11);
    }
}
