//! hive_web - embeddable HTTP/1.x server core built around worker processes
//!
//! A daemon owns the listening socket and forwards each framed HTTP request
//! over a UNIX control socket to a pool of workers. This crate is the
//! worker side: it parses the framed request, dispatches it to registered
//! endpoints, emits the response frame, and manages its own lifecycle
//! (privilege drop, idle/lifetime retirement, request-timeout watchdog).
//! Workers serve one request at a time; concurrency is the daemon's job.
//!
//! # Protocol Support
//!
//! - **HTTP/1.1** with keep-alive signalling back to the daemon
//! - **HTTP/1.0** for legacy clients (never keep-alive)
//! - **WebSocket (RFC 6455)** framing via the [`websocket`] module
//!
//! # Quick Start
//!
//! ```no_run
//! use hive_web::{Endpoint, Registry, Worker, WorkerLimits};
//!
//! fn main() -> Result<(), hive_web::WorkerError> {
//!     let mut registry = Registry::new();
//!
//!     registry.register(
//!         Endpoint::new("hello", |req, out| {
//!             out.write(format!("hello from {}", req.uri()));
//!         })
//!         .route_equals("/hello")
//!         .priority(1),
//!     );
//!
//!     registry.on_startup(|| println!("worker up"));
//!
//!     // Reads SERVERINO_DAEMON / SERVERINO_SOCKET / SERVERINO_DYNAMIC_WORKER
//!     // from the environment the daemon prepared.
//!     Worker::new(registry, WorkerLimits::default()).run()
//! }
//! ```
//!
//! # Request lifecycle
//!
//! One iteration of the worker loop: read a length-prefixed frame from the
//! daemon, parse it into a [`Request`], run endpoints in priority order
//! until one dirties the [`Output`], then send the framed response back.
//! A background watchdog answers `504` and retires the process when a
//! handler overruns its deadline; a compare-and-set guarantees exactly one
//! response per request either way.

pub(crate) mod buffer;
pub(crate) mod errors;
pub(crate) mod handler;
pub mod limits;
pub mod websocket;

pub(crate) mod http {
    pub(crate) mod cookie;
    pub mod mime;
    pub(crate) mod multipart;
    pub(crate) mod query;
    pub(crate) mod request;
    pub(crate) mod response;
    pub(crate) mod types;
}

pub(crate) mod worker {
    pub(crate) mod channel;
    pub(crate) mod watchdog;
    pub(crate) mod worker_impl;
}

pub use crate::{
    errors::{CookieError, WorkerError},
    handler::{Endpoint, Registry},
    http::{
        cookie::{Cookie, SameSite},
        mime::content_type_for,
        multipart::FormData,
        request::{ParsingStatus, Request},
        response::Output,
        types::{Method, Version},
    },
    limits::WorkerLimits,
    worker::worker_impl::{BootEnv, Worker},
};
