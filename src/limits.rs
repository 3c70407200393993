//! Worker configuration surface.

use std::time::Duration;

/// Limits and identity settings consumed by the worker process.
///
/// The daemon decides pool sizing and balancing; everything here concerns a
/// single worker: how long a request may run, when an idle worker retires,
/// and which credentials it drops to before serving.
#[derive(Debug, Clone)]
pub struct WorkerLimits {
    /// Hard ceiling on one request's handler time (default: `5s`).
    ///
    /// When exceeded, the watchdog answers `504` and the worker exits.
    /// Handlers may raise it for their own request via
    /// [`Output::set_timeout`](crate::Output::set_timeout).
    pub max_request_time: Duration,

    /// Idle time after which a worker retires (default: `60s`).
    pub max_worker_idling: Duration,

    /// Total lifetime after which a worker retires (default: `6h`).
    pub max_worker_lifetime: Duration,

    /// Idle time after which a *dynamic* worker retires (default: `10s`).
    ///
    /// Dynamic workers are spawned by the daemon under load and cool down
    /// much faster than the resident pool.
    pub max_dynamic_worker_idling: Duration,

    /// Global keep-alive gate (default: `true`). When off, every response
    /// tells the daemon to close the client connection.
    pub keep_alive: bool,

    /// Largest accepted request body (default: 10 MiB). Larger uploads
    /// answer `413` without touching handlers.
    pub max_upload_size: usize,

    /// User to switch to after connecting to the daemon (default: none).
    /// Resolution failure is fatal.
    pub user: Option<String>,

    /// Group to switch to, applied before the user switch (default: none).
    /// Resolution failure is fatal.
    pub group: Option<String>,
}

impl Default for WorkerLimits {
    fn default() -> Self {
        Self {
            max_request_time: Duration::from_secs(5),
            max_worker_idling: Duration::from_secs(60),
            max_worker_lifetime: Duration::from_secs(6 * 60 * 60),
            max_dynamic_worker_idling: Duration::from_secs(10),
            keep_alive: true,
            max_upload_size: 10 * 1024 * 1024,
            user: None,
            group: None,
        }
    }
}
