//! Minimal worker binary. Run it under a daemon that sets SERVERINO_DAEMON
//! and SERVERINO_SOCKET; it serves /hello and a static file at /readme.

use hive_web::{Endpoint, Registry, Worker, WorkerLimits};

fn main() -> Result<(), hive_web::WorkerError> {
    env_logger::init();

    let mut registry = Registry::new();

    registry.register(
        Endpoint::new("hello", |req, out| {
            out.add_header("content-type", "text/plain");
            out.write(format!("hello from worker {}\n", req.worker()));
        })
        .route_equals("/hello")
        .priority(1),
    );

    registry.register(
        Endpoint::new("readme", |_, out| {
            if !out.serve_file("README.md") {
                out.set_status(404);
            }
        })
        .route_equals("/readme"),
    );

    registry.on_startup(|| log::info!("worker ready"));
    registry.on_shutdown(|| log::info!("worker retiring"));

    Worker::new(registry, WorkerLimits::default()).run()
}
