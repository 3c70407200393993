use thiserror::Error;

/// Failures that terminate a worker.
///
/// Parse-level problems never surface here; they become 4xx responses and
/// the worker keeps serving. These errors end the process.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("control socket i/o failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed boot environment: {0}")]
    Boot(String),

    #[error("privilege drop failed: {0}")]
    Privilege(String),
}

/// Explicit failure for [`Output::set_cookie`](crate::Output::set_cookie)
/// with a cookie that was never given a name.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CookieError {
    #[error("cookie is invalid; build it with Cookie::new(name, value)")]
    Invalid,
}
