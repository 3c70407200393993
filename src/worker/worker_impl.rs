//! Worker process lifecycle: boot, privilege drop, request loop, retirement.

use crate::errors::WorkerError;
use crate::handler::Registry;
use crate::http::request::{ParsingStatus, Request};
use crate::http::response::Output;
use crate::limits::WorkerLimits;
use crate::worker::channel::{DaemonChannel, FrameRead};
use crate::worker::watchdog;
use log::{info, warn};
use std::env;
use std::ffi::CString;
use std::time::{Duration, Instant};

/// Boot parameters handed down by the daemon through the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootEnv {
    /// Pid of the supervising daemon; the worker exits once it is gone.
    pub daemon_pid: i32,
    /// Control socket name. Linux: abstract namespace; elsewhere: path.
    pub socket_name: String,
    /// Dynamic workers cool down on the shorter idle limit.
    pub dynamic: bool,
}

impl BootEnv {
    pub(crate) fn from_env() -> Result<Self, WorkerError> {
        let daemon_pid = env::var("SERVERINO_DAEMON")
            .ok()
            .and_then(|value| value.parse::<i32>().ok())
            .filter(|pid| *pid > 0)
            .ok_or_else(|| WorkerError::Boot("SERVERINO_DAEMON is missing or not a pid".into()))?;

        let socket_name = env::var("SERVERINO_SOCKET")
            .ok()
            .filter(|name| !name.is_empty())
            .ok_or_else(|| WorkerError::Boot("SERVERINO_SOCKET is missing".into()))?;

        let dynamic = env::var("SERVERINO_DYNAMIC_WORKER").as_deref() == Ok("1");

        Ok(Self {
            daemon_pid,
            socket_name,
            dynamic,
        })
    }
}

/// Why the worker decided to retire, `None` to keep serving. Evaluated on
/// every idle tick of the control socket.
pub(crate) fn retirement_reason(
    idle: Duration,
    lifetime: Duration,
    dynamic: bool,
    limits: &WorkerLimits,
) -> Option<&'static str> {
    if lifetime > limits.max_worker_lifetime {
        return Some("lifetime limit reached");
    }
    if idle > limits.max_worker_idling {
        return Some("idle limit reached");
    }
    if dynamic && idle > limits.max_dynamic_worker_idling {
        return Some("dynamic cooldown reached");
    }
    None
}

/// Parses one frame and produces the complete response in `output`.
///
/// Everything between "frame received" and "frame sent": reset, parse,
/// status mapping, dispatch, 404 fallback, header build.
pub(crate) fn process_frame(
    registry: &Registry,
    limits: &WorkerLimits,
    frame: &[u8],
    request: &mut Request,
    output: &mut Output,
) {
    request.clear();
    output.clear();

    request.parse(frame, limits.max_upload_size);

    output.set_version(request.version());
    output.set_keep_alive(limits.keep_alive && request.keep_alive_requested());

    match request.parsing_status() {
        ParsingStatus::Ok => {
            if request.method().suppresses_body() {
                output.set_send_body(false);
            }

            watchdog::mark_processing_started();
            registry.dispatch(request, output);
            watchdog::mark_processing_done();

            if !output.dirty() {
                output.reset_to_status(404);
            }
        }
        ParsingStatus::InvalidRequest => output.reset_to_status(400),
        ParsingStatus::MaxUploadSizeExceeded => output.reset_to_status(413),
        ParsingStatus::InvalidBody => output.reset_to_status(422),
    }

    output.build_headers();
}

/// A worker process serving one request at a time.
///
/// Built around a [`Registry`] of endpoints, it connects back to the
/// daemon named in the boot environment and serves frames until one of the
/// retirement rules fires, the daemon goes away, or the watchdog kills it.
pub struct Worker {
    registry: Registry,
    limits: WorkerLimits,
}

impl Worker {
    pub fn new(registry: Registry, limits: WorkerLimits) -> Self {
        Self { registry, limits }
    }

    /// Runs the worker to completion on its own runtime.
    ///
    /// Returns `Ok(())` on clean retirement; the embedding binary maps
    /// [`WorkerError`] to its exit code. The watchdog's forced exit never
    /// returns here.
    pub fn run(mut self) -> Result<(), WorkerError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()?;
        runtime.block_on(self.run_async())
    }

    async fn run_async(&mut self) -> Result<(), WorkerError> {
        let boot = BootEnv::from_env()?;

        let mut channel = DaemonChannel::connect(&boot.socket_name).await?;
        channel.send_ack().await?;

        drop_privileges(&self.limits)?;
        if unsafe { libc::geteuid() } == 0 {
            warn!("worker {} is running as root", std::process::id());
        }
        redirect_stdin_to_null();

        self.registry.seal();
        self.registry.run_startup_hooks();

        watchdog::arm_request_timeout(self.limits.max_request_time);
        let _watchdog = watchdog::spawn(channel.writer());

        let started = Instant::now();
        let mut last_request = Instant::now();
        let mut request = Request::new();
        let mut output = Output::new();

        info!("worker {} serving", std::process::id());

        let result = loop {
            match channel.read_frame(Duration::from_secs(1)).await {
                Ok(FrameRead::Idle) => {
                    if let Some(reason) = retirement_reason(
                        last_request.elapsed(),
                        started.elapsed(),
                        boot.dynamic,
                        &self.limits,
                    ) {
                        info!("worker {} retiring: {reason}", std::process::id());
                        break Ok(());
                    }
                    if !process_alive(boot.daemon_pid) {
                        info!("daemon {} is gone; exiting", boot.daemon_pid);
                        break Ok(());
                    }
                }
                Ok(FrameRead::Closed) => {
                    info!("daemon closed the control socket");
                    break Ok(());
                }
                Ok(FrameRead::Frame) => {
                    // Open the send slot for this iteration and re-arm the
                    // configured deadline before any handler runs.
                    watchdog::release_send_slot();
                    watchdog::arm_request_timeout(self.limits.max_request_time);

                    process_frame(
                        &self.registry,
                        &self.limits,
                        channel.frame(),
                        &mut request,
                        &mut output,
                    );

                    if !watchdog::claim_send_slot() {
                        // The watchdog answered 504 and is taking the
                        // process down.
                        return Ok(());
                    }
                    channel
                        .writer()
                        .send(
                            output.keep_alive(),
                            output.headers_buffer().as_slice(),
                            output.send_buffer().as_slice(),
                        )
                        .await?;

                    last_request = Instant::now();
                }
                Err(error) => break Err(WorkerError::Io(error)),
            }
        };

        // Self-terminating exit: spill files of the last request go away
        // and shutdown hooks run. The watchdog path skips all of this.
        request.clear();
        self.registry.run_shutdown_hooks();
        channel.writer().shutdown().await;

        result
    }
}

/// Switches group then user as configured. Resolution or switch failure is
/// fatal: a worker that cannot shed root must not serve.
fn drop_privileges(limits: &WorkerLimits) -> Result<(), WorkerError> {
    if let Some(group) = &limits.group {
        let gid = resolve_group(group)
            .ok_or_else(|| WorkerError::Privilege(format!("unknown group {group}")))?;
        if unsafe { libc::setgid(gid) } != 0 {
            return Err(WorkerError::Privilege(format!(
                "setgid({gid}): {}",
                std::io::Error::last_os_error()
            )));
        }
    }

    if let Some(user) = &limits.user {
        let uid = resolve_user(user)
            .ok_or_else(|| WorkerError::Privilege(format!("unknown user {user}")))?;
        if unsafe { libc::setuid(uid) } != 0 {
            return Err(WorkerError::Privilege(format!(
                "setuid({uid}): {}",
                std::io::Error::last_os_error()
            )));
        }
    }

    Ok(())
}

fn resolve_user(name: &str) -> Option<libc::uid_t> {
    let name = CString::new(name).ok()?;
    let passwd = unsafe { libc::getpwnam(name.as_ptr()) };
    if passwd.is_null() {
        None
    } else {
        Some(unsafe { (*passwd).pw_uid })
    }
}

fn resolve_group(name: &str) -> Option<libc::gid_t> {
    let name = CString::new(name).ok()?;
    let group = unsafe { libc::getgrnam(name.as_ptr()) };
    if group.is_null() {
        None
    } else {
        Some(unsafe { (*group).gr_gid })
    }
}

/// Points stdin at the null device so handlers cannot read an inherited fd.
fn redirect_stdin_to_null() {
    let Ok(path) = CString::new("/dev/null") else {
        return;
    };
    let fd = unsafe { libc::open(path.as_ptr(), libc::O_RDONLY) };
    if fd < 0 {
        warn!("could not open /dev/null: {}", std::io::Error::last_os_error());
        return;
    }
    unsafe {
        libc::dup2(fd, libc::STDIN_FILENO);
        libc::close(fd);
    }
}

/// Signal-0 liveness probe.
fn process_alive(pid: i32) -> bool {
    unsafe { libc::kill(pid, 0) == 0 }
}
