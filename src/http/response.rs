//! Response accumulation and header emission.

use crate::buffer::Buffer;
use crate::errors::CookieError;
use crate::http::cookie::{http_date_after, Cookie};
use crate::http::mime;
use crate::http::types::{status_phrase, Version};
use log::warn;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Headers the system emits itself; user attempts are warned and ignored.
const RESERVED_HEADERS: [&str; 3] = ["content-length", "status", "transfer-encoding"];

/// Response under construction.
///
/// Handlers mutate it through the write/header/cookie methods; any
/// user-visible mutation marks it dirty, which ends the dispatch chain.
/// The worker owns one instance and reuses its buffers across iterations.
#[derive(Debug)]
pub struct Output {
    status: u16,
    http_version: Version,
    keep_alive: bool,
    headers: Vec<(String, String)>,
    cookies: Vec<Cookie>,
    send_body: bool,
    dirty: bool,
    headers_buffer: Buffer,
    send_buffer: Buffer,
    timeout: Option<Duration>,
}

impl Default for Output {
    fn default() -> Self {
        Self::new()
    }
}

impl Output {
    pub(crate) fn new() -> Self {
        Self {
            status: 200,
            http_version: Version::Http11,
            keep_alive: true,
            headers: Vec::new(),
            cookies: Vec::new(),
            send_body: true,
            dirty: false,
            headers_buffer: Buffer::with_capacity(512),
            send_buffer: Buffer::with_capacity(4096),
            timeout: None,
        }
    }

    pub(crate) fn clear(&mut self) {
        self.status = 200;
        self.http_version = Version::Http11;
        self.keep_alive = true;
        self.headers.clear();
        self.cookies.clear();
        self.send_body = true;
        self.dirty = false;
        self.headers_buffer.clear();
        self.send_buffer.clear();
        self.timeout = None;
    }

    /// Drops everything user-visible and pins a bare status, keeping the
    /// keep-alive decision. Used for error short-circuits (400/500/...).
    pub(crate) fn reset_to_status(&mut self, status: u16) {
        self.headers.clear();
        self.cookies.clear();
        self.headers_buffer.clear();
        self.send_buffer.clear();
        self.status = status;
        self.send_body = false;
        self.dirty = true;
    }
}

// Handler-facing surface.
impl Output {
    /// Appends bytes (or a string) to the response body.
    #[inline]
    pub fn write(&mut self, data: impl AsRef<[u8]>) {
        self.send_buffer.append(data.as_ref());
        self.dirty = true;
    }

    /// Current status code (default `200`).
    #[inline(always)]
    pub fn status(&self) -> u16 {
        self.status
    }

    /// Sets the status code.
    #[inline]
    pub fn set_status(&mut self, status: u16) {
        self.status = status;
        self.dirty = true;
    }

    /// Adds a response header. The name is lowercased. The reserved
    /// `content-length`, `status` and `transfer-encoding` are emitted by the
    /// system only; setting them is warned and ignored.
    pub fn add_header(&mut self, name: impl AsRef<str>, value: impl Into<String>) {
        let name = name.as_ref().to_ascii_lowercase();
        if RESERVED_HEADERS.contains(&name.as_str()) {
            warn!("header {name} is reserved and cannot be set by handlers");
            return;
        }
        self.headers.push((name, value.into()));
        self.dirty = true;
    }

    /// Adds a header whose value is the HTTP date `now + offset`.
    pub fn add_header_date(&mut self, name: impl AsRef<str>, offset: Duration) {
        self.add_header(name, http_date_after(offset));
    }

    /// Queues a cookie for emission. Fails on a cookie built without a name.
    pub fn set_cookie(&mut self, cookie: Cookie) -> Result<(), CookieError> {
        if !cookie.valid() {
            return Err(CookieError::Invalid);
        }
        self.cookies.push(cookie);
        self.dirty = true;
        Ok(())
    }

    /// Whether a body will be emitted. Cleared automatically for CONNECT,
    /// HEAD and TRACE and for error short-circuits.
    #[inline(always)]
    pub fn send_body(&self) -> bool {
        self.send_body
    }

    #[inline]
    pub fn set_send_body(&mut self, send_body: bool) {
        self.send_body = send_body;
    }

    /// Tells the daemon whether to keep the client connection open.
    #[inline(always)]
    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    #[inline]
    pub fn set_keep_alive(&mut self, keep_alive: bool) {
        self.keep_alive = keep_alive;
    }

    /// Raises the watchdog deadline for the current request only.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = Some(timeout);
        crate::worker::watchdog::override_request_timeout(timeout);
    }

    /// The per-request deadline override, when one was set.
    #[inline(always)]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// True once any user-visible mutation happened; ends dispatch.
    #[inline(always)]
    pub fn dirty(&self) -> bool {
        self.dirty
    }

    /// Reads a whole file into the body, guessing the content type from the
    /// extension. Returns `false` (leaving the response untouched) when the
    /// path is missing or not a regular file.
    pub fn serve_file(&mut self, path: impl AsRef<Path>) -> bool {
        let path = path.as_ref();

        let metadata = match fs::metadata(path) {
            Ok(m) => m,
            Err(error) => {
                warn!("cannot serve {}: {}", path.display(), error);
                return false;
            }
        };
        if !metadata.is_file() {
            warn!("cannot serve {}: not a regular file", path.display());
            return false;
        }

        let contents = match fs::read(path) {
            Ok(c) => c,
            Err(error) => {
                warn!("cannot serve {}: {}", path.display(), error);
                return false;
            }
        };

        if !self.has_header("content-type") {
            let extension = path
                .extension()
                .map(|e| e.to_string_lossy().into_owned())
                .unwrap_or_default();
            self.add_header("content-type", mime::content_type_for(&extension));
        }

        self.send_buffer.reserve(contents.len());
        self.write(contents);
        true
    }
}

// Worker-facing surface.
impl Output {
    #[inline(always)]
    pub(crate) fn set_version(&mut self, version: Version) {
        self.http_version = version;
    }

    #[inline(always)]
    pub(crate) fn headers_buffer(&self) -> &Buffer {
        &self.headers_buffer
    }

    #[inline(always)]
    pub(crate) fn send_buffer(&self) -> &Buffer {
        &self.send_buffer
    }

    fn has_header(&self, name: &str) -> bool {
        self.headers.iter().any(|(k, _)| k == name)
    }

    /// Serializes the status line and headers into the headers buffer.
    ///
    /// Emission order is fixed: status line, connection, content-length,
    /// user headers, default content-type, set-cookie lines, blank line.
    /// When the body is suppressed the send buffer is cleared afterwards.
    pub(crate) fn build_headers(&mut self) {
        use std::io::Write;

        self.headers_buffer.clear();

        let _ = write!(
            self.headers_buffer,
            "{} {} {}\r\n",
            self.http_version.as_str(),
            self.status,
            status_phrase(self.status)
        );

        let connection = if self.keep_alive { "keep-alive" } else { "close" };
        let _ = write!(self.headers_buffer, "connection: {connection}\r\n");

        let content_length = if self.send_body { self.send_buffer.len() } else { 0 };
        let _ = write!(self.headers_buffer, "content-length: {content_length}\r\n");

        let mut have_content_type = false;
        for (name, value) in &self.headers {
            if !self.send_body && (name == "content-length" || name == "transfer-encoding") {
                continue;
            }
            have_content_type |= name == "content-type";
            let _ = write!(self.headers_buffer, "{name}: {value}\r\n");
        }

        if self.send_body && !have_content_type {
            self.headers_buffer.append(b"content-type: text/html;charset=utf-8\r\n");
        }

        for cookie in &self.cookies {
            let _ = write!(self.headers_buffer, "set-cookie: {}\r\n", cookie.header_value());
        }

        self.headers_buffer.append(b"\r\n");

        if !self.send_body {
            self.send_buffer.clear();
        }
    }
}
