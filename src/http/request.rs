//! Request model and the parse pipeline turning one daemon frame into it.

use crate::http::multipart::{self, FormData};
use crate::http::query::{self, BadEscape};
use crate::http::types::{slice_to_usize, Method, Version};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use log::debug;
use memchr::{memchr, memmem};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic per-process request counter, for log correlation.
static REQUEST_ID: AtomicU64 = AtomicU64::new(0);

/// Outcome of parsing one inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParsingStatus {
    #[default]
    Ok,
    /// Declared body exceeds the configured upload cap → `413`.
    MaxUploadSizeExceeded,
    /// Body grammar failure (multipart/urlencoded) → `422`.
    InvalidBody,
    /// Framing-level failure (request line, headers, escapes) → `400`.
    InvalidRequest,
}

/// One parsed HTTP request.
///
/// The worker owns a single instance and reuses it: [`clear`](Request::clear)
/// empties every mapping, truncates the buffers and unlinks spill files left
/// by the previous iteration.
#[derive(Debug, Default)]
pub struct Request {
    pub(crate) method: Method,
    pub(crate) uri: String,
    pub(crate) raw_query_string: String,
    pub(crate) raw_headers: String,
    pub(crate) raw_request_line: String,
    pub(crate) http_version: Version,
    pub(crate) host: String,
    pub(crate) worker: u32,
    pub(crate) request_id: u64,
    pub(crate) user: String,
    pub(crate) password: String,
    pub(crate) header: HashMap<String, String>,
    pub(crate) cookie: HashMap<String, String>,
    pub(crate) get: HashMap<String, String>,
    pub(crate) post: HashMap<String, String>,
    pub(crate) form: HashMap<String, FormData>,
    pub(crate) body: Vec<u8>,
    pub(crate) body_content_type: String,
    pub(crate) route: Vec<String>,
    pub(crate) parsing_status: ParsingStatus,
    pub(crate) keep_alive: bool,
}

// Public, read-only view for handlers.
impl Request {
    #[inline(always)]
    pub fn method(&self) -> Method {
        self.method
    }

    /// Normalized request path: always starts with `/`, never escapes it.
    #[inline(always)]
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Query string exactly as received, without the leading `?`.
    #[inline(always)]
    pub fn query_string(&self) -> &str {
        &self.raw_query_string
    }

    #[inline(always)]
    pub fn raw_headers(&self) -> &str {
        &self.raw_headers
    }

    #[inline(always)]
    pub fn raw_request_line(&self) -> &str {
        &self.raw_request_line
    }

    #[inline(always)]
    pub fn version(&self) -> Version {
        self.http_version
    }

    #[inline(always)]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Process id of the worker that parsed this request.
    #[inline(always)]
    pub fn worker(&self) -> u32 {
        self.worker
    }

    #[inline(always)]
    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    /// User name from Basic auth; empty when absent or undecodable.
    #[inline(always)]
    pub fn user(&self) -> &str {
        &self.user
    }

    #[inline(always)]
    pub fn password(&self) -> &str {
        &self.password
    }

    /// Header value by its lowercase name.
    #[inline(always)]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.header.get(name).map(String::as_str)
    }

    #[inline(always)]
    pub fn headers(&self) -> &HashMap<String, String> {
        &self.header
    }

    #[inline(always)]
    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookie.get(name).map(String::as_str)
    }

    #[inline(always)]
    pub fn cookies(&self) -> &HashMap<String, String> {
        &self.cookie
    }

    /// Decoded query parameter.
    #[inline(always)]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.get.get(name).map(String::as_str)
    }

    /// Decoded urlencoded body parameter.
    #[inline(always)]
    pub fn post(&self, name: &str) -> Option<&str> {
        self.post.get(name).map(String::as_str)
    }

    /// Multipart form field.
    #[inline(always)]
    pub fn form(&self, name: &str) -> Option<&FormData> {
        self.form.get(name)
    }

    #[inline(always)]
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    #[inline(always)]
    pub fn body_content_type(&self) -> &str {
        &self.body_content_type
    }

    /// Identifiers of the endpoints that observed this request, in order.
    #[inline(always)]
    pub fn route(&self) -> &[String] {
        &self.route
    }

    #[inline(always)]
    pub fn parsing_status(&self) -> ParsingStatus {
        self.parsing_status
    }

    /// Keep-alive as decided from version + `connection` header. False for
    /// requests that failed before the decision point.
    #[inline(always)]
    pub fn keep_alive_requested(&self) -> bool {
        self.keep_alive
    }
}

impl Request {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Resets for the next iteration. Spill files of the previous request
    /// are removed here.
    pub(crate) fn clear(&mut self) {
        multipart::remove_spill_files(&self.form);

        self.method = Method::Get;
        self.uri.clear();
        self.raw_query_string.clear();
        self.raw_headers.clear();
        self.raw_request_line.clear();
        self.http_version = Version::Http11;
        self.host.clear();
        self.user.clear();
        self.password.clear();
        self.header.clear();
        self.cookie.clear();
        self.get.clear();
        self.post.clear();
        self.form.clear();
        self.body.clear();
        self.body_content_type.clear();
        self.route.clear();
        self.parsing_status = ParsingStatus::Ok;
        self.keep_alive = false;
    }

    /// Parses one complete framed request (headers + body, as the daemon
    /// delivered it). Sets `parsing_status` instead of returning errors.
    pub(crate) fn parse(&mut self, data: &[u8], max_upload_size: usize) {
        self.worker = std::process::id();
        self.request_id = REQUEST_ID.fetch_add(1, Ordering::Relaxed);

        let Some(header_end) = memmem::find(data, b"\r\n\r\n") else {
            self.parsing_status = ParsingStatus::InvalidRequest;
            return;
        };
        let header_bytes = &data[..header_end];
        self.raw_headers = String::from_utf8_lossy(header_bytes).into_owned();

        // Request line: METHOD SP target SP VERSION.
        let line_end = memmem::find(header_bytes, b"\r\n").unwrap_or(header_bytes.len());
        let request_line = &header_bytes[..line_end];
        self.raw_request_line = String::from_utf8_lossy(request_line).into_owned();

        let mut tokens = request_line.split(|&b| b == b' ').filter(|t| !t.is_empty());
        let (method, target, version) = match (tokens.next(), tokens.next(), tokens.next()) {
            (Some(m), Some(t), Some(v)) if tokens.next().is_none() => (m, t, v),
            _ => {
                self.parsing_status = ParsingStatus::InvalidRequest;
                return;
            }
        };

        self.method = Method::from_bytes(method);
        if self.method == Method::Unknown {
            debug!("unknown method in request line {:?}", self.raw_request_line);
            self.parsing_status = ParsingStatus::InvalidRequest;
            return;
        }
        self.http_version = match Version::from_bytes(version) {
            Some(v) => v,
            None => {
                self.parsing_status = ParsingStatus::InvalidRequest;
                return;
            }
        };

        // Header lines. Names are lowercased; only the first content-length
        // is consulted for body sizing.
        let mut content_length: Option<usize> = None;
        let mut rest = &header_bytes[(line_end + 2).min(header_bytes.len())..];
        while !rest.is_empty() {
            let end = memmem::find(rest, b"\r\n").unwrap_or(rest.len());
            let line = &rest[..end];
            rest = &rest[(end + 2).min(rest.len())..];

            let Some(colon) = memchr(b':', line) else {
                continue;
            };
            let name = match simdutf8::basic::from_utf8(&line[..colon]) {
                Ok(n) => n.to_ascii_lowercase(),
                Err(_) => {
                    self.parsing_status = ParsingStatus::InvalidRequest;
                    return;
                }
            };
            let value = String::from_utf8_lossy(&line[colon + 1..]).trim().to_owned();

            if name == "content-length" && content_length.is_none() {
                content_length = slice_to_usize(value.as_bytes());
                if content_length.is_none() {
                    self.parsing_status = ParsingStatus::InvalidRequest;
                    return;
                }
            }
            self.header.insert(name, value);
        }

        self.keep_alive = match self.http_version {
            Version::Http10 => false,
            Version::Http11 => self
                .header
                .get("connection")
                .map(|v| v.eq_ignore_ascii_case("keep-alive"))
                .unwrap_or(true),
        };
        if let Some(host) = self.header.get("host") {
            self.host = host.clone();
        }

        // Body region: exactly content-length bytes after the terminator.
        // The daemon's framing is authoritative, so excess bytes are ignored
        // and a shortfall means the frame is corrupt.
        let body_region = &data[header_end + 4..];
        let declared = content_length.unwrap_or(0);
        if declared > max_upload_size {
            self.parsing_status = ParsingStatus::MaxUploadSizeExceeded;
            return;
        }
        if body_region.len() < declared {
            self.parsing_status = ParsingStatus::InvalidRequest;
            return;
        }
        self.body = body_region[..declared].to_vec();

        if !self.split_target(target) {
            self.parsing_status = ParsingStatus::InvalidRequest;
            return;
        }

        if query::parse_pairs(self.raw_query_string.as_bytes(), &mut self.get).is_err() {
            self.parsing_status = ParsingStatus::InvalidRequest;
            return;
        }

        self.parse_cookies();
        self.parse_basic_auth();
        self.decode_body();
    }

    /// Splits the request target into raw path and raw query; a `#` aborts
    /// the scan. The path is percent-decoded, then traversal-normalized.
    fn split_target(&mut self, target: &[u8]) -> bool {
        let target = match memchr(b'#', target) {
            Some(pos) => &target[..pos],
            None => target,
        };
        let (raw_path, raw_query) = match memchr(b'?', target) {
            Some(pos) => (&target[..pos], &target[pos + 1..]),
            None => (target, &[][..]),
        };

        self.raw_query_string = String::from_utf8_lossy(raw_query).into_owned();

        let decoded = match query::decode(raw_path, false) {
            Ok(p) => p,
            Err(BadEscape) => return false,
        };
        self.uri = normalize_path(&decoded);
        true
    }

    fn parse_cookies(&mut self) {
        let Some(value) = self.header.get("cookie").cloned() else {
            return;
        };

        for pair in value.split(';') {
            let Some((name, value)) = pair.split_once('=') else {
                continue;
            };
            let name = query::decode(name.trim().as_bytes(), false);
            let value = query::decode(value.trim().as_bytes(), false);
            if let (Ok(name), Ok(value)) = (name, value) {
                self.cookie.insert(name, value);
            }
        }
    }

    /// Basic auth is best-effort: a broken header leaves user/password
    /// empty and the request is still served.
    fn parse_basic_auth(&mut self) {
        let Some(value) = self.header.get("authorization") else {
            return;
        };
        let Some(encoded) = strip_prefix_ignore_case(value, "basic ") else {
            return;
        };

        match BASE64.decode(encoded.trim()) {
            Ok(credentials) => {
                let credentials = String::from_utf8_lossy(&credentials).into_owned();
                match credentials.split_once(':') {
                    Some((user, password)) => {
                        self.user = user.to_owned();
                        self.password = password.to_owned();
                    }
                    None => self.user = credentials,
                }
            }
            Err(error) => {
                debug!("undecodable basic auth header: {error}");
                self.user.clear();
                self.password.clear();
            }
        }
    }

    fn decode_body(&mut self) {
        let content_type = self.header.get("content-type").cloned().unwrap_or_default();
        self.body_content_type = content_type.clone();

        let (first_token, parameters) = match content_type.split_once(';') {
            Some((token, rest)) => (token.trim().to_ascii_lowercase(), rest.to_owned()),
            None => (content_type.trim().to_ascii_lowercase(), String::new()),
        };

        match first_token.as_str() {
            "application/x-www-form-urlencoded" => {
                if query::parse_pairs(&self.body, &mut self.post).is_err() {
                    self.post.clear();
                    self.parsing_status = ParsingStatus::InvalidBody;
                }
            }
            "multipart/form-data" => {
                if multipart::parse(&self.body, &parameters, &mut self.form).is_err() {
                    multipart::remove_spill_files(&self.form);
                    self.form.clear();
                    self.parsing_status = ParsingStatus::InvalidBody;
                }
            }
            _ => {}
        }
    }
}

/// Collapses `.` and `..` segments so the result never escapes `/`.
///
/// Walks segments in reverse: `..` skips the next real segment towards the
/// root, surplus `..` are absorbed. The result always begins with `/`.
pub(crate) fn normalize_path(path: &str) -> String {
    let mut kept: Vec<&str> = Vec::new();
    let mut skip = 0usize;

    for segment in path.split('/').rev() {
        match segment {
            "" | "." => {}
            ".." => skip += 1,
            _ if skip > 0 => skip -= 1,
            real => kept.push(real),
        }
    }

    let mut out = String::with_capacity(path.len().max(1));
    if kept.is_empty() {
        out.push('/');
        return out;
    }
    for segment in kept.iter().rev() {
        out.push('/');
        out.push_str(segment);
    }
    out
}

fn strip_prefix_ignore_case<'a>(value: &'a str, prefix: &str) -> Option<&'a str> {
    if value.len() >= prefix.len() && value[..prefix.len()].eq_ignore_ascii_case(prefix) {
        Some(&value[prefix.len()..])
    } else {
        None
    }
}
