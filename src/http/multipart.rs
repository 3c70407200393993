//! `multipart/form-data` body decoding with temp-file spill for uploads.

use log::warn;
use memchr::memmem;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use std::{env, fs};

/// Monotonic per-process counter embedded in spill file names.
static UPLOAD_ID: AtomicU64 = AtomicU64::new(0);

/// One decoded form field.
///
/// Fields carrying a `filename` in their disposition are spilled to a temp
/// file ([`path`](FormData::path)); everything else stays inline in
/// [`data`](FormData::data). Spill files belong to the current request and
/// are unlinked when it is cleared.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FormData {
    /// Field name from the `content-disposition` header.
    pub name: String,
    /// Part content type, empty when the part did not declare one.
    pub content_type: String,
    /// Inline payload. Empty for file parts.
    pub data: Vec<u8>,
    /// Client-side file name. Empty for inline parts.
    pub filename: String,
    /// Spill location on disk. Empty for inline parts.
    pub path: PathBuf,
}

impl FormData {
    /// Whether this field was spilled to disk.
    #[inline(always)]
    pub fn is_file(&self) -> bool {
        !self.path.as_os_str().is_empty()
    }
}

/// Body did not follow the boundary grammar: the boundary is missing, a
/// chunk is not CRLF-delimited, or the terminal `--` marker never arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct InvalidMultipart;

/// Decodes `body` into `form`.
///
/// `parameters` is the raw tail of the `content-type` header after the
/// `multipart/form-data` token. On error the caller clears the form and
/// deletes any spill files already written.
pub(crate) fn parse(
    body: &[u8],
    parameters: &str,
    form: &mut HashMap<String, FormData>,
) -> Result<(), InvalidMultipart> {
    let boundary = match boundary_from_parameters(parameters) {
        Some(b) => b,
        None => boundary_from_body(body).ok_or(InvalidMultipart)?,
    };

    let marker = {
        let mut m = Vec::with_capacity(boundary.len() + 2);
        m.extend_from_slice(b"--");
        m.extend_from_slice(boundary.as_bytes());
        m
    };

    let positions: Vec<usize> = memmem::find_iter(body, &marker).collect();
    if positions.is_empty() {
        return Err(InvalidMultipart);
    }

    // Terminal chunk must be "--", optionally followed by a last CRLF.
    let tail = &body[positions[positions.len() - 1] + marker.len()..];
    if !tail.starts_with(b"--") {
        return Err(InvalidMultipart);
    }

    for window in positions.windows(2) {
        let chunk = &body[window[0] + marker.len()..window[1]];

        // Every chunk is CRLF-framed on both sides of the boundary line.
        let chunk = chunk
            .strip_prefix(b"\r\n")
            .and_then(|c| c.strip_suffix(b"\r\n"))
            .ok_or(InvalidMultipart)?;

        let field = parse_part(chunk)?;
        form.insert(field.name.clone(), field);
    }

    Ok(())
}

/// Unlinks every spill file referenced by `form`. Failures are logged; a
/// missing file is not an error.
pub(crate) fn remove_spill_files(form: &HashMap<String, FormData>) {
    for field in form.values() {
        if !field.is_file() {
            continue;
        }
        if let Err(error) = fs::remove_file(&field.path) {
            if error.kind() != std::io::ErrorKind::NotFound {
                warn!("could not remove upload {}: {}", field.path.display(), error);
            }
        }
    }
}

fn boundary_from_parameters(parameters: &str) -> Option<String> {
    for param in parameters.split(';') {
        let param = param.trim();
        let Some((key, value)) = param.split_once('=') else {
            continue;
        };
        if key.trim().eq_ignore_ascii_case("boundary") {
            let value = value.trim().trim_matches('"');
            if !value.is_empty() {
                return Some(value.to_owned());
            }
        }
    }
    None
}

/// Fallback: the first non-empty line of the body is the `--boundary` line.
fn boundary_from_body(body: &[u8]) -> Option<String> {
    let mut rest = body;
    loop {
        let line_end = memmem::find(rest, b"\r\n")?;
        let line = &rest[..line_end];
        if line.is_empty() {
            rest = &rest[line_end + 2..];
            continue;
        }
        let boundary = line.strip_prefix(b"--")?;
        return simdutf8::basic::from_utf8(boundary).ok().map(str::to_owned);
    }
}

fn parse_part(chunk: &[u8]) -> Result<FormData, InvalidMultipart> {
    let header_end = memmem::find(chunk, b"\r\n\r\n").ok_or(InvalidMultipart)?;
    let (header_bytes, payload) = (&chunk[..header_end], &chunk[header_end + 4..]);

    let mut field = FormData::default();

    for line in header_bytes.split(|&b| b == b'\n') {
        let line = simdutf8::basic::from_utf8(line)
            .map_err(|_| InvalidMultipart)?
            .trim_end_matches('\r');
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();

        if name.eq_ignore_ascii_case("content-disposition") {
            field.name = disposition_parameter(value, "name").unwrap_or_default();
            field.filename = disposition_parameter(value, "filename").unwrap_or_default();
        } else if name.eq_ignore_ascii_case("content-type") {
            field.content_type = value.to_owned();
        }
    }

    if field.name.is_empty() {
        return Err(InvalidMultipart);
    }

    if field.filename.is_empty() {
        field.data = payload.to_vec();
    } else {
        let path = next_spill_path(&field.filename);
        if let Err(error) = fs::write(&path, payload) {
            warn!("could not spill upload {}: {}", path.display(), error);
            return Err(InvalidMultipart);
        }
        field.path = path;
    }

    Ok(field)
}

/// Pulls a quoted parameter like `name="f"` out of a disposition value.
fn disposition_parameter(disposition: &str, key: &str) -> Option<String> {
    for param in disposition.split(';') {
        let param = param.trim();
        let Some((k, v)) = param.split_once('=') else {
            continue;
        };
        if k.trim().eq_ignore_ascii_case(key) {
            return Some(v.trim().trim_matches('"').to_owned());
        }
    }
    None
}

/// `upload_<unix-seconds>_<pid>_<5-digit-counter><original-extension>` in
/// the OS temp dir.
fn next_spill_path(filename: &str) -> PathBuf {
    let extension = Path::new(filename)
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    let unix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let counter = UPLOAD_ID.fetch_add(1, Ordering::Relaxed);

    env::temp_dir().join(format!(
        "upload_{}_{}_{:05}{}",
        unix,
        std::process::id(),
        counter,
        extension
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(parts: &str) -> Vec<u8> {
        parts.replace('\n', "\r\n").into_bytes()
    }

    #[test]
    fn single_file_part_spills() {
        let data = body(
            "--XYZ\n\
             Content-Disposition: form-data; name=\"f\"; filename=\"a.txt\"\n\
             Content-Type: text/plain\n\
             \n\
             HELLO\n\
             --XYZ--\n",
        );

        let mut form = HashMap::new();
        parse(&data, "; boundary=XYZ", &mut form).unwrap();

        let field = &form["f"];
        assert!(field.is_file());
        assert_eq!(field.filename, "a.txt");
        assert_eq!(field.content_type, "text/plain");
        assert!(field.data.is_empty());
        assert_eq!(fs::read(&field.path).unwrap(), b"HELLO");

        let name = field.path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("upload_"));
        assert!(name.ends_with(".txt"));

        remove_spill_files(&form);
        assert!(!field.path.exists());
    }

    #[test]
    fn inline_and_file_parts() {
        let data = body(
            "--AB\n\
             Content-Disposition: form-data; name=\"title\"\n\
             \n\
             hello world\n\
             --AB\n\
             Content-Disposition: form-data; name=\"doc\"; filename=\"r.bin\"\n\
             Content-Type: application/octet-stream\n\
             \n\
             \u{1}\u{2}\u{3}\n\
             --AB--\n",
        );

        let mut form = HashMap::new();
        parse(&data, " ; boundary=\"AB\"", &mut form).unwrap();

        assert_eq!(form.len(), 2);
        assert!(!form["title"].is_file());
        assert_eq!(form["title"].data, b"hello world");
        assert!(form["doc"].is_file());

        remove_spill_files(&form);
    }

    #[test]
    fn boundary_detected_from_body() {
        let data = body(
            "--guessme\n\
             Content-Disposition: form-data; name=\"x\"\n\
             \n\
             1\n\
             --guessme--\n",
        );

        let mut form = HashMap::new();
        parse(&data, "", &mut form).unwrap();
        assert_eq!(form["x"].data, b"1");
    }

    #[test]
    fn missing_boundary_is_invalid() {
        let mut form = HashMap::new();
        assert_eq!(
            parse(b"no markers here", "; boundary=XYZ", &mut form),
            Err(InvalidMultipart)
        );
    }

    #[test]
    fn truncated_trailer_is_invalid() {
        let data = body(
            "--XYZ\n\
             Content-Disposition: form-data; name=\"f\"\n\
             \n\
             data\n\
             --XYZ\n",
        );

        let mut form = HashMap::new();
        assert_eq!(parse(&data, "; boundary=XYZ", &mut form), Err(InvalidMultipart));
    }

    #[test]
    fn chunk_without_crlf_frame_is_invalid() {
        let data = b"--XYZ Content-Disposition: form-data; name=\"f\"\r\n\r\nx\r\n--XYZ--".to_vec();

        let mut form = HashMap::new();
        assert_eq!(parse(&data, "; boundary=XYZ", &mut form), Err(InvalidMultipart));
    }

    #[test]
    fn part_without_name_is_invalid() {
        let data = body(
            "--XYZ\n\
             Content-Type: text/plain\n\
             \n\
             orphan\n\
             --XYZ--\n",
        );

        let mut form = HashMap::new();
        assert_eq!(parse(&data, "; boundary=XYZ", &mut form), Err(InvalidMultipart));
    }

    #[test]
    fn spill_names_are_unique() {
        let a = next_spill_path("x.dat");
        let b = next_spill_path("x.dat");
        assert_ne!(a, b);
    }
}
