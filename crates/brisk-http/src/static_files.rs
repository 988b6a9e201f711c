//! Static file serving.
//!
//! GET/HEAD requests under the public folder are answered directly:
//! percent-decoded paths (with `..` segments rejected after decoding), a
//! `.gz` sibling when the client accepts gzip, `Last-Modified` and a
//! content-derived ETag with `If-None-Match`/`If-Range` handling, and a
//! single `bytes=a-b` range.  `OPTIONS` short-circuits with headers only.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use base64::Engine as _;
use parking_lot::RwLock;
use sha1::{Digest, Sha1};
use tracing::trace;

use crate::params::percent_decode;
use crate::request::HttpRequest;
use crate::response::imf_date;

// ---------------------------------------------------------------------------
// MIME registry
// ---------------------------------------------------------------------------

static MIME_OVERRIDES: RwLock<Vec<(String, String)>> = RwLock::new(Vec::new());

/// Register (or override) the MIME type served for a file extension.
pub fn mime_register(extension: &str, mime: &str) {
    let mut table = MIME_OVERRIDES.write();
    let extension = extension.trim_start_matches('.').to_ascii_lowercase();
    table.retain(|(ext, _)| *ext != extension);
    table.push((extension, mime.to_owned()));
}

fn mime_for(path: &Path) -> String {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    if let Some(ref ext) = extension {
        let table = MIME_OVERRIDES.read();
        if let Some((_, mime)) = table.iter().find(|(e, _)| e == ext) {
            return mime.clone();
        }
    }
    mime_guess::from_path(path)
        .first_raw()
        .unwrap_or("application/octet-stream")
        .to_owned()
}

// ---------------------------------------------------------------------------
// Serving
// ---------------------------------------------------------------------------

/// Try to answer `req` from `folder`.  Returns the request back when it is
/// not a static hit (wrong method, traversal, missing file) so the caller
/// can fall through to the application handler.
pub fn try_serve(folder: &Path, req: HttpRequest, max_age: u32) -> Option<HttpRequest> {
    let method_ok = req.method().eq_ignore_ascii_case(b"GET")
        || req.method().eq_ignore_ascii_case(b"HEAD")
        || req.method().eq_ignore_ascii_case(b"OPTIONS");
    if !method_ok {
        return Some(req);
    }

    let Some(path) = sanitize_path(folder, req.path()) else {
        return Some(req);
    };
    let path = if path.is_dir() {
        path.join("index.html")
    } else {
        path
    };

    // Prefer the pre-compressed sibling when the client speaks gzip.
    let accepts_gzip = req
        .header_str("accept-encoding")
        .is_some_and(|enc| enc.contains("gzip"));
    let mut gzipped = false;
    let mut serve_path = path.clone();
    if accepts_gzip {
        let candidate = PathBuf::from(format!("{}.gz", path.display()));
        if candidate.is_file() {
            serve_path = candidate;
            gzipped = true;
        }
    }

    let metadata = match std::fs::metadata(&serve_path) {
        Ok(meta) if meta.is_file() => meta,
        _ => return Some(req),
    };
    let size = metadata.len();
    let mtime = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map_or(0, |d| d.as_secs());
    let etag = derive_etag(size, mtime);

    serve_file(req, &path, &serve_path, size, mtime, &etag, gzipped, max_age);
    None
}

#[allow(clippy::too_many_arguments)]
fn serve_file(
    mut req: HttpRequest,
    logical_path: &Path,
    serve_path: &Path,
    size: u64,
    mtime: u64,
    etag: &str,
    gzipped: bool,
    max_age: u32,
) {
    req.set_header("etag", format!("\"{etag}\""));
    req.set_header("last-modified", imf_date(mtime));
    req.set_header("cache-control", format!("max-age={max_age}"));
    req.set_header("accept-ranges", &b"bytes"[..]);
    req.set_header("content-type", mime_for(logical_path));
    if gzipped {
        req.set_header("content-encoding", &b"gzip"[..]);
    }

    if req.method().eq_ignore_ascii_case(b"OPTIONS") {
        req.set_header("allow", &b"GET, HEAD, OPTIONS"[..]);
        req.reply(204, "");
        return;
    }

    // Conditional GET.
    if let Some(inm) = req.header_str("if-none-match") {
        if etag_matches(inm, etag) {
            req.set_status(304);
            req.finish();
            return;
        }
    }

    // A range is honored only when unconditional or when If-Range still
    // names the current representation.
    let range_allowed = match req.header_str("if-range") {
        Some(condition) => etag_matches(condition, etag),
        None => true,
    };
    let range = if range_allowed {
        req.header_str("range").and_then(|r| parse_range(r, size))
    } else {
        None
    };

    let file = match std::fs::File::open(serve_path) {
        Ok(file) => Arc::new(file),
        Err(err) => {
            trace!(path = %serve_path.display(), %err, "static open failed");
            req.reply(404, "Not Found");
            return;
        }
    };

    match range {
        Some((start, end)) => {
            req.set_status(206);
            req.set_header(
                "content-range",
                format!("bytes {start}-{end}/{size}"),
            );
            req.sendfile(file, start, end - start + 1);
        }
        None => req.sendfile(file, 0, size),
    }
}

/// Decode and normalize the request path under `folder`; `None` for
/// traversal attempts or undecodable paths.
fn sanitize_path(folder: &Path, raw: &[u8]) -> Option<PathBuf> {
    let decoded = percent_decode(raw, false);
    let text = std::str::from_utf8(&decoded).ok()?;
    let trimmed = text.trim_start_matches('/');
    // Reject `..` segments after decoding; encoded dots must not escape.
    if trimmed.split(['/', '\\']).any(|segment| segment == "..") {
        return None;
    }
    if trimmed.contains('\0') {
        return None;
    }
    Some(folder.join(trimmed))
}

/// ETag = base64 over the leading bytes of `sha1(size, mtime)`.
fn derive_etag(size: u64, mtime: u64) -> String {
    let mut hasher = Sha1::new();
    hasher.update(size.to_le_bytes());
    hasher.update(mtime.to_le_bytes());
    let digest = hasher.finalize();
    base64::engine::general_purpose::STANDARD_NO_PAD.encode(&digest[..12])
}

fn etag_matches(header: &str, etag: &str) -> bool {
    header
        .split(',')
        .map(str::trim)
        .any(|candidate| candidate == "*" || candidate.trim_matches('"') == etag)
}

/// Parse a single `bytes=a-b` range into an inclusive pair.  Multi-range
/// requests and unsatisfiable ranges are ignored (full response).
fn parse_range(header: &str, size: u64) -> Option<(u64, u64)> {
    let spec = header.strip_prefix("bytes=")?;
    if spec.contains(',') || size == 0 {
        return None;
    }
    let (start, end) = spec.split_once('-')?;
    let range = if start.is_empty() {
        // Suffix form: last N bytes.
        let suffix: u64 = end.parse().ok()?;
        if suffix == 0 {
            return None;
        }
        (size.saturating_sub(suffix), size - 1)
    } else {
        let start: u64 = start.parse().ok()?;
        let end: u64 = if end.is_empty() {
            size - 1
        } else {
            end.parse().ok()?
        };
        (start, end.min(size - 1))
    };
    if range.0 > range.1 || range.0 >= size {
        return None;
    }
    Some(range)
}
