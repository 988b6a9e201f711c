//! The HTTP/1.x byte parser.
//!
//! A pure state machine fed arbitrary byte spans.  It owns no buffers:
//! `parse` reports how many bytes it consumed and the caller resubmits the
//! unconsumed tail together with more data.  Events fire through
//! [`Http1Events`]; any callback may reject, which aborts the message.
//!
//! Both CRLF and bare LF terminate lines.  Header names are lowercased
//! before the `on_header` event.  `Transfer-Encoding: chunked` wins over
//! `Content-Length`; after unchunking, a `content-length` header carrying
//! the decoded length is synthesized so downstream code sees a coherent
//! message.  Parsing stops at each message boundary — the caller decides
//! when the next pipelined message may start.

use crate::error::ParseError;

// ---------------------------------------------------------------------------
// Options & events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Http1Options {
    /// Total header-section bytes allowed.
    pub max_header_size: usize,
    /// Longest single header line.
    pub max_header_line: usize,
    pub max_header_count: usize,
    /// Accept `chunked` in the middle of a Transfer-Encoding list.  Off by
    /// default: the strict reading requires chunked to be final.
    pub tolerant_chunked: bool,
}

impl Default for Http1Options {
    fn default() -> Self {
        Http1Options {
            max_header_size: 32 * 1024,
            max_header_line: 8 * 1024,
            max_header_count: 128,
            tolerant_chunked: false,
        }
    }
}

pub type ParseStep = Result<(), ParseError>;

/// Parser event sink.  Default implementations accept and ignore.
pub trait Http1Events {
    fn on_method(&mut self, _method: &[u8]) -> ParseStep {
        Ok(())
    }
    fn on_path(&mut self, _path: &[u8]) -> ParseStep {
        Ok(())
    }
    fn on_query(&mut self, _query: &[u8]) -> ParseStep {
        Ok(())
    }
    fn on_version(&mut self, _version: &[u8]) -> ParseStep {
        Ok(())
    }
    fn on_status(&mut self, _code: u16, _reason: &[u8]) -> ParseStep {
        Ok(())
    }
    /// `name` arrives lowercased; `value` is trimmed.
    fn on_header(&mut self, _name: &[u8], _value: &[u8]) -> ParseStep {
        Ok(())
    }
    fn on_body_chunk(&mut self, _data: &[u8]) -> ParseStep {
        Ok(())
    }
    /// A complete request was parsed.
    fn on_request(&mut self) -> ParseStep {
        Ok(())
    }
    /// A complete response was parsed.
    fn on_response(&mut self) -> ParseStep {
        Ok(())
    }
    fn on_error(&mut self, _error: &ParseError) {}
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Start,
    Headers,
    Body,
    ChunkSize,
    ChunkData(u64),
    /// The CRLF that trails each chunk's data.
    ChunkDataEnd,
    Trailers,
}

#[derive(Debug)]
pub struct Http1Parser {
    opts: Http1Options,
    state: State,
    is_response: bool,
    content_length: Option<u64>,
    chunked: bool,
    body_read: u64,
    header_bytes: usize,
    header_count: usize,
}

impl Http1Parser {
    pub fn new(opts: Http1Options) -> Self {
        Http1Parser {
            opts,
            state: State::Start,
            is_response: false,
            content_length: None,
            chunked: false,
            body_read: 0,
            header_bytes: 0,
            header_count: 0,
        }
    }

    /// Whether a message is mid-parse (useful for shutdown decisions).
    pub fn mid_message(&self) -> bool {
        self.state != State::Start
    }

    /// The body bytes delivered so far for the current message.
    pub fn body_read(&self) -> u64 {
        self.body_read
    }

    /// Feed bytes.  Returns how many were consumed; the tail must be
    /// resubmitted later with more data.  Stops after each complete message.
    pub fn parse<E: Http1Events>(&mut self, buf: &[u8], events: &mut E) -> Result<usize, ParseError> {
        match self.parse_inner(buf, events) {
            Ok(consumed) => Ok(consumed),
            Err(err) => {
                events.on_error(&err);
                Err(err)
            }
        }
    }

    fn parse_inner<E: Http1Events>(
        &mut self,
        buf: &[u8],
        events: &mut E,
    ) -> Result<usize, ParseError> {
        let mut pos = 0usize;
        loop {
            match self.state {
                State::Start => {
                    let Some((line, next)) = take_line(buf, pos, self.opts.max_header_line)? else {
                        return Ok(pos);
                    };
                    pos = next;
                    if line.is_empty() {
                        // Tolerate stray blank lines between messages.
                        continue;
                    }
                    self.begin_message(line, events)?;
                    self.state = State::Headers;
                }

                State::Headers => {
                    let Some((line, next)) = take_line(buf, pos, self.opts.max_header_line)? else {
                        return Ok(pos);
                    };
                    pos = next;
                    if line.is_empty() {
                        let body_expected = match self.content_length {
                            Some(0) => false,
                            Some(_) => true,
                            // A length-less response body runs until close;
                            // a length-less request has no body.
                            None => !self.chunked && self.is_response,
                        };
                        if self.chunked {
                            self.state = State::ChunkSize;
                        } else if body_expected {
                            self.state = State::Body;
                        } else {
                            return self.complete(events).map(|()| pos);
                        }
                        continue;
                    }
                    self.consume_header(line, events)?;
                }

                State::Body => {
                    let avail = &buf[pos..];
                    if avail.is_empty() {
                        return Ok(pos);
                    }
                    match self.content_length {
                        Some(total) => {
                            let want =
                                usize::try_from(total - self.body_read).unwrap_or(usize::MAX);
                            let take = want.min(avail.len());
                            events.on_body_chunk(&avail[..take])?;
                            self.body_read += take as u64;
                            pos += take;
                            if self.body_read == total {
                                return self.complete(events).map(|()| pos);
                            }
                            return Ok(pos);
                        }
                        None => {
                            // Read-until-close response body.
                            events.on_body_chunk(avail)?;
                            self.body_read += avail.len() as u64;
                            return Ok(buf.len());
                        }
                    }
                }

                State::ChunkSize => {
                    let Some((line, next)) = take_line(buf, pos, self.opts.max_header_line)? else {
                        return Ok(pos);
                    };
                    pos = next;
                    if line.is_empty() {
                        // The CRLF after the previous chunk's data shows up
                        // here when ChunkDataEnd already consumed one.
                        continue;
                    }
                    let size = parse_chunk_size(line)?;
                    if size == 0 {
                        self.state = State::Trailers;
                    } else {
                        self.state = State::ChunkData(size);
                    }
                }

                State::ChunkData(remaining) => {
                    let avail = &buf[pos..];
                    if avail.is_empty() {
                        return Ok(pos);
                    }
                    let take = usize::try_from(remaining).unwrap_or(usize::MAX).min(avail.len());
                    events.on_body_chunk(&avail[..take])?;
                    self.body_read += take as u64;
                    pos += take;
                    let left = remaining - take as u64;
                    if left == 0 {
                        self.state = State::ChunkDataEnd;
                    } else {
                        self.state = State::ChunkData(left);
                        return Ok(pos);
                    }
                }

                State::ChunkDataEnd => {
                    let Some((line, next)) = take_line(buf, pos, self.opts.max_header_line)? else {
                        return Ok(pos);
                    };
                    pos = next;
                    if !line.is_empty() {
                        return Err(ParseError::BadChunk);
                    }
                    self.state = State::ChunkSize;
                }

                State::Trailers => {
                    let Some((line, next)) = take_line(buf, pos, self.opts.max_header_line)? else {
                        return Ok(pos);
                    };
                    pos = next;
                    if line.is_empty() {
                        // Make the decoded length visible as an ordinary
                        // header before the completion event.
                        let decoded = self.body_read.to_string();
                        events.on_header(b"content-length", decoded.as_bytes())?;
                        return self.complete(events).map(|()| pos);
                    }
                    self.consume_trailer(line, events)?;
                }
            }
        }
    }

    fn begin_message<E: Http1Events>(&mut self, line: &[u8], events: &mut E) -> ParseStep {
        self.content_length = None;
        self.chunked = false;
        self.body_read = 0;
        self.header_bytes = 0;
        self.header_count = 0;

        if line.starts_with(b"HTTP/") {
            self.is_response = true;
            let mut parts = line.splitn(3, |&b| b == b' ');
            let version = parts.next().ok_or(ParseError::BadRequestLine)?;
            let code = parts.next().ok_or(ParseError::BadRequestLine)?;
            let reason = parts.next().unwrap_or(b"");
            let code: u16 = std::str::from_utf8(code)
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or(ParseError::BadRequestLine)?;
            events.on_version(version)?;
            events.on_status(code, reason)?;
            return Ok(());
        }

        self.is_response = false;
        let mut parts = line.splitn(3, |&b| b == b' ');
        let method = parts.next().ok_or(ParseError::BadRequestLine)?;
        let target = parts.next().ok_or(ParseError::BadRequestLine)?;
        let version = parts.next().ok_or(ParseError::BadRequestLine)?;
        if method.is_empty() || target.is_empty() || !version.starts_with(b"HTTP/") {
            return Err(ParseError::BadRequestLine);
        }
        events.on_method(method)?;

        // Absolute-form targets carry the authority inline; split it out and
        // surface it as a host header.
        let (host, origin) = split_absolute_form(target);
        let (path, query) = match origin.iter().position(|&b| b == b'?') {
            Some(idx) => (&origin[..idx], &origin[idx + 1..]),
            None => (origin, &b""[..]),
        };
        events.on_path(path)?;
        if !query.is_empty() {
            events.on_query(query)?;
        }
        events.on_version(version)?;
        if let Some(host) = host {
            events.on_header(b"host", host)?;
        }
        Ok(())
    }

    fn consume_header<E: Http1Events>(&mut self, line: &[u8], events: &mut E) -> ParseStep {
        self.header_bytes += line.len();
        if self.header_bytes > self.opts.max_header_size {
            return Err(ParseError::HeadersTooLarge);
        }
        self.header_count += 1;
        if self.header_count > self.opts.max_header_count {
            return Err(ParseError::TooManyHeaders);
        }

        let (name, value) = split_header(line)?;
        let lowered = name.to_ascii_lowercase();

        match lowered.as_slice() {
            b"content-length" => {
                let parsed: u64 = std::str::from_utf8(value)
                    .ok()
                    .and_then(|s| s.trim().parse().ok())
                    .ok_or(ParseError::BadHeader)?;
                if let Some(existing) = self.content_length {
                    if existing != parsed {
                        return Err(ParseError::ContentLengthConflict);
                    }
                }
                if !self.chunked {
                    self.content_length = Some(parsed);
                }
            }
            b"transfer-encoding" => {
                if encoding_lists_chunked(value, self.opts.tolerant_chunked)? {
                    self.chunked = true;
                    // Chunked wins; any content-length is framing noise.
                    self.content_length = None;
                }
            }
            _ => {}
        }
        events.on_header(&lowered, value)
    }

    fn consume_trailer<E: Http1Events>(&mut self, line: &[u8], events: &mut E) -> ParseStep {
        let (name, value) = split_header(line)?;
        let lowered = name.to_ascii_lowercase();
        // Only innocuous trailers pass: anything that could change message
        // semantics after the body is dropped.
        let allowed = lowered.starts_with(b"x-") || lowered.as_slice() == b"server-timing";
        if allowed {
            events.on_header(&lowered, value)?;
        }
        Ok(())
    }

    fn complete<E: Http1Events>(&mut self, events: &mut E) -> ParseStep {
        let is_response = self.is_response;
        self.state = State::Start;
        if is_response {
            events.on_response()
        } else {
            events.on_request()
        }
    }

    /// EOF notification for read-until-close response bodies.
    pub fn finish<E: Http1Events>(&mut self, events: &mut E) -> ParseStep {
        if self.is_response && self.state == State::Body && self.content_length.is_none() {
            return self.complete(events);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Lexing helpers
// ---------------------------------------------------------------------------

/// Extract the next line (without its terminator).  `None` means the line is
/// still incomplete; a line exceeding `max_line` without a terminator is an
/// error rather than an invitation to buffer forever.
fn take_line(buf: &[u8], pos: usize, max_line: usize) -> Result<Option<(&[u8], usize)>, ParseError> {
    let rest = &buf[pos..];
    match rest.iter().position(|&b| b == b'\n') {
        Some(idx) => {
            let mut line = &rest[..idx];
            if line.last() == Some(&b'\r') {
                line = &line[..line.len() - 1];
            }
            if line.len() > max_line {
                return Err(ParseError::HeadersTooLarge);
            }
            Ok(Some((line, pos + idx + 1)))
        }
        None => {
            if rest.len() > max_line {
                return Err(ParseError::HeadersTooLarge);
            }
            Ok(None)
        }
    }
}

fn split_header(line: &[u8]) -> Result<(&[u8], &[u8]), ParseError> {
    let colon = line
        .iter()
        .position(|&b| b == b':')
        .ok_or(ParseError::BadHeader)?;
    let name = &line[..colon];
    if name.is_empty() || name.ends_with(b" ") || name.ends_with(b"\t") {
        return Err(ParseError::BadHeader);
    }
    let mut value = &line[colon + 1..];
    while value.first() == Some(&b' ') || value.first() == Some(&b'\t') {
        value = &value[1..];
    }
    while value.last() == Some(&b' ') || value.last() == Some(&b'\t') {
        value = &value[..value.len() - 1];
    }
    Ok((name, value))
}

/// For `http://host/path` targets, return `(Some(host), "/path")`.
fn split_absolute_form(target: &[u8]) -> (Option<&[u8]>, &[u8]) {
    let rest = if let Some(rest) = target.strip_prefix(b"http://") {
        rest
    } else if let Some(rest) = target.strip_prefix(b"https://") {
        rest
    } else {
        return (None, target);
    };
    match rest.iter().position(|&b| b == b'/') {
        Some(idx) => (Some(&rest[..idx]), &rest[idx..]),
        None => (Some(rest), &b"/"[..]),
    }
}

fn parse_chunk_size(line: &[u8]) -> Result<u64, ParseError> {
    // Extensions after ';' are tolerated and ignored.
    let digits = match line.iter().position(|&b| b == b';') {
        Some(idx) => &line[..idx],
        None => line,
    };
    let digits = digits.strip_suffix(b" ").unwrap_or(digits);
    if digits.is_empty() || digits.len() > 16 {
        return Err(ParseError::BadChunk);
    }
    let mut size: u64 = 0;
    for &b in digits {
        let digit = match b {
            b'0'..=b'9' => u64::from(b - b'0'),
            b'a'..=b'f' => u64::from(b - b'a' + 10),
            b'A'..=b'F' => u64::from(b - b'A' + 10),
            _ => return Err(ParseError::BadChunk),
        };
        size = size
            .checked_mul(16)
            .and_then(|s| s.checked_add(digit))
            .ok_or(ParseError::BadChunk)?;
    }
    Ok(size)
}

/// Whether the Transfer-Encoding list selects chunked framing.  Strict mode
/// requires `chunked` to be the final (or only) encoding.
fn encoding_lists_chunked(value: &[u8], tolerant: bool) -> Result<bool, ParseError> {
    let value = value.to_ascii_lowercase();
    let list: Vec<&[u8]> = value
        .split(|&b| b == b',')
        .map(|t| t.trim_ascii())
        .filter(|t| !t.is_empty())
        .collect();
    let Some(position) = list.iter().position(|t| *t == b"chunked") else {
        return Ok(false);
    };
    if position + 1 != list.len() && !tolerant {
        return Err(ParseError::BadHeader);
    }
    Ok(true)
}
