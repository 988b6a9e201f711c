//! brisk-http: the HTTP/1.1 pipeline.
//!
//! A callback-driven byte parser feeds a per-connection protocol that
//! enforces size guards, keep-alive and pipelining order, serves static
//! files, and gates protocol upgrades (WebSocket, EventSource).  Responses
//! compose through a deferred header map that is serialized on first send.

mod error;
mod headers;
mod params;
mod parser;
mod protocol;
mod request;
mod response;
mod static_files;

pub use error::{HttpError, ParseError};
pub use headers::HeaderMap;
pub use params::{ParamValue, parse_query, percent_decode};
pub use parser::{Http1Events, Http1Options, Http1Parser, ParseStep};
pub use protocol::{HttpSettings, RequestHandler, UpgradeHandler, listen};
pub use request::{Body, HttpRequest, derive_accept_key};
pub use response::{cached_date, imf_date, status_text};
pub use static_files::mime_register;
