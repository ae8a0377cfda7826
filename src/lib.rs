//! # Fronthaul
//!
//! A censorship-circumvention transport that tunnels a bidirectional byte
//! stream over a sequence of ordinary HTTPS request/response pairs. At the
//! TLS layer the traffic is indistinguishable from an HTTPS client talking
//! to a well-known cloud front-end; the real destination is revealed only to
//! the front-end's HTTP routing by the inner `Host` header (domain
//! fronting).
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │ SOCKS5 client                                            │
//! ├──────────────────────────────────────────────────────────┤
//! │ Client copy loop (adaptive polling, per-session serial)  │
//! ├──────────────────────────────────────────────────────────┤
//! │ Dispatcher (direct HTTPS | browser helper bridge)        │
//! ├────────────────── POST + X-Session-Id ───────────────────┤
//! │ Server dispatch (session table, turnaround drain)        │
//! ├──────────────────────────────────────────────────────────┤
//! │ Back-end TCP (one connection per live session)           │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Design Goals
//!
//! 1. **Unobservability**: nothing on the wire but well-formed HTTPS
//! 2. **Push-free operation**: the server never initiates; the client polls
//! 3. **Bounded turnaround**: requests are answered within milliseconds
//!    whether or not the back-end has produced data

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

use std::time::Duration;

pub mod client;
pub mod error;
pub mod proxy;
pub mod server;

pub use error::{Error, Result};

/// Number of random bytes in a freshly generated session id (before base64).
pub const SESSION_ID_LENGTH: usize = 32;

/// Minimum accepted length of the `X-Session-Id` header value.
pub const MIN_SESSION_ID_LENGTH: usize = 32;

/// The largest chunk of data read from the local connection before
/// forwarding it in a request, and the maximum reply body copied back.
pub const MAX_PAYLOAD_LENGTH: usize = 0x10000;

/// Name of the header carrying the session id.
pub const SESSION_ID_HEADER: &str = "X-Session-Id";

/// The server cannot push; when this much time passes without local traffic
/// the client sends a request with an empty body. The interval starts here
/// and then grows.
pub const INIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Ceiling on the polling interval.
pub const MAX_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Geometric growth applied to the polling interval on each idle poll.
pub const POLL_INTERVAL_MULTIPLIER: f64 = 1.5;

/// Try an HTTP roundtrip at most this many times.
pub const MAX_TRIES: u32 = 10;

/// Wait this long between roundtrip retries.
pub const RETRY_DELAY: Duration = Duration::from_secs(30);

/// Safety limit on the helper's declared reply length.
pub const MAX_HELPER_RESPONSE_LENGTH: u32 = 10_000_000;

/// Deadline for writing a framed request to the helper.
pub const HELPER_WRITE_TIMEOUT: Duration = Duration::from_secs(2);

/// Deadline for reading a framed reply from the helper.
pub const HELPER_READ_TIMEOUT: Duration = Duration::from_secs(60);

/// How long the server tries to read something back from the back-end
/// before returning the response.
pub const TURNAROUND_TIMEOUT: Duration = Duration::from_millis(10);

/// Read and write timeout applied to every HTTP transaction on the server.
pub const READ_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// A session with no POST for longer than this is expired and its back-end
/// closed.
pub const MAX_SESSION_STALENESS: Duration = Duration::from_secs(120);
