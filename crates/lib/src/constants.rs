//! Constants used throughout the Trove library.
//!
//! Central definitions for protocol defaults and reserved characters shared
//! by the server, the client, and the macro compiler.

use std::time::Duration;

/// Default TCP port the worker listens on.
pub const DEFAULT_PORT: u16 = 9435;

/// Default bind/connect host. The channel is private to one machine.
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Default time a client waits for a response before failing the request.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Default interval between expiry sweeps (the expiry accuracy).
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Default delay between reconnection attempts.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Default number of reconnection attempts before the session fails.
pub const DEFAULT_MAX_RETRIES: u32 = 4;

/// Request ids wrap back to 1 after this value. Kept below 2^53 so ids
/// survive any JSON peer that reads numbers as doubles.
pub const MAX_REQUEST_ID: u64 = (1 << 53) - 2;

/// Private stand-in for a literal `.` inside an escaped key segment.
///
/// The macro compiler's `#(...)` form writes this character in place of
/// dots so the text is not later split as a path; the outbound filter
/// restores it to `.` before a message reaches the wire.
pub const DOT_PLACEHOLDER: char = '\u{1A}';

/// Buffered event deliveries per local watch subscription.
pub const WATCH_BUFFER: usize = 64;
