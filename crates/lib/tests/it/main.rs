/*! Integration tests for Trove.
 *
 * This test suite is organized as a single integration test binary
 * following the pattern described by matklad in
 * https://matklad.github.io/2021/02/27/delete-cargo-integration-tests.html
 *
 * The module structure mirrors the main library structure:
 * - wire: Raw protocol tests against a live worker, asserting exact lines
 * - handshake: The init secret gate
 * - pubsub: Watches and broadcasts across multiple sessions
 * - expiry: Time-to-live scheduling and sweep announcements
 * - query: Scripts over the wire, data folding, and death queries
 * - session: Client lifecycle, queueing, timeouts, and reconnect limits
 */

use tracing_subscriber::EnvFilter;

#[ctor::ctor]
fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("trove=info".parse().unwrap()),
        )
        .with_test_writer()
        .try_init();
}

mod expiry;
mod handshake;
mod helpers;
mod pubsub;
mod query;
mod session;
mod wire;
