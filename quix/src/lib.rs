//! Demo harness for `quix-quic`: tokio UDP drivers, the client/server
//! application API, and the HTTP/0.9-style request mapping.

pub mod client;
pub mod endpoint;
pub mod http09;
pub mod server;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Shared key material both demo binaries fall back to when no key file
/// is given. The static TLS engine binds client and server to the same
/// secret.
pub const DEV_SECRET: &[u8] = b"quix development shared secret";

/// Environment variable routing verbose logging.
pub const LOG_ENV: &str = "QUIX_LOG";

/// Initialize structured logging from `QUIX_LOG` (default `info`).
pub fn init_logging() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(true);
    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
}
