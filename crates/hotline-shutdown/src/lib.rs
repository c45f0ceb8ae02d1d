//! # hotline-shutdown
//!
//! Graceful shutdown support for the Hotline relay.
//!
//! ## Overview
//!
//! Shutdown happens in two phases:
//! 1. A stop token is cancelled. Accept loops stop taking new connections and
//!    every connection handler watching the token starts closing.
//! 2. The coordinator waits for all outstanding [`ConnectionGuard`]s to drop,
//!    bounded by the drain timeout. Whatever is left after that is the
//!    caller's to abort.
//!
//! ## Signals
//!
//! - `SIGINT` (Ctrl-C): graceful stop
//! - `SIGTERM`: graceful stop (Unix only)

mod shutdown;

pub use shutdown::{ConnectionGuard, GracefulShutdown, ShutdownSignal};
