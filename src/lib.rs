#![warn(clippy::pedantic)]
// Noisy doc/signature lints — would require annotating hundreds of pub functions
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::must_use_candidate)]
// Style preference — keeping format!("{}", x) over format!("{x}") for readability with complex exprs
#![allow(clippy::uninlined_format_args)]
// Intentional casts in timing/backoff arithmetic (durations, counts, ratios)
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_precision_loss)]
// Dispatch and session loops are naturally long; splitting would be artificial
#![allow(clippy::too_many_lines)]
// Module structure — foo::FooManager pattern by design
#![allow(clippy::module_name_repetitions)]

pub mod bus;
pub mod cli;
pub mod config;
pub mod context;
pub(crate) mod errors;
pub mod gateway;
pub mod idempotency;
pub mod queue;
pub mod resilience;
pub mod retry;
pub mod session;
pub mod tools;
pub mod webhook;
pub mod worker;

pub use errors::{MeshError, MeshResult};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Protocol version spoken on the session channel. Clients advertising an
/// older version are still accepted; the server replies with its own.
pub const PROTOCOL_VERSION: &str = "2025-06-01";
