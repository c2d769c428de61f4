//! Commands of the harvest CLI
//!
//! Each command loads the configuration itself and reports its outcome on
//! stdout; progress and diagnostics go to the log on stderr.

pub mod check;
pub mod validate;
