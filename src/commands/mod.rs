//! CLI command implementations.
//!
//! `run` is the caller side of the execution contract; `runtime` and
//! `worker` serve the two HTTP surfaces that run inside sandboxes and
//! worker pods.

pub mod format;
pub mod run;
pub mod runtime;
pub mod worker;
