//! Application-level orchestration.
//!
//! This module owns the stage state machine, the driver that runs it against a
//! background worker, the run lifecycle (start/restart/quit) and post-run
//! processing such as exports. UI/CLI layers call into this module to keep
//! responsibilities separated.

mod controller;
mod machine;
mod post_process;

pub(crate) use controller::{run_configured, run_controller, UiCommand};
pub(crate) use post_process::process_run_completion;
