//! Application-level orchestration utilities.
//!
//! This module owns run lifecycle control (submit/cancel/restart), the session holding the
//! current image, and post-run processing such as exports and auto-save. UI/CLI layers call
//! into this module to keep responsibilities separated.

mod controller;
mod post_process;
mod session;

pub(crate) use controller::{run_controller, Services, UiCommand};
pub(crate) use post_process::{
    process_run_completion, process_run_failure, PostProcessOptions, ProcessedRun,
};
pub use session::Session;
