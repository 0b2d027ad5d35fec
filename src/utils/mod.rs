//! Utility modules.

pub mod debug;
pub mod process;

pub use debug::{init_debug_logging, is_debug_enabled, NSRELAY_DEBUG_ENV};
pub use process::{process_alive, wait_for_exit};
