//! devdeck: spawn, track and supervise project commands and SSH tunnels.
//!
//! Processes outlive the invocation that started them; the JSON store is the
//! only state shared between invocations. Auto-restart polling lives in the
//! memory of whichever invocation armed it.

pub mod cli;
pub mod logging;
pub mod orchestrator;
pub mod os;
pub mod settings;
pub mod store;
pub mod supervisor;
pub mod tunnel;
