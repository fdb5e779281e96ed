//! ask-continue MCP Server Library
//!
//! A local human-in-the-loop bridge: the `ask_continue` tool pauses the agent
//! until the user replies through the editor extension. Queries go out over
//! HTTP to whichever extension windows have registered themselves; the reply
//! comes back asynchronously on a callback listener and is matched to the
//! waiting call by request id.

pub mod constants;
mod correlation;
mod directory;
mod dispatch;
mod listener;
mod server;
pub mod structured_logging;
pub mod types;

// Re-export Options for use in main.rs
pub use crate::main_types::Options;

mod main_types {
    use clap::Parser;

    #[derive(Parser, Debug, Clone)]
    pub struct Options {
        /// Enable development logging to the default log file
        #[arg(long, global = true)]
        pub dev_log: bool,
    }
}

pub use correlation::CorrelationTable;
pub use directory::CandidateDirectory;
pub use dispatch::{AskError, Dispatcher};
pub use listener::{CallbackListener, ListenerError};
pub use server::AskContinueServer;
