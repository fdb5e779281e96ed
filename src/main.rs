//! ask-continue MCP Server
//!
//! Lets the agent pause at the end of each reply and wait for the user's
//! decision, delivered by the editor extension over a local HTTP callback.

use anyhow::Result;
use clap::Parser;
use rmcp::{ServiceExt, transport::stdio};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use ask_continue_mcp::{
    AskContinueServer, CallbackListener, CandidateDirectory, CorrelationTable, Dispatcher, Options,
    constants::{self, CALLBACK_PORT_START, LISTENER_STARTUP_TIMEOUT},
    structured_logging,
};

#[derive(Parser)]
#[command(name = "ask-continue-mcp")]
#[command(about = "MCP server that pauses the agent until the user answers in the editor")]
struct Args {
    #[command(flatten)]
    options: Options,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let flush_guard = structured_logging::init_tracing(args.options.dev_log)
        .expect("Failed to initialize logging");

    info!("Starting ask-continue MCP server (pid {})", std::process::id());

    let directory = CandidateDirectory::new(constants::registration_dir());

    // Drop records left behind by extension windows that are gone, so
    // discovery does not keep probing dead ports.
    let removed = directory.remove_stale_records();
    if removed > 0 {
        info!("removed {removed} stale registration record(s)");
    }

    let table = CorrelationTable::new();
    let shutdown = CancellationToken::new();

    // The listener must be up (or declared failed) before the first query
    // goes out, since its address is embedded in every outbound ask. On
    // failure the server still runs, degraded: queries can be sent but no
    // reply can ever be delivered.
    let listener = match tokio::time::timeout(
        LISTENER_STARTUP_TIMEOUT,
        CallbackListener::spawn(table.clone(), CALLBACK_PORT_START),
    )
    .await
    {
        Ok(Ok(listener)) => Some(listener),
        Ok(Err(e)) => {
            warn!("callback listener failed to start: {e}; user replies cannot be delivered");
            None
        }
        Err(_) => {
            warn!("callback listener startup timed out; user replies cannot be delivered");
            None
        }
    };

    let callback_port = listener
        .as_ref()
        .map(|l| l.addr().port())
        .unwrap_or(CALLBACK_PORT_START);
    let callback_address = format!("http://127.0.0.1:{callback_port}");
    info!("callback address: {callback_address}");

    let dispatcher = Dispatcher::new(table, directory, callback_address, shutdown.clone());
    let server = AskContinueServer::new(dispatcher);

    let service = server.serve(stdio()).await.inspect_err(|e| {
        error!("MCP server error: {e:?}");
    })?;

    info!("ask-continue MCP server is ready and listening");

    service.waiting().await?;

    info!("ask-continue MCP server shutting down");

    // Break any ask() still suspended, then tear the listener down cleanly.
    shutdown.cancel();
    if let Some(listener) = listener {
        listener.shutdown().await;
    }

    std::mem::drop(flush_guard);
    Ok(())
}
