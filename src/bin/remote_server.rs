use std::net::TcpListener;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use rillvm::dap::{tcp_channel, DapHandler, DapSession};
use rillvm::Vm;

/// One-client-at-a-time DAP server. The client uploads bytecode through the
/// `uploadBytecode` request and then drives execution over the same
/// connection.
#[derive(Parser, Debug)]
#[command(name = "rill-remote-server", about = "Remote DAP server for the Rill VM")]
struct Args {
    /// TCP port to listen on.
    #[arg(default_value_t = 7777)]
    port: u16,
}

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();
    let listener = TcpListener::bind(("0.0.0.0", args.port))
        .with_context(|| format!("failed to bind port {}", args.port))?;
    info!(port = args.port, "remote-vm-server listening");

    let session_running = Arc::new(AtomicBool::new(false));
    loop {
        info!("waiting for connection");
        let (stream, peer) = match listener.accept() {
            Ok(accepted) => accepted,
            Err(err) => {
                error!("accept failed: {err}");
                continue;
            }
        };
        if session_running.load(Ordering::Acquire) {
            warn!(%peer, "session already running, rejecting connection");
            drop(stream);
            continue;
        }
        session_running.store(true, Ordering::Release);

        let running = session_running.clone();
        thread::spawn(move || {
            info!(%peer, "client connected");
            match tcp_channel(stream) {
                Ok((mut reader, writer)) => {
                    let vm = Vm::new();
                    let session = DapSession::new(Box::new(writer));
                    let mut handler = DapHandler::new(&vm, session);
                    handler.run(&mut reader);
                }
                Err(err) => error!("failed to split client stream: {err}"),
            }
            info!(%peer, "client session finished");
            running.store(false, Ordering::Release);
        });
    }
}
