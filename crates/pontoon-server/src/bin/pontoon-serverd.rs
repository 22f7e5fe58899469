//! The bridge server executable.
//!
//! Launched by the client as `pontoon-serverd <guid> <version> <game
//! args…>`. Attaches to the session the client created, answers the
//! handshake, and pumps commands until Terminate or client exit.
//!
//! The dispatcher wired in here only logs transported-API commands; the
//! real renderer integration registers its own [`Dispatcher`] and links
//! against `pontoon-server` as a library.

use std::path::PathBuf;
use std::process::ExitCode;

use pontoon_core::{BridgeOptions, CommandHeader, Result};
use pontoon_server::{Dispatcher, ServerRuntime, ServerServices};

/// Logs every transported-API command it sees, once per command id.
#[derive(Default)]
struct LoggingDispatcher {
    seen: std::collections::HashSet<u32>,
}

impl Dispatcher for LoggingDispatcher {
    fn dispatch(
        &mut self,
        _services: &mut ServerServices<'_>,
        header: CommandHeader,
        uid: u32,
    ) -> Result<()> {
        if self.seen.insert(header.command.to_u32()) {
            tracing::info!(
                id = header.command.to_u32(),
                uid,
                "transported-API command reached the stub dispatcher"
            );
        }
        Ok(())
    }
}

fn main() -> ExitCode {
    let mut args = std::env::args().skip(1);
    let Some(guid) = args.next() else {
        eprintln!("usage: pontoon-serverd <session-guid> <version> [game args...]");
        return ExitCode::FAILURE;
    };
    let Some(version) = args.next() else {
        eprintln!("usage: pontoon-serverd <session-guid> <version> [game args...]");
        return ExitCode::FAILURE;
    };

    // The remaining arguments are the game's own command line; the bridge
    // recognizes a couple of its own flags in there.
    let rest: Vec<String> = args.collect();
    let mut config_path = PathBuf::from("pontoon.conf");
    let mut crash_after_handshake = false;
    let mut iter = rest.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" => {
                if let Some(path) = iter.next() {
                    config_path = PathBuf::from(path);
                }
            }
            // Fault injection for lifecycle testing.
            "--crash-after-handshake" => crash_after_handshake = true,
            _ => {}
        }
    }

    let options = BridgeOptions::load(&config_path);
    tracing_subscriber::fmt()
        .with_max_level(options.log_level)
        .init();
    tracing::info!(guid = %guid, version = %version, "pontoon bridge server starting");

    let runtime = match ServerRuntime::connect(&guid, &version, options) {
        Ok(runtime) => runtime,
        Err(err) => {
            tracing::error!(%err, "unable to join the bridge session");
            return ExitCode::FAILURE;
        }
    };

    if let Err(err) = runtime.handshake() {
        tracing::error!(%err, "handshake failed");
        return ExitCode::FAILURE;
    }

    if crash_after_handshake {
        tracing::warn!("fault injection: aborting after handshake");
        std::process::abort();
    }

    let mut dispatcher = LoggingDispatcher::default();
    if let Err(err) = runtime.run(&mut dispatcher) {
        tracing::error!(%err, "command processing failed");
        return ExitCode::FAILURE;
    }

    tracing::info!("shutdown complete");
    ExitCode::SUCCESS
}
