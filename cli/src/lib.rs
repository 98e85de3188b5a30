//! The `elephie` terminal chat client.

// Terminal output goes through the renderer task's writer.
#![deny(clippy::print_stdout, clippy::print_stderr)]

pub mod chat;
pub mod render;

pub use chat::ChatCli;
pub use chat::ChatCommand;
pub use chat::run_chat;
pub use render::TerminalRenderer;

use tracing_subscriber::EnvFilter;

/// Installs a stderr subscriber. `RUST_LOG` wins over `default_level` when
/// it parses.
pub fn init_tracing(default_level: &str) {
    let _ = tracing_subscriber::fmt()
        // Fallback to the `default_level` log filter if the environment
        // variable is not set _or_ contains an invalid value
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .or_else(|_| EnvFilter::try_new(default_level))
                .unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .try_init();
}
