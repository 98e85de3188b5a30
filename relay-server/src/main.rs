//! Entry-point for the `elephie-relay` binary.
use clap::Parser;
use elephie_relay_server::Cli;
use elephie_relay_server::run_main;

fn main() -> anyhow::Result<()> {
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let cli = Cli::parse();
        run_main(cli).await?;
        Ok(())
    })
}
