use clap::Parser;
use elephie_cli::ChatCli;
use elephie_cli::run_chat;
use elephie_relay_server::Cli as ServeCli;

/// Elephie chat relay and client
#[derive(Debug, Parser)]
#[clap(author, version)]
struct MultitoolCli {
    #[clap(subcommand)]
    subcommand: Subcommand,
}

#[derive(Debug, clap::Subcommand)]
enum Subcommand {
    /// Run the relay between chat clients and the completion service.
    #[clap(visible_alias = "s")]
    Serve(ServeCli),

    /// Chat with a running relay from the terminal.
    #[clap(visible_alias = "c")]
    Chat(ChatCli),
}

fn main() -> anyhow::Result<()> {
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let cli = MultitoolCli::parse();
        match cli.subcommand {
            Subcommand::Serve(serve_cli) => elephie_relay_server::run_main(serve_cli).await?,
            Subcommand::Chat(chat_cli) => run_chat(chat_cli).await?,
        }
        Ok(())
    })
}
