use clap::Parser;
use std::net::SocketAddr;

/// Command-line interface for the `elephie-relay` server.
#[derive(Parser, Debug, Clone)]
#[command(version)]
pub struct Cli {
    /// Address to listen on.
    #[arg(long, default_value = "127.0.0.1:3000")]
    pub listen: SocketAddr,

    /// Full URL of the upstream chat-completions endpoint.
    #[arg(long, value_name = "URL")]
    pub upstream: Option<String>,

    /// Upper bound on tokens generated per reply.
    #[arg(long)]
    pub max_tokens: Option<u32>,

    /// Model name forwarded to the upstream service.
    #[arg(long, short = 'm')]
    pub model: Option<String>,

    /// System prompt prepended to every request.
    #[arg(long)]
    pub system_prompt: Option<String>,
}
