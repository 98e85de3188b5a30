use std::time::Duration;

use env_flags::env_flags;

env_flags! {
    /// Upstream chat-completion endpoint used when the config file does not
    /// name one.
    pub ELEPHIE_UPSTREAM_URL: &str = "http://localhost:5000/v1/chat/completions";

    /// Address of the relay the chat client talks to.
    pub ELEPHIE_RELAY_URL: &str = "http://127.0.0.1:3000";

    // Upstream generation can pause for a long time between tokens; five
    // minutes keeps slow local models usable.
    pub ELEPHIE_STREAM_IDLE_TIMEOUT_MS: Duration = Duration::from_millis(300_000), |value| {
        value.parse().map(Duration::from_millis)
    };
}
