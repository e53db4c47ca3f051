//! Standalone authority server.
//!
//! ```text
//! LIVEROOM_BIND=0.0.0.0:9090 LIVEROOM_TOKENS=alpha,beta liveroom-authority
//! ```
//!
//! Without `LIVEROOM_TOKENS` every token is accepted.

use liveroom_collab::{AuthorityConfig, AuthorityServer};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut config = AuthorityConfig::default();
    if let Ok(bind) = std::env::var("LIVEROOM_BIND") {
        config.bind_addr = bind;
    }

    let server = match std::env::var("LIVEROOM_TOKENS") {
        Ok(tokens) => {
            let tokens: Vec<String> =
                tokens.split(',').map(str::trim).filter(|t| !t.is_empty()).map(String::from).collect();
            log::info!("accepting {} configured tokens", tokens.len());
            AuthorityServer::with_tokens(config, tokens)
        }
        Err(_) => {
            log::warn!("LIVEROOM_TOKENS not set, accepting any token");
            AuthorityServer::new(config)
        }
    };

    Arc::new(server).run().await
}
