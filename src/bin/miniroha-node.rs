#![forbid(unsafe_code)]
//! Miniroha node entry point

use miniroha::config::Config;
use miniroha::node::Node;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env();
    let node = Arc::new(Node::init(config).await?);
    node.start().await
}
