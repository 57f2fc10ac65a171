use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};

use tether_core::{RelayStore, Sweeper};

use crate::config::Config;
use crate::storage::RedisStore;

#[derive(Parser, Debug)]
#[command(name = "tether-relay")]
#[command(about = "Tether session registry and signaling relay")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run one cleanup pass against the store and print the summary
    Sweep,
}

pub async fn run_sweep(config: &Config) -> Result<()> {
    let store = Arc::new(
        RedisStore::new(&config.redis_url, config.store_key_ttl_seconds).await?,
    ) as Arc<dyn RelayStore>;
    let sweeper = Sweeper::with_config(store, config.sweeper_config());
    let summary = sweeper.sweep_once().await;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
