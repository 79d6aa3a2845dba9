#[macro_use]
extern crate log;

use std::collections::HashMap;
use std::env::var;
use std::sync::Arc;

use async_trait::async_trait;

mod auth;
mod config;
mod discovery;
mod dispatcher;
mod error;
mod file_transfer;
mod instance;
mod location;
mod peer_table;
mod protocol;
mod rci;
mod registry;
mod reply;
mod scheduler;
mod transport;
mod wire;

use config::Config;
use instance::Instance;
use protocol::KwValue;
use scheduler::RciHandler;

/// Example RCI registered at startup: hashes its single string/bytes
/// argument with SHA-1, the way the end-to-end handshake scenario expects
/// a peer to register `hash_rci` and return a result another instance can
/// locate and invoke.
struct HashRci;

#[async_trait]
impl RciHandler for HashRci {
    async fn call(&self, args: Vec<KwValue>, _kwargs: HashMap<String, KwValue>) -> Result<KwValue, String> {
        use sha1::{Digest, Sha1};

        let payload = match args.into_iter().next() {
            Some(KwValue::Text(s)) => s,
            Some(KwValue::Bytes(b)) => String::from_utf8_lossy(&b).into_owned(),
            _ => return Err("hash_rci expects one string/bytes argument".into()),
        };
        let digest = Sha1::digest(payload.as_bytes());
        Ok(KwValue::Text(format!("sha1:{}", hex::encode(digest))))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config_loc = var("ASYNCORO_NET_CONFIG").unwrap_or_else(|_| "config.toml".into());
    let config: Config = toml::from_slice(&std::fs::read(&config_loc)?)?;

    let instance = Instance::new(config).await?;
    instance.register_rci("hash_rci", Arc::new(HashRci))?;

    info!("registered hash_rci at {}", instance.location());

    instance.up().await?;

    Ok(())
}
