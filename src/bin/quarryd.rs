use std::error::Error;
use std::sync::{Arc, mpsc};

use clap::Parser;
use log::info;

use quarry::backend::memory::MemoryBackendFactory;
use quarry::backend::registry::{BackendOptions, BackendRegistry};
use quarry::protocol::CacheServer;

#[derive(Debug, Parser)]
struct Cli {
    /// Endpoint locator, e.g. unix=/var/run/quarry.sock or tcp=127.0.0.1:4323
    locator: String,
    /// Cache manager name advertised at handshake
    #[arg(long, default_value = "quarry")]
    name: String,
    /// Backend kind to run
    #[arg(long, default_value = "memory")]
    backend: String,
    /// Cache capacity in bytes
    #[arg(long, default_value_t = 1 << 30)]
    capacity: u64,
    /// Worker threads (reserved; requests run on the supervisor thread)
    #[arg(long, default_value_t = 0)]
    workers: usize,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();

    let mut registry = BackendRegistry::new();
    registry.register(Box::new(MemoryBackendFactory));

    let mut options = BackendOptions::new();
    options.insert("capacity".to_string(), cli.capacity.to_string());
    let backend = registry
        .construct(&cli.backend, &options)
        .ok_or_else(|| format!("no usable backend of kind '{}'", cli.backend))?;

    let mut server = CacheServer::new(&cli.name, Arc::from(backend))?;
    server.listen(&cli.locator)?;
    server.process_requests(cli.workers)?;

    let (sender, receiver) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = sender.send(());
    })?;
    receiver.recv()?;

    info!("shutting down cache daemon.");
    server.terminate();
    Ok(())
}
