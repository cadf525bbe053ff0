//! kadepeer CLI: stand up a peer, or drive one-shot DHT operations that load
//! and save the same on-disk routing-table snapshot a long-lived `Start`
//! would maintain.

use clap::{Parser, Subcommand};
use kadepeer::config::{resolve_data_dir, PeerConfig};
use kadepeer::contact::{Contact, Endpoint};
use kadepeer::dht::Dht;
use kadepeer::id::Id;
use kadepeer::protocol::tcp::TcpTransport;
use kadepeer::storage::{DurableStorage, MemoryStorage};
use kadepeer::Result;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about = "A standalone Kademlia DHT peer", long_about = None)]
struct Cli {
    /// Set the verbosity/filter directive for tracing (e.g. "info", "debug").
    #[arg(short, long, default_value = "info")]
    verbosity: String,

    /// Path to the data directory holding the persisted routing table and
    /// key-value stores.
    #[arg(short, long, default_value = "~/.kadepeer")]
    data_dir: String,

    /// Address to listen on for inbound RPCs.
    #[arg(short, long, default_value = "0.0.0.0:8468")]
    listen: SocketAddr,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a long-lived peer, serving RPCs and running maintenance timers.
    Start {
        /// An existing peer to bootstrap from.
        #[arg(long)]
        bootstrap: Option<SocketAddr>,
    },
    /// Bootstrap this peer's routing table against a known peer and persist
    /// the resulting snapshot for subsequent one-shot commands to reuse.
    Bootstrap { addr: SocketAddr },
    /// Store a value under a key computed from its bytes.
    Put { key: String, value: String },
    /// Fetch a value by key.
    Get { key: String },
    /// Print routing-table and store occupancy for this peer.
    Stats,
    /// Ping a single remote peer and report whether it answered.
    Ping { addr: SocketAddr },
}

fn key_from_str(s: &str) -> Id {
    use std::convert::TryInto;
    let digest = blake3_like_hash(s.as_bytes());
    Id::from_bytes(digest.try_into().expect("hash is 20 bytes"))
}

/// Folds an arbitrary byte string down to a 20-byte key. Not a real hash
/// function; `Id` has no dependency on a digest crate, so lookups keyed by
/// human-readable strings use this fold instead of proper content hashing.
fn blake3_like_hash(bytes: &[u8]) -> Vec<u8> {
    let mut out = [0u8; kadepeer::id::ID_BYTES];
    for (i, b) in bytes.iter().enumerate() {
        out[i % out.len()] ^= *b;
    }
    out.to_vec()
}

fn snapshot_path(data_dir: &std::path::Path) -> PathBuf {
    data_dir.join("routing_table.snapshot.json")
}

async fn build_dht(cli: &Cli) -> Result<Arc<Dht>> {
    let data_dir = resolve_data_dir(&cli.data_dir);
    tokio::fs::create_dir_all(&data_dir).await?;

    let mut config = PeerConfig::production_defaults();
    config.listen_addr = cli.listen;
    config.verbose = cli.verbosity.clone();
    config.data_dir = data_dir.clone();
    let config = config.apply_env_overrides()?;

    let our_contact = Contact::new(Id::random(), Endpoint::Tcp(config.listen_addr));
    let transport: Arc<dyn kadepeer::protocol::Transport> =
        Arc::new(TcpTransport::new(config.request_timeout));

    let originator = DurableStorage::open(data_dir.join("originator.json")).await?;
    let republish = DurableStorage::open(data_dir.join("republish.json")).await?;
    let cache = Arc::new(MemoryStorage::new());

    let dht = Dht::new(config, our_contact, transport, originator, republish, cache);

    let snapshot = snapshot_path(&data_dir);
    if snapshot.exists() {
        dht.load(&snapshot).await?;
    }

    Ok(dht)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    use tracing_subscriber::{fmt, EnvFilter};
    fmt().with_env_filter(EnvFilter::new(&cli.verbosity)).init();

    let data_dir = resolve_data_dir(&cli.data_dir);
    let snapshot = snapshot_path(&data_dir);

    match &cli.command {
        Commands::Start { bootstrap } => {
            let dht = build_dht(&cli).await?;
            tracing::info!(contact = %dht.local_contact_summary(), "starting peer");

            let listen_addr = dht.our_contact().endpoint.clone();
            let handler = dht.request_handler();
            let listen_addr = match listen_addr {
                Endpoint::Tcp(addr) => addr,
                Endpoint::Channel(_) => unreachable!("cli peers always listen over tcp"),
            };
            tokio::spawn(async move {
                if let Err(err) = TcpTransport::serve(listen_addr, handler).await {
                    tracing::error!(?err, "rpc server exited");
                }
            });

            if let Some(addr) = bootstrap {
                let seed = Contact::new(Id::random(), Endpoint::Tcp(*addr));
                dht.bootstrap(seed).await?;
                tracing::info!(%addr, "bootstrap complete");
            }

            let _handles = dht.spawn_maintenance_tasks();

            tokio::signal::ctrl_c().await?;
            tracing::info!("shutting down, saving snapshot");
            dht.save(&snapshot).await?;
        }
        Commands::Bootstrap { addr } => {
            let dht = build_dht(&cli).await?;
            let seed = Contact::new(Id::random(), Endpoint::Tcp(*addr));
            dht.bootstrap(seed).await?;
            dht.save(&snapshot).await?;
            let stats = dht.stats().await;
            println!(
                "bootstrapped against {addr}: {} contacts across {} buckets",
                stats.contact_count, stats.bucket_count
            );
        }
        Commands::Put { key, value } => {
            let dht = build_dht(&cli).await?;
            let key_id = key_from_str(key);
            dht.store(key_id, value.clone().into_bytes()).await?;
            dht.save(&snapshot).await?;
            println!("stored {key} -> {} bytes", value.len());
        }
        Commands::Get { key } => {
            let dht = build_dht(&cli).await?;
            let key_id = key_from_str(key);
            match dht.find_value(key_id).await? {
                Some(value) => println!("{}", String::from_utf8_lossy(&value)),
                None => println!("not found"),
            }
            dht.save(&snapshot).await?;
        }
        Commands::Stats => {
            let dht = build_dht(&cli).await?;
            let stats = dht.stats().await;
            println!("id:          {}", stats.our_id);
            println!("buckets:     {}", stats.bucket_count);
            println!("contacts:    {}", stats.contact_count);
            println!("originator:  {} keys", stats.originator_count);
            println!("republish:   {} keys", stats.republish_count);
            println!("cache:       {} keys", stats.cache_count);
        }
        Commands::Ping { addr } => {
            let dht = build_dht(&cli).await?;
            let target = Contact::new(Id::random(), Endpoint::Tcp(*addr));
            match kadepeer::routing::ContactPinger::ping(dht.as_ref(), &target).await {
                true => println!("{addr} is alive"),
                false => println!("{addr} did not respond"),
            }
        }
    }

    Ok(())
}
