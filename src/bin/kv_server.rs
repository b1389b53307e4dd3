//! `kv-server`: stand-alone TCP server process.

use clap::Parser;
use kv_store::config::{Config, ReplicationMode};
use kv_store::server::Server;
use kv_store::store::Store;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "kv-server", about = "Networked key-value store server")]
struct Args {
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    #[arg(long, default_value_t = 7878)]
    port: u16,

    #[arg(long, default_value = "./kvstore-data")]
    data_dir: PathBuf,

    /// Run as a replication follower.
    #[arg(long)]
    follower: bool,

    /// Comma-separated `host:port` follower endpoints (primary only).
    #[arg(long, value_delimiter = ',')]
    followers: Vec<String>,

    #[arg(long, value_enum)]
    replication_mode: Option<ReplicationModeArg>,

    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(clap::ValueEnum, Clone, Debug)]
enum ReplicationModeArg {
    Async,
    Sync,
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("kv-server: {}", e);
            ExitCode::from(1)
        }
    }
}

fn run(args: Args) -> kv_store::KvResult<()> {
    let mut config = Config::new(&args.data_dir);
    config.is_follower = args.follower;

    if let Some(path) = &args.config {
        config = config.merge_toml_file(path)?;
    }

    if !args.followers.is_empty() {
        config.replication_enabled = true;
        config.replica_addresses = args
            .followers
            .iter()
            .map(|a| {
                a.parse::<SocketAddr>()
                    .map_err(|_| kv_store::KvError::InvalidConfig {
                        reason: format!("invalid --followers address '{}'", a),
                    })
            })
            .collect::<kv_store::KvResult<Vec<_>>>()?;
    }
    if let Some(mode) = args.replication_mode {
        config.replication_mode = match mode {
            ReplicationModeArg::Async => ReplicationMode::Async,
            ReplicationModeArg::Sync => ReplicationMode::Sync,
        };
    }

    let store = Store::open(config)?;
    let server = Server::new(store.clone(), args.host, args.port);

    // The accept loop polls with a short timeout (`accept_poll_interval`)
    // so it would observe `shutdown` promptly if something set it; in
    // this binary nothing ever does, so `server.run` only returns on a
    // bind/accept error and `store.close()` below never actually runs
    // before the process is killed. `Store::close`'s bounded-timeout
    // joins matter for embedding callers (tests, library use) that hold
    // the `AtomicBool` themselves and call `close()` on a live process.
    let shutdown = Arc::new(AtomicBool::new(false));
    let result = server.run(shutdown);
    store.close();
    result
}
