//! `kv-client`: interactive/scripted command-line client.

use clap::{Parser, Subcommand};
use kv_store::client::Client;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(name = "kv-client", about = "Client for a kv-store server")]
struct Args {
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    #[arg(long, default_value_t = 7878)]
    port: u16,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Put { key: String, value: String },
    Batchput { keys: String, values: String },
    Read { key: String },
    Readrange { start: String, end: String },
    Delete { key: String },
    Ping,
    Stats,
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut client = match Client::connect(&args.host, args.port) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("kv-client: could not connect: {}", e);
            return ExitCode::from(1);
        }
    };

    match run(&mut client, args.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(ReplyOutcome::ServerError(message)) => {
            eprintln!("ERROR: {}", message);
            ExitCode::from(2)
        }
        Err(ReplyOutcome::ClientError(message)) => {
            eprintln!("kv-client: {}", message);
            ExitCode::from(1)
        }
    }
}

enum ReplyOutcome {
    ServerError(String),
    ClientError(String),
}

fn classify(err: kv_store::KvError) -> ReplyOutcome {
    match err {
        kv_store::KvError::ProtocolError { message } => ReplyOutcome::ServerError(message),
        other => ReplyOutcome::ClientError(other.to_string()),
    }
}

fn run(client: &mut Client, command: Command) -> Result<(), ReplyOutcome> {
    match command {
        Command::Put { key, value } => {
            client.put(key.as_bytes(), value.as_bytes()).map_err(classify)?;
            println!("OK");
        }
        Command::Batchput { keys, values } => {
            let keys: Vec<Vec<u8>> = keys.split(',').map(|k| k.as_bytes().to_vec()).collect();
            let values: Vec<Vec<u8>> = values.split(',').map(|v| v.as_bytes().to_vec()).collect();
            client.batch_put(&keys, &values).map_err(classify)?;
            println!("OK");
        }
        Command::Read { key } => match client.read(key.as_bytes()).map_err(classify)? {
            Some(value) => println!("{}", String::from_utf8_lossy(&value)),
            None => println!("NOT_FOUND"),
        },
        Command::Readrange { start, end } => {
            let entries = client
                .read_range(start.as_bytes(), end.as_bytes())
                .map_err(classify)?;
            if entries.is_empty() {
                println!("NOT_FOUND");
            }
            for (key, value) in entries {
                println!(
                    "{}={}",
                    String::from_utf8_lossy(&key),
                    String::from_utf8_lossy(&value)
                );
            }
        }
        Command::Delete { key } => {
            if client.delete(key.as_bytes()).map_err(classify)? {
                println!("OK");
            } else {
                println!("NOT_FOUND");
            }
        }
        Command::Ping => {
            if client.ping().map_err(classify)? {
                println!("PONG");
            }
        }
        Command::Stats => {
            println!("{}", client.stats().map_err(classify)?);
        }
    }
    Ok(())
}
