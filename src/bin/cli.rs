//! CradleKV CLI Client
//!
//! Command-line interface for interacting with a CradleKV host.

use clap::{Parser, Subcommand};
use cradlekv::protocol::{AdminCommand, ListFilter};
use cradlekv::{Client, KeyRange};

/// CradleKV CLI
#[derive(Parser, Debug)]
#[command(name = "cradlekv-cli")]
#[command(about = "CLI for the CradleKV key-value store")]
#[command(version)]
struct Args {
    /// Host address
    #[arg(short, long, default_value = "127.0.0.1:7400")]
    server: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Get a value by key
    Get {
        /// The key to get
        key: String,
    },

    /// Set a key-value pair
    Put {
        /// The key to set
        key: String,

        /// The value to set
        value: String,
    },

    /// List keys from `start`, following ranges across routers
    List {
        /// Inclusive start key
        #[arg(default_value = "")]
        start: String,

        /// Only keys with this prefix
        #[arg(short, long)]
        prefix: Option<String>,

        /// Exclusive end key
        #[arg(short, long)]
        end: Option<String>,

        /// Maximum records to print
        #[arg(short, long)]
        limit: Option<u32>,
    },

    /// Ping the host
    Ping,

    /// Print the host's directory
    Directory,

    /// Start a router for an unowned range (start..end)
    Create { name: String, range: String },

    /// Stop a router and release its range
    Delete { name: String },

    /// Split a router at a boundary key
    Split { name: String, boundary: String },

    /// Merge two adjacent routers
    Merge { a: String, b: String },

    /// Adopt the ranges a peer host owns
    Sync { addr: String },

    /// Run one rebalance round
    Rebalance,
}

fn main() {
    let args = Args::parse();

    if let Err(e) = run(&args) {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}

fn run(args: &Args) -> cradlekv::Result<()> {
    let mut client = Client::connect(&args.server)?;

    match &args.command {
        Commands::Get { key } => match client.get(key.as_bytes())? {
            Some(value) => println!("{}", String::from_utf8_lossy(&value)),
            None => println!("(nil)"),
        },
        Commands::Put { key, value } => {
            client.put(key.as_bytes(), value.as_bytes())?;
            println!("OK");
        }
        Commands::List {
            start,
            prefix,
            end,
            limit,
        } => {
            let filter = ListFilter {
                prefix: prefix.as_ref().map(|p| p.as_bytes().to_vec()),
                end: end.as_ref().map(|e| e.as_bytes().to_vec()),
                limit: *limit,
            };
            let records = client.list(start.as_bytes(), filter)?;
            for record in &records {
                println!(
                    "{} = {}",
                    record.key.escape_ascii(),
                    String::from_utf8_lossy(&record.value)
                );
            }
            println!("({} records)", records.len());
        }
        Commands::Ping => println!("{}", client.ping()?),
        Commands::Directory => print!("{}", client.directory()?),
        Commands::Create { name, range } => {
            let range: KeyRange = range.parse()?;
            println!("{}", client.create_node(name, range)?);
        }
        Commands::Delete { name } => {
            println!("{}", client.admin(AdminCommand::DeleteNode { name: name.clone() })?);
        }
        Commands::Split { name, boundary } => {
            println!("{}", client.split_node(name, boundary.as_bytes())?);
        }
        Commands::Merge { a, b } => {
            let command = AdminCommand::Merge {
                a: a.clone(),
                b: b.clone(),
            };
            println!("{}", client.admin(command)?);
        }
        Commands::Sync { addr } => {
            println!("{}", client.admin(AdminCommand::SyncPeer { addr: addr.clone() })?);
        }
        Commands::Rebalance => println!("{}", client.admin(AdminCommand::Rebalance)?),
    }
    Ok(())
}
