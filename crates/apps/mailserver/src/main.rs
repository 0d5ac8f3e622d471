//! Melange mail server
//!
//! Holds mailboxes for registered users, serves published messages to
//! other servers, and records alerts for incoming private mail.

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info, warn};
use std::net::TcpListener;
use std::path::PathBuf;
use std::sync::Arc;

use mail::{Identity, MailServer, Server, ServerConfig, SqliteMailStore, init_routers};

/// Melange mail server
#[derive(Parser, Debug)]
#[command(name = "mailserver")]
#[command(version, about, long_about = None)]
struct Args {
    /// Settings file (defaults to ~/.config/melange/mailserver.json)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Location advertised to other servers (host:port)
    #[arg(long)]
    me: Option<String>,

    /// Key file, created if it doesn't exist
    #[arg(short, long)]
    key: Option<PathBuf>,

    /// SQLite database path
    #[arg(long)]
    db: Option<PathBuf>,

    /// Registration directory domain or host:port
    #[arg(long)]
    tracker: Option<String>,

    /// Alias to register for the server key at startup
    #[arg(long)]
    alias: Option<String>,
}

impl Args {
    /// Flags override everything loaded from file and environment
    fn apply(self, config: &mut ServerConfig) {
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(me) = self.me {
            config.location = me;
        }
        if let Some(key) = self.key {
            config.key_file = Some(key);
        }
        if let Some(db) = self.db {
            config.database = Some(db);
        }
        if let Some(tracker) = self.tracker {
            config.tracker = tracker;
        }
        if let Some(alias) = self.alias {
            config.alias = Some(alias);
        }
    }
}

fn main() {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    if let Err(e) = run(Args::parse()) {
        error!("Mail server stopped: {:#}", e);
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    // Bootstrap config directory
    if let Err(e) = config::init() {
        warn!("Failed to initialize config directory: {}", e);
    }

    let mut server_config = ServerConfig::load(args.config.as_deref())?;
    args.apply(&mut server_config);
    let location = server_config.advertised_location();

    let key = Identity::load_or_create(server_config.key_path().as_deref())
        .context("Failed to load mail server key")?
        .with_location(location.clone());
    info!("Loaded address {}", key.fingerprint());

    let db_path = server_config
        .database_path()
        .context("Could not determine database path")?;
    let store = Arc::new(SqliteMailStore::new(&db_path)?);
    info!("Using database {}", db_path.display());

    let routers = init_routers(Some(key), &server_config.tracker);
    let key = routers.server_key.clone();

    if let Some(alias) = &server_config.alias {
        match routers.registration.register(&key, alias) {
            Ok(()) => info!("Registered {} as {}", key.fingerprint(), alias),
            Err(e) => warn!("Failed to register alias {}: {}", alias, e),
        }
    }

    let handler = Arc::new(MailServer::new(store, key.clone(), location.clone()));
    let listener = TcpListener::bind(("0.0.0.0", server_config.port))
        .with_context(|| format!("Failed to listen on port {}", server_config.port))?;

    Server::new(location, key, handler).serve(listener)?;
    Ok(())
}
