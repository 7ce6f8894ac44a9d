//! Shellgate server binary: parse flags, open the database, bootstrap
//! accounts and the allow-list, start the hub and its reaper, then serve.

use clap::Parser;
use common::auth::{self, AuthRegistry};
use common::db::Db;
use common::hub::Hub;
use server::{AppState, ServerConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info, warn};

fn main() {
    let config = ServerConfig::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!("failed to start runtime: {e}");
            std::process::exit(1);
        }
    };
    if let Err(e) = rt.block_on(run(config)) {
        error!("fatal: {e}");
        std::process::exit(1);
    }
}

async fn run(config: ServerConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let db = Arc::new(Db::open(&config.db_path)?);
    info!("database ready at {:?}", config.db_path);
    bootstrap(&config, &db);

    let hub = Arc::new(Hub::new(db.clone()));
    hub.spawn_reaper();

    let state = AppState {
        hub,
        db,
        auth: Arc::new(AuthRegistry::new()),
        dist: config.dist.clone(),
    };

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    server::run_web_server(addr, state).await
}

/// Seed the allow-list and user accounts from the command line, mirroring
/// what the flags promise. Nothing here is fatal: a duplicate account or IP
/// is reported and skipped.
fn bootstrap(config: &ServerConfig, db: &Db) {
    if let Some(ref ips) = config.whitelist {
        for ip in ips.split(',').map(str::trim).filter(|ip| !ip.is_empty()) {
            match db.add_allowed_ip(ip, "Added through command line parameters") {
                Ok(()) => info!("IP {ip} added to the allow-list"),
                Err(e) => warn!("failed to add {ip} to the allow-list: {e}"),
            }
        }
    }

    if let (Some(user), Some(pass)) = (&config.admin_user, &config.admin_pass) {
        match db.add_user(user, pass) {
            Ok(()) => info!("admin account {user} has been added"),
            Err(e) => warn!("failed to add admin account {user}: {e}"),
        }
    }

    for _ in 0..config.random_users {
        let username = auth::generate_username("user_", 16);
        let password = auth::generate_password(16);
        match db.add_user(&username, &password) {
            Ok(()) => info!("generated account - Username: {username}, Password: {password}"),
            Err(e) => warn!("failed to generate random user: {e}"),
        }
    }

    if config.show_users {
        match db.all_users() {
            Ok(users) => {
                info!("there are {} users in the system:", users.len());
                for (username, password) in users {
                    info!("Username: {username}, Password: {password}");
                }
            }
            Err(e) => warn!("failed to list users: {e}"),
        }
    }

    // Never start with an unusable gateway.
    if db.all_users().map(|users| users.is_empty()).unwrap_or(false) {
        match db.add_user("admin", "admin") {
            Ok(()) => info!("default admin account added - Username: admin, Password: admin"),
            Err(e) => warn!("failed to add default admin account: {e}"),
        }
    }
}
