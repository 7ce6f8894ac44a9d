//! CLI configuration for the shellgate server.

use std::path::PathBuf;

#[derive(Debug, Clone, clap::Parser)]
#[command(name = "shellgate", version, about = "Web shell gateway: browser terminals multiplexed onto persistent server-side PTY sessions.")]
pub struct ServerConfig {
    /// Port to listen on.
    #[arg(short = 'p', long, default_value_t = 8080, env = "SHELLGATE_PORT")]
    pub port: u16,

    /// Host to bind on.
    #[arg(long, default_value = "0.0.0.0", env = "SHELLGATE_HOST")]
    pub host: String,

    /// Admin username to create at startup (requires --pass).
    #[arg(long = "user")]
    pub admin_user: Option<String>,

    /// Admin password for --user.
    #[arg(long = "pass")]
    pub admin_pass: Option<String>,

    /// Auto-generate this many random user accounts and print their credentials.
    #[arg(short = 'U', long = "random-users", default_value_t = 0)]
    pub random_users: usize,

    /// Allow-list IP addresses, comma separated. An empty list allows all.
    #[arg(short = 'w', long = "whitelist")]
    pub whitelist: Option<String>,

    /// Print all stored user accounts at startup.
    #[arg(long)]
    pub show_users: bool,

    /// SQLite database path.
    #[arg(long = "db", default_value = "shellgate.db", env = "SHELLGATE_DB")]
    pub db_path: PathBuf,

    /// Directory with the web UI build to serve. Omit to run API-only.
    #[arg(long, env = "SHELLGATE_DIST")]
    pub dist: Option<PathBuf>,
}
