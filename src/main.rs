//! rollcall: a login-gated command server
//!
//! Features:
//! - Single-threaded readiness loop (epoll/kqueue via mio)
//! - One-shot email + password login per connection
//! - Action-code command dispatch for logged-in connections
//! - Configuration via CLI arguments or TOML file

use rollcall::commands::CommandRegistry;
use rollcall::config::Config;
use rollcall::directory::{NewUser, UserDirectory};
use rollcall::runtime;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        max_connections = config.max_connections,
        login_timeout = ?config.login_timeout,
        max_login_attempts = ?config.max_login_attempts,
        "Starting rollcall server"
    );

    let directory = build_directory(&config)?;
    let registry = CommandRegistry::with_defaults();
    info!(users = directory.len(), actions = registry.len(), "Directory ready");

    runtime::run(&config, directory, registry)?;
    Ok(())
}

/// Provision the administrator and seed configured users.
fn build_directory(config: &Config) -> Result<UserDirectory, Box<dyn std::error::Error>> {
    let mut directory = UserDirectory::new();
    directory.provision_admin(&config.admin.email, &config.admin.password)?;

    for seed in &config.users {
        directory.register(NewUser {
            first_name: seed.first_name.clone(),
            last_name: seed.last_name.clone(),
            email: seed.email.clone(),
            password: seed.password.clone(),
            role: seed.role,
        })?;
    }

    Ok(directory)
}
