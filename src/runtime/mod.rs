//! Server runtime.
//!
//! A single-threaded, readiness-based event loop (mio: epoll on Linux,
//! kqueue on macOS) that owns every connection:
//! - `ConnectionPool`: pending and active connections in insertion order
//! - `Server`: the accept / login / dispatch loop

mod connection;
mod event_loop;

pub use connection::{
    ActiveVisit, ConnId, ConnState, Connection, ConnectionPool, PendingVisit, PoolError,
};
pub use event_loop::{LoopSettings, Server};

use crate::commands::CommandRegistry;
use crate::config::Config;
use crate::directory::CredentialGate;
use tracing::info;

/// Bind the configured address and serve until the poller fails.
///
/// A bind failure is returned before any connection is accepted.
pub fn run<G: CredentialGate>(
    config: &Config,
    gate: G,
    registry: CommandRegistry,
) -> std::io::Result<()> {
    let mut server = Server::bind(config.listen, LoopSettings::from(config), gate, registry)?;

    info!(
        addr = %server.local_addr()?,
        max_connections = config.max_connections,
        read_buffer_size = config.read_buffer_size,
        "Server listening"
    );

    server.run_forever()
}
