//! Host port selection for the devnet's published service.
//!
//! Verification and the node's eventual bind are not atomic: another process
//! can grab the port in between. That race is accepted; the allocator only
//! runs right before container creation.

use std::{
    fmt, io,
    net::TcpListener,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::{debug, warn};

const PORT_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[async_trait]
pub trait PortProbe: Send + Sync + fmt::Debug {
    /// Asks the OS for a currently unused ephemeral port.
    fn free_port(&self) -> io::Result<u16>;

    fn is_taken(&self, port: u16) -> bool;

    async fn accepts_connections(&self, host: &str, port: u16) -> bool;
}

/// [`PortProbe`] that talks to the local network stack.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsPortProbe;

#[async_trait]
impl PortProbe for OsPortProbe {
    fn free_port(&self) -> io::Result<u16> {
        let listener = TcpListener::bind(("127.0.0.1", 0))?;
        Ok(listener.local_addr()?.port())
    }

    fn is_taken(&self, port: u16) -> bool {
        TcpListener::bind(("0.0.0.0", port)).is_err()
    }

    async fn accepts_connections(&self, host: &str, port: u16) -> bool {
        TcpStream::connect((host, port)).await.is_ok()
    }
}

/// Returns `requested` if it is free, otherwise keeps asking the OS for
/// ephemeral ports until one verifies as unbound. Zero means unset.
pub fn allocate_port(probe: &dyn PortProbe, requested: Option<u16>) -> io::Result<u16> {
    let mut candidate = requested.filter(|port| *port != 0);
    let mut attempt: u32 = 0;
    loop {
        let port = match candidate.take() {
            Some(port) => port,
            None => probe.free_port()?,
        };
        attempt += 1;
        if !probe.is_taken(port) {
            debug!(port, attempt, "allocated devnet port");
            return Ok(port);
        }
        warn!(port, attempt, "port is already bound, trying another");
    }
}

/// Polls until `host:port` accepts a TCP connection or `timeout` elapses.
pub async fn wait_for_port(probe: &dyn PortProbe, host: &str, port: u16, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if probe.accepts_connections(host, port).await {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        debug!(host, port, "waiting for devnet port to open");
        tokio::time::sleep(PORT_POLL_INTERVAL).await;
    }
}
