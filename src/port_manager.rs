use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tracing::{debug, info};

/// Configuration for port probing
#[derive(Debug, Clone)]
pub struct PortProbeConfig {
    /// Address the subject and the mock peer listen on
    pub address: IpAddr,
    /// Delay between readiness connection attempts
    pub poll_interval: Duration,
    /// Timeout of a single connection attempt
    pub connect_timeout: Duration,
}

impl Default for PortProbeConfig {
    fn default() -> Self {
        Self {
            address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            poll_interval: Duration::from_millis(200),
            connect_timeout: Duration::from_millis(500),
        }
    }
}

/// Checks port availability before launch and waits for listeners afterwards.
///
/// Scenarios run one at a time, so a port only needs to be unique among the
/// processes of a single scenario; `base_port + offset` keeps them apart if
/// scenarios ever run side by side.
#[derive(Debug, Clone, Default)]
pub struct PortManager {
    config: PortProbeConfig,
}

impl PortManager {
    /// Creates a new port manager
    ///
    /// # Arguments
    /// * `config` - Probe address and timing
    ///
    /// # Returns
    /// * `Self` - The port manager instance
    pub fn new(config: PortProbeConfig) -> Self {
        Self { config }
    }

    /// Verifies nothing is listening on `port` by binding it briefly.
    ///
    /// # Arguments
    /// * `port` - The port the subject will be told to serve on
    ///
    /// # Returns
    /// * `io::Result<()>` - `Ok` if the bind succeeded, the bind error otherwise
    pub fn ensure_free(&self, port: u16) -> io::Result<()> {
        let addr = SocketAddr::new(self.config.address, port);
        let domain = match addr {
            SocketAddr::V4(_) => Domain::IPV4,
            SocketAddr::V6(_) => Domain::IPV6,
        };
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        // Lingering TIME_WAIT sockets from the previous scenario must not count as busy.
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        debug!("port {} is free", port);
        Ok(())
    }

    /// Polls `port` until a TCP connection succeeds or `budget` elapses.
    ///
    /// # Arguments
    /// * `port` - Port to connect to on the probe address
    /// * `budget` - Total time to keep trying; a budget too large to represent never expires
    ///
    /// # Returns
    /// * `bool` - True once something accepted a connection
    pub async fn wait_listening(&self, port: u16, budget: Duration) -> bool {
        let addr = SocketAddr::new(self.config.address, port);
        let deadline = Instant::now().checked_add(budget);

        loop {
            if let Ok(Ok(_stream)) = timeout(self.config.connect_timeout, TcpStream::connect(addr)).await {
                info!("{} is accepting connections", addr);
                return true;
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                debug!("{} not listening after {:?}", addr, budget);
                return false;
            }
            sleep(self.config.poll_interval).await;
        }
    }
}
