use std::net::{IpAddr, Ipv4Addr};

/// Configuration for the networking core.
#[derive(Clone)]
pub struct Config {
    /// Address the TCP and UDP listeners bind to.
    pub bind_addr: IpAddr,
    /// TCP listener port. 0 = ephemeral (read it back with
    /// [`Networking::tcp_port`](crate::Networking::tcp_port)).
    pub tcp_port: u16,
    /// UDP listener port. The UDP endpoint is reserved: the socket is bound
    /// but datagrams are not handled.
    pub udp_port: u16,
    /// Number of worker threads for [`launch`](crate::Networking::launch).
    /// 0 = number of CPUs.
    pub worker_threads: usize,
    /// TCP listen backlog.
    pub backlog: i32,
    /// Initial number of connection-table slots. The table grows by doubling
    /// when a descriptor number exceeds it.
    pub conn_table_size: usize,
    /// Initial capacity of each per-connection ring buffer. Rings grow by 8x
    /// under load and shed back to this size when the connection closes.
    pub buffer_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            tcp_port: 7878,
            udp_port: 7879,
            worker_threads: 0,
            backlog: 64,
            conn_table_size: 1024,
            buffer_size: 4096,
        }
    }
}

impl Config {
    /// Validate configuration values. Returns an error if any value is out
    /// of range.
    pub fn validate(&self) -> Result<(), crate::error::Error> {
        if self.backlog <= 0 {
            return Err(crate::error::Error::Config("backlog must be > 0".into()));
        }
        if self.conn_table_size == 0 {
            return Err(crate::error::Error::Config(
                "conn_table_size must be > 0".into(),
            ));
        }
        if self.buffer_size < 64 {
            return Err(crate::error::Error::Config(
                "buffer_size must be >= 64".into(),
            ));
        }
        Ok(())
    }
}

/// Builder for [`Config`] with discoverable methods and `build()` validation.
///
/// # Example
///
/// ```rust
/// use lineloop::ConfigBuilder;
///
/// let config = ConfigBuilder::new()
///     .tcp_port(7878)
///     .udp_port(7879)
///     .worker_threads(4)
///     .build()
///     .expect("invalid config");
/// ```
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new builder with default config values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the address the listeners bind to.
    pub fn bind_addr(mut self, addr: IpAddr) -> Self {
        self.config.bind_addr = addr;
        self
    }

    /// Set the TCP listener port. 0 = ephemeral.
    pub fn tcp_port(mut self, port: u16) -> Self {
        self.config.tcp_port = port;
        self
    }

    /// Set the UDP listener port. 0 = ephemeral.
    pub fn udp_port(mut self, port: u16) -> Self {
        self.config.udp_port = port;
        self
    }

    /// Set the number of worker threads. 0 = number of CPUs.
    pub fn worker_threads(mut self, n: usize) -> Self {
        self.config.worker_threads = n;
        self
    }

    /// Set the TCP listen backlog.
    pub fn backlog(mut self, n: i32) -> Self {
        self.config.backlog = n;
        self
    }

    /// Set the initial connection-table size.
    pub fn conn_table_size(mut self, n: usize) -> Self {
        self.config.conn_table_size = n;
        self
    }

    /// Set the initial per-connection ring buffer capacity.
    pub fn buffer_size(mut self, n: usize) -> Self {
        self.config.buffer_size = n;
        self
    }

    /// Validate and build the final [`Config`].
    pub fn build(self) -> Result<Config, crate::error::Error> {
        self.config.validate()?;
        Ok(self.config)
    }
}
