//! Transports and the connector seam used to establish them.

use std::{io, net::SocketAddr, time::Duration};

use async_trait::async_trait;
use socket2::{SockRef, TcpKeepalive};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpSocket,
};

/// A duplex byte stream a physical connection can own.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Opens transports to endpoints.
///
/// Bridges call [`Connector::connect`] for every connection attempt, so an
/// implementation may fail selectively to exercise reconnect behaviour.
#[async_trait]
#[cfg_attr(test, mockall::automock)]
pub trait Connector: Send + Sync {
    /// Open a new transport to `endpoint`.
    async fn connect(&self, endpoint: SocketAddr) -> io::Result<Box<dyn Transport>>;
}

/// Connects over TCP, applying [`SocketOptions`] before the handshake.
#[derive(Clone, Copy, Debug, Default)]
pub struct TcpConnector {
    options: SocketOptions,
}

impl TcpConnector {
    /// Create a connector applying `options` to every socket.
    #[must_use]
    pub fn new(options: SocketOptions) -> Self { Self { options } }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, endpoint: SocketAddr) -> io::Result<Box<dyn Transport>> {
        let socket = if endpoint.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        self.options.apply(&socket)?;
        let stream = socket.connect(endpoint).await?;
        Ok(Box::new(stream))
    }
}

/// Socket options applied before connecting.
///
/// Unset options keep the operating system defaults.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use respmux::SocketOptions;
///
/// let options = SocketOptions::default()
///     .nodelay(true)
///     .keepalive(Some(Duration::from_secs(60)));
/// assert_ne!(options, SocketOptions::default());
/// ```
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SocketOptions {
    nodelay: Option<bool>,
    keepalive: Option<Option<Duration>>,
    linger: Option<Option<Duration>>,
    send_buffer_size: Option<u32>,
    recv_buffer_size: Option<u32>,
}

impl SocketOptions {
    /// Configure `TCP_NODELAY`. Pipelined commands benefit from enabling it.
    #[must_use]
    pub fn nodelay(mut self, enabled: bool) -> Self {
        self.nodelay = Some(enabled);
        self
    }

    /// Enable TCP keepalive probes after `idle`, or disable them with `None`.
    #[must_use]
    pub fn keepalive(mut self, idle: Option<Duration>) -> Self {
        self.keepalive = Some(idle);
        self
    }

    /// Configure `SO_LINGER`; `None` disables lingering.
    #[must_use]
    pub fn linger(mut self, duration: Option<Duration>) -> Self {
        self.linger = Some(duration);
        self
    }

    /// Configure the socket send buffer size.
    #[must_use]
    pub fn send_buffer_size(mut self, size: u32) -> Self {
        self.send_buffer_size = Some(size);
        self
    }

    /// Configure the socket receive buffer size.
    #[must_use]
    pub fn recv_buffer_size(mut self, size: u32) -> Self {
        self.recv_buffer_size = Some(size);
        self
    }

    pub(crate) fn apply(&self, socket: &TcpSocket) -> io::Result<()> {
        if let Some(enabled) = self.nodelay {
            socket.set_nodelay(enabled)?;
        }
        match self.keepalive {
            Some(Some(idle)) => {
                socket.set_keepalive(true)?;
                SockRef::from(socket).set_tcp_keepalive(&TcpKeepalive::new().with_time(idle))?;
            }
            Some(None) => socket.set_keepalive(false)?,
            None => {}
        }
        if let Some(linger) = self.linger {
            socket.set_linger(linger)?;
        }
        if let Some(size) = self.send_buffer_size {
            socket.set_send_buffer_size(size)?;
        }
        if let Some(size) = self.recv_buffer_size {
            socket.set_recv_buffer_size(size)?;
        }
        Ok(())
    }
}
