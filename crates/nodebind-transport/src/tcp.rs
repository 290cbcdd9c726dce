use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{debug, info};

use crate::address::NodeAddress;
use crate::error::{Result, TransportError};
use crate::stream::NodeStream;

/// Connect timeout used when waking a blocked acceptor.
const WAKE_TIMEOUT: Duration = Duration::from_millis(500);

/// TCP listener for a node's inbound connections.
///
/// `accept` blocks. To stop an acceptor thread, call [`close`](Self::close)
/// from another thread: it marks the listener closed and makes a throwaway
/// connection so the blocked `accept` returns [`TransportError::Shutdown`].
pub struct NodeListener {
    listener: TcpListener,
    address: NodeAddress,
    local_addr: SocketAddr,
    closing: AtomicBool,
}

impl NodeListener {
    /// Bind and listen on `address`. Port 0 picks an ephemeral port.
    pub fn bind(address: &NodeAddress) -> Result<Self> {
        let addrs = address.resolve().map_err(|err| match err {
            TransportError::Connect { address, source } => TransportError::Bind { address, source },
            other => other,
        })?;
        let listener =
            TcpListener::bind(addrs.as_slice()).map_err(|source| TransportError::Bind {
                address: address.to_string(),
                source,
            })?;
        let local_addr = listener.local_addr()?;

        info!(%address, %local_addr, "listening on tcp");

        Ok(Self {
            listener,
            address: address.clone(),
            local_addr,
            closing: AtomicBool::new(false),
        })
    }

    /// Parse `uri` and bind it.
    pub fn bind_uri(uri: &str) -> Result<Self> {
        Self::bind(&NodeAddress::parse(uri)?)
    }

    /// Accept an incoming connection (blocking).
    pub fn accept(&self) -> Result<NodeStream> {
        let (stream, peer) = self.listener.accept().map_err(TransportError::Accept)?;
        if self.closing.load(Ordering::Acquire) {
            debug!(%peer, "listener closing; dropping connection");
            return Err(TransportError::Shutdown);
        }
        debug!(%peer, "accepted connection");
        Ok(NodeStream::from_tcp(stream))
    }

    /// Stop accepting. Wakes a thread blocked in [`accept`](Self::accept).
    pub fn close(&self) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        let target = wake_target(self.local_addr);
        if let Err(err) = TcpStream::connect_timeout(&target, WAKE_TIMEOUT) {
            debug!(%target, error = %err, "acceptor wake-up connect failed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// The configured address this listener was bound from.
    pub fn address(&self) -> &NodeAddress {
        &self.address
    }

    /// The actual bound socket address (resolves port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Transport name for diagnostics.
    pub fn transport_name(&self) -> &'static str {
        "tcp"
    }
}

impl std::fmt::Debug for NodeListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeListener")
            .field("local_addr", &self.local_addr)
            .field("closing", &self.is_closed())
            .finish()
    }
}

/// Connect to a node, trying each resolved address within `timeout`.
pub fn connect(address: &NodeAddress, timeout: Duration) -> Result<NodeStream> {
    let mut last_err = None;
    for addr in address.resolve()? {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => {
                debug!(%address, %addr, "connected to node");
                return Ok(NodeStream::from_tcp(stream));
            }
            Err(err) => {
                debug!(%address, %addr, error = %err, "connect attempt failed");
                last_err = Some(err);
            }
        }
    }
    Err(TransportError::Connect {
        address: address.to_string(),
        source: last_err.unwrap_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "no address to connect to")
        }),
    })
}

fn wake_target(bound: SocketAddr) -> SocketAddr {
    match bound.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), bound.port())
        }
        IpAddr::V6(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), bound.port())
        }
        _ => bound,
    }
}
