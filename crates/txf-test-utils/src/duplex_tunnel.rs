//! In-process side-channel transport.
//!
//! One `DuplexTunnel` hands the two ends of a pre-created duplex pipe to
//! the connector and acceptor roles. A tunnel that should fail to connect
//! is modeled by constructing the broken variant.

use std::sync::Mutex;

use async_trait::async_trait;
use tokio::io::DuplexStream;

use txf_core::error::{Error, Result};
use txf_core::tunnel::{TunnelAcceptor, TunnelConnector, TunnelStream};

/// A tunnel transport backed by an in-memory pipe.
pub struct DuplexTunnel {
    port: u16,
    connect_end: Mutex<Option<DuplexStream>>,
    accept_end: Mutex<Option<DuplexStream>>,
    broken: bool,
}

impl DuplexTunnel {
    /// A working tunnel advertising the given port.
    pub fn new(port: u16) -> Self {
        let (a, b) = tokio::io::duplex(256 * 1024);
        Self {
            port,
            connect_end: Mutex::new(Some(a)),
            accept_end: Mutex::new(Some(b)),
            broken: false,
        }
    }

    /// A tunnel whose connect side always fails, for fallback tests.
    pub fn broken(port: u16) -> Self {
        let mut tunnel = Self::new(port);
        tunnel.broken = true;
        tunnel
    }
}

#[async_trait]
impl TunnelConnector for DuplexTunnel {
    async fn connect(&self, port: u16) -> Result<Box<dyn TunnelStream>> {
        if self.broken {
            return Err(Error::Transport {
                message: format!("connection refused on port {port}"),
            });
        }
        self.connect_end
            .lock()
            .unwrap()
            .take()
            .map(|s| Box::new(s) as Box<dyn TunnelStream>)
            .ok_or(Error::Transport {
                message: "tunnel already connected".into(),
            })
    }
}

#[async_trait]
impl TunnelAcceptor for DuplexTunnel {
    fn port(&self) -> u16 {
        self.port
    }

    async fn accept(&self) -> Result<Box<dyn TunnelStream>> {
        self.accept_end
            .lock()
            .unwrap()
            .take()
            .map(|s| Box::new(s) as Box<dyn TunnelStream>)
            .ok_or(Error::Transport {
                message: "tunnel already accepted".into(),
            })
    }
}
