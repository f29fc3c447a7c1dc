//! Transport seam.
//!
//! A [`Connector`] produces a [`Connection`]: a pair of channels carrying
//! outbound frames and inbound transport events. The session layer never
//! touches sockets directly, so tests can script a fake server.

mod native;

pub use native::WsConnector;

use futures_util::future::BoxFuture;
use tokio::sync::mpsc;

use imkit_core::ImResult;

use crate::protocol::Frame;

/// What the transport reports upwards.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Frame(Frame),
    /// A frame arrived that could not be decoded. `serial` is its `i` when
    /// that much was readable.
    Malformed { serial: Option<u64>, reason: String },
    /// The connection ended. `code` is the close code when the peer sent one.
    Closed { code: Option<u16>, reason: String },
}

/// One live connection. Dropping `outbound` closes it.
pub struct Connection {
    pub outbound: mpsc::UnboundedSender<Frame>,
    pub inbound: mpsc::UnboundedReceiver<TransportEvent>,
}

impl Connection {
    /// Build a connection from both ends of a scripted peer, returning the
    /// peer's halves.
    pub fn pair() -> (
        Self,
        mpsc::UnboundedReceiver<Frame>,
        mpsc::UnboundedSender<TransportEvent>,
    ) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        (
            Self {
                outbound: out_tx,
                inbound: in_rx,
            },
            out_rx,
            in_tx,
        )
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("closed", &self.outbound.is_closed())
            .finish()
    }
}

pub trait Connector: Send + Sync + 'static {
    fn connect(&self, url: &str) -> BoxFuture<'static, ImResult<Connection>>;
}
