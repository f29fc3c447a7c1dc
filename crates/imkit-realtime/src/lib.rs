//! Realtime session layer for imkit.
//!
//! One [`Realtime`] owns one multiplexed connection. Each [`IMClient`] opens
//! a session for one identity over it, and each [`Conversation`] is the
//! cached, event-emitting view of one conversation that client belongs to.
//!
//! # Usage
//!
//! ```ignore
//! use imkit_realtime::{Realtime, ClientOptions, ConversationOptions, SendOptions};
//!
//! let realtime = Realtime::new(RealtimeConfig::new("app-id"))?;
//! let alice = realtime.create_im_client("alice", ClientOptions::new()).await?;
//! let conversation = alice
//!     .create_conversation(ConversationOptions::new().members(["bob"]))
//!     .await?;
//!
//! let mut message = Message::text("hello");
//! conversation.send(&mut message, SendOptions::new().receipt(true)).await?;
//! ```

pub mod client;
pub mod conversation;
pub mod plugin;
pub mod protocol;
pub mod realtime;
pub mod signature;
pub mod transport;
pub mod types;

// Re-exports for convenient access
pub use client::{IMClient, MAX_PING_IDS};
pub use conversation::{Conversation, ConversationRecord, MessagesIterator};
pub use plugin::{DispatchContext, Plugin};
pub use protocol::{CommandType, Frame, Op};
pub use realtime::{Realtime, RealtimeBuilder};
pub use signature::{Signature, SignatureAction, SignatureFactory, SignatureRequest};
pub use transport::{Connection, Connector, TransportEvent, WsConnector};
pub use types::{
    ClientEvent, ClientOptions, ConnectionState, ConversationEvent, ConversationKind,
    ConversationOptions, MessagePriority, MessageQuery, MessageQueryDirection, RealtimeEvent,
    ReceiptTimestamps, SendOptions,
};
