//! Realtime instant-messaging client.
//!
//! Re-exports the imkit crates behind one dependency. `query` and
//! `realtime` are default features; without them only the message model and
//! the shared core remain.
//!
//! ```ignore
//! use imkit::prelude::*;
//!
//! let realtime = Realtime::new(RealtimeConfig::new("app-id"))?;
//! let alice = realtime.create_im_client("alice", ClientOptions::new()).await?;
//! alice.on(|event| {
//!     if let ClientEvent::Message { conversation, message } = event {
//!         println!("{}: {:?}", conversation.id(), message.payload());
//!     }
//! });
//! ```

// Re-export core (always available)
pub use imkit_core::*;

// Re-export the message model (always available)
pub use imkit_message::*;

#[cfg(feature = "query")]
pub use imkit_query::*;

#[cfg(feature = "realtime")]
pub use imkit_realtime::*;

/// Prelude module for convenient imports.
///
/// ```ignore
/// use imkit::prelude::*;
/// ```
pub mod prelude {
    pub use imkit_core::{
        ErrorCode, Flow, ImError, ImResult, ListenerId, ReconnectConfig, RealtimeConfig, Region,
    };

    pub use imkit_message::{
        Message, MessageClass, MessagePointer, MessageStatus, Payload, TypedContent,
    };

    #[cfg(feature = "query")]
    pub use imkit_query::{ConversationQuery, Filterable, GeoPoint, Modifiable};

    #[cfg(feature = "realtime")]
    pub use imkit_realtime::{
        ClientEvent, ClientOptions, ConnectionState, Conversation, ConversationEvent,
        ConversationKind, ConversationOptions, IMClient, MessagePriority, MessageQuery,
        MessageQueryDirection, Plugin, Realtime, RealtimeEvent, ReceiptTimestamps, SendOptions,
        Signature, SignatureAction, SignatureFactory,
    };
}
