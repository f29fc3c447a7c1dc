//! Message model for imkit: envelopes, typed classes, payload codec and the
//! delivery state machine.

pub mod message;
pub mod parser;
pub mod payload;
pub mod registry;
pub mod status;

pub use message::{Content, Message, MessagePointer};
pub use parser::MessageParser;
pub use payload::{Payload, PayloadKind, TypedContent, RECALLED_MESSAGE_TYPE, TEXT_MESSAGE_TYPE};
pub use registry::{MessageClass, MessageRegistry};
pub use status::MessageStatus;
