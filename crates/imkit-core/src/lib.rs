pub mod config;
pub mod error;
pub mod events;
pub mod pipeline;
pub mod platform;
pub mod time;

pub use config::{build_ws_url, ReconnectConfig, RealtimeConfig, Region};
pub use error::{ErrorCode, ImError, ImResult};
pub use events::{EventEmitter, ListenerId};
pub use pipeline::{Decorators, Flow, Gate, Pipeline, Rejection};
