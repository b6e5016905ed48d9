// Library modules
pub mod config;
pub mod constants;
pub mod coordinator;
pub mod crypto;
pub mod error;
pub mod executor;
pub mod frame;
pub mod registry;
pub mod watcher;
pub mod writer;

// Re-export the public surface.
pub use config::Config;
pub use coordinator::{Coordinator, DecodedMessage, MessageCallback, MethodFn, ThreadMode};
pub use crypto::AeadCodec;
pub use error::{Result, SpeedError};
pub use frame::{Frame, MessageType};
