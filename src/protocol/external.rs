/// A Tokio codec that transforms an `AsyncRead` into a `Stream` of `Message`s.
pub mod codec;
/// Inventory items.
pub(crate) mod inv;
/// An enum of all supported Bitcoin message types.
pub(crate) mod message;

/// A single byte enum representing a Bitcoin message type.
pub(crate) mod command;
/// Newtype wrappers for primitive types.
pub mod types;

use command::Command;

pub use codec::Codec;
pub use inv::InventoryHash;
pub use message::{Message, RejectReason, Version};
