//! cairn-core — peer identity, framing, and object transfer.
//! The `cairnd` node and the integration tests depend on this crate.

pub mod config;
pub mod crypto;
pub mod identity;
pub mod transfer;
pub mod wire;

pub use crypto::{KeyError, KeyRegistry, KeyType, PrivateKey, PublicKey};
pub use identity::{IdEncoding, IdentityCodec, IdentityError, PeerId};
pub use transfer::{ReceiverSession, SenderSession, TransferError, TransferHeader};
pub use wire::{Frame, FrameError};
