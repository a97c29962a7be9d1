//! Wire protocol shared by the relay server and its clients.
//!
//! Every message travels as a single text frame: a three-character tag
//! followed by length-prefixed fields. [`ProtocolMessage`] is the parsed,
//! immutable form; [`codec`] converts between frames and messages.

pub mod codec;
pub mod message;

pub use codec::{decode, encode, CodecError};
pub use message::{Direction, MessageKind, ProtocolMessage};
