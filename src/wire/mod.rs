//! Wire grammar: varints, cursors, packet numbers, and the frame codec.

mod cursor;
mod error;
mod frame;
pub mod packet_number;
pub mod varint;

pub use cursor::{Reader, Writer};
pub use error::{CodecError, Result};
pub use frame::{AckFrame, EcnCounts, Frame, PacketClass};
