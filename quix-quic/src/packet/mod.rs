//! Packet layer: header codec, packet-number truncation, number spaces.

pub mod header;
pub mod number;
pub mod space;

pub use header::{Header, PacketType};
pub use number::PnWidth;
pub use space::{PacketSpace, SpaceId, SPACE_COUNT};
