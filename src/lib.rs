//! Cross-process shared memory message channel
//!
//! Single-producer/single-consumer bounded FIFO built on a named shared
//! memory segment and a named cross-process lock. One process opens the
//! channel as [`Role::Producer`] and appends messages with [`Channel::send`];
//! the peer opens it as [`Role::Consumer`] and drains them with
//! [`Channel::peek_next_size`] and [`Channel::receive`]. Neither call blocks
//! waiting for the other side; callers poll with a delay of their choosing.

pub mod channel;
pub mod error;
pub mod lock;
pub mod protocol;
pub mod region;

pub use channel::*;
pub use error::*;
pub use lock::*;
pub use protocol::*;
pub use region::*;

/// Frame alignment unit; every frame is padded to a multiple of this.
pub const FRAME_ALIGNMENT: usize = 64;

/// Size of the per-frame length header (one machine word).
pub const HEADER_SIZE: usize = std::mem::size_of::<u64>();

/// First valid data offset: the byte immediately after the control block.
pub const DATA_OFFSET: usize = std::mem::size_of::<protocol::ControlBlock>();
