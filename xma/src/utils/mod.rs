//! Supporting infrastructure: bit-level reading, ring buffer bookkeeping and
//! error types.

pub mod bit_cursor;
pub mod errors;
pub mod ring_buffer;
