//! Structured representations of the packet stream: packet headers, frame
//! locations and codec-ready frame buffers.

pub mod frame;
pub mod packet;
