//! Byte-level building blocks: the chunked [`buf::Buffer`] every connection reads into and
//! writes from, streaming compression straight into buffers, and outbound proxy framing.

pub mod buf;
pub mod compression;
pub mod proxy;

pub use buf::Buffer;
