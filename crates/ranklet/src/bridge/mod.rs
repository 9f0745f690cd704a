//! The tool/daemon bridge: request/response types, their wire encoding,
//! and the byte transports they travel over.

pub mod codec;
pub mod protocol;
pub mod transport;
