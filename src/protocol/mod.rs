//! RESP2 wire protocol.
//!
//! The transfer engine speaks the classic request/response subset of the
//! Redis serialization protocol: every request is an array of bulk strings,
//! every reply is one of the five RESP2 frame types.

pub mod encoder;
pub mod frame;
pub mod parser;

pub use encoder::{encode_command, encode_frame};
pub use frame::Frame;
pub use parser::{parse_frame, ParseError};
