//! PostgreSQL v3 wire protocol
//!
//! * Message types shared by both directions
//! * Frontend encoding, backend decoding
//! * The stream framer that turns TCP chunks into typed messages

pub mod constants;
pub mod decode;
pub mod encode;
pub mod framer;
pub mod message;

pub use decode::decode_body;
pub use encode::{encode_message, startup_message};
pub use framer::Framer;
pub use message::{
    affected_rows, AuthenticationRequest, BackendMessage, BoundValue, ErrorFields,
    FieldDescription, FrontendMessage, Notification, TransactionStatus,
};
