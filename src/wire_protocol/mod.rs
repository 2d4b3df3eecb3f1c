//! Request and reply framing for the commands the topology layer sends.
pub mod flags;
pub mod header;
pub mod operations;

pub use self::operations::Message;
