//! Host <-> sandbox message protocol.

mod message;

pub use message::{as_number, Direction, Message, ProtocolError, RunRequest, SystemId};
