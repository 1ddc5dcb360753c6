//! Open Pixel Control protocol layer (OPL): wire framing and the TCP
//! listener/connection plumbing built on top of it.
pub mod frame;
pub mod listener;

pub use frame::{decode_command, Framer, OpcCommand, OpcMessage};
pub use listener::{Connection, Listener};
