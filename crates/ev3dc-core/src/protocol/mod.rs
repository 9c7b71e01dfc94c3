//! Direct Command protocol
//!
//! Implements the EV3 Direct Command protocol: parameter encoding, reply
//! framing, request/response correlation and the session tying them to a
//! serial transport.

mod broker;
pub mod codec;
mod error;
mod framer;
pub mod packet;
pub mod serial;
mod session;

pub use broker::{ResponseBroker, ResponseFuture};
pub use codec::{Parameter, Pointer, PointerScope, PointerType};
pub use error::{Ev3Error, Result};
pub use framer::MessageFramer;
pub use packet::{DecodedValue, ResponseMessage, ResponsePointer, Value};
pub use serial::{find_brick_port, list_ports, open_port, PortInfo};
pub use session::{ProtocolSession, ResponseReader, SessionConfig, SessionEvent};

/// Default baud rate for the serial link
pub const DEFAULT_BAUD_RATE: u32 = 115200;

/// Default time to wait for a reply in milliseconds
pub const DEFAULT_TIMEOUT_MS: u64 = 5000;
