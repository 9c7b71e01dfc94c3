//! # ev3dc Core Library
//!
//! Request/response engine for the LEGO EV3 "Direct Command" protocol.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//!
//! This library provides:
//! - Parameter encoding (bytes, numbers, strings, memory pointers)
//! - Reply framing for byte streams split at arbitrary points
//! - Request/response correlation with per-request timeouts
//! - A session that ties these to any async transport
//! - A small command catalog for a brick on a serial or Bluetooth port
//!
//! ## Example
//!
//! ```rust,ignore
//! use ev3dc_core::prelude::*;
//!
//! let brick = Brick::connect(&ConnectionConfig::for_port("/dev/rfcomm0")).await?;
//! println!("battery: {:.2} V", brick.battery_voltage().await?);
//!
//! // Raw Direct Command: UI_READ, GET_VBATT into a global float
//! let values = brick
//!     .send_request(&[0x81u8.into(), 0x01u8.into(), Pointer::global_float().into()])
//!     .await?;
//! ```

pub mod brick;
pub mod protocol;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::brick::{Brick, ConnectionConfig, LedColor, LedPattern};
    pub use crate::protocol::{
        DecodedValue, Ev3Error, MessageFramer, Parameter, Pointer, PointerScope, PointerType,
        ProtocolSession, ResponseBroker, SessionConfig, SessionEvent, Value,
    };
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
