//! AT Command Protocol Engine
//!
//! This crate talks to GSM modems over their line-based AT command
//! interface. One [`ProtocolEngine`] serves one modem and correlates the
//! commands it sends with the responses it receives, while unsolicited
//! events arriving on the same channel are parsed and dispatched on a
//! separate thread.
//!
//! # Protocol Overview
//!
//! - **Commands** (host → modem): text lines terminated with `\r\n`
//! - **Responses** (modem → host): zero or more lines, then a terminal token
//!   (`OK` or `ERROR` by default)
//! - **Events** (modem → host, unprompted): `+NAME: arg,arg,...`
//!
//! # Example
//!
//! ```rust,ignore
//! use smser_at::{AtCommand, Invocation, NoopHandler, ProtocolEngine, StreamWriter};
//!
//! let engine = ProtocolEngine::start("modem0", Box::new(StreamWriter::new(port)),
//!     Arc::new(NoopHandler), DEFAULT_COMMAND_TIMEOUT);
//!
//! // The reader thread feeds every decoded line:
//! engine.classify("OK");
//!
//! let lines = engine.execute(&AtCommand::ReadMessage { index: 3 })?;
//! ```

mod codec;
mod commands;
mod engine;
mod error;
mod event;
mod subscription;
mod transport;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use codec::*;
pub use commands::*;
pub use engine::*;
pub use error::*;
pub use event::*;
pub use subscription::*;
pub use transport::*;
