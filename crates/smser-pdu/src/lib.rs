//! SMS PDU Decoding
//!
//! Decodes SMS-DELIVER PDUs as modems report them in PDU mode (`AT+CMGF=0`)
//! in reply to `AT+CMGR`. Supported user data:
//!
//! - GSM 7-bit default alphabet with the extension table
//! - 8-bit data (mapped octet-per-character)
//! - UCS-2
//!
//! A user data header is parsed for concatenation info only; other
//! information elements are skipped.
//!
//! # Example
//!
//! ```rust,ignore
//! use smser_pdu::decode_deliver;
//!
//! let sms = decode_deliver("07917283010010F5040BC87238880900F10000993092516195800AE8329BFD4697D9EC37")?;
//! assert_eq!(sms.body, "hellohello");
//! ```

mod decode;
mod error;
pub mod gsm7;

pub use decode::*;
pub use error::*;
