//! The AT command engine: half-duplex request/response multiplexed against
//! an unsolicited event stream on one byte transport.
//!
//! [`channel::AtChannel`] owns the protocol state and exposes the five
//! blocking send operations; [`reader`] runs the per-channel reader thread
//! that frames bytes into lines and classifies them; [`response`] holds the
//! completed-exchange value and final-result-code tables; [`tok`] is the
//! response line tokenizer.

pub mod channel;
pub mod reader;
pub mod response;
pub mod tok;

pub use channel::AtChannel;
pub use response::{AtResponse, ResponseKind};
pub use tok::Tokenizer;
