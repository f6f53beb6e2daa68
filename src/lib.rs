//! A `#![no_std]` (+ `alloc`) RFC 7252 CoAP protocol engine, built for
//! embedded LwM2M clients.
//!
//! The wire codec ([`msg`], [`msg_builder`], [`header`], [`block`]) works
//! on any target with a global allocator. Everything that needs a
//! monotonic clock or a real transport — the duplicate-response
//! [`cache`], the [`socket`] wrapper, the [`block_transfer`] engine and
//! the [`stream`] facade — sits behind the default-on `std` feature.
//!
//! ## Usage
//! ```rust
//! use anjay_coap::msg_builder::{MsgInfo, OutputBuffer};
//! use anjay_coap::header::{MessageClass, MessageType, RequestType};
//! use anjay_coap::msg::{Msg, Token};
//! use anjay_coap::option_numbers::URI_PATH;
//!
//! let mut info = MsgInfo::new(
//!     MessageType::Confirmable,
//!     MessageClass::Request(RequestType::Get),
//!     23839,
//!     Token::new(&[0, 0, 57, 116]).unwrap(),
//! );
//! info.add_option(URI_PATH, b"tv1".to_vec());
//!
//! let mut buf = [0u8; 64];
//! let mut out = OutputBuffer::new(&mut buf);
//! out.setup(&info).unwrap();
//! out.write_payload(&[]).unwrap();
//!
//! let msg = Msg::parse(out.as_bytes()).unwrap();
//! assert_eq!(msg.id(), 23839);
//! assert_eq!(msg.token(), &[0, 0, 57, 116]);
//! ```

#![cfg_attr(not(feature = "std"), no_std)]

#[macro_use]
extern crate alloc;

#[macro_use]
mod log;

#[cfg_attr(tarpaulin, skip)]
pub mod error;

pub mod block;
pub mod block_builder;
pub mod details;
pub mod header;
pub mod id_source;
pub mod msg;
pub mod msg_builder;
pub mod option_numbers;
pub mod tx_params;

#[cfg(feature = "std")]
pub mod cache;
#[cfg(feature = "std")]
pub mod block_transfer;
#[cfg(feature = "std")]
pub mod socket;
#[cfg(feature = "std")]
pub mod stream;

pub use header::{Header, HeaderRaw, MessageClass, MessageType, RequestType, ResponseType};
pub use msg::{Identity, Msg, Opt, Token};
pub use msg_builder::{MsgInfo, OutputBuffer};

#[cfg(feature = "std")]
pub use stream::Stream;
