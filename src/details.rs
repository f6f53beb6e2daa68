//! Request/response "details" and the `MsgInfo` they expand into (§4.2,
//! §4.10). Grounded on `stream/common.c`'s `anjay_msg_details_t` and
//! `_anjay_coap_common_fill_msg_info`: the caller describes a message by
//! its application-level shape (options it wants, not the wire bytes),
//! and [`fill_msg_info`] lays those options into a fresh [`MsgInfo`] in
//! the exact order the original does, since option order on the wire
//! must be ascending by number and the original's add order already
//! respects that (Observe=6, Location-Path=8, Uri-Path=11,
//! Content-Format=12, Uri-Query=15).

use alloc::string::String;
use alloc::vec::Vec;

use crate::block::BlockValue;
use crate::header::MessageClass;
use crate::header::MessageType;
use crate::msg::{Identity, Token};
use crate::msg_builder::MsgInfo;
use crate::option_numbers::{CONTENT_FORMAT, LOCATION_PATH, OBSERVE, URI_PATH, URI_QUERY};

/// The application-level shape of a request or response, independent of
/// wire encoding; turned into a [`MsgInfo`] by [`fill_msg_info`].
#[derive(Debug, Clone, Default)]
pub struct MsgDetails {
    pub msg_type: Option<MessageType>,
    pub code: Option<MessageClass>,
    /// `Some(format)` adds a Content-Format option; `None` omits it.
    pub content_format: Option<u16>,
    /// Adds an Observe option carrying the current monotonic timestamp
    /// (§4.10, §6); only meaningful on a response.
    pub observe: bool,
    pub location_path: Vec<String>,
    pub uri_path: Vec<String>,
    pub uri_query: Vec<String>,
}

impl MsgDetails {
    pub fn new(msg_type: MessageType, code: MessageClass) -> Self {
        MsgDetails {
            msg_type: Some(msg_type),
            code: Some(code),
            ..Default::default()
        }
    }

    pub fn with_content_format(mut self, format: u16) -> Self {
        self.content_format = Some(format);
        self
    }

    pub fn with_observe(mut self, observe: bool) -> Self {
        self.observe = observe;
        self
    }

    pub fn with_uri_path(mut self, segments: Vec<String>) -> Self {
        self.uri_path = segments;
        self
    }

    pub fn with_uri_query(mut self, segments: Vec<String>) -> Self {
        self.uri_query = segments;
        self
    }

    pub fn with_location_path(mut self, segments: Vec<String>) -> Self {
        self.location_path = segments;
        self
    }
}

fn add_string_options(info: &mut MsgInfo, number: u16, values: &[String]) {
    for v in values {
        info.add_option(number, v.as_bytes().to_vec());
    }
}

/// Builds a [`MsgInfo`] from `details` and `identity`, optionally adding
/// a Block1/Block2 option. Option add order matches
/// `_anjay_coap_common_fill_msg_info` exactly, which is already in
/// ascending option-number order.
pub fn fill_msg_info(details: &MsgDetails, identity: Identity, block: Option<(u16, BlockValue)>) -> MsgInfo {
    let mut info = MsgInfo::new(
        details.msg_type.unwrap_or(MessageType::Confirmable),
        details.code.unwrap_or(MessageClass::Empty),
        identity.msg_id,
        identity.token,
    );

    if details.observe {
        info.add_option(OBSERVE, encode_uint(observe_timestamp()));
    }
    add_string_options(&mut info, LOCATION_PATH, &details.location_path);
    add_string_options(&mut info, URI_PATH, &details.uri_path);
    if let Some(format) = details.content_format {
        info.add_option(CONTENT_FORMAT, encode_uint(format as u32));
    }
    add_string_options(&mut info, URI_QUERY, &details.uri_query);

    if let Some((option_number, value)) = block {
        info.set_option(option_number, value.encode());
    }

    info
}

/// Minimal big-endian encoding of `value`, dropping leading zero bytes
/// (a zero value encodes to an empty option, as CoAP's `uint` option
/// format requires).
fn encode_uint(value: u32) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let first_nonzero = bytes.iter().position(|&b| b != 0);
    match first_nonzero {
        Some(i) => bytes[i..].to_vec(),
        None => Vec::new(),
    }
}

/// A strictly monotonic, wrapping-every-512-seconds Observe sequence
/// value, computed exactly as `_anjay_coap_common_timestamp` does: the
/// low 9 bits of the current second plus the top 17 bits of the
/// sub-second nanoseconds, giving ~32.768 us resolution (RFC 7641 §3.4,
/// §4.4). Only available with `std`, since it reads the wall clock.
#[cfg(feature = "std")]
pub fn observe_timestamp() -> u32 {
    use std::time::{SystemTime, UNIX_EPOCH};

    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
    ((now.as_secs() as u32 & 0x1FF) << 15) | (now.subsec_nanos() >> 15)
}

#[cfg(not(feature = "std"))]
pub fn observe_timestamp() -> u32 {
    0
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::header::{RequestType, ResponseType};
    use crate::msg::Token;

    fn identity() -> Identity {
        Identity {
            msg_id: 1,
            token: Token::new(&[0xAA]).unwrap(),
        }
    }

    #[test]
    fn options_are_added_in_ascending_number_order() {
        let details = MsgDetails::new(MessageType::Confirmable, MessageClass::Response(ResponseType::Content))
            .with_content_format(40)
            .with_uri_path(alloc::vec!["a".into(), "b".into()])
            .with_uri_query(alloc::vec!["q=1".into()])
            .with_location_path(alloc::vec!["loc".into()]);

        let info = fill_msg_info(&details, identity(), None);
        let numbers: Vec<u16> = info.options().map(|(n, _)| n).collect();
        let mut sorted = numbers.clone();
        sorted.sort_unstable();
        assert_eq!(numbers, sorted);
        assert!(numbers.contains(&LOCATION_PATH));
        assert!(numbers.contains(&URI_PATH));
        assert!(numbers.contains(&CONTENT_FORMAT));
        assert!(numbers.contains(&URI_QUERY));
    }

    #[test]
    fn observe_adds_option_when_requested() {
        let details =
            MsgDetails::new(MessageType::NonConfirmable, MessageClass::Response(ResponseType::Content)).with_observe(true);
        let info = fill_msg_info(&details, identity(), None);
        assert!(info.options().any(|(n, _)| n == OBSERVE));
    }

    #[test]
    fn request_details_carry_no_observe_by_default() {
        let details = MsgDetails::new(MessageType::Confirmable, MessageClass::Request(RequestType::Get));
        let info = fill_msg_info(&details, identity(), None);
        assert!(!info.options().any(|(n, _)| n == OBSERVE));
    }
}
