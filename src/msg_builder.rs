//! Builds a CoAP message into a caller-supplied buffer (§4.2).
//!
//! [`MsgInfo`] collects the header fields and options that make up a
//! message; [`OutputBuffer`] serializes an `MsgInfo` plus a payload into
//! a fixed buffer without ever allocating a `Vec` for the wire bytes
//! themselves (only the staged option values in `MsgInfo` live on the
//! heap, exactly as `Packet`'s `BTreeMap<u16, LinkedList<Vec<u8>>>` did).

use alloc::{collections::BTreeMap, vec::Vec};

use crate::error::MessageError;
use crate::header::{Header, HeaderRaw, MessageClass, MessageType};
use crate::msg::{Token, MAX_TOKEN_LENGTH, PAYLOAD_MARKER};

/// The header fields and options of a message still being assembled.
///
/// Options are kept in a `BTreeMap` so [`MsgInfo::options`] always
/// iterates in ascending option-number order, which is what the wire
/// encoding's delta scheme requires; the `Vec` under each number holds
/// repeated instances (e.g. multiple `Uri-Path` segments) in the order
/// they were added.
#[derive(Debug, Clone)]
pub struct MsgInfo {
    pub msg_type: MessageType,
    pub code: MessageClass,
    pub msg_id: u16,
    pub token: Token,
    options: BTreeMap<u16, Vec<Vec<u8>>>,
}

impl MsgInfo {
    pub fn new(msg_type: MessageType, code: MessageClass, msg_id: u16, token: Token) -> Self {
        MsgInfo {
            msg_type,
            code,
            msg_id,
            token,
            options: BTreeMap::new(),
        }
    }

    pub fn add_option(&mut self, number: u16, value: Vec<u8>) {
        self.options.entry(number).or_default().push(value);
    }

    /// Replaces every instance of `number` with a single new value; used
    /// by the block transfer engine to update the Block option as the
    /// transfer advances without disturbing the rest of the message.
    pub fn set_option(&mut self, number: u16, value: Vec<u8>) {
        self.options.insert(number, vec![value]);
    }

    pub fn options(&self) -> impl Iterator<Item = (u16, &Vec<u8>)> {
        self.options
            .iter()
            .flat_map(|(&number, values)| values.iter().map(move |v| (number, v)))
    }

    fn encoded_options_len(&self) -> usize {
        let mut prev = 0u16;
        let mut total = 0usize;
        for (number, value) in self.options() {
            let delta = number - prev;
            prev = number;
            total += 1;
            total += ext_len(delta);
            total += ext_len(value.len() as u16);
            total += value.len();
        }
        total
    }
}

fn ext_len(n: u16) -> usize {
    if n <= 12 {
        0
    } else if n < 269 {
        1
    } else {
        2
    }
}

fn write_ext_nibble(out: &mut Vec<u8>, n: u16) -> u8 {
    if n <= 12 {
        n as u8
    } else if n < 269 {
        out.push((n - 13) as u8);
        13
    } else {
        let fix = n - 269;
        out.push((fix >> 8) as u8);
        out.push((fix & 0xFF) as u8);
        14
    }
}

/// Writes a message into a fixed, caller-owned buffer.
///
/// `setup` may be called repeatedly to rewrite the header and options
/// (the block transfer engine does this once per block, to bump the
/// Block option's sequence number) as long as no payload has been
/// committed yet. Once [`OutputBuffer::write_payload`] succeeds the
/// buffer is sealed; call [`OutputBuffer::reset`] to reuse it.
pub struct OutputBuffer<'a> {
    buf: &'a mut [u8],
    header_len: usize,
    total_len: usize,
    sealed: bool,
}

impl<'a> OutputBuffer<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        OutputBuffer {
            buf,
            header_len: 0,
            total_len: 0,
            sealed: false,
        }
    }

    pub fn is_reset(&self) -> bool {
        self.header_len == 0 && self.total_len == 0 && !self.sealed
    }

    pub fn reset(&mut self) {
        self.header_len = 0;
        self.total_len = 0;
        self.sealed = false;
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Writes the header, token and options for `info`. Fails with
    /// [`MessageError::BufferTooSmall`] rather than partially writing.
    pub fn setup(&mut self, info: &MsgInfo) -> Result<(), MessageError> {
        if self.sealed {
            return Err(MessageError::InvalidPacketLength);
        }
        let tkl = info.token.as_slice().len();
        if tkl > MAX_TOKEN_LENGTH {
            return Err(MessageError::InvalidTokenLength);
        }

        let mut header = Header::new();
        header.set_version(1);
        header.set_type(info.msg_type);
        header.set_token_length(tkl as u8);
        header.code = info.code;
        header.message_id = info.msg_id;

        let options_bytes = encode_options(info)?;
        let needed = 4 + tkl + options_bytes.len();
        if needed > self.buf.len() {
            return Err(MessageError::BufferTooSmall);
        }

        let raw = header.to_raw();
        let mut head: Vec<u8> = Vec::with_capacity(4);
        raw.serialize_into(&mut head)?;
        self.buf[..4].copy_from_slice(&head);
        self.buf[4..4 + tkl].copy_from_slice(info.token.as_slice());
        self.buf[4 + tkl..needed].copy_from_slice(&options_bytes);

        self.header_len = needed;
        self.total_len = needed;
        Ok(())
    }

    /// Appends the `0xFF` marker and `payload`, sealing the buffer.
    /// A call with an empty payload writes no marker at all.
    pub fn write_payload(&mut self, payload: &[u8]) -> Result<(), MessageError> {
        if self.header_len == 0 {
            return Err(MessageError::InvalidPacketLength);
        }
        if payload.is_empty() {
            self.sealed = true;
            return Ok(());
        }
        let needed = self.header_len + 1 + payload.len();
        if needed > self.buf.len() {
            return Err(MessageError::BufferTooSmall);
        }
        self.buf[self.header_len] = PAYLOAD_MARKER;
        self.buf[self.header_len + 1..needed].copy_from_slice(payload);
        self.total_len = needed;
        self.sealed = true;
        Ok(())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.total_len]
    }
}

fn encode_options(info: &MsgInfo) -> Result<Vec<u8>, MessageError> {
    let mut out = Vec::with_capacity(info.encoded_options_len());
    let mut prev = 0u16;
    for (number, value) in info.options() {
        if number < prev {
            return Err(MessageError::OptionsOutOfOrder);
        }
        let delta = number - prev;
        prev = number;

        let mut ext = Vec::new();
        let delta_nibble = write_ext_nibble(&mut ext, delta);
        let length_nibble = write_ext_nibble(&mut ext, value.len() as u16);
        out.push((delta_nibble << 4) | length_nibble);
        out.extend_from_slice(&ext);
        out.extend_from_slice(value);
    }
    Ok(out)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::header::RequestType;
    use crate::msg::Msg;

    #[test]
    fn round_trips_through_msg_parse() {
        let token = Token::new(&[0xAB, 0xCD]).unwrap();
        let mut info = MsgInfo::new(
            MessageType::Confirmable,
            MessageClass::Request(RequestType::Get),
            42,
            token,
        );
        info.add_option(11, b"sensors".to_vec());
        info.add_option(11, b"temp".to_vec());

        let mut buf = [0u8; 64];
        let mut out = OutputBuffer::new(&mut buf);
        out.setup(&info).unwrap();
        out.write_payload(b"22.5").unwrap();

        let bytes = out.as_bytes().to_vec();
        let msg = Msg::parse(&bytes).unwrap();
        assert_eq!(msg.id(), 42);
        assert_eq!(msg.token(), &[0xAB, 0xCD]);
        assert_eq!(msg.payload(), b"22.5");
        let opts: Vec<_> = msg.options().collect();
        assert_eq!(opts.len(), 2);
        assert_eq!(opts[0].value, b"sensors");
        assert_eq!(opts[1].value, b"temp");
    }

    #[test]
    fn setup_rewritable_until_payload_written() {
        let token = Token::empty();
        let mut info = MsgInfo::new(
            MessageType::Confirmable,
            MessageClass::Request(RequestType::Get),
            1,
            token,
        );
        let mut buf = [0u8; 32];
        let mut out = OutputBuffer::new(&mut buf);
        out.setup(&info).unwrap();
        info.set_option(11, vec![0x12]); // a single-byte Uri-Path segment
        out.setup(&info).unwrap();
        out.write_payload(&[]).unwrap();
        assert_eq!(out.as_bytes().len(), 4 + 2); // header + one-byte option
    }

    #[test]
    fn buffer_too_small_is_reported() {
        let token = Token::empty();
        let info = MsgInfo::new(
            MessageType::Confirmable,
            MessageClass::Request(RequestType::Get),
            1,
            token,
        );
        let mut buf = [0u8; 2];
        let mut out = OutputBuffer::new(&mut buf);
        assert_eq!(
            out.setup(&info).unwrap_err(),
            MessageError::BufferTooSmall
        );
    }
}
