//! The server side of one request/response exchange (§4.9).
//!
//! Grounded on `stream/server_internal.c`: `coap_server_state_t`
//! becomes [`ServerState`], `process_initial_request`'s validation
//! becomes [`ServerSubStream::process_initial_request`], and the
//! byte-for-byte critical-option comparison across blocks of one
//! Block1 upload becomes [`ServerSubStream::validate_block_continuation`].

use crate::error::{BlockError, StreamError};
use crate::msg::{Identity, Msg};
use crate::option_numbers::{BLOCK1, BLOCK2};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Reset,
    HasRequest,
    HasBlock1Request,
    HasBlock2Request,
    NeedsNextBlock,
}

/// Rejection reason for [`ServerSubStream::process_initial_request`],
/// distinct from a transport-level [`StreamError`] because it always
/// maps to a specific response code rather than silence/Reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitialRequestError {
    /// Both Block1 and Block2 present: LwM2M has no operation that
    /// needs bidirectional block transfer, so CoAP's allowance for it
    /// is refused outright (4.02 Bad Option).
    BothBlockDirectionsPresent,
    /// A Block1 (or Block2) transfer must start at block 0.
    DoesNotStartAtZero,
    /// The Block option's size exponent was the reserved value 7
    /// (on-wire size 2048); RFC 7959 §2.2 requires a 4.00 Bad Request.
    ReservedBlockSize,
}

/// Outcome of [`ServerSubStream::validate_block_continuation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockContinuationOutcome {
    /// The block continues the transfer; its payload should be appended.
    Accepted,
    /// An exact retransmission of the block already applied; re-send
    /// the last 2.31 Continue without re-applying its payload.
    Duplicate,
    /// A critical option changed since block 0. Per §4.9/§7 this replies
    /// 5.03 Service Unavailable and re-enters the wait loop rather than
    /// aborting the transfer, since another client may share the port.
    CriticalOptionMismatch,
}

/// Tracks one server-initiated response to a single client request,
/// across as many blocks as the request or response need.
pub struct ServerSubStream {
    state: ServerState,
    request_identity: Option<Identity>,
    /// Snapshot of every critical option (other than Block1) from the
    /// first block of a Block1 upload, to be byte-compared against
    /// every subsequent block (`block_store_critical_options` /
    /// `block_validate_critical_options` in the original).
    expected_critical_options: Vec<(u16, Vec<u8>)>,
    expected_block_offset: u64,
}

impl Default for ServerSubStream {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerSubStream {
    pub fn new() -> Self {
        ServerSubStream {
            state: ServerState::Reset,
            request_identity: None,
            expected_critical_options: Vec::new(),
            expected_block_offset: 0,
        }
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    pub fn reset(&mut self) {
        self.state = ServerState::Reset;
        self.request_identity = None;
        self.expected_critical_options.clear();
        self.expected_block_offset = 0;
    }

    /// Validates the first message of a new request, per
    /// `process_initial_request`: rejects a request carrying both
    /// Block1 and Block2 (LwM2M never needs bidirectional block
    /// transfer), and rejects a Block1/Block2 option whose initial
    /// `seq_num` is nonzero.
    pub fn process_initial_request(&mut self, msg: &Msg) -> Result<(), InitialRequestError> {
        let block1 = msg.find_unique_opt(BLOCK1).ok().flatten();
        let block2 = msg.find_unique_opt(BLOCK2).ok().flatten();

        if block1.is_some() && block2.is_some() {
            return Err(InitialRequestError::BothBlockDirectionsPresent);
        }

        self.request_identity = Some(msg.identity());

        if let Some(opt) = block1 {
            let block = opt.as_block().map_err(map_block_decode_error)?;
            if block.seq_num != 0 {
                return Err(InitialRequestError::DoesNotStartAtZero);
            }
            self.store_critical_options(msg, BLOCK1);
            self.expected_block_offset = block.size() as u64;
            self.state = ServerState::HasBlock1Request;
        } else if let Some(opt) = block2 {
            let block = opt.as_block().map_err(map_block_decode_error)?;
            if block.seq_num != 0 {
                return Err(InitialRequestError::DoesNotStartAtZero);
            }
            self.state = ServerState::HasBlock2Request;
        } else {
            self.state = ServerState::HasRequest;
        }
        Ok(())
    }

    fn store_critical_options(&mut self, msg: &Msg, excluding: u16) {
        self.expected_critical_options.clear();
        for opt in msg.options() {
            if opt.number % 2 == 1 && opt.number != excluding {
                self.expected_critical_options
                    .push((opt.number, opt.value.to_vec()));
            }
        }
    }

    /// Compares the next Block1 fragment's critical options against the
    /// ones captured from block 0, and checks the block's offset
    /// continues where the last one left off.
    pub fn validate_block_continuation(
        &mut self,
        msg: &Msg,
    ) -> Result<BlockContinuationOutcome, StreamError> {
        let opt = msg
            .find_unique_opt(BLOCK1)
            .map_err(StreamError::Codec)?
            .ok_or(StreamError::UnexpectedState)?;
        let block = opt.as_block().map_err(|e| StreamError::Block(e.into()))?;

        let mut seen = Vec::new();
        for o in msg.options() {
            if o.number % 2 == 1 && o.number != BLOCK1 {
                seen.push((o.number, o.value.to_vec()));
            }
        }
        if seen != self.expected_critical_options {
            // Another client sharing this port may legitimately be
            // interleaving requests; reply 5.03 and keep waiting rather
            // than aborting this transfer (§4.9, §7).
            coap_debug!("Block1 continuation changed a critical option mid-transfer, msg_id={}", msg.id());
            return Ok(BlockContinuationOutcome::CriticalOptionMismatch);
        }

        let offset = block.offset();
        if offset == self.expected_block_offset.saturating_sub(block.size() as u64) {
            coap_trace!("Block1 continuation at offset {} is a duplicate", offset);
            return Ok(BlockContinuationOutcome::Duplicate);
        }
        if offset != self.expected_block_offset {
            coap_debug!(
                "Block1 continuation offset {} does not match expected {}",
                offset,
                self.expected_block_offset
            );
            return Err(StreamError::UnexpectedState);
        }
        self.expected_block_offset += block.size() as u64;
        if block.has_more {
            self.state = ServerState::NeedsNextBlock;
        }
        Ok(BlockContinuationOutcome::Accepted)
    }

    pub fn request_identity(&self) -> Option<Identity> {
        self.request_identity
    }
}

/// Distinguishes a reserved Block size exponent (RFC 7959 §2.2's "must
/// be rejected with 4.00 Bad Request") from any other malformed Block
/// encoding, which this engine treats the same as a block not starting
/// at zero (4.08 Request Entity Incomplete).
fn map_block_decode_error(e: BlockError) -> InitialRequestError {
    match e {
        BlockError::ReservedSizeExponent => InitialRequestError::ReservedBlockSize,
        _ => InitialRequestError::DoesNotStartAtZero,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::block::BlockValue;
    use crate::header::{MessageClass, MessageType, RequestType};
    use crate::msg::Token;
    use crate::msg_builder::{MsgInfo, OutputBuffer};

    fn get_with_block1(seq_num: u32, has_more: bool) -> Vec<u8> {
        let mut info = MsgInfo::new(
            MessageType::Confirmable,
            MessageClass::Request(RequestType::Put),
            1,
            Token::empty(),
        );
        let block = BlockValue::new(seq_num, has_more, 0).unwrap();
        info.add_option(BLOCK1, block.encode());
        let mut buf = [0u8; 32];
        let mut out = OutputBuffer::new(&mut buf);
        out.setup(&info).unwrap();
        out.write_payload(b"x").unwrap();
        out.as_bytes().to_vec()
    }

    #[test]
    fn accepts_block1_starting_at_zero() {
        let bytes = get_with_block1(0, true);
        let msg = Msg::parse(&bytes).unwrap();
        let mut sub = ServerSubStream::new();
        sub.process_initial_request(&msg).unwrap();
        assert_eq!(sub.state(), ServerState::HasBlock1Request);
    }

    #[test]
    fn rejects_block1_not_starting_at_zero() {
        let bytes = get_with_block1(1, true);
        let msg = Msg::parse(&bytes).unwrap();
        let mut sub = ServerSubStream::new();
        assert_eq!(
            sub.process_initial_request(&msg).unwrap_err(),
            InitialRequestError::DoesNotStartAtZero
        );
    }

    #[test]
    fn rejects_reserved_block1_size_exponent_with_bad_request() {
        // seq_num=0, has_more=0, size_exponent=7 (reserved, on-wire size
        // 2048): can't go through `BlockValue::new` since it already
        // rejects this, so the raw option byte is crafted by hand.
        let mut info = MsgInfo::new(
            MessageType::Confirmable,
            MessageClass::Request(RequestType::Put),
            1,
            Token::empty(),
        );
        info.add_option(BLOCK1, vec![0x07]);
        let mut buf = [0u8; 32];
        let mut out = OutputBuffer::new(&mut buf);
        out.setup(&info).unwrap();
        out.write_payload(b"x").unwrap();
        let msg = Msg::parse(out.as_bytes()).unwrap();

        let mut sub = ServerSubStream::new();
        assert_eq!(
            sub.process_initial_request(&msg).unwrap_err(),
            InitialRequestError::ReservedBlockSize
        );
    }

    #[test]
    fn plain_request_has_no_block_state() {
        let mut info = MsgInfo::new(
            MessageType::Confirmable,
            MessageClass::Request(RequestType::Get),
            1,
            Token::empty(),
        );
        info.add_option(11, b"x".to_vec());
        let mut buf = [0u8; 32];
        let mut out = OutputBuffer::new(&mut buf);
        out.setup(&info).unwrap();
        out.write_payload(&[]).unwrap();
        let bytes = out.as_bytes().to_vec();
        let msg = Msg::parse(&bytes).unwrap();

        let mut sub = ServerSubStream::new();
        sub.process_initial_request(&msg).unwrap();
        assert_eq!(sub.state(), ServerState::HasRequest);
    }
}
