//! The block-wise transfer engine: proposes a block size, then drives
//! the per-block confirmable send/retry loop for Block1 (uploads) and
//! Block2 (downloads) (§4.7). Grounded on `block/transfer.c`,
//! `block/request.c` (client-side Block1 receive handler) and
//! `block/response.c` (server-side Block2 receive handler).
//!
//! Needs `std` for the socket and timeouts it drives, so it sits behind
//! the `std` feature along with [`crate::socket`] and [`crate::cache`].

use std::net::SocketAddr;
use std::time::Duration;

use crate::block::{largest_fitting_block_size, BlockValue};
use crate::block_builder::BlockBuilder;
use crate::error::{BlockError, BlockTransferError, SocketError};
use crate::header::MessageType;
use crate::id_source::{IdSource, Rng};
use crate::msg::{Identity, Msg};
use crate::msg_builder::{MsgInfo, OutputBuffer};
use crate::option_numbers::{BLOCK1, BLOCK2};
use crate::socket::{DatagramSocket, SocketWrapper};
use crate::tx_params::{RetryState, TransmissionParams};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockDirection {
    Block1,
    Block2,
}

impl BlockDirection {
    pub fn option_number(self) -> u16 {
        match self {
            BlockDirection::Block1 => BLOCK1,
            BlockDirection::Block2 => BLOCK2,
        }
    }
}

/// Picks the largest block size that fits both `mtu_payload_capacity`
/// (`None` if there is no hard MTU, e.g. a stream transport) and the
/// caller's output buffer, reserving one byte of the buffer so the last
/// block of a transfer is never forced out early (`buffer_size_enforced_
/// payload_capacity` in the original).
pub fn calculate_proposed_block_size(
    mtu_payload_capacity: Option<usize>,
    buffer_capacity: usize,
) -> Result<u16, BlockError> {
    let buffer_cap = buffer_capacity.saturating_sub(1);
    let capacity = match mtu_payload_capacity {
        Some(mtu) => mtu.min(buffer_cap),
        None => buffer_cap,
    };
    largest_fitting_block_size(capacity).ok_or(BlockError::MtuTooSmall)
}

/// What to do next after inspecting the peer's reply to a just-sent
/// block (`block_recv_handler_t`'s return value in the original, minus
/// the error path which is a plain `Err` here).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockRecvOutcome {
    /// The reply settles this block; advance to the next one.
    Accept,
    /// Re-send the current block unchanged (or, for the server, the
    /// peer's message was a duplicate of the request already answered).
    Retry,
}

/// Inspects the message received in reply to a just-sent block and
/// decides how the transfer should proceed. Direction-specific (client
/// Block1 vs. server Block2): the two concrete implementations below
/// replace the original's `block_recv_handler_t` callback plus its
/// `void *` argument with a trait object carrying its own typed state.
pub trait BlockRecvHandler {
    fn handle(
        &mut self,
        msg: &Msg,
        id_source: &mut dyn IdSource,
        seq_num: &mut u32,
        block_size: &mut u16,
        num_sent_blocks: u32,
    ) -> Result<BlockRecvOutcome, BlockTransferError>;
}

/// Client-side receive handler for a Block1 (upload) transfer, grounded
/// on `block/request.c`'s `block_recv_handler`.
pub struct ClientBlockRecvHandler;

impl BlockRecvHandler for ClientBlockRecvHandler {
    fn handle(
        &mut self,
        msg: &Msg,
        _id_source: &mut dyn IdSource,
        seq_num: &mut u32,
        block_size: &mut u16,
        _num_sent_blocks: u32,
    ) -> Result<BlockRecvOutcome, BlockTransferError> {
        if msg.msg_type() == MessageType::Reset {
            coap_debug!("Block1 transfer reset by peer, msg_id={}", msg.id());
            return Err(BlockTransferError::Reset);
        }
        if !msg.code().is_response() {
            return Err(BlockTransferError::Aborted("peer's message is not a response"));
        }
        let class_digit = msg.code().class_digit();
        if class_digit == 4 || class_digit == 5 {
            coap_debug!("Block1 transfer aborted: peer returned {}.xx response", class_digit);
            return Err(BlockTransferError::Aborted("peer rejected the block with an error response"));
        }

        if msg.find_unique_opt(BLOCK2)?.is_some() {
            return Err(BlockTransferError::Aborted(
                "response carries Block2: mixed block-wise exchanges are unsupported",
            ));
        }
        let opt = msg
            .find_unique_opt(BLOCK1)?
            .ok_or(BlockTransferError::Aborted("response is missing the Block1 option"))?;
        let peer_block = opt.as_block()?;

        if peer_block.seq_num != *seq_num {
            return Err(BlockTransferError::Aborted("Block1 seq_num in response does not match the request"));
        }

        let peer_size = peer_block.size();
        if peer_size == *block_size {
            *seq_num += 1;
        } else if peer_size < *block_size {
            if *seq_num != 0 {
                return Err(BlockTransferError::Aborted(
                    "peer changed the Block1 size after the transfer had already started",
                ));
            }
            let ratio = (*block_size / peer_size) as u32;
            *seq_num = (*seq_num + 1) * ratio;
            *block_size = peer_size;
        } else {
            return Err(BlockTransferError::Aborted("peer proposed a larger Block1 size than offered"));
        }

        Ok(BlockRecvOutcome::Accept)
    }
}

/// Server-side receive handler for a Block2 (download) transfer,
/// grounded on `block/response.c`'s `block_recv_handler`.
///
/// Every continuation request the client sends shares the original
/// request's message-id/token only by coincidence of retransmission;
/// what identifies a *duplicate* of the most recently answered request
/// is that its identity exactly matches the identity the server last
/// echoed back. A genuinely new continuation carries a new identity and
/// an incremented (or, for a size renegotiation, still-zero) seq_num.
pub struct ServerBlockRecvHandler {
    last_request_identity: Identity,
    validator: Option<Box<dyn FnMut(&Msg) -> bool>>,
}

impl ServerBlockRecvHandler {
    pub fn new(initial_request_identity: Identity) -> Self {
        ServerBlockRecvHandler {
            last_request_identity: initial_request_identity,
            validator: None,
        }
    }

    /// Installs a callback that must accept a continuation request
    /// before it is otherwise validated, e.g. to confirm it still
    /// targets the same resource/observation as the first block (§4.10).
    pub fn with_validator(
        initial_request_identity: Identity,
        validator: Box<dyn FnMut(&Msg) -> bool>,
    ) -> Self {
        ServerBlockRecvHandler {
            last_request_identity: initial_request_identity,
            validator: Some(validator),
        }
    }
}

impl BlockRecvHandler for ServerBlockRecvHandler {
    fn handle(
        &mut self,
        msg: &Msg,
        id_source: &mut dyn IdSource,
        seq_num: &mut u32,
        block_size: &mut u16,
        num_sent_blocks: u32,
    ) -> Result<BlockRecvOutcome, BlockTransferError> {
        if msg.msg_type() == MessageType::Reset {
            coap_debug!("Block2 transfer reset by peer, msg_id={}", msg.id());
            return Err(BlockTransferError::Reset);
        }
        if !msg.is_request() {
            return Err(BlockTransferError::Aborted("expected a continuation request"));
        }

        let incoming_identity = msg.identity();
        if incoming_identity == self.last_request_identity {
            coap_trace!("Block2 continuation request is a duplicate, msg_id={}", msg.id());
            return Ok(BlockRecvOutcome::Retry);
        }

        if let Some(validator) = &mut self.validator {
            if !validator(msg) {
                return Err(BlockTransferError::Aborted(
                    "continuation request failed the installed validator",
                ));
            }
        }

        if msg.find_unique_opt(BLOCK1)?.is_some() {
            return Err(BlockTransferError::Aborted(
                "request carries Block1: mixed block-wise exchanges are unsupported",
            ));
        }
        let opt = msg
            .find_unique_opt(BLOCK2)?
            .ok_or(BlockTransferError::Aborted("continuation request is missing the Block2 option"))?;
        let peer_block = opt.as_block()?;

        let peer_size = peer_block.size();
        if peer_size > *block_size {
            return Err(BlockTransferError::Aborted("client requested a larger Block2 size than offered"));
        } else if peer_size < *block_size {
            if peer_block.seq_num != 0 || num_sent_blocks != 0 {
                return Err(BlockTransferError::Aborted(
                    "client changed the Block2 size after the transfer had already started",
                ));
            }
            *block_size = peer_size;
        }

        if peer_block.seq_num < *seq_num || peer_block.seq_num > *seq_num + 1 {
            return Err(BlockTransferError::Aborted("non-consecutive Block2 seq_num"));
        }

        self.last_request_identity = incoming_identity;
        id_source.reset(incoming_identity);

        if peer_block.seq_num == *seq_num {
            return Ok(BlockRecvOutcome::Retry);
        }
        *seq_num = peer_block.seq_num;
        Ok(BlockRecvOutcome::Accept)
    }
}

/// Drives one direction (Block1 or Block2) of a single block-wise
/// transfer: buffers outgoing payload, and sends/retries one block at a
/// time.
pub struct BlockTransferCtx<'a, S: DatagramSocket> {
    socket: &'a mut SocketWrapper<S>,
    remote: SocketAddr,
    tx_params: TransmissionParams,
    direction: BlockDirection,
    block_size: u16,
    builder: BlockBuilder,
    seq_num: u32,
    num_sent_blocks: u32,
    timed_out: bool,
    handler: Box<dyn BlockRecvHandler + 'a>,
    /// Pre-populated with message type, code and any application options
    /// that stay the same across every block of this transfer; only the
    /// Block option, message ID and token change block to block.
    template: MsgInfo,
    /// Bytes of the most recent reply accepted by the handler. On a
    /// Block1 upload this is overwritten on every block; once the final
    /// block (`has_more = false`) is accepted, it holds the real
    /// application response rather than a 2.31 Continue, and the caller
    /// retrieves it with [`take_last_reply`].
    last_reply: Option<Vec<u8>>,
}

impl<'a, S: DatagramSocket> BlockTransferCtx<'a, S> {
    pub fn new(
        socket: &'a mut SocketWrapper<S>,
        remote: SocketAddr,
        tx_params: TransmissionParams,
        direction: BlockDirection,
        block_size: u16,
        template: MsgInfo,
        handler: Box<dyn BlockRecvHandler + 'a>,
    ) -> Self {
        BlockTransferCtx {
            socket,
            remote,
            tx_params,
            direction,
            block_size,
            builder: BlockBuilder::new(block_size),
            seq_num: 0,
            num_sent_blocks: 0,
            timed_out: false,
            handler,
            template,
            last_reply: None,
        }
    }

    pub fn num_sent_blocks(&self) -> u32 {
        self.num_sent_blocks
    }

    pub fn block_size(&self) -> u16 {
        self.block_size
    }

    /// Takes the bytes of the last reply the handler accepted, if any.
    pub fn take_last_reply(&mut self) -> Option<Vec<u8>> {
        self.last_reply.take()
    }

    /// A Block1 exchange always waits for the ack/response of every
    /// block including the last; a Block2 exchange only waits while
    /// more blocks remain to be requested (§4.7).
    fn should_wait_for_response(&self, has_more: bool) -> bool {
        has_more || self.direction == BlockDirection::Block1
    }

    /// Appends `data` to the staging buffer and flushes every full
    /// intermediate block (strictly more than one block's worth
    /// staged), so the in-flight buffer never grows past one block plus
    /// whatever was just appended.
    pub fn write(
        &mut self,
        id_source: &mut dyn IdSource,
        rng: &mut dyn Rng,
        data: &[u8],
        recv_buf: &mut [u8],
    ) -> Result<(), BlockTransferError> {
        self.builder.append(data);
        while self.builder.has_full_intermediate_block() && !self.timed_out {
            let block = self.builder.take_block();
            self.send_block(id_source, rng, &block, true, recv_buf)?;
        }
        Ok(())
    }

    /// Flushes whatever remains staged as the final block
    /// (`has_more = false`), unless the transfer already timed out.
    pub fn finish(
        &mut self,
        id_source: &mut dyn IdSource,
        rng: &mut dyn Rng,
        recv_buf: &mut [u8],
    ) -> Result<(), BlockTransferError> {
        if self.timed_out {
            return Err(BlockTransferError::Timeout);
        }
        while self.builder.has_full_intermediate_block() {
            let block = self.builder.take_block();
            self.send_block(id_source, rng, &block, true, recv_buf)?;
        }
        let last = self.builder.take_block();
        self.send_block(id_source, rng, &last, false, recv_buf)?;
        Ok(())
    }

    /// Sends one block, waits for the peer's reply if one is expected,
    /// and lets the direction-specific [`BlockRecvHandler`] decide
    /// whether to advance or re-send. Confirmable retry (binary backoff,
    /// `max_retransmit` cap) wraps the whole thing, mirroring
    /// `send_block_msg` in the original.
    fn send_block(
        &mut self,
        id_source: &mut dyn IdSource,
        rng: &mut dyn Rng,
        payload: &[u8],
        has_more: bool,
        recv_buf: &mut [u8],
    ) -> Result<(), BlockTransferError> {
        loop {
            let identity = id_source.next_identity();
            let block = BlockValue::with_size(self.seq_num, has_more, self.block_size)?;
            self.template.msg_id = identity.msg_id;
            self.template.token = identity.token;
            self.template
                .set_option(self.direction.option_number(), block.encode());

            let mut out = vec![0u8; self.block_size as usize + 64];
            let bytes = {
                let mut buf = OutputBuffer::new(&mut out);
                buf.setup(&self.template)?;
                buf.write_payload(payload)?;
                buf.as_bytes().to_vec()
            };
            self.socket.send(&bytes, self.remote)?;

            if !self.should_wait_for_response(has_more) {
                self.seq_num += 1;
                self.num_sent_blocks += 1;
                return Ok(());
            }

            let mut retry_state = RetryState::initial(&self.tx_params, rng);
            let outcome = loop {
                let wait = Duration::from_millis(retry_state.recv_timeout_ms as u64);
                match self.socket.recv(recv_buf, wait) {
                    Ok((n, _)) => {
                        let msg = Msg::parse(&recv_buf[..n])?;
                        let reply_bytes = recv_buf[..n].to_vec();
                        let outcome = self.handler.handle(
                            &msg,
                            id_source,
                            &mut self.seq_num,
                            &mut self.block_size,
                            self.num_sent_blocks,
                        )?;
                        if outcome == BlockRecvOutcome::Accept {
                            self.last_reply = Some(reply_bytes);
                        }
                        break outcome;
                    }
                    Err(SocketError::Duplicate) => continue,
                    Err(SocketError::Timeout) => {
                        if retry_state.can_retry(&self.tx_params) {
                            coap_trace!(
                                "block {} (direction {:?}) timed out, retrying",
                                self.seq_num,
                                self.direction
                            );
                            retry_state = retry_state.advance(&self.tx_params, rng);
                            continue;
                        }
                        coap_error!(
                            "block transfer gave up on block {} after exhausting retries",
                            self.seq_num
                        );
                        self.timed_out = true;
                        return Err(BlockTransferError::Timeout);
                    }
                    Err(e) => return Err(e.into()),
                }
            };

            match outcome {
                BlockRecvOutcome::Accept => {
                    self.builder.set_block_size(self.block_size);
                    self.num_sent_blocks += 1;
                    return Ok(());
                }
                // The handler may have renegotiated `block_size` even on
                // a Retry (e.g. the client's first re-request at a
                // smaller size for the still-current block); either way
                // the outer loop rebuilds the block from scratch before
                // resending.
                BlockRecvOutcome::Retry => {
                    self.builder.set_block_size(self.block_size);
                    continue;
                }
            }
        }
    }
}
