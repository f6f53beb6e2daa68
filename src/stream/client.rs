//! The client side of one request/response exchange (§4.8).
//!
//! Grounded on `stream/client_internal.c`: `coap_client_state_t`'s five
//! states become [`ClientState`], `check_response`'s three-way dispatch
//! becomes [`CheckOutcome`], and `send_confirmable_with_retry`'s
//! do-while loop becomes the loop in
//! [`ClientSubStream::send_confirmable`].

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::error::{SocketError, StreamError};
use crate::id_source::Rng;
use crate::msg::{Identity, Msg};
use crate::socket::{DatagramSocket, SocketWrapper};
use crate::tx_params::{RetryState, TransmissionParams, SEPARATE_RESPONSE_TIMEOUT_MS};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Reset,
    HasRequestHeader,
    RequestSent,
    HasSeparateAck,
    HasResponseContent,
}

enum CheckOutcome {
    /// A piggybacked response, or the confirmable separate response
    /// itself: this exchange is done.
    Accepted,
    /// An empty ACK: the response will follow separately.
    SeparateAckReceived,
    /// Not a message for this exchange; keep waiting.
    Ignore,
}

/// Tracks one client-initiated request/response exchange.
pub struct ClientSubStream {
    state: ClientState,
    request_identity: Option<Identity>,
}

impl Default for ClientSubStream {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientSubStream {
    pub fn new() -> Self {
        ClientSubStream {
            state: ClientState::Reset,
            request_identity: None,
        }
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn reset(&mut self) {
        self.state = ClientState::Reset;
        self.request_identity = None;
    }

    pub fn request_identity(&self) -> Option<Identity> {
        self.request_identity
    }

    /// Marks the exchange as settled without going through
    /// [`ClientSubStream::send_confirmable`], for a request that was
    /// instead driven block-by-block by [`crate::block_transfer`].
    pub fn mark_response_received(&mut self) {
        self.state = ClientState::HasResponseContent;
    }

    /// Records the identity a new request will be sent with.
    pub fn setup_request(&mut self, identity: Identity) {
        self.request_identity = Some(identity);
        self.state = ClientState::HasRequestHeader;
    }

    /// Sends `request_bytes` (already carrying the identity passed to
    /// [`ClientSubStream::setup_request`]) as a Confirmable request,
    /// retrying per `tx_params`, and returns the length of the accepted
    /// response written into `recv_buf`.
    pub fn send_confirmable<S: DatagramSocket>(
        &mut self,
        socket: &mut SocketWrapper<S>,
        remote: SocketAddr,
        tx_params: &TransmissionParams,
        rng: &mut dyn Rng,
        request_bytes: &[u8],
        recv_buf: &mut [u8],
    ) -> Result<usize, StreamError> {
        let identity = self
            .request_identity
            .ok_or(StreamError::UnexpectedState)?;
        self.state = ClientState::RequestSent;

        let mut retry_state = RetryState::initial(tx_params, rng);
        loop {
            socket.send(request_bytes, remote)?;
            let wait = Duration::from_millis(retry_state.recv_timeout_ms as u64);

            match socket.recv(recv_buf, wait) {
                Ok((n, _from)) => match self.check_response(&recv_buf[..n], &identity)? {
                    CheckOutcome::Accepted => {
                        self.state = ClientState::HasResponseContent;
                        return Ok(n);
                    }
                    CheckOutcome::SeparateAckReceived => {
                        self.state = ClientState::HasSeparateAck;
                        return self.await_separate_response(socket, remote, &identity, recv_buf);
                    }
                    CheckOutcome::Ignore => continue,
                },
                Err(SocketError::Duplicate) => continue,
                Err(SocketError::Timeout) => {
                    if retry_state.can_retry(tx_params) {
                        coap_trace!("request {} timed out, retrying", identity.msg_id);
                        retry_state = retry_state.advance(tx_params, rng);
                        continue;
                    }
                    coap_error!("request {} gave up after exhausting retries", identity.msg_id);
                    self.state = ClientState::Reset;
                    return Err(StreamError::Socket(SocketError::Timeout));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Sends `request_bytes` as Non-confirmable: no retry, no
    /// acknowledgement expected.
    pub fn send_non_confirmable<S: DatagramSocket>(
        &mut self,
        socket: &mut SocketWrapper<S>,
        remote: SocketAddr,
        request_bytes: &[u8],
    ) -> Result<(), StreamError> {
        self.state = ClientState::RequestSent;
        socket.send(request_bytes, remote)?;
        Ok(())
    }

    fn check_response(&self, bytes: &[u8], identity: &Identity) -> Result<CheckOutcome, StreamError> {
        use crate::header::MessageClass;
        use crate::header::MessageType::*;

        let msg = Msg::parse(bytes)?;
        match msg.msg_type() {
            Reset => {
                if msg.id() == identity.msg_id {
                    coap_debug!("peer reset request {}", identity.msg_id);
                    Err(StreamError::ReceivedReset)
                } else {
                    Ok(CheckOutcome::Ignore)
                }
            }
            Acknowledgement => {
                if msg.id() != identity.msg_id {
                    return Ok(CheckOutcome::Ignore);
                }
                if matches!(msg.code(), MessageClass::Empty) {
                    Ok(CheckOutcome::SeparateAckReceived)
                } else {
                    Ok(CheckOutcome::Accepted)
                }
            }
            Confirmable if !msg.is_request() => {
                if msg.token() == identity.token.as_slice() {
                    Ok(CheckOutcome::Accepted)
                } else {
                    Ok(CheckOutcome::Ignore)
                }
            }
            _ => Ok(CheckOutcome::Ignore),
        }
    }

    /// After an empty ACK, waits up to `SEPARATE_RESPONSE_TIMEOUT_MS`
    /// for the separate Confirmable response carrying the same token.
    fn await_separate_response<S: DatagramSocket>(
        &mut self,
        socket: &mut SocketWrapper<S>,
        _remote: SocketAddr,
        identity: &Identity,
        recv_buf: &mut [u8],
    ) -> Result<usize, StreamError> {
        let deadline = Instant::now() + Duration::from_millis(SEPARATE_RESPONSE_TIMEOUT_MS as u64);
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                self.state = ClientState::Reset;
                return Err(StreamError::Socket(SocketError::Timeout));
            }
            match socket.recv(recv_buf, remaining) {
                Ok((n, from)) => {
                    let msg = Msg::parse(&recv_buf[..n])?;
                    if msg.token() == identity.token.as_slice() {
                        if msg.msg_type() == crate::header::MessageType::Confirmable {
                            send_empty_ack(socket, from, msg.id())?;
                        }
                        self.state = ClientState::HasResponseContent;
                        return Ok(n);
                    }
                }
                Err(SocketError::Duplicate) => continue,
                Err(SocketError::Timeout) => {
                    self.state = ClientState::Reset;
                    return Err(StreamError::Socket(SocketError::Timeout));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Acknowledges a Confirmable Separate Response (§4.8): an empty ACK
/// correlated only by message ID, matching `handle_matching_response`'s
/// `avs_coap_ctx_send_empty(..., AVS_COAP_MSG_ACKNOWLEDGEMENT, ...)` call
/// in the original.
fn send_empty_ack<S: DatagramSocket>(
    socket: &mut SocketWrapper<S>,
    remote: SocketAddr,
    msg_id: u16,
) -> Result<(), StreamError> {
    let bytes = [0x60, 0x00, (msg_id >> 8) as u8, msg_id as u8];
    socket.send(&bytes, remote)?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::msg::Token;

    #[test]
    fn starts_in_reset_state() {
        let sub = ClientSubStream::new();
        assert_eq!(sub.state(), ClientState::Reset);
    }

    #[test]
    fn setup_request_transitions_to_has_request_header() {
        let mut sub = ClientSubStream::new();
        let identity = Identity {
            msg_id: 1,
            token: Token::new(&[1]).unwrap(),
        };
        sub.setup_request(identity);
        assert_eq!(sub.state(), ClientState::HasRequestHeader);
    }

    #[test]
    fn reset_clears_recorded_identity() {
        let mut sub = ClientSubStream::new();
        sub.setup_request(Identity {
            msg_id: 1,
            token: Token::empty(),
        });
        sub.reset();
        assert_eq!(sub.state(), ClientState::Reset);
        assert!(sub.request_identity.is_none());
    }
}
