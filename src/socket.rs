//! A validating, cache-aware wrapper around a datagram transport (§4.6).
//!
//! Grounded on `socket.c`: `send` rejects an invalid outgoing message
//! before handing it to the transport and, for responses, opportunistically
//! caches a copy; `recv` validates what came back and, for a request that
//! matches a cached response, resends the cached bytes and reports the
//! request as a duplicate rather than letting it reach the caller.
//!
//! Needs `std` for `SocketAddr`/`Duration`, so it sits behind the `std`
//! feature along with [`crate::cache`].

use std::net::SocketAddr;
use std::time::Duration;

use crate::cache::ResponseCache;
use crate::error::SocketError;
use crate::msg::Msg;
use crate::tx_params::TransmissionParams;

/// The transport this engine needs: send a datagram to an address,
/// receive one with a timeout. A thin seam so tests can swap in an
/// in-memory transport instead of a real UDP/DTLS socket.
pub trait DatagramSocket {
    fn send_to(&mut self, buf: &[u8], addr: SocketAddr) -> Result<(), SocketError>;

    /// Returns `Err(SocketError::Timeout)` if nothing arrives within
    /// `timeout`.
    fn recv_from(&mut self, buf: &mut [u8], timeout: Duration) -> Result<(usize, SocketAddr), SocketError>;
}

pub struct SocketWrapper<S> {
    inner: S,
    tx_params: TransmissionParams,
    cache: Option<ResponseCache>,
}

impl<S: DatagramSocket> SocketWrapper<S> {
    pub fn new(inner: S, tx_params: TransmissionParams, cache: Option<ResponseCache>) -> Self {
        SocketWrapper {
            inner,
            tx_params,
            cache,
        }
    }

    pub fn tx_params(&self) -> &TransmissionParams {
        &self.tx_params
    }

    pub fn set_tx_params(&mut self, tx_params: TransmissionParams) {
        self.tx_params = tx_params;
    }

    /// Validates `bytes` as a CoAP message, sends it, and if it is a
    /// response, opportunistically caches it for retransmitted requests.
    pub fn send(&mut self, bytes: &[u8], remote: SocketAddr) -> Result<(), SocketError> {
        let msg = Msg::parse(bytes).map_err(SocketError::MsgMalformed)?;
        let msg_id = msg.id();
        let is_response = msg.code().is_response();

        self.inner.send_to(bytes, remote)?;

        if is_response {
            if let Some(cache) = &mut self.cache {
                // A duplicate send (the handler re-sent the exact same
                // response) is not an error worth surfacing here.
                let _ = cache.add(remote, msg_id, bytes, &self.tx_params);
            }
        }
        Ok(())
    }

    /// Receives one datagram, validating it as a CoAP message. If it is
    /// a request that was already answered and the response is still
    /// cached, resends the cached response and returns
    /// `Err(SocketError::Duplicate)` instead of the new bytes.
    pub fn recv(&mut self, buf: &mut [u8], timeout: Duration) -> Result<(usize, SocketAddr), SocketError> {
        let (n, remote) = self.inner.recv_from(buf, timeout)?;
        let msg = Msg::parse(&buf[..n]).map_err(SocketError::MsgMalformed)?;

        if msg.msg_type() == crate::header::MessageType::Confirmable
            && matches!(msg.code(), crate::header::MessageClass::Empty)
        {
            return Err(SocketError::MsgWasPing);
        }

        if msg.is_request() {
            if let Some(cache) = &mut self.cache {
                if let Some(cached) = cache.get(&remote, msg.id()) {
                    let cached = cached.to_vec();
                    coap_debug!("resending cached response for duplicate request {} from {}", msg.id(), remote);
                    self.inner.send_to(&cached, remote)?;
                    return Err(SocketError::Duplicate);
                }
            }
        }

        Ok((n, remote))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::VecDeque;

    struct LoopbackSocket {
        inbox: VecDeque<(Vec<u8>, SocketAddr)>,
        sent: Vec<(Vec<u8>, SocketAddr)>,
    }

    impl LoopbackSocket {
        fn new() -> Self {
            LoopbackSocket {
                inbox: VecDeque::new(),
                sent: Vec::new(),
            }
        }

        fn deliver(&mut self, bytes: Vec<u8>, from: SocketAddr) {
            self.inbox.push_back((bytes, from));
        }
    }

    impl DatagramSocket for LoopbackSocket {
        fn send_to(&mut self, buf: &[u8], addr: SocketAddr) -> Result<(), SocketError> {
            self.sent.push((buf.to_vec(), addr));
            Ok(())
        }

        fn recv_from(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<(usize, SocketAddr), SocketError> {
            let (bytes, from) = self.inbox.pop_front().ok_or(SocketError::Timeout)?;
            buf[..bytes.len()].copy_from_slice(&bytes);
            Ok((bytes.len(), from))
        }
    }

    fn addr() -> SocketAddr {
        "127.0.0.1:5683".parse().unwrap()
    }

    fn get_request(msg_id: u16) -> Vec<u8> {
        vec![0x40, 0x01, (msg_id >> 8) as u8, msg_id as u8]
    }

    fn content_response(msg_id: u16) -> Vec<u8> {
        vec![0x60, 0x45, (msg_id >> 8) as u8, msg_id as u8]
    }

    #[test]
    fn recv_reports_duplicate_and_resends_cached_response() {
        let mut sock = LoopbackSocket::new();
        sock.deliver(get_request(1), addr());
        let mut wrapper = SocketWrapper::new(
            sock,
            TransmissionParams::default(),
            Some(ResponseCache::new(4096)),
        );

        let mut buf = [0u8; 64];
        let (n, from) = wrapper.recv(&mut buf, Duration::from_secs(1)).unwrap();
        assert_eq!(from, addr());
        wrapper.send(&content_response(1), from).unwrap();

        wrapper.inner.deliver(get_request(1), addr());
        let err = wrapper.recv(&mut buf[..n], Duration::from_secs(1)).unwrap_err();
        matches!(err, SocketError::Duplicate);
        assert_eq!(wrapper.inner.sent.len(), 2);
        assert_eq!(wrapper.inner.sent[1].0, content_response(1));
    }

    #[test]
    fn recv_detects_empty_confirmable_as_ping() {
        let mut sock = LoopbackSocket::new();
        sock.deliver(vec![0x40, 0x00, 0x00, 0x01], addr());
        let mut wrapper = SocketWrapper::new(sock, TransmissionParams::default(), None);
        let mut buf = [0u8; 16];
        let err = wrapper.recv(&mut buf, Duration::from_secs(1)).unwrap_err();
        matches!(err, SocketError::MsgWasPing);
    }

    #[test]
    fn send_rejects_malformed_bytes() {
        let sock = LoopbackSocket::new();
        let mut wrapper = SocketWrapper::new(sock, TransmissionParams::default(), None);
        let err = wrapper.send(&[0x90], addr()).unwrap_err();
        matches!(err, SocketError::MsgMalformed(_));
    }
}
