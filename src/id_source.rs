//! Message-ID and token generation (§4.4).
//!
//! The original engine dispatched through a `coap_id_source_t` vtable
//! with a single `get` entry point and two concrete sources: one that
//! draws fresh random identities, one that echoes a fixed identity back
//! forever (used to resume a Block2 response transfer with the
//! identity the request arrived with). A trait plus two structs is the
//! natural Rust shape for that vtable.

use crate::msg::{Identity, Token};

/// Produces the `(message-id, token)` pair for the next outgoing message.
pub trait IdSource {
    fn next_identity(&mut self) -> Identity;

    /// Changes the identity a [`StaticIdSource`] echoes back; a no-op for
    /// [`AutoIdSource`]. Used by the server-side Block2 receive handler to
    /// re-prime the source with each new continuation request's identity
    /// as it arrives (§4.7, §4.9).
    fn reset(&mut self, _identity: Identity) {}
}

/// A minimal, dependency-free PRNG (xorshift32), seeded by the caller.
///
/// The crate stays off `rand`: every message identity only needs to be
/// hard to guess, not cryptographically unpredictable, and `rand` would
/// be the only dependency pulling in a runtime-sized feature surface for
/// a `no_std` target.
pub trait Rng {
    fn next_u32(&mut self) -> u32;
}

#[derive(Debug, Clone)]
pub struct XorShiftRng {
    state: u32,
}

impl XorShiftRng {
    pub fn new(seed: u32) -> Self {
        XorShiftRng {
            state: if seed == 0 { 0x9E3779B9 } else { seed },
        }
    }
}

impl Rng for XorShiftRng {
    fn next_u32(&mut self) -> u32 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.state = x;
        x
    }
}

/// Draws a fresh random token for every message but advances the
/// message-id as a simple counter seeded once from the PRNG at
/// construction, as the original `coap_id_source_t` auto source does
/// (`next_msg_id` is drawn once, then incremented per call).
pub struct AutoIdSource<R: Rng> {
    rng: R,
    next_msg_id: u16,
    token_len: usize,
}

impl<R: Rng> AutoIdSource<R> {
    pub fn new(mut rng: R, token_len: usize) -> Self {
        assert!(token_len <= crate::msg::MAX_TOKEN_LENGTH);
        let next_msg_id = rng.next_u32() as u16;
        AutoIdSource {
            rng,
            next_msg_id,
            token_len,
        }
    }
}

impl<R: Rng> IdSource for AutoIdSource<R> {
    fn next_identity(&mut self) -> Identity {
        let msg_id = self.next_msg_id;
        self.next_msg_id = self.next_msg_id.wrapping_add(1);
        let mut bytes = [0u8; crate::msg::MAX_TOKEN_LENGTH];
        for b in bytes.iter_mut().take(self.token_len) {
            *b = self.rng.next_u32() as u8;
        }
        Identity {
            msg_id,
            token: Token::new(&bytes[..self.token_len]).expect("token_len <= MAX_TOKEN_LENGTH"),
        }
    }
}

/// Always returns the same identity; used by a server sub-stream while
/// resuming a Block2 response so that every block of one response shares
/// the request's token (§4.9).
pub struct StaticIdSource {
    identity: Identity,
}

impl StaticIdSource {
    pub fn new(identity: Identity) -> Self {
        StaticIdSource { identity }
    }
}

impl IdSource for StaticIdSource {
    fn next_identity(&mut self) -> Identity {
        self.identity
    }

    fn reset(&mut self, identity: Identity) {
        self.identity = identity;
    }
}
