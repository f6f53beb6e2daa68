//! The fixed-byte-budget duplicate-response cache (§4.5).
//!
//! Grounded on `msg_cache.c`: entries are appended in a ring that is
//! already in non-decreasing expiration order (since `EXCHANGE_LIFETIME`
//! is the same for every entry and entries are only ever appended at the
//! back), so eviction is always "drop from the front". Endpoints are
//! reference-counted so that many cached responses to the same peer
//! share one copy of its address; a plain `Rc` gives us that for free
//! instead of the original's hand-rolled `refcount` field.
//!
//! Needs `std` for `Instant`/`SocketAddr`, so this module is behind the
//! `std` feature along with [`crate::socket`].

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::error::CacheError;
use crate::tx_params::TransmissionParams;

/// Bookkeeping bytes charged per entry on top of its payload, standing
/// in for the original's `offsetof(cache_entry_t, data)` plus alignment
/// padding.
const ENTRY_OVERHEAD: usize = 24;

struct CacheEntry {
    endpoint: Rc<SocketAddr>,
    msg_id: u16,
    expires_at: Instant,
    bytes: Vec<u8>,
}

impl CacheEntry {
    fn size(&self) -> usize {
        ENTRY_OVERHEAD + self.bytes.len()
    }
}

/// A FIFO, fixed-capacity cache of recently sent responses, keyed by
/// (remote endpoint, CoAP message ID), used to resend a cached response
/// instead of re-running a handler when a Confirmable request is
/// retransmitted (§4.6).
pub struct ResponseCache {
    capacity: usize,
    used: usize,
    endpoints: Vec<Rc<SocketAddr>>,
    entries: VecDeque<CacheEntry>,
}

impl ResponseCache {
    pub fn new(capacity: usize) -> Self {
        ResponseCache {
            capacity,
            used: 0,
            endpoints: Vec::new(),
            entries: VecDeque::new(),
        }
    }

    /// Caches `bytes` as the response for `(endpoint, msg_id)`, expiring
    /// it after `params.exchange_lifetime_ms()`. Drops the oldest
    /// entries (expired or not) to make room if necessary.
    pub fn add(
        &mut self,
        endpoint: SocketAddr,
        msg_id: u16,
        bytes: &[u8],
        params: &TransmissionParams,
    ) -> Result<(), CacheError> {
        let now = Instant::now();
        self.drop_expired(now);

        let required = ENTRY_OVERHEAD + bytes.len();
        if required > self.capacity {
            return Err(CacheError::TooLargeForCache);
        }
        if self.find(&endpoint, msg_id).is_some() {
            return Err(CacheError::Duplicate);
        }

        self.free_bytes(required);

        let ep = self.endpoint_ref(endpoint);
        let expires_at = now + Duration::from_millis(params.exchange_lifetime_ms() as u64);
        self.used += required;
        self.entries.push_back(CacheEntry {
            endpoint: ep,
            msg_id,
            expires_at,
            bytes: bytes.to_vec(),
        });
        Ok(())
    }

    /// Returns the cached response for `(endpoint, msg_id)`, if any and
    /// not yet expired.
    pub fn get(&mut self, endpoint: &SocketAddr, msg_id: u16) -> Option<&[u8]> {
        let now = Instant::now();
        self.drop_expired(now);
        self.find(endpoint, msg_id).map(|e| e.bytes.as_slice())
    }

    fn find(&self, endpoint: &SocketAddr, msg_id: u16) -> Option<&CacheEntry> {
        self.entries
            .iter()
            .find(|e| e.msg_id == msg_id && *e.endpoint == *endpoint)
    }

    fn drop_expired(&mut self, now: Instant) {
        while let Some(front) = self.entries.front() {
            if front.expires_at > now {
                break;
            }
            self.pop_front();
        }
    }

    fn free_bytes(&mut self, required: usize) {
        while self.used + required > self.capacity {
            if self.pop_front().is_none() {
                break;
            }
        }
    }

    fn pop_front(&mut self) -> Option<()> {
        let entry = self.entries.pop_front()?;
        self.used -= entry.size();
        self.release_endpoint(entry.endpoint);
        Some(())
    }

    fn endpoint_ref(&mut self, addr: SocketAddr) -> Rc<SocketAddr> {
        if let Some(existing) = self.endpoints.iter().find(|e| ***e == addr) {
            return Rc::clone(existing);
        }
        let ep = Rc::new(addr);
        self.endpoints.push(Rc::clone(&ep));
        ep
    }

    fn release_endpoint(&mut self, endpoint: Rc<SocketAddr>) {
        // Dropping `endpoint` here brings the count to whatever is held
        // by `self.endpoints` alone; if that's the last reference,
        // nothing else in the cache still needs this address.
        drop(endpoint);
        self.endpoints.retain(|e| Rc::strong_count(e) > 1);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    #[test]
    fn add_then_get_round_trips() {
        let mut cache = ResponseCache::new(4096);
        let params = TransmissionParams::default();
        cache.add(addr(1), 7, b"hello", &params).unwrap();
        assert_eq!(cache.get(&addr(1), 7), Some(&b"hello"[..]));
    }

    #[test]
    fn rejects_duplicate_message_id_per_endpoint() {
        let mut cache = ResponseCache::new(4096);
        let params = TransmissionParams::default();
        cache.add(addr(1), 7, b"hello", &params).unwrap();
        assert_eq!(
            cache.add(addr(1), 7, b"again", &params).unwrap_err(),
            CacheError::Duplicate
        );
    }

    #[test]
    fn same_msg_id_different_endpoint_is_not_a_duplicate() {
        let mut cache = ResponseCache::new(4096);
        let params = TransmissionParams::default();
        cache.add(addr(1), 7, b"a", &params).unwrap();
        cache.add(addr(2), 7, b"b", &params).unwrap();
        assert_eq!(cache.get(&addr(1), 7), Some(&b"a"[..]));
        assert_eq!(cache.get(&addr(2), 7), Some(&b"b"[..]));
    }

    #[test]
    fn evicts_oldest_entry_to_make_room() {
        let mut cache = ResponseCache::new(ENTRY_OVERHEAD + 10);
        let params = TransmissionParams::default();
        cache.add(addr(1), 1, b"0123456789", &params).unwrap();
        cache.add(addr(1), 2, b"abcdefghij", &params).unwrap();
        assert_eq!(cache.get(&addr(1), 1), None);
        assert_eq!(cache.get(&addr(1), 2), Some(&b"abcdefghij"[..]));
    }

    #[test]
    fn rejects_message_too_large_for_cache() {
        let mut cache = ResponseCache::new(16);
        let params = TransmissionParams::default();
        assert_eq!(
            cache.add(addr(1), 1, &[0u8; 64], &params).unwrap_err(),
            CacheError::TooLargeForCache
        );
    }

    #[test]
    fn endpoint_record_is_released_once_all_its_entries_are_gone() {
        let mut cache = ResponseCache::new(4096);
        let params = TransmissionParams::default();
        cache.add(addr(1), 1, b"x", &params).unwrap();
        cache.add(addr(1), 2, b"y", &params).unwrap();
        assert_eq!(cache.endpoints.len(), 1);
        assert_eq!(Rc::strong_count(&cache.endpoints[0]), 3);
    }
}
