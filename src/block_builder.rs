//! Staging buffer for outgoing block-wise payload data (§4.3).
//!
//! Payload handed to [`crate::block_transfer`] by the caller is appended
//! here; blocks are peeled off the front once a full block's worth (or,
//! at the end of the transfer, whatever remains) has accumulated. A
//! `VecDeque` gives cheap pops from the front without shifting the rest
//! of the buffer, which is the only thing `avs_coap_block_builder` did
//! differently from a plain growable buffer.

use alloc::collections::VecDeque;
use alloc::vec::Vec;

pub struct BlockBuilder {
    block_size: u16,
    staged: VecDeque<u8>,
}

impl BlockBuilder {
    pub fn new(block_size: u16) -> Self {
        BlockBuilder {
            block_size,
            staged: VecDeque::new(),
        }
    }

    pub fn append(&mut self, data: &[u8]) {
        self.staged.extend(data.iter().copied());
    }

    /// Updates the block size used by subsequent [`take_block`] calls, to
    /// follow a mid-transfer renegotiation (§4.7). Never shrinks data
    /// already staged; it just changes how much of it the next call
    /// peels off.
    pub fn set_block_size(&mut self, block_size: u16) {
        self.block_size = block_size;
    }

    pub fn staged_len(&self) -> usize {
        self.staged.len()
    }

    /// True once more than one full block's worth of data is staged,
    /// i.e. it is safe to flush a block while guaranteeing it is not the
    /// transfer's last one.
    pub fn has_full_intermediate_block(&self) -> bool {
        self.staged.len() > self.block_size as usize
    }

    pub fn has_full_block(&self) -> bool {
        self.staged.len() >= self.block_size as usize
    }

    /// Removes and returns up to one block size worth of staged bytes.
    pub fn take_block(&mut self) -> Vec<u8> {
        let n = (self.block_size as usize).min(self.staged.len());
        self.staged.drain(..n).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.staged.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn take_block_respects_block_size() {
        let mut b = BlockBuilder::new(4);
        b.append(b"0123456789");
        assert!(b.has_full_intermediate_block());
        assert_eq!(b.take_block(), b"0123");
        assert_eq!(b.take_block(), b"4567");
        assert!(!b.has_full_intermediate_block());
        assert_eq!(b.take_block(), b"89");
        assert!(b.is_empty());
    }

    #[test]
    fn full_intermediate_requires_strictly_more_than_one_block() {
        let mut b = BlockBuilder::new(4);
        b.append(b"1234");
        assert!(!b.has_full_intermediate_block());
        assert!(b.has_full_block());
        b.append(b"5");
        assert!(b.has_full_intermediate_block());
    }
}
