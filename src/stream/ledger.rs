//! Bookkeeping for the blocks of one upload session.

use uuid::Uuid;

use crate::models::BlockId;

/// Where a sealed block is in its dispatch lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    /// Sealed, waiting for a dispatch slot.
    Buffered,
    InFlight,
    Acknowledged,
    /// The dispatch failed, or the block was abandoned before it started.
    Failed,
}

impl DispatchState {
    pub fn is_settled(&self) -> bool {
        matches!(self, DispatchState::Acknowledged | DispatchState::Failed)
    }
}

/// A sealed block awaiting acknowledgement.
#[derive(Debug, Clone)]
pub struct PendingBlock {
    pub sequence: u64,
    pub id: BlockId,
    /// Offset of the block's first byte in the blob.
    pub offset: u64,
    pub len: u64,
    pub state: DispatchState,
}

/// Ordered record of every block sealed by a stream.
///
/// Blocks are kept in submission order. Completion only changes a block's
/// state, so [`commit_order`](Ledger::commit_order) never depends on the
/// order in which dispatches finish.
#[derive(Debug)]
pub struct Ledger {
    prefix: Uuid,
    blocks: Vec<PendingBlock>,
    in_flight: usize,
    peak_in_flight: usize,
    bytes_acknowledged: u64,
}

impl Ledger {
    pub fn new() -> Self {
        Self {
            prefix: Uuid::new_v4(),
            blocks: Vec::new(),
            in_flight: 0,
            peak_in_flight: 0,
            bytes_acknowledged: 0,
        }
    }

    /// Records a new block and assigns it the next sequential id.
    pub fn seal(&mut self, offset: u64, len: u64) -> PendingBlock {
        let sequence = self.blocks.len() as u64;
        let block = PendingBlock {
            sequence,
            id: BlockId::for_sequence(&self.prefix, sequence),
            offset,
            len,
            state: DispatchState::Buffered,
        };
        self.blocks.push(block.clone());
        block
    }

    pub fn start(&mut self, sequence: u64) {
        if let Some(block) = self.block_mut(sequence) {
            if block.state == DispatchState::Buffered {
                block.state = DispatchState::InFlight;
                self.in_flight += 1;
                self.peak_in_flight = self.peak_in_flight.max(self.in_flight);
            }
        }
    }

    pub fn acknowledge(&mut self, sequence: u64) {
        if let Some(block) = self.block_mut(sequence) {
            if block.state == DispatchState::InFlight {
                block.state = DispatchState::Acknowledged;
                let len = block.len;
                self.in_flight -= 1;
                self.bytes_acknowledged += len;
            }
        }
    }

    pub fn fail(&mut self, sequence: u64) {
        if let Some(block) = self.block_mut(sequence) {
            let was_in_flight = block.state == DispatchState::InFlight;
            if !block.state.is_settled() {
                block.state = DispatchState::Failed;
                if was_in_flight {
                    self.in_flight -= 1;
                }
            }
        }
    }

    fn block_mut(&mut self, sequence: u64) -> Option<&mut PendingBlock> {
        self.blocks.get_mut(sequence as usize)
    }

    /// Whether the first `count` sealed blocks have all finished dispatching.
    pub fn settled(&self, count: usize) -> bool {
        self.blocks.iter().take(count).all(|b| b.state.is_settled())
    }

    pub fn all_acknowledged(&self) -> bool {
        self.blocks
            .iter()
            .all(|b| b.state == DispatchState::Acknowledged)
    }

    /// Block ids in submission order.
    pub fn commit_order(&self) -> Vec<BlockId> {
        self.blocks.iter().map(|b| b.id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn acknowledged(&self) -> usize {
        self.blocks
            .iter()
            .filter(|b| b.state == DispatchState::Acknowledged)
            .count()
    }

    pub fn bytes_acknowledged(&self) -> u64 {
        self.bytes_acknowledged
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight
    }
}

impl Default for Ledger {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_order_ignores_completion_order() {
        let mut ledger = Ledger::new();
        let blocks: Vec<_> = (0..4).map(|i| ledger.seal(i * 512, 512)).collect();
        for block in &blocks {
            ledger.start(block.sequence);
        }
        assert_eq!(ledger.peak_in_flight(), 4);

        for sequence in [3, 1, 0, 2] {
            ledger.acknowledge(sequence);
        }

        assert!(ledger.all_acknowledged());
        assert_eq!(ledger.bytes_acknowledged(), 2048);
        let order: Vec<_> = ledger
            .commit_order()
            .iter()
            .map(|id| id.sequence().unwrap())
            .collect();
        assert_eq!(order, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_settled_tracks_prefix() {
        let mut ledger = Ledger::new();
        let first = ledger.seal(0, 10);
        let second = ledger.seal(10, 10);
        ledger.start(first.sequence);
        ledger.start(second.sequence);

        ledger.acknowledge(second.sequence);
        assert!(!ledger.settled(1));
        assert!(!ledger.settled(2));

        ledger.fail(first.sequence);
        assert!(ledger.settled(2));
        assert!(!ledger.all_acknowledged());
        assert_eq!(ledger.in_flight(), 0);
        assert_eq!(ledger.bytes_acknowledged(), 10);
    }

    #[test]
    fn test_abandoned_block_is_settled() {
        let mut ledger = Ledger::new();
        let block = ledger.seal(0, 512);
        ledger.fail(block.sequence);

        assert!(ledger.settled(1));
        assert_eq!(ledger.in_flight(), 0);
        assert_eq!(ledger.acknowledged(), 0);
    }
}
