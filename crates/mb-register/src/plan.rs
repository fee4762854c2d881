//! Read planning
//!
//! Reading registers one at a time is slow on a shared serial bus, so
//! descriptors are coalesced into contiguous block reads. Blocks never span a
//! gap (unmapped registers make some devices answer with an exception), never
//! exceed the client's maximum block size and never cross a barrier address.

use crate::descriptor::RegisterDescriptor;
use crate::{Access, MAX_BLOCK_SIZE};

/// One contiguous read covering one or more descriptors
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadBlock {
    /// Register table to read
    pub access: Access,
    /// First register of the block
    pub start: u16,
    /// Number of registers in the block
    pub count: u16,
    /// Indices (into the planned descriptor slice) served by this block
    pub members: Vec<usize>,
}

impl ReadBlock {
    /// The words belonging to `reg` within a response to this block
    pub fn slice<'a>(&self, reg: &RegisterDescriptor, words: &'a [u16]) -> Option<&'a [u16]> {
        let offset = reg.address.checked_sub(self.start)? as usize;
        words.get(offset..offset + reg.count() as usize)
    }
}

/// Groups descriptors into block reads
#[derive(Debug, Clone)]
pub struct ReadPlanner {
    max_block: u16,
    barriers: Vec<u16>,
}

impl Default for ReadPlanner {
    fn default() -> Self {
        Self::new(MAX_BLOCK_SIZE)
    }
}

impl ReadPlanner {
    /// Create a planner with the given maximum block size
    pub fn new(max_block: u16) -> Self {
        Self {
            max_block: max_block.max(1),
            barriers: Vec::new(),
        }
    }

    /// Addresses that must start a new block
    pub fn with_barriers(mut self, barriers: impl IntoIterator<Item = u16>) -> Self {
        self.barriers = barriers.into_iter().collect();
        self.barriers.sort_unstable();
        self
    }

    pub fn max_block(&self) -> u16 {
        self.max_block
    }

    /// Plan reads for the selected descriptors of `regs`
    pub fn plan(
        &self,
        regs: &[RegisterDescriptor],
        selected: impl IntoIterator<Item = usize>,
    ) -> Vec<ReadBlock> {
        let mut order: Vec<usize> = selected.into_iter().filter(|&i| i < regs.len()).collect();
        order.sort_by_key(|&i| (regs[i].access, regs[i].address, regs[i].count(), i));
        order.dedup();

        let mut blocks: Vec<ReadBlock> = Vec::new();

        for i in order {
            let reg = &regs[i];

            if let Some(block) = blocks.last_mut() {
                let block_end = block.start as u32 + block.count as u32;
                let new_end = block_end.max(reg.end());
                let joinable = block.access == reg.access
                    && reg.address as u32 <= block_end
                    && new_end - block.start as u32 <= self.max_block as u32
                    && !self.crosses_barrier(block.start, reg.address);

                if joinable {
                    block.count = (new_end - block.start as u32) as u16;
                    block.members.push(i);
                    continue;
                }
            }

            blocks.push(ReadBlock {
                access: reg.access,
                start: reg.address,
                count: reg.count(),
                members: vec![i],
            });
        }

        blocks
    }

    fn crosses_barrier(&self, start: u16, address: u16) -> bool {
        self.barriers.iter().any(|&b| start < b && b <= address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn f32_regs(addresses: &[u16]) -> Vec<RegisterDescriptor> {
        addresses
            .iter()
            .map(|&a| RegisterDescriptor::f32_be(a).input())
            .collect()
    }

    #[test]
    fn test_adjacent_registers_coalesce() {
        let regs = f32_regs(&[0x0000, 0x0006, 0x0008, 0x0002, 0x0004]);
        let blocks = ReadPlanner::default().plan(&regs, 0..regs.len());

        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].start, 0);
        assert_eq!(blocks[0].count, 10);
        assert_eq!(blocks[0].members, vec![0, 3, 4, 1, 2]);
    }

    #[test]
    fn test_gap_splits_blocks() {
        let regs = f32_regs(&[0x0000, 0x0046, 0x0048]);
        let blocks = ReadPlanner::default().plan(&regs, 0..regs.len());

        assert_eq!(blocks.len(), 2);
        assert_eq!((blocks[1].start, blocks[1].count), (0x0046, 4));
    }

    #[test]
    fn test_access_kinds_never_mix() {
        let regs = vec![
            RegisterDescriptor::u16(10).holding(),
            RegisterDescriptor::u16(11).input(),
        ];
        let blocks = ReadPlanner::default().plan(&regs, 0..2);
        assert_eq!(blocks.len(), 2);
    }

    #[test]
    fn test_max_block_size() {
        let regs: Vec<_> = (0..10).map(RegisterDescriptor::u16).collect();
        let blocks = ReadPlanner::new(4).plan(&regs, 0..regs.len());
        let counts: Vec<u16> = blocks.iter().map(|b| b.count).collect();
        assert_eq!(counts, vec![4, 4, 2]);
    }

    #[test]
    fn test_barriers() {
        let regs = f32_regs(&[0x0010, 0x0012, 0x0014]);
        let blocks = ReadPlanner::default()
            .with_barriers([0x0012])
            .plan(&regs, 0..regs.len());
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[1].start, 0x0012);
    }

    #[test]
    fn test_selection_subset() {
        let regs = f32_regs(&[0, 2, 4]);
        let blocks = ReadPlanner::default().plan(&regs, [2, 0]);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].members, vec![0]);
        assert_eq!(blocks[1].members, vec![2]);
    }

    fn descriptor() -> impl Strategy<Value = RegisterDescriptor> {
        (0u16..200, 0usize..4).prop_map(|(address, kind)| match kind {
            0 => RegisterDescriptor::u16(address),
            1 => RegisterDescriptor::s16(address),
            2 => RegisterDescriptor::u32_be(address),
            _ => RegisterDescriptor::f32_be(address),
        })
    }

    proptest! {
        #[test]
        fn coalesced_decode_matches_individual(
            regs in prop::collection::vec(descriptor(), 1..20),
            memory in prop::collection::vec(any::<u16>(), 256),
            max_block in 1u16..130,
        ) {
            let blocks = ReadPlanner::new(max_block).plan(&regs, 0..regs.len());

            let mut seen = vec![false; regs.len()];
            for block in &blocks {
                prop_assert!(block.count <= max_block.max(2));
                let start = block.start as usize;
                let words = &memory[start..start + block.count as usize];

                for &i in &block.members {
                    let reg = &regs[i];
                    let own = &memory[reg.address as usize..reg.end() as usize];
                    let sliced = block.slice(reg, words).expect("member inside block");
                    // Debug text so NaN payloads compare equal
                    prop_assert_eq!(
                        format!("{:?}", reg.decode(sliced)),
                        format!("{:?}", reg.decode(own))
                    );
                    seen[i] = true;
                }
            }

            prop_assert!(seen.iter().all(|s| *s));
        }
    }
}
