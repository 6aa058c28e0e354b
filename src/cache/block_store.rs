use crate::range::{ByteRange, RangeSet};
use std::collections::HashMap;
use tracing::debug;

/// One fixed-size slice of the file
#[derive(Debug)]
struct Block {
    data: Vec<u8>,
    /// Logical clock value of the last read or write (for LRU)
    last_used: u64,
}

/// In-memory storage of downloaded bytes in fixed-size blocks
///
/// Tracks exactly which bytes are present in a [`RangeSet`]. When bounded,
/// writes evict least recently used blocks that are not pinned; an evicted
/// block removes its whole range from the set.
#[derive(Debug)]
pub(crate) struct BlockStore {
    block_size: u64,
    file_size: u64,
    /// `None` keeps every block
    max_blocks: Option<usize>,
    blocks: HashMap<u64, Block>,
    downloaded: RangeSet,
    clock: u64,
}

impl BlockStore {
    pub(crate) fn new(file_size: u64, block_size: u64, capacity_bytes: Option<u64>) -> Self {
        let max_blocks =
            capacity_bytes.map(|capacity| capacity.div_ceil(block_size).max(1) as usize);

        Self {
            block_size,
            file_size,
            max_blocks,
            blocks: HashMap::new(),
            downloaded: RangeSet::new(),
            clock: 0,
        }
    }

    pub(crate) fn downloaded(&self) -> &RangeSet {
        &self.downloaded
    }

    /// Store `data` at `offset`, then evict down to capacity
    ///
    /// Blocks overlapping any of `pins` or the written range are never
    /// evicted. Returns the ranges that were evicted.
    pub(crate) fn write(&mut self, offset: u64, data: &[u8], pins: &[ByteRange]) -> Vec<ByteRange> {
        if data.is_empty() {
            return Vec::new();
        }

        let tick = self.tick();
        let mut position = offset;
        let mut remaining = data;

        while !remaining.is_empty() {
            let index = position / self.block_size;
            let block_range = self.block_range(index);
            let within = (position - block_range.start) as usize;
            let count = remaining.len().min(block_range.len() as usize - within);

            let block = self.blocks.entry(index).or_insert_with(|| Block {
                data: vec![0; block_range.len() as usize],
                last_used: tick,
            });
            block.data[within..within + count].copy_from_slice(&remaining[..count]);
            block.last_used = tick;

            position += count as u64;
            remaining = &remaining[count..];
        }

        let written = ByteRange::new(offset, position);
        self.downloaded.insert(written);
        self.evict(written, pins)
    }

    /// Bytes of `range` if every byte is present
    pub(crate) fn read(&mut self, range: ByteRange) -> Option<Vec<u8>> {
        if !self.downloaded.is_fully_covered(range) {
            return None;
        }

        let tick = self.tick();
        let mut out = Vec::with_capacity(range.len() as usize);
        let mut position = range.start;

        while position < range.end {
            let index = position / self.block_size;
            let block_range = self.block_range(index);
            let block = self.blocks.get_mut(&index)?;
            block.last_used = tick;

            let within = (position - block_range.start) as usize;
            let until = (range.end.min(block_range.end) - block_range.start) as usize;
            out.extend_from_slice(&block.data[within..until]);
            position = block_range.start + until as u64;
        }

        Some(out)
    }

    pub(crate) fn block_count(&self) -> usize {
        self.blocks.len()
    }

    fn evict(&mut self, written: ByteRange, pins: &[ByteRange]) -> Vec<ByteRange> {
        let Some(max_blocks) = self.max_blocks else {
            return Vec::new();
        };

        let mut evicted = Vec::new();
        while self.blocks.len() > max_blocks {
            let victim = self
                .blocks
                .iter()
                .filter(|(index, _)| !self.is_pinned(**index, written, pins))
                .min_by_key(|(_, block)| block.last_used)
                .map(|(index, _)| *index);

            let Some(index) = victim else {
                debug!(
                    "BlockStore: {} blocks pinned, over capacity of {}",
                    self.blocks.len(),
                    max_blocks
                );
                break;
            };

            self.blocks.remove(&index);
            let range = self.block_range(index);
            self.downloaded.remove(range);
            evicted.push(range);
        }

        evicted
    }

    fn is_pinned(&self, index: u64, written: ByteRange, pins: &[ByteRange]) -> bool {
        let range = self.block_range(index);
        written.overlaps(&range) || pins.iter().any(|pin| pin.overlaps(&range))
    }

    fn block_range(&self, index: u64) -> ByteRange {
        let start = index * self.block_size;
        ByteRange::new(start, (start + self.block_size).min(self.file_size))
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }
}
