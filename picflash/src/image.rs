//! Firmware image segments and write-block chunking.
//!
//! The bootloader writes flash in fixed-size blocks at block-aligned
//! addresses. Firmware images rarely cooperate: segments start and stop at
//! arbitrary addresses, may arrive unordered, and may overlap. The chunker
//! maps a set of segments onto the device's write grid:
//!
//! - each segment is widened so it starts and ends on a write-block boundary,
//!   with the widened bytes padded,
//! - every block is emitted at most once, with the data of all segments that
//!   touch it merged in, so a later chunk never clobbers an earlier write
//!   with stale padding,
//! - a block reaching the top of program memory always covers the final
//!   address of the range, even when the segment stops short of it,
//! - segment data outside the program memory range is rejected outright.

use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::protocol::PAD_BYTE;
use crate::session::BootAttrs;

/// A contiguous piece of a firmware image.
///
/// Segments are the raw material produced by whatever parsed the firmware
/// image; they carry no alignment guarantees.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// Address of the first byte.
    pub address: u32,
    /// Firmware bytes.
    pub data: Vec<u8>,
}

impl Segment {
    /// Create a segment from an address and its data.
    pub fn new(address: u32, data: Vec<u8>) -> Self {
        Self { address, data }
    }
}

/// One write-block-aligned, padded unit of data, ready for a single
/// `WRITE_FLASH` exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Block-aligned start address.
    pub address: u32,
    /// Block payload, original data plus alignment padding.
    pub data: Vec<u8>,
}

/// Split firmware segments into aligned, padded write chunks.
///
/// Returns the total number of bytes to be written and the chunks in
/// ascending address order. Chunking is deterministic: the same segment set
/// always yields the same chunk sequence. Where segments overlap, the later
/// segment in `segments` wins.
#[allow(clippy::cast_possible_truncation)] // Block addresses stay below the u32 range end
pub fn chunked(segments: &[Segment], attrs: &BootAttrs) -> Result<(usize, Vec<Chunk>)> {
    let write = u64::from(attrs.write_size);
    let range_start = u64::from(attrs.memory_range.0);
    let range_end = u64::from(attrs.memory_range.1);

    let mut blocks: BTreeMap<u64, Vec<u8>> = BTreeMap::new();

    for segment in segments.iter().filter(|s| !s.data.is_empty()) {
        let seg_start = u64::from(segment.address);
        let seg_end = seg_start + segment.data.len() as u64;

        if seg_start < range_start || seg_end > range_end {
            return Err(Error::SegmentOutOfRange {
                start: segment.address,
                end: u32::try_from(seg_end).unwrap_or(u32::MAX),
                range_start: attrs.memory_range.0,
                range_end: attrs.memory_range.1,
            });
        }

        let mut block_addr = seg_start - seg_start % write;

        while block_addr < seg_end {
            let block_end = (block_addr + write).min(range_end);
            let block = blocks
                .entry(block_addr)
                .or_insert_with(|| vec![PAD_BYTE; (block_end - block_addr) as usize]);

            let copy_start = block_addr.max(seg_start);
            let copy_end = block_end.min(seg_end);
            let dst = (copy_start - block_addr) as usize..(copy_end - block_addr) as usize;
            let src = (copy_start - seg_start) as usize..(copy_end - seg_start) as usize;
            block[dst].copy_from_slice(&segment.data[src]);

            block_addr += write;
        }
    }

    if blocks.is_empty() {
        return Err(Error::EmptyImage);
    }

    let total_bytes = blocks.values().map(Vec::len).sum();
    let chunks = blocks
        .into_iter()
        .map(|(address, data)| Chunk {
            address: address as u32,
            data,
        })
        .collect();

    Ok((total_bytes, chunks))
}
