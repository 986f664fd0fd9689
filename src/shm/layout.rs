//! Byte layout of a shared-memory segment
//!
//! ```text
//! +----------------------------+ 0
//! | SegmentHeader (64 B)       |
//! +----------------------------+
//! | RankControl x group_size   |  one cache line each
//! +----------------------------+
//! | ChannelControl x g*g       |  indexed src * g + dst
//! +----------------------------+ page aligned
//! | slot 0 .. slot g-1         |  slot_bytes each
//! +----------------------------+
//! | channel (0,0) .. (g-1,g-1) |  p2p_bytes each
//! +----------------------------+ total_bytes (page aligned)
//! ```
//!
//! Every control field is an atomic so that zero-filled memory from
//! `ftruncate` is a valid initial state.

use std::sync::atomic::{AtomicU32, AtomicU64};

use crate::error::{ForgeResult, ShmForgeError};

/// "SHMFORGE" in ASCII
pub const MAGIC: u64 = 0x5348_4D46_4F52_4745;

/// Bumped whenever the byte layout changes
pub const LAYOUT_VERSION: u32 = 2;

pub const CACHE_LINE: usize = 64;

pub const PAGE_SIZE: usize = 4096;

/// Attachment is tracked in a 64-bit mask
pub const MAX_GROUP_SIZE: usize = 64;

/// Segment header, written once by the creator
#[repr(C, align(64))]
#[derive(Debug)]
pub struct SegmentHeader {
    /// Published last (Release) once the rest of the header is valid
    pub magic: AtomicU64,
    pub version: AtomicU32,
    pub group_size: AtomicU32,
    pub slot_bytes: AtomicU64,
    pub p2p_bytes: AtomicU64,
    pub total_bytes: AtomicU64,
    pub creator_pid: AtomicU32,
    /// Futex word bumped on every attach
    pub attach_events: AtomicU32,
    /// Bit `r` set while rank `r` is attached; cleared on detach
    pub attached_mask: AtomicU64,
    /// Bit `r` set once rank `r` has ever attached; never cleared
    pub joined_mask: AtomicU64,
}

/// Per-rank collective control block
#[repr(C, align(64))]
#[derive(Debug)]
pub struct RankControl {
    /// Last round whose payload is visible in this rank's slot
    pub publish_seq: AtomicU32,
    /// Last round this rank finished consuming
    pub done_seq: AtomicU32,
    /// Collective kind of the published round
    pub op_code: AtomicU32,
    _reserved: u32,
    /// Bytes valid in the slot for the published round
    pub payload_len: AtomicU64,
    /// Total bytes of the whole (possibly chunked) collective
    pub total_len: AtomicU64,
}

/// Control block of one `(src, dst)` point-to-point channel
#[repr(C, align(64))]
#[derive(Debug)]
pub struct ChannelControl {
    /// Chunks written by the sender
    pub send_seq: AtomicU32,
    /// Chunks consumed by the receiver
    pub ack_seq: AtomicU32,
    /// Bytes valid in the channel buffer for the current chunk
    pub chunk_len: AtomicU64,
    /// Length of the whole message the current chunk belongs to
    pub message_len: AtomicU64,
}

/// Round `n` up to a multiple of `align` (a power of two)
pub fn align_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

/// Offsets of every region in a segment for a given group shape
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentLayout {
    pub group_size: usize,
    pub slot_bytes: usize,
    pub p2p_bytes: usize,
    pub ranks_offset: usize,
    pub channels_offset: usize,
    pub slots_offset: usize,
    pub p2p_offset: usize,
    pub total_bytes: usize,
}

impl SegmentLayout {
    /// Compute the layout. Slot and channel sizes are rounded up to a cache line.
    pub fn compute(group_size: usize, slot_bytes: usize, p2p_bytes: usize) -> ForgeResult<Self> {
        if group_size == 0 || group_size > MAX_GROUP_SIZE {
            return Err(ShmForgeError::InvalidGroupSize(group_size as i64));
        }
        let slot_bytes = align_up(slot_bytes.max(CACHE_LINE), CACHE_LINE);
        let p2p_bytes = align_up(p2p_bytes.max(CACHE_LINE), CACHE_LINE);

        let overflow = || {
            ShmForgeError::InvalidConfiguration(format!(
                "segment size overflows for group_size={} slot_bytes={} p2p_bytes={}",
                group_size, slot_bytes, p2p_bytes
            ))
        };

        let header = std::mem::size_of::<SegmentHeader>();
        let ranks_offset = header;
        let channels_offset = ranks_offset + group_size * std::mem::size_of::<RankControl>();
        let control_end =
            channels_offset + group_size * group_size * std::mem::size_of::<ChannelControl>();

        let slots_offset = align_up(control_end, PAGE_SIZE);
        let p2p_offset = group_size
            .checked_mul(slot_bytes)
            .and_then(|n| n.checked_add(slots_offset))
            .ok_or_else(overflow)?;
        let end = (group_size * group_size)
            .checked_mul(p2p_bytes)
            .and_then(|n| n.checked_add(p2p_offset))
            .ok_or_else(overflow)?;
        let total_bytes = end.checked_add(PAGE_SIZE - 1).ok_or_else(overflow)? & !(PAGE_SIZE - 1);

        Ok(Self {
            group_size,
            slot_bytes,
            p2p_bytes,
            ranks_offset,
            channels_offset,
            slots_offset,
            p2p_offset,
            total_bytes,
        })
    }

    pub fn rank_control_offset(&self, rank: usize) -> usize {
        debug_assert!(rank < self.group_size);
        self.ranks_offset + rank * std::mem::size_of::<RankControl>()
    }

    pub fn channel_control_offset(&self, src: usize, dst: usize) -> usize {
        debug_assert!(src < self.group_size && dst < self.group_size);
        self.channels_offset
            + (src * self.group_size + dst) * std::mem::size_of::<ChannelControl>()
    }

    pub fn slot_offset(&self, rank: usize) -> usize {
        debug_assert!(rank < self.group_size);
        self.slots_offset + rank * self.slot_bytes
    }

    pub fn channel_offset(&self, src: usize, dst: usize) -> usize {
        debug_assert!(src < self.group_size && dst < self.group_size);
        self.p2p_offset + (src * self.group_size + dst) * self.p2p_bytes
    }
}
