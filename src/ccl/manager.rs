//! Collective engine over one attached segment
//!
//! A collective runs as one or more rounds. In each round every rank:
//!
//! 1. waits until all peers marked the previous round done (its slot is free),
//! 2. copies its chunk into its own slot and bumps its publish counter,
//! 3. waits for each peer's publish counter to reach the round,
//! 4. reads the peer slots it needs, then bumps its done counter.
//!
//! Rounds are numbered by the rank's own publish counter, so every rank must
//! issue the same collectives in the same order with the same sizes. A
//! mismatch in kind or length is reported as `CollectiveMismatch` when seen.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::error::{ForgeResult, ShmForgeError};
use crate::internal_error;
use crate::shm::{futex, ShmConfig, ShmSegment};
use crate::tensor::Element;

use super::reduce::{self, ReduceElement};
use super::stats::{CollectiveKind, CollectiveStats, StatsSnapshot};

/// A wait longer than this logs a warning once
const SLOW_WAIT_WARN: Duration = Duration::from_secs(10);

/// `cur` has reached `target`, allowing for wraparound of the 32-bit counters
#[inline]
pub(crate) fn seq_reached(cur: u32, target: u32) -> bool {
    (cur.wrapping_sub(target) as i32) >= 0
}

/// One rank's view of a shared-memory communication group
#[derive(Debug)]
pub struct ShmManager {
    segment: ShmSegment,
    config: ShmConfig,
    stats: CollectiveStats,
    /// Serializes operations issued on this manager from several threads
    op_lock: Mutex<()>,
}

impl ShmManager {
    /// Create (rank 0) or attach to (other ranks) the segment `name`
    pub fn new(name: &str, group_size: usize, rank: usize, config: ShmConfig) -> ForgeResult<Self> {
        config.validate()?;
        if group_size == 0 || group_size > crate::shm::MAX_GROUP_SIZE {
            return Err(ShmForgeError::InvalidGroupSize(group_size as i64));
        }
        if rank >= group_size {
            return Err(ShmForgeError::InvalidRank {
                rank: rank as i64,
                group_size: group_size as i64,
            });
        }

        let segment = if rank == 0 {
            ShmSegment::create(name, group_size, &config)?
        } else {
            ShmSegment::open(name, group_size, rank, &config)?
        };

        tracing::debug!(
            "Shared-memory manager {:?} ready: rank {}/{}",
            name,
            rank,
            group_size
        );

        Ok(Self {
            segment,
            config,
            stats: CollectiveStats::new(),
            op_lock: Mutex::new(()),
        })
    }

    pub fn name(&self) -> &str {
        self.segment.name()
    }

    pub fn rank(&self) -> usize {
        self.segment.rank()
    }

    pub fn group_size(&self) -> usize {
        self.segment.group_size()
    }

    pub fn config(&self) -> &ShmConfig {
        &self.config
    }

    pub fn segment(&self) -> &ShmSegment {
        &self.segment
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub(super) fn stats_ref(&self) -> &CollectiveStats {
        &self.stats
    }

    pub(super) fn lock(&self) -> ForgeResult<MutexGuard<'_, ()>> {
        Ok(self.op_lock.lock()?)
    }

    /// Confirm this manager serves `name` and block until every rank attached
    ///
    /// Completion is judged on the sticky joined mask, so a peer that
    /// already finished its work and detached still counts as joined.
    ///
    /// # Errors
    /// `InvalidArgument` if `name` is not this manager's segment,
    /// `RendezvousTimeout` if the group is incomplete after `attach_timeout`.
    pub fn join(&self, name: &str) -> ForgeResult<String> {
        if name != self.name() {
            return Err(ShmForgeError::InvalidArgument(format!(
                "manager serves {:?}, not {:?}",
                self.name(),
                name
            )));
        }

        let group_size = self.group_size();
        let full_mask = if group_size == 64 {
            u64::MAX
        } else {
            (1u64 << group_size) - 1
        };
        let events = &self.segment.header().attach_events;
        let deadline = Instant::now() + self.config.attach_timeout;

        loop {
            let seen = events.load(Ordering::Acquire);
            let mask = self.segment.joined_mask();
            if mask & full_mask == full_mask {
                tracing::debug!(
                    "Rank {} joined {:?}: all {} ranks attached",
                    self.rank(),
                    name,
                    group_size
                );
                return Ok(name.to_string());
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(ShmForgeError::RendezvousTimeout {
                    name: name.to_string(),
                    attached: (mask & full_mask).count_ones() as usize,
                    expected: group_size,
                });
            }
            futex::wait(events, seen, deadline - now);
        }
    }

    /// In-place element-wise sum across all ranks
    ///
    /// Every rank ends with the same values, summed in rank order.
    pub fn allreduce<T: ReduceElement>(&self, data: &mut [T]) -> ForgeResult<()> {
        let _guard = self.lock()?;
        self.stats.record_call(CollectiveKind::AllReduce);

        let group_size = self.group_size();
        if data.is_empty() || group_size == 1 {
            return Ok(());
        }

        let elem = std::mem::size_of::<T>();
        let total = data.len() * elem;
        let per_round = self.segment.layout().slot_bytes / elem;

        for chunk in data.chunks_mut(per_round) {
            let nbytes = chunk.len() * elem;
            let round = self.publish(
                CollectiveKind::AllReduce,
                total,
                bytemuck::cast_slice::<T, u8>(&*chunk),
            )?;

            self.consume(round, CollectiveKind::AllReduce, nbytes, total, |this| {
                let mut inputs: Vec<&[T]> = Vec::with_capacity(group_size);
                for peer in 0..group_size {
                    // SAFETY: every peer published this round and none can
                    // overwrite its slot until this rank marks the round done.
                    let bytes = unsafe { this.segment.slot(peer, nbytes) };
                    let typed = bytemuck::try_cast_slice::<u8, T>(bytes)
                        .map_err(|e| {
                            internal_error!("slot {} not viewable as {}: {:?}", peer, T::DTYPE, e)
                        })?;
                    inputs.push(typed);
                }
                reduce::sum_into(chunk, &inputs, this.config.parallel_reduce_threshold);
                this.stats.record_consumed(nbytes * (group_size - 1));
                Ok(())
            })?;
        }
        Ok(())
    }

    /// Gather every rank's `data` into `outputs` on rank `dst`
    ///
    /// On `dst`, `outputs` must hold `group_size` buffers of `data.len()`
    /// elements; `outputs[i]` receives rank `i`'s data. Other ranks publish
    /// and return without waiting, and leave `outputs` untouched.
    pub fn gather<T: Element>(
        &self,
        data: &[T],
        outputs: Option<&mut [&mut [T]]>,
        dst: usize,
    ) -> ForgeResult<()> {
        match outputs {
            Some(outs) => {
                let mut views: Vec<&mut [u8]> = outs
                    .iter_mut()
                    .map(|o| bytemuck::cast_slice_mut::<T, u8>(o))
                    .collect();
                self.gather_bytes(bytemuck::cast_slice(data), Some(views.as_mut_slice()), dst)
            }
            None => self.gather_bytes(bytemuck::cast_slice(data), None, dst),
        }
    }

    /// Byte-level [`gather`](Self::gather)
    pub fn gather_bytes(
        &self,
        data: &[u8],
        outputs: Option<&mut [&mut [u8]]>,
        dst: usize,
    ) -> ForgeResult<()> {
        let group_size = self.group_size();
        let rank = self.rank();
        if dst >= group_size {
            return Err(ShmForgeError::InvalidRank {
                rank: dst as i64,
                group_size: group_size as i64,
            });
        }

        let mut outputs = if rank == dst {
            let outs = outputs.ok_or_else(|| {
                ShmForgeError::InvalidArgument("gather destination needs output buffers".to_string())
            })?;
            check_outputs(outs, group_size, data.len())?;
            Some(outs)
        } else {
            None
        };

        let _guard = self.lock()?;
        self.stats.record_call(CollectiveKind::Gather);

        if let Some(outs) = outputs.as_deref_mut() {
            outs[rank].copy_from_slice(data);
        }
        if data.is_empty() || group_size == 1 {
            return Ok(());
        }

        let total = data.len();
        let slot_bytes = self.segment.layout().slot_bytes;
        for (i, chunk) in data.chunks(slot_bytes).enumerate() {
            let offset = i * slot_bytes;
            let round = self.publish(CollectiveKind::Gather, total, chunk)?;

            match outputs.as_deref_mut() {
                Some(outs) => {
                    self.consume(round, CollectiveKind::Gather, chunk.len(), total, |this| {
                        for (peer, out) in outs.iter_mut().enumerate() {
                            if peer == rank {
                                continue;
                            }
                            // SAFETY: peer published this round; its slot is
                            // stable until this rank marks the round done.
                            let bytes = unsafe { this.segment.slot(peer, chunk.len()) };
                            out[offset..offset + chunk.len()].copy_from_slice(bytes);
                        }
                        this.stats.record_consumed(chunk.len() * (group_size - 1));
                        Ok(())
                    })?;
                }
                None => self.finish_round(round),
            }
        }
        Ok(())
    }

    /// Every rank receives all ranks' `data` concatenated in rank order
    ///
    /// `output` must hold `group_size * data.len()` elements.
    pub fn all_gather<T: Element>(&self, data: &[T], output: &mut [T]) -> ForgeResult<()> {
        self.all_gather_bytes(
            bytemuck::cast_slice(data),
            bytemuck::cast_slice_mut(output),
        )
    }

    /// Byte-level [`all_gather`](Self::all_gather)
    pub fn all_gather_bytes(&self, data: &[u8], output: &mut [u8]) -> ForgeResult<()> {
        let group_size = self.group_size();
        let rank = self.rank();
        let n = data.len();
        if output.len() != n * group_size {
            return Err(ShmForgeError::SizeMismatch {
                expected: n * group_size,
                actual: output.len(),
            });
        }

        let _guard = self.lock()?;
        self.stats.record_call(CollectiveKind::AllGather);

        output[rank * n..(rank + 1) * n].copy_from_slice(data);
        if n == 0 || group_size == 1 {
            return Ok(());
        }

        let slot_bytes = self.segment.layout().slot_bytes;
        for (i, chunk) in data.chunks(slot_bytes).enumerate() {
            let offset = i * slot_bytes;
            let len = chunk.len();
            let round = self.publish(CollectiveKind::AllGather, n, chunk)?;

            self.consume(round, CollectiveKind::AllGather, len, n, |this| {
                for peer in (0..group_size).filter(|&p| p != rank) {
                    // SAFETY: see `gather_bytes`.
                    let bytes = unsafe { this.segment.slot(peer, len) };
                    let start = peer * n + offset;
                    output[start..start + len].copy_from_slice(bytes);
                }
                this.stats.record_consumed(len * (group_size - 1));
                Ok(())
            })?;
        }
        Ok(())
    }

    /// Block until every rank reached the barrier
    pub fn barrier(&self) -> ForgeResult<()> {
        let _guard = self.lock()?;
        self.stats.record_call(CollectiveKind::Barrier);
        if self.group_size() == 1 {
            return Ok(());
        }
        let round = self.publish(CollectiveKind::Barrier, 0, &[])?;
        self.consume(round, CollectiveKind::Barrier, 0, 0, |_| Ok(()))
    }

    /// Copy `chunk` into this rank's slot and announce round `publish_seq + 1`
    fn publish(&self, kind: CollectiveKind, total: usize, chunk: &[u8]) -> ForgeResult<u32> {
        let rank = self.rank();
        let me = self.segment.rank_control(rank);
        let round = me.publish_seq.load(Ordering::Relaxed).wrapping_add(1);
        let previous = round.wrapping_sub(1);

        for peer in (0..self.group_size()).filter(|&p| p != rank) {
            let ctrl = self.segment.rank_control(peer);
            self.wait_for(&ctrl.done_seq, previous, kind, peer)?;
        }

        // SAFETY: all peers are done with the previous round, so nobody reads
        // this slot until the publish below; the op lock is held.
        unsafe { self.segment.own_slot_mut(chunk.len()) }.copy_from_slice(chunk);
        me.op_code.store(kind.code(), Ordering::Relaxed);
        me.payload_len.store(chunk.len() as u64, Ordering::Relaxed);
        me.total_len.store(total as u64, Ordering::Relaxed);
        me.publish_seq.store(round, Ordering::Release);
        futex::wake_all(&me.publish_seq);

        self.stats.record_published(chunk.len());
        tracing::trace!(
            "Rank {} published {} round {} ({} of {} bytes)",
            rank,
            kind,
            round,
            chunk.len(),
            total
        );
        Ok(round)
    }

    /// Wait for every peer's publish of `round`, check it matches, run `read`,
    /// then mark the round done. The round is marked done even on error so
    /// peers are not held back by this rank's slot.
    fn consume<F>(
        &self,
        round: u32,
        kind: CollectiveKind,
        len: usize,
        total: usize,
        read: F,
    ) -> ForgeResult<()>
    where
        F: FnOnce(&Self) -> ForgeResult<()>,
    {
        let result = self
            .await_peers(round, kind, len, total)
            .and_then(|()| read(self));
        self.finish_round(round);
        result
    }

    fn await_peers(
        &self,
        round: u32,
        kind: CollectiveKind,
        len: usize,
        total: usize,
    ) -> ForgeResult<()> {
        let rank = self.rank();
        for peer in (0..self.group_size()).filter(|&p| p != rank) {
            let ctrl = self.segment.rank_control(peer);
            self.wait_for(&ctrl.publish_seq, round, kind, peer)?;

            let code = ctrl.op_code.load(Ordering::Relaxed);
            let peer_len = ctrl.payload_len.load(Ordering::Relaxed) as usize;
            let peer_total = ctrl.total_len.load(Ordering::Relaxed) as usize;
            if code != kind.code() {
                let theirs = CollectiveKind::from_code(code)
                    .map(|k| k.to_string())
                    .unwrap_or_else(|| format!("op code {}", code));
                return Err(ShmForgeError::CollectiveMismatch {
                    peer,
                    detail: format!("round {}: this rank runs {}, peer runs {}", round, kind, theirs),
                });
            }
            if peer_len != len || peer_total != total {
                return Err(ShmForgeError::CollectiveMismatch {
                    peer,
                    detail: format!(
                        "round {} of {}: this rank has {}/{} bytes, peer has {}/{}",
                        round, kind, len, total, peer_len, peer_total
                    ),
                });
            }
        }
        Ok(())
    }

    fn finish_round(&self, round: u32) {
        let me = self.segment.rank_control(self.rank());
        me.done_seq.store(round, Ordering::Release);
        futex::wake_all(&me.done_seq);
        self.stats.record_round();
    }

    /// Block until `word` reaches `target`: spin first, then futex waits
    pub(super) fn wait_for(
        &self,
        word: &AtomicU32,
        target: u32,
        op: CollectiveKind,
        peer: usize,
    ) -> ForgeResult<()> {
        if seq_reached(word.load(Ordering::Acquire), target) {
            return Ok(());
        }
        for _ in 0..self.config.spin_iters {
            std::hint::spin_loop();
            if seq_reached(word.load(Ordering::Acquire), target) {
                return Ok(());
            }
        }

        self.stats.record_slow_wait();
        let start = Instant::now();
        let mut warned = false;
        loop {
            let current = word.load(Ordering::Acquire);
            if seq_reached(current, target) {
                return Ok(());
            }

            let elapsed = start.elapsed();
            let slice = match self.config.wait_timeout {
                Some(limit) if elapsed >= limit => {
                    return Err(ShmForgeError::SynchronizationTimeout {
                        op: op.to_string(),
                        peer,
                        waited_ms: elapsed.as_millis() as u64,
                    });
                }
                Some(limit) => limit - elapsed,
                None => futex::MAX_WAIT_SLICE,
            };

            if !warned && elapsed >= SLOW_WAIT_WARN {
                tracing::warn!(
                    "Rank {} still waiting for rank {} in {} after {:?}",
                    self.rank(),
                    peer,
                    op,
                    elapsed
                );
                warned = true;
            }
            futex::wait(word, current, slice);
        }
    }
}

fn check_outputs(outputs: &[&mut [u8]], group_size: usize, len: usize) -> ForgeResult<()> {
    if outputs.len() != group_size {
        return Err(ShmForgeError::InvalidArgument(format!(
            "gather needs {} output buffers, got {}",
            group_size,
            outputs.len()
        )));
    }
    if let Some(bad) = outputs.iter().find(|o| o.len() != len) {
        return Err(ShmForgeError::SizeMismatch {
            expected: len,
            actual: bad.len(),
        });
    }
    Ok(())
}
