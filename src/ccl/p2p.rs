//! Point-to-point tensor-list transfer over the `(src, dst)` channels
//!
//! Each ordered pair of ranks owns one channel buffer and control block,
//! disjoint from the collective slots. A message is the encoded tensor list,
//! sent in channel-sized chunks. The sender waits for the receiver to
//! acknowledge the previous chunk before overwriting the buffer, and returns
//! once the last chunk is written.

use std::sync::atomic::Ordering;

use crate::error::{ForgeResult, ShmForgeError};
use crate::shm::futex;
use crate::tensor::HostTensor;

use super::codec::{decode_tensor_list, encode_tensor_list};
use super::manager::ShmManager;
use super::stats::CollectiveKind;

impl ShmManager {
    /// Send `tensors` to rank `dst`, preserving order, dtype and shape
    pub fn send_tensor_list(&self, tensors: &[HostTensor], dst: usize) -> ForgeResult<()> {
        self.check_peer(dst)?;
        let message = encode_tensor_list(tensors)?;

        let _guard = self.lock()?;
        self.stats_ref().record_call(CollectiveKind::Send);

        let rank = self.rank();
        let capacity = self.segment().layout().p2p_bytes;
        let ctrl = self.segment().channel_control(rank, dst);

        for chunk in message.chunks(capacity) {
            let seq = ctrl.send_seq.load(Ordering::Relaxed);
            self.wait_for(&ctrl.ack_seq, seq, CollectiveKind::Send, dst)?;

            // SAFETY: the receiver acknowledged every chunk sent so far and
            // only this rank writes its outgoing channels; the op lock is held.
            unsafe { self.segment().channel_mut(dst, chunk.len()) }.copy_from_slice(chunk);
            ctrl.chunk_len.store(chunk.len() as u64, Ordering::Relaxed);
            ctrl.message_len
                .store(message.len() as u64, Ordering::Relaxed);
            ctrl.send_seq.store(seq.wrapping_add(1), Ordering::Release);
            futex::wake_all(&ctrl.send_seq);

            self.stats_ref().record_published(chunk.len());
        }

        tracing::trace!(
            "Rank {} sent {} tensors ({} bytes) to rank {}",
            rank,
            tensors.len(),
            message.len(),
            dst
        );
        Ok(())
    }

    /// Receive the next tensor list sent by rank `src`
    pub fn recv_tensor_list(&self, src: usize) -> ForgeResult<Vec<HostTensor>> {
        self.check_peer(src)?;

        let _guard = self.lock()?;
        self.stats_ref().record_call(CollectiveKind::Recv);

        let rank = self.rank();
        let capacity = self.segment().layout().p2p_bytes;
        let ctrl = self.segment().channel_control(src, rank);

        let mut message: Vec<u8> = Vec::new();
        let mut expected: Option<usize> = None;
        loop {
            let next = ctrl.ack_seq.load(Ordering::Relaxed).wrapping_add(1);
            self.wait_for(&ctrl.send_seq, next, CollectiveKind::Recv, src)?;

            let len = ctrl.chunk_len.load(Ordering::Relaxed) as usize;
            let total = ctrl.message_len.load(Ordering::Relaxed) as usize;
            match expected {
                None => {
                    expected = Some(total);
                    message.reserve_exact(total);
                }
                Some(e) if e != total => {
                    return Err(ShmForgeError::MalformedMessage(format!(
                        "message length changed from {} to {} mid-transfer",
                        e, total
                    )));
                }
                Some(_) => {}
            }
            if len == 0 || len > capacity || message.len() + len > total {
                return Err(ShmForgeError::MalformedMessage(format!(
                    "chunk of {} bytes after {} of {} (channel holds {})",
                    len,
                    message.len(),
                    total,
                    capacity
                )));
            }

            // SAFETY: the sender published this chunk and will not touch the
            // buffer again until it is acknowledged below.
            message.extend_from_slice(unsafe { self.segment().channel(src, rank, len) });
            ctrl.ack_seq.store(next, Ordering::Release);
            futex::wake_all(&ctrl.ack_seq);
            self.stats_ref().record_consumed(len);

            if message.len() == total {
                break;
            }
        }

        let tensors = decode_tensor_list(&message)?;
        tracing::trace!(
            "Rank {} received {} tensors ({} bytes) from rank {}",
            rank,
            tensors.len(),
            message.len(),
            src
        );
        Ok(tensors)
    }

    fn check_peer(&self, peer: usize) -> ForgeResult<()> {
        if peer >= self.group_size() {
            return Err(ShmForgeError::InvalidRank {
                rank: peer as i64,
                group_size: self.group_size() as i64,
            });
        }
        if peer == self.rank() {
            return Err(ShmForgeError::InvalidArgument(format!(
                "rank {} cannot send to or receive from itself",
                peer
            )));
        }
        Ok(())
    }
}
