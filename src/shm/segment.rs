//! Named shared-memory segment backed by a file in a tmpfs directory
//!
//! Rank 0 creates the segment: it builds the file under a temporary name,
//! sizes and maps it, writes the header and renames it into place, so other
//! ranks never observe a half-initialized segment. Other ranks poll for the
//! file until it appears with a valid header, then map it and set their bit
//! in the attach mask.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::MetadataExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use memmap2::{Mmap, MmapMut};
use serde::Serialize;

use super::config::ShmConfig;
use super::futex;
use super::layout::{
    ChannelControl, RankControl, SegmentHeader, SegmentLayout, LAYOUT_VERSION, MAGIC,
};
use crate::error::{io_context, ForgeResult, ShmForgeError};
use crate::{attach_error, user_error};

const FILE_PREFIX: &str = "shmforge-";
const MAX_NAME_LEN: usize = 200;
const ATTACH_POLL: Duration = Duration::from_millis(5);

/// Check that `name` can be used as a single path component
pub fn validate_name(name: &str) -> ForgeResult<()> {
    if name.is_empty() {
        return Err(ShmForgeError::InvalidName("name is empty".to_string()));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(ShmForgeError::InvalidName(format!(
            "name is {} bytes, limit is {}",
            name.len(),
            MAX_NAME_LEN
        )));
    }
    if name.starts_with('.') {
        return Err(ShmForgeError::InvalidName(name.to_string()));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(ShmForgeError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Path of the backing file for segment `name`
pub fn segment_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{}{}", FILE_PREFIX, name))
}

/// Why a joiner could not use the file currently at the segment path
enum OpenFailure {
    /// Not there yet, not initialized yet, or left over from a previous run
    Retry(String),
    Fatal(ShmForgeError),
}

/// A mapped segment attached as one rank
pub struct ShmSegment {
    name: String,
    path: PathBuf,
    layout: SegmentLayout,
    rank: usize,
    /// `(dev, ino)` of the file this rank created; only the creator unlinks
    created: Option<(u64, u64)>,
    /// Whether this rank's bit in the attach mask is ours to clear
    attached: bool,
    base: *mut u8,
    _mmap: MmapMut,
    _file: File,
}

// SAFETY: the mapping lives as long as the segment and is never remapped.
// All shared control state is accessed through atomics; slot and channel
// bytes are only touched under the sequence protocol in `ccl`.
unsafe impl Send for ShmSegment {}
unsafe impl Sync for ShmSegment {}

impl std::fmt::Debug for ShmSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShmSegment")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("rank", &self.rank)
            .field("creator", &self.created.is_some())
            .field("total_bytes", &self.layout.total_bytes)
            .finish()
    }
}

impl ShmSegment {
    /// Create the segment as rank 0, replacing any stale file at the path
    ///
    /// # Errors
    /// `SegmentCreationFailed` if the path holds a segment that is still in
    /// use: its creator is alive and at least one rank is attached.
    pub fn create(name: &str, group_size: usize, config: &ShmConfig) -> ForgeResult<Self> {
        validate_name(name)?;
        let layout = SegmentLayout::compute(group_size, config.slot_bytes, config.p2p_bytes)?;

        std::fs::create_dir_all(&config.segment_dir).map_err(|e| {
            ShmForgeError::SegmentCreationFailed(format!(
                "cannot create segment directory {}: {}",
                config.segment_dir.display(),
                e
            ))
        })?;

        let path = segment_path(&config.segment_dir, name);
        let tmp_path = path.with_file_name(format!(
            "{}{}.{}.tmp",
            FILE_PREFIX,
            name,
            std::process::id()
        ));

        tracing::debug!(
            "Creating segment {:?} at {} ({} bytes, group_size={})",
            name,
            path.display(),
            layout.total_bytes,
            group_size
        );

        let result = Self::build_file(&tmp_path, &layout, config);
        let (file, mut mmap) = match result {
            Ok(v) => v,
            Err(e) => {
                let _ = std::fs::remove_file(&tmp_path);
                return Err(e);
            }
        };
        let base = mmap.as_mut_ptr();

        // SAFETY: the mapping is at least one header long and page aligned.
        let header = unsafe { &*(base as *const SegmentHeader) };
        header.version.store(LAYOUT_VERSION, Ordering::Relaxed);
        header.group_size.store(group_size as u32, Ordering::Relaxed);
        header
            .slot_bytes
            .store(layout.slot_bytes as u64, Ordering::Relaxed);
        header
            .p2p_bytes
            .store(layout.p2p_bytes as u64, Ordering::Relaxed);
        header
            .total_bytes
            .store(layout.total_bytes as u64, Ordering::Relaxed);
        header
            .creator_pid
            .store(std::process::id(), Ordering::Relaxed);
        header.magic.store(MAGIC, Ordering::Release);

        if let Err(e) = check_replaceable(&path) {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(e);
        }
        if let Err(e) = std::fs::rename(&tmp_path, &path) {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(ShmForgeError::SegmentCreationFailed(format!(
                "cannot publish {}: {}",
                path.display(),
                e
            )));
        }

        let meta = file
            .metadata()
            .map_err(|e| io_context(e, "reading segment metadata"))?;

        let segment = Self {
            name: name.to_string(),
            path,
            layout,
            rank: 0,
            created: Some((meta.dev(), meta.ino())),
            attached: true,
            base,
            _mmap: mmap,
            _file: file,
        };
        segment.mark_attached();
        Ok(segment)
    }

    fn build_file(
        tmp_path: &Path,
        layout: &SegmentLayout,
        config: &ShmConfig,
    ) -> ForgeResult<(File, MmapMut)> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(tmp_path)
            .map_err(|e| {
                ShmForgeError::SegmentCreationFailed(format!(
                    "cannot create {}: {}",
                    tmp_path.display(),
                    e
                ))
            })?;

        file.set_len(layout.total_bytes as u64)
            .map_err(|e| map_alloc_error(e, layout.total_bytes))?;

        if config.preallocate {
            preallocate(&file, layout.total_bytes)?;
        }

        // SAFETY: the file was just created by this process and sized above;
        // no other process knows its temporary name.
        let mmap = unsafe { MmapMut::map_mut(&file) }.map_err(|e| {
            ShmForgeError::SegmentCreationFailed(format!(
                "cannot map {}: {}",
                tmp_path.display(),
                e
            ))
        })?;

        Ok((file, mmap))
    }

    /// Attach to an existing segment as `rank`, waiting up to
    /// `config.attach_timeout` for rank 0 to create it
    pub fn open(
        name: &str,
        group_size: usize,
        rank: usize,
        config: &ShmConfig,
    ) -> ForgeResult<Self> {
        validate_name(name)?;
        let layout = SegmentLayout::compute(group_size, config.slot_bytes, config.p2p_bytes)?;
        if rank >= group_size {
            return Err(ShmForgeError::InvalidRank {
                rank: rank as i64,
                group_size: group_size as i64,
            });
        }

        let path = segment_path(&config.segment_dir, name);
        let deadline = Instant::now() + config.attach_timeout;
        let mut last_reason = String::from("segment not found");
        let mut logged = false;

        loop {
            match Self::try_open(name, &path, &layout, rank) {
                Ok(segment) => {
                    tracing::debug!(
                        "Rank {} attached to segment {:?} at {}",
                        rank,
                        name,
                        path.display()
                    );
                    return Ok(segment);
                }
                Err(OpenFailure::Fatal(e)) => return Err(e),
                Err(OpenFailure::Retry(reason)) => {
                    if !logged && reason != last_reason {
                        tracing::debug!("Waiting for segment {:?}: {}", name, reason);
                        logged = true;
                    }
                    last_reason = reason;
                }
            }

            if Instant::now() >= deadline {
                return Err(attach_error!(
                    "{} after {} ms: {}",
                    path.display(),
                    config.attach_timeout.as_millis(),
                    last_reason
                ));
            }
            std::thread::sleep(ATTACH_POLL);
        }
    }

    fn try_open(
        name: &str,
        path: &Path,
        layout: &SegmentLayout,
        rank: usize,
    ) -> Result<Self, OpenFailure> {
        let file = match OpenOptions::new().read(true).write(true).open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(OpenFailure::Retry("segment not found".to_string()))
            }
            Err(e) => {
                return Err(OpenFailure::Fatal(attach_error!(
                    "cannot open {}: {}",
                    path.display(),
                    e
                )))
            }
        };

        let len = file
            .metadata()
            .map_err(|e| OpenFailure::Fatal(io_context(e, "reading segment metadata")))?
            .len() as usize;
        if len < std::mem::size_of::<SegmentHeader>() {
            return Err(OpenFailure::Retry(format!("segment file is only {} bytes", len)));
        }

        // SAFETY: the file is a shared segment; every field the mapping exposes
        // as a reference is atomic.
        let mut mmap = unsafe { MmapMut::map_mut(&file) }.map_err(|e| {
            OpenFailure::Fatal(attach_error!("cannot map {}: {}", path.display(), e))
        })?;
        let base = mmap.as_mut_ptr();
        // SAFETY: checked above that the mapping holds a header.
        let header = unsafe { &*(base as *const SegmentHeader) };

        if header.magic.load(Ordering::Acquire) != MAGIC {
            return Err(OpenFailure::Retry("segment header not initialized".to_string()));
        }

        let creator_pid = header.creator_pid.load(Ordering::Relaxed);
        if !process_alive(creator_pid) {
            return Err(OpenFailure::Retry(format!(
                "segment was created by exited process {}",
                creator_pid
            )));
        }

        check_header(header, layout, len).map_err(OpenFailure::Fatal)?;

        let mut segment = Self {
            name: name.to_string(),
            path: path.to_path_buf(),
            layout: *layout,
            rank,
            created: None,
            attached: false,
            base,
            _mmap: mmap,
            _file: file,
        };

        let bit = 1u64 << rank;
        let prev = segment.header().attached_mask.fetch_or(bit, Ordering::AcqRel);
        if prev & bit != 0 {
            // Either this rank is live elsewhere or a previous run crashed
            // without detaching; the bit belongs to that attachment.
            return Err(OpenFailure::Retry(format!(
                "rank {} is already attached (stale segment)",
                rank
            )));
        }
        segment.attached = true;
        segment.announce_attach();
        Ok(segment)
    }

    fn mark_attached(&self) {
        self.header()
            .attached_mask
            .fetch_or(1u64 << self.rank, Ordering::AcqRel);
        self.announce_attach();
    }

    fn announce_attach(&self) {
        let header = self.header();
        header
            .joined_mask
            .fetch_or(1u64 << self.rank, Ordering::AcqRel);
        header.attach_events.fetch_add(1, Ordering::AcqRel);
        futex::wake_all(&header.attach_events);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn group_size(&self) -> usize {
        self.layout.group_size
    }

    pub fn layout(&self) -> &SegmentLayout {
        &self.layout
    }

    pub fn is_creator(&self) -> bool {
        self.created.is_some()
    }

    pub fn header(&self) -> &SegmentHeader {
        // SAFETY: the header sits at offset 0 of a mapping of at least
        // `total_bytes`; all its fields are atomics.
        unsafe { &*(self.base as *const SegmentHeader) }
    }

    pub fn rank_control(&self, rank: usize) -> &RankControl {
        let offset = self.layout.rank_control_offset(rank);
        // SAFETY: offset is in bounds and 64-byte aligned; fields are atomics.
        unsafe { &*(self.base.add(offset) as *const RankControl) }
    }

    pub fn channel_control(&self, src: usize, dst: usize) -> &ChannelControl {
        let offset = self.layout.channel_control_offset(src, dst);
        // SAFETY: offset is in bounds and 64-byte aligned; fields are atomics.
        unsafe { &*(self.base.add(offset) as *const ChannelControl) }
    }

    /// Bitmask of attached ranks
    pub fn attached_mask(&self) -> u64 {
        self.header().attached_mask.load(Ordering::Acquire)
    }

    /// Number of attached ranks
    pub fn attached_count(&self) -> usize {
        self.attached_mask().count_ones() as usize
    }

    /// Bitmask of ranks that have attached at some point, including ranks
    /// that have since detached
    pub fn joined_mask(&self) -> u64 {
        self.header().joined_mask.load(Ordering::Acquire)
    }

    /// The first `len` bytes of `rank`'s collective slot
    ///
    /// # Safety
    /// No other rank may write that slot while the slice is alive. For a
    /// peer's slot this holds between observing its publish for a round and
    /// marking that round done.
    pub unsafe fn slot(&self, rank: usize, len: usize) -> &[u8] {
        assert!(len <= self.layout.slot_bytes);
        std::slice::from_raw_parts(self.base.add(self.layout.slot_offset(rank)), len)
    }

    /// Mutable view of this rank's own slot
    ///
    /// # Safety
    /// Every peer must have marked the previous round done, and the caller
    /// must hold the only live view of the slot.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn own_slot_mut(&self, len: usize) -> &mut [u8] {
        assert!(len <= self.layout.slot_bytes);
        std::slice::from_raw_parts_mut(self.base.add(self.layout.slot_offset(self.rank)), len)
    }

    /// The first `len` bytes of the `(src, dst)` channel buffer
    ///
    /// # Safety
    /// The sender must have published a chunk that the caller has not yet
    /// acknowledged.
    pub unsafe fn channel(&self, src: usize, dst: usize, len: usize) -> &[u8] {
        assert!(len <= self.layout.p2p_bytes);
        std::slice::from_raw_parts(self.base.add(self.layout.channel_offset(src, dst)), len)
    }

    /// Mutable view of an outgoing channel buffer of this rank
    ///
    /// # Safety
    /// The receiver must have acknowledged every chunk sent so far, and the
    /// caller must hold the only live view of the channel.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn channel_mut(&self, dst: usize, len: usize) -> &mut [u8] {
        assert!(len <= self.layout.p2p_bytes);
        std::slice::from_raw_parts_mut(
            self.base.add(self.layout.channel_offset(self.rank, dst)),
            len,
        )
    }

    /// Whether the segment path still refers to the file this rank created
    fn path_is_ours(&self) -> bool {
        match (self.created, std::fs::metadata(&self.path)) {
            (Some((dev, ino)), Ok(meta)) => meta.dev() == dev && meta.ino() == ino,
            _ => false,
        }
    }
}

impl Drop for ShmSegment {
    fn drop(&mut self) {
        if self.attached {
            self.header()
                .attached_mask
                .fetch_and(!(1u64 << self.rank), Ordering::AcqRel);
        }

        if self.path_is_ours() {
            match std::fs::remove_file(&self.path) {
                Ok(()) => tracing::debug!("Removed segment file {}", self.path.display()),
                Err(e) => tracing::warn!(
                    "Failed to remove segment file {}: {}",
                    self.path.display(),
                    e
                ),
            }
        }
    }
}

fn check_header(header: &SegmentHeader, layout: &SegmentLayout, len: usize) -> ForgeResult<()> {
    let version = header.version.load(Ordering::Relaxed);
    if version != LAYOUT_VERSION {
        return Err(ShmForgeError::IncompatibleSegment(format!(
            "layout version {} (expected {})",
            version, LAYOUT_VERSION
        )));
    }

    let group_size = header.group_size.load(Ordering::Relaxed) as usize;
    if group_size != layout.group_size {
        return Err(user_error!(
            "segment was created for group_size {}, joiner expects {}",
            group_size,
            layout.group_size
        ));
    }

    let slot_bytes = header.slot_bytes.load(Ordering::Relaxed) as usize;
    let p2p_bytes = header.p2p_bytes.load(Ordering::Relaxed) as usize;
    let total_bytes = header.total_bytes.load(Ordering::Relaxed) as usize;
    if slot_bytes != layout.slot_bytes
        || p2p_bytes != layout.p2p_bytes
        || total_bytes != layout.total_bytes
    {
        return Err(ShmForgeError::IncompatibleSegment(format!(
            "slot_bytes={} p2p_bytes={} total_bytes={}, expected {}/{}/{}",
            slot_bytes,
            p2p_bytes,
            total_bytes,
            layout.slot_bytes,
            layout.p2p_bytes,
            layout.total_bytes
        )));
    }
    if len < total_bytes {
        return Err(ShmForgeError::IncompatibleSegment(format!(
            "file is {} bytes, header says {}",
            len, total_bytes
        )));
    }
    Ok(())
}

/// Refuse to replace a segment that a live group is still using
///
/// A file is stale when it never finished initializing, its creator has
/// exited, or no rank is attached to it anymore.
fn check_replaceable(path: &Path) -> ForgeResult<()> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => {
            return Err(ShmForgeError::SegmentCreationFailed(format!(
                "cannot check existing {}: {}",
                path.display(),
                e
            )))
        }
    };
    let len = file
        .metadata()
        .map_err(|e| io_context(e, "reading existing segment metadata"))?
        .len() as usize;
    if len < std::mem::size_of::<SegmentHeader>() {
        tracing::warn!("Replacing truncated segment file {}", path.display());
        return Ok(());
    }

    // SAFETY: read-only mapping; the header is only read through atomics.
    let mmap = unsafe { Mmap::map(&file) }
        .map_err(|e| io_context(e, &format!("mapping {}", path.display())))?;
    // SAFETY: length checked above; mappings are page aligned.
    let header = unsafe { &*(mmap.as_ptr() as *const SegmentHeader) };

    if header.magic.load(Ordering::Acquire) != MAGIC {
        tracing::warn!("Replacing uninitialized segment file {}", path.display());
        return Ok(());
    }
    let creator_pid = header.creator_pid.load(Ordering::Relaxed);
    let attached = header.attached_mask.load(Ordering::Acquire);
    if process_alive(creator_pid) && attached != 0 {
        return Err(ShmForgeError::SegmentCreationFailed(format!(
            "{} is in use by a group of {} created by live process {} (attached mask {:#x})",
            path.display(),
            header.group_size.load(Ordering::Relaxed),
            creator_pid,
            attached
        )));
    }

    tracing::warn!(
        "Replacing stale segment file {} (creator {}, attached mask {:#x})",
        path.display(),
        creator_pid,
        attached
    );
    Ok(())
}

fn map_alloc_error(err: std::io::Error, bytes: usize) -> ShmForgeError {
    match err.raw_os_error() {
        Some(libc::ENOSPC) | Some(libc::EDQUOT) => ShmForgeError::QuotaExceeded(format!(
            "cannot reserve {} bytes: {}",
            bytes, err
        )),
        _ => ShmForgeError::SegmentCreationFailed(format!("cannot size segment: {}", err)),
    }
}

#[cfg(target_os = "linux")]
fn preallocate(file: &File, bytes: usize) -> ForgeResult<()> {
    // SAFETY: the descriptor is owned by `file` and open for writing.
    let rc = unsafe { libc::posix_fallocate(file.as_raw_fd(), 0, bytes as libc::off_t) };
    match rc {
        0 => Ok(()),
        libc::ENOSPC | libc::EDQUOT => Err(ShmForgeError::QuotaExceeded(format!(
            "cannot reserve {} bytes of shared memory: {}",
            bytes,
            std::io::Error::from_raw_os_error(rc)
        ))),
        _ => {
            tracing::warn!(
                "posix_fallocate unavailable for segment ({}); continuing without reservation",
                std::io::Error::from_raw_os_error(rc)
            );
            Ok(())
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn preallocate(file: &File, _bytes: usize) -> ForgeResult<()> {
    let _ = file.as_raw_fd();
    Ok(())
}

fn process_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    if pid == std::process::id() {
        return true;
    }
    // SAFETY: signal 0 performs only the existence and permission check.
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Snapshot of a segment header, for inspection tools
#[derive(Debug, Clone, Serialize)]
pub struct SegmentInfo {
    pub path: PathBuf,
    pub file_bytes: u64,
    pub initialized: bool,
    pub version: u32,
    pub group_size: u32,
    pub slot_bytes: u64,
    pub p2p_bytes: u64,
    pub total_bytes: u64,
    pub creator_pid: u32,
    pub creator_alive: bool,
    pub attached_ranks: Vec<usize>,
    pub joined_ranks: Vec<usize>,
}

/// Read the header of the segment file at `path` without attaching
pub fn inspect(path: &Path) -> ForgeResult<SegmentInfo> {
    let file = File::open(path).map_err(|e| io_context(e, &format!("opening {}", path.display())))?;
    let file_bytes = file
        .metadata()
        .map_err(|e| io_context(e, "reading segment metadata"))?
        .len();
    if (file_bytes as usize) < std::mem::size_of::<SegmentHeader>() {
        return Err(ShmForgeError::IncompatibleSegment(format!(
            "{} is only {} bytes",
            path.display(),
            file_bytes
        )));
    }

    // SAFETY: read-only mapping; the header is only read through atomics.
    let mmap = unsafe { Mmap::map(&file) }
        .map_err(|e| io_context(e, &format!("mapping {}", path.display())))?;
    // SAFETY: length checked above; mappings are page aligned.
    let header = unsafe { &*(mmap.as_ptr() as *const SegmentHeader) };

    let mask = header.attached_mask.load(Ordering::Acquire);
    let joined = header.joined_mask.load(Ordering::Acquire);
    let creator_pid = header.creator_pid.load(Ordering::Relaxed);
    Ok(SegmentInfo {
        path: path.to_path_buf(),
        file_bytes,
        initialized: header.magic.load(Ordering::Acquire) == MAGIC,
        version: header.version.load(Ordering::Relaxed),
        group_size: header.group_size.load(Ordering::Relaxed),
        slot_bytes: header.slot_bytes.load(Ordering::Relaxed),
        p2p_bytes: header.p2p_bytes.load(Ordering::Relaxed),
        total_bytes: header.total_bytes.load(Ordering::Relaxed),
        creator_pid,
        creator_alive: process_alive(creator_pid),
        attached_ranks: (0..64).filter(|r| mask & (1u64 << r) != 0).collect(),
        joined_ranks: (0..64).filter(|r| joined & (1u64 << r) != 0).collect(),
    })
}
