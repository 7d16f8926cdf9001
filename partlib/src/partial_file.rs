//! A file that can be read and written at the same time.
//!
//! The file is preallocated contiguously, so its byte offsets map directly to
//! sectors on the drive, and the write path bypasses the filesystem and sends
//! whole sectors to the block device. Because of that the file itself tracks
//! which parts of it hold valid data: up to two independent parts, the "head"
//! anchored at offset 0 and the "tail" gradually growing towards the end of
//! the file. Every write must extend one of the two; when they meet they
//! merge and the file is complete. Readers keep using the ordinary
//! filesystem interface and consult [`PartialFile::get_state`] to learn what
//! is safe to read.

use std::{
    fmt,
    io,
    path::Path,
    sync::{
        atomic::{AtomicBool, AtomicI32, Ordering},
        Arc, Mutex,
    },
};

use log::{debug, error, warn};
use thiserror::Error;

use crate::sector_pool::{SectorPool, POOL_SLOTS};
use crate::volume::{
    BlockDev, ContiguousFile, IdentityLock, LunNbr, SectorBuf, SectorNbr, StorageError, Volume,
    WriteRequest, SECTOR_SIZE,
};

/// One contiguous run of bytes known to be fully written to the drive.
/// Half-open: `start` is in the part, `end` is not.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ValidPart {
    pub start: u64,
    pub end: u64,
}

impl ValidPart {
    /// Grow this part to cover `other`, provided the two touch or overlap.
    /// Disjoint parts leave `self` alone.
    pub fn merge(&mut self, other: &ValidPart) {
        // this:  oooox
        // other:     oooox
        if other.start <= self.end && other.end > self.end {
            self.end = other.end;
        }
        // this:       oooox
        // other:  oooox
        if other.start < self.start && other.end >= self.start {
            self.start = other.start;
        }
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// The integrity view of a partial file: which byte ranges hold valid data.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct State {
    /// Valid part starting at offset 0, if any.
    pub valid_head: Option<ValidPart>,
    /// Valid part ending at `total_size`, or still growing towards it.
    pub valid_tail: Option<ValidPart>,
    pub total_size: u64,
}

impl State {
    pub fn new(total_size: u64) -> Self {
        Self {
            valid_head: None,
            valid_tail: None,
            total_size,
        }
    }

    /// Number of valid bytes, counting the head/tail overlap only once.
    pub fn get_valid_size(&self) -> u64 {
        let head = self.valid_head.map_or(0, |p| p.len());
        let tail = self.valid_tail.map_or(0, |p| p.len());
        let overlap = match (self.valid_head, self.valid_tail) {
            (Some(h), Some(t)) if h.end > t.start => h.end - t.start,
            _ => 0,
        };
        head + tail - overlap
    }

    pub fn get_percent_valid(&self) -> u32 {
        if self.total_size == 0 {
            0
        } else {
            (self.get_valid_size() as f64 * 100.0 / self.total_size as f64) as u32
        }
    }

    pub fn is_complete(&self) -> bool {
        self.get_valid_size() == self.total_size
    }

    /// Is `[0, bytes)` fully valid?
    pub fn has_valid_head(&self, bytes: u64) -> bool {
        matches!(self.valid_head, Some(head) if head.start == 0 && head.end >= bytes)
    }

    /// Is `[total_size - bytes, total_size)` fully valid?
    pub fn has_valid_tail(&self, bytes: u64) -> bool {
        matches!(self.valid_tail, Some(tail)
            if tail.start <= self.total_size.saturating_sub(bytes) && tail.end == self.total_size)
    }

    /// Fold a freshly written part into the head and/or tail.
    ///
    /// A part that extends neither (a third independent region) is silently
    /// dropped; the download order policies never produce one.
    pub(crate) fn extend(&mut self, new_part: ValidPart) {
        if let Some(head) = &mut self.valid_head {
            head.merge(&new_part);
        } else if new_part.start == 0 {
            self.valid_head = Some(new_part);
        }
        let head_end = self.valid_head.map_or(0, |p| p.end);

        if let Some(tail) = &mut self.valid_tail {
            tail.merge(&new_part);
        } else if new_part.start > head_end {
            self.valid_tail = Some(new_part);
        }

        // head spread all the way to the end?
        if let Some(head) = self.valid_head {
            if head.end == self.total_size {
                self.valid_tail = Some(head);
            }
        }

        // head met the tail?
        if let (Some(mut head), Some(mut tail)) = (self.valid_head, self.valid_tail) {
            head.merge(&tail);
            tail.merge(&head);
            self.valid_head = Some(head);
            self.valid_tail = Some(tail);
        }
    }
}

/// Failure modes of the sector write path.
#[derive(Clone, Copy, Debug, Error, Eq, PartialEq)]
pub enum WriteError {
    #[error("a previous sector write failed")]
    Latched,
    #[error("write past the end of the file")]
    PastEnd,
    #[error("timed out waiting for a free sector buffer")]
    PoolTimeout,
    #[error("file is no longer in place")]
    LockLost,
    #[error("failed to submit sector write")]
    Submit,
}

struct Sector {
    slot: usize,
    nbr: SectorNbr,
    data: SectorBuf,
}

struct Cursor {
    current: Option<Sector>,
    offset: u64,
}

/// Shared with the in-flight write requests; completion callbacks run against
/// this from the device's writer thread.
struct Core {
    lun: LunNbr,
    first_sector: SectorNbr,
    total_size: u64,
    dev: Arc<dyn BlockDev>,
    lock: Box<dyn IdentityLock>,
    pool: SectorPool,
    state: Mutex<State>,
    write_error: AtomicBool,
    /// What each in-flight slot will add to the valid ranges when its write
    /// completes. Written before submission, consumed by the completion
    /// callback; the submit/complete hand-off orders the two.
    future_extend: Mutex<[Option<ValidPart>; POOL_SLOTS]>,
    last_progress_percent: AtomicI32,
}

pub struct PartialFile {
    core: Arc<Core>,
    cursor: tokio::sync::Mutex<Cursor>,
}

impl fmt::Debug for PartialFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartialFile")
            .field("lun", &self.core.lun)
            .field("first_sector", &self.core.first_sector)
            .field("total_size", &self.core.total_size)
            .finish()
    }
}

impl PartialFile {
    /// Try to create a new partial file of preallocated size.
    pub fn create(
        volume: &dyn Volume,
        path: &Path,
        size: u64,
    ) -> Result<Arc<PartialFile>, StorageError> {
        let file = volume.preallocate(path, size)?;
        Ok(Self::from_contiguous(file, State::default()))
    }

    /// Open an existing partial file, for recovery.
    ///
    /// `state.total_size` is updated according to what is found on the disk.
    pub fn open(
        volume: &dyn Volume,
        path: &Path,
        state: State,
    ) -> Result<Arc<PartialFile>, StorageError> {
        let file = volume.reopen(path)?;
        Ok(Self::from_contiguous(file, state))
    }

    fn from_contiguous(file: ContiguousFile, mut state: State) -> Arc<PartialFile> {
        state.total_size = file.size;

        Arc::new(PartialFile {
            core: Arc::new(Core {
                lun: file.lun,
                first_sector: file.first_sector,
                total_size: file.size,
                dev: file.dev,
                lock: file.lock,
                pool: SectorPool::new(),
                state: Mutex::new(state),
                write_error: AtomicBool::new(false),
                future_extend: Mutex::new([None; POOL_SLOTS]),
                last_progress_percent: AtomicI32::new(-1),
            }),
            cursor: tokio::sync::Mutex::new(Cursor {
                current: None,
                offset: 0,
            }),
        })
    }

    /// Final size of the file once the transfer completes.
    pub fn final_size(&self) -> u64 {
        self.core.total_size
    }

    pub fn get_state(&self) -> State {
        *self.core.state.lock().unwrap()
    }

    pub fn get_valid_head(&self) -> Option<ValidPart> {
        self.get_state().valid_head
    }

    pub fn get_valid_tail(&self) -> Option<ValidPart> {
        self.get_state().valid_tail
    }

    pub fn has_valid_head(&self, bytes: u64) -> bool {
        self.get_state().has_valid_head(bytes)
    }

    pub fn has_valid_tail(&self, bytes: u64) -> bool {
        self.get_state().has_valid_tail(bytes)
    }

    /// Seek to a given offset within the file. Only sector-aligned jumps to a
    /// currently appending edge make sense; seeking away from a sector whose
    /// buffer has not been dispatched discards the buffered data.
    pub async fn seek(&self, offset: u64) {
        let mut cursor = self.cursor.lock().await;
        self.seek_locked(&mut cursor, offset);
    }

    fn seek_locked(&self, cursor: &mut Cursor, offset: u64) {
        let new_sector = self.core.sector_nbr(offset);

        if let Some(current) = &cursor.current {
            if current.nbr != new_sector {
                warn!("Discarding buffered data for sector {}", current.nbr);
                self.discard_locked(cursor);
            }
        }

        cursor.offset = offset;
    }

    fn discard_locked(&self, cursor: &mut Cursor) {
        if let Some(sector) = cursor.current.take() {
            self.core.pool.release(sector.slot, sector.data);
        }
    }

    /// Write data at the current offset, filling the current sector and
    /// dispatching it to the device whenever it becomes full.
    pub async fn write(&self, mut data: &[u8]) -> Result<(), WriteError> {
        if self.core.write_error.load(Ordering::Relaxed) {
            return Err(WriteError::Latched);
        }

        let mut cursor = self.cursor.lock().await;

        while !data.is_empty() {
            // open a new sector buffer if needed
            if cursor.current.is_none() {
                if cursor.offset >= self.core.total_size {
                    error!("Write past end of file attempted");
                    return Err(WriteError::PastEnd);
                }
                let nbr = self.core.sector_nbr(cursor.offset);
                let (slot, buf) = self
                    .core
                    .pool
                    .acquire()
                    .await
                    .ok_or(WriteError::PoolTimeout)?;
                cursor.current = Some(Sector {
                    slot,
                    nbr,
                    data: buf,
                });
            }

            // fill the sector buffer
            let sector_offset = (cursor.offset % SECTOR_SIZE as u64) as usize;
            let write_size = data.len().min(SECTOR_SIZE - sector_offset);
            let next_offset = cursor.offset + write_size as u64;
            assert!(
                next_offset <= self.core.total_size,
                "write past the end of the file"
            );
            let sector = cursor.current.as_mut().unwrap();
            sector.data[sector_offset..sector_offset + write_size]
                .copy_from_slice(&data[..write_size]);
            debug!(
                "Writing {} bytes to sector {} at offset {}",
                write_size, sector.nbr, sector_offset
            );

            // dispatch once the write reaches the end of the sector
            if self.core.sector_nbr(next_offset) != sector.nbr {
                self.dispatch_current(&mut cursor)?;
            }

            self.seek_locked(&mut cursor, next_offset);
            data = &data[write_size..];
        }

        Ok(())
    }

    /// Hand the current sector over to the device. On the identity-poke
    /// failure the sector stays buffered; on submission failure the error is
    /// latched.
    fn dispatch_current(&self, cursor: &mut Cursor) -> Result<(), WriteError> {
        let sector = cursor.current.take().unwrap();

        // Between creating this file and now, the drive may have been swapped
        // for another one. We write behind the filesystem's back, so that
        // would corrupt whatever the new drive keeps in these sectors; the
        // identity lock is our tripwire for it.
        if !self.core.lock.poke() {
            error!("Partial file no longer in place, sector {} not sent", sector.nbr);
            cursor.current = Some(sector);
            return Err(WriteError::LockLost);
        }

        let start = self.core.offset_of(sector.nbr);
        let end = (start + SECTOR_SIZE as u64).min(self.core.total_size);
        self.core.future_extend.lock().unwrap()[sector.slot] =
            Some(ValidPart { start, end });

        debug!("Sending sector {} to LUN {}", sector.nbr, self.core.lun);

        let core = Arc::clone(&self.core);
        let slot = sector.slot;
        let request = WriteRequest {
            lun: self.core.lun,
            sector_nbr: sector.nbr,
            data: sector.data,
            done: Box::new(move |result, buf| core.write_finished(result, slot, buf)),
        };

        if let Err(e) = self.core.dev.submit(request) {
            error!("Failed to submit sector write: {}", e);
            self.core.write_error.store(true, Ordering::Relaxed);
            return Err(WriteError::Submit);
        }

        Ok(())
    }

    /// Flush the current sector to the drive without closing it for further
    /// writes, then wait for the queue to drain.
    ///
    /// The partially filled sector is duplicated into a fresh slot and the
    /// original is dispatched; the copy stays open so subsequent writes keep
    /// filling it. Returns whether everything made it to the drive.
    pub async fn sync(&self) -> bool {
        let mut cursor = self.cursor.lock().await;
        let mut avoid = 0;

        if let Some(current) = &cursor.current {
            avoid = 1;
            let Some((slot, mut buf)) = self.core.pool.acquire().await else {
                return false;
            };
            buf.copy_from_slice(&current.data[..]);
            let copy = Sector {
                slot,
                nbr: current.nbr,
                data: buf,
            };

            match self.dispatch_current(&mut cursor) {
                Ok(()) => cursor.current = Some(copy),
                Err(_) => {
                    self.core.pool.release(copy.slot, copy.data);
                    error!("Failed to write sector");
                    return false;
                }
            }
        }

        if !self.core.pool.sync(avoid, false).await {
            return false;
        }

        !self.core.write_error.load(Ordering::Relaxed)
    }

    /// Throw away the failed state after an aborted attempt: discard the
    /// buffered sector, wait out all in-flight writes and clear the latch.
    pub async fn reset_error(&self) {
        let mut cursor = self.cursor.lock().await;
        self.discard_locked(&mut cursor);
        self.core.pool.sync(0, true).await;
        self.core.write_error.store(false, Ordering::Relaxed);
    }

    /// Discard the buffered sector and wait for all in-flight writes to
    /// finish. Call before letting go of the file so the identity lock
    /// outlives every submitted sector.
    pub async fn drain(&self) {
        let mut cursor = self.cursor.lock().await;
        self.discard_locked(&mut cursor);
        self.core.pool.sync(0, true).await;
    }
}

impl Core {
    /// Translate a file offset to a sector number. An offset at or past
    /// `total_size` maps one sector further so a final short sector still
    /// counts as crossed when the write reaches the end of the file.
    fn sector_nbr(&self, offset: u64) -> SectorNbr {
        let mut sector = self.first_sector + (offset / SECTOR_SIZE as u64) as SectorNbr;
        if offset >= self.total_size {
            sector += 1;
        }
        sector
    }

    /// Translate a sector number back to its first byte's file offset.
    fn offset_of(&self, sector_nbr: SectorNbr) -> u64 {
        (sector_nbr - self.first_sector) as u64 * SECTOR_SIZE as u64
    }

    fn write_finished(&self, result: io::Result<()>, slot: usize, buf: SectorBuf) {
        match result {
            Ok(()) if !self.write_error.load(Ordering::Relaxed) => {
                // The slot can't be reacquired before the release below, so
                // the entry is still ours.
                if let Some(part) = self.future_extend.lock().unwrap()[slot].take() {
                    self.extend_valid_part(part);
                }
            }
            Ok(()) => {}
            Err(e) => {
                error!("Failed to write sector: {}", e);
                self.write_error.store(true, Ordering::Relaxed);
            }
        }

        self.pool.release(slot, buf);
    }

    fn extend_valid_part(&self, part: ValidPart) {
        let mut state = self.state.lock().unwrap();
        state.extend(part);

        let percent = state.get_percent_valid() as i32;
        if self.last_progress_percent.swap(percent, Ordering::Relaxed) != percent {
            debug!(
                "Valid: {}% of {} bytes ({} valid)",
                percent,
                state.total_size,
                state.get_valid_size()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::testing::MemVolume;
    use crate::volume::SECTOR_SIZE;

    const SS: u64 = SECTOR_SIZE as u64;

    fn part(start: u64, end: u64) -> ValidPart {
        ValidPart { start, end }
    }

    #[test]
    fn test_merge() {
        // touching and overlapping on the right
        let mut p = part(0, 4);
        p.merge(&part(4, 8));
        assert_eq!(p, part(0, 8));
        p.merge(&part(6, 10));
        assert_eq!(p, part(0, 10));

        // touching and overlapping on the left
        let mut p = part(8, 12);
        p.merge(&part(4, 8));
        assert_eq!(p, part(4, 12));
        p.merge(&part(0, 5));
        assert_eq!(p, part(0, 12));

        // disjoint parts leave it alone
        let mut p = part(4, 8);
        p.merge(&part(10, 12));
        assert_eq!(p, part(4, 8));
        p.merge(&part(0, 3));
        assert_eq!(p, part(4, 8));

        // merge is commutative for touching pairs
        let (mut a, mut b) = (part(0, 4), part(4, 8));
        a.merge(&part(4, 8));
        b.merge(&part(0, 4));
        assert_eq!(a, b);

        // fully contained part is a no-op
        let mut p = part(0, 10);
        p.merge(&part(2, 5));
        assert_eq!(p, part(0, 10));
    }

    #[test]
    fn test_state_extend() {
        let mut state = State::new(100);

        // a part not anchored at 0 and disjoint from nothing becomes the tail
        state.extend(part(50, 60));
        assert_eq!(state.valid_head, None);
        assert_eq!(state.valid_tail, Some(part(50, 60)));

        // a part at 0 becomes the head
        state.extend(part(0, 10));
        assert_eq!(state.valid_head, Some(part(0, 10)));
        assert_eq!(state.valid_tail, Some(part(50, 60)));
        assert_eq!(state.get_valid_size(), 20);

        // growing the head towards the tail
        state.extend(part(10, 50));
        assert_eq!(state.valid_head, Some(part(0, 60)));
        assert_eq!(state.valid_tail, Some(part(0, 60)));

        // and to the end
        state.extend(part(60, 100));
        assert_eq!(state.valid_head, Some(part(0, 100)));
        assert_eq!(state.valid_tail, Some(part(0, 100)));
        assert!(state.is_complete());
        assert_eq!(state.get_percent_valid(), 100);
    }

    #[test]
    fn test_state_head_reaching_end_becomes_tail() {
        let mut state = State::new(100);

        state.extend(part(0, 60));
        assert_eq!(state.valid_tail, None);

        state.extend(part(60, 100));
        assert_eq!(state.valid_head, Some(part(0, 100)));
        assert_eq!(state.valid_tail, Some(part(0, 100)));
    }

    #[test]
    fn test_state_valid_size_overlap() {
        let state = State {
            valid_head: Some(part(0, 60)),
            valid_tail: Some(part(40, 100)),
            total_size: 100,
        };
        assert_eq!(state.get_valid_size(), 100);
        assert!(state.is_complete());
    }

    #[test]
    fn test_state_head_tail_checks() {
        let state = State {
            valid_head: Some(part(0, 30)),
            valid_tail: Some(part(80, 100)),
            total_size: 100,
        };

        assert!(state.has_valid_head(0));
        assert!(state.has_valid_head(30));
        assert!(!state.has_valid_head(31));

        assert!(state.has_valid_tail(20));
        assert!(!state.has_valid_tail(21));

        let no_tail = State {
            valid_tail: Some(part(80, 99)),
            ..state
        };
        assert!(!no_tail.has_valid_tail(10));
    }

    #[tokio::test]
    async fn test_sector_mapping() {
        let volume = MemVolume::new();
        let total = 2 * SS + 100;
        let file = PartialFile::create(&volume, "/a.bin".as_ref(), total).unwrap();

        assert_eq!(file.core.sector_nbr(0), 0);
        assert_eq!(file.core.sector_nbr(SS - 1), 0);
        assert_eq!(file.core.sector_nbr(SS), 1);
        assert_eq!(file.core.sector_nbr(2 * SS + 99), 2);
        // end of file maps past the last sector so a short sector flushes
        assert_eq!(file.core.sector_nbr(total), 3);

        for n in 0..3 {
            assert_eq!(file.core.offset_of(file.core.sector_nbr(n * SS)), n * SS);
        }

        // monotonic in the offset
        let mut last = 0;
        for offset in (0..=total).step_by(64) {
            let sector = file.core.sector_nbr(offset);
            assert!(sector >= last);
            last = sector;
        }
    }

    #[tokio::test]
    async fn test_linear_write() {
        let volume = MemVolume::new();
        let total = 2 * SS + 100;
        let file = PartialFile::create(&volume, "/a.bin".as_ref(), total).unwrap();

        let payload: Vec<u8> = (0..total).map(|i| (i % 251) as u8).collect();

        // feed in odd-sized chunks so sector boundaries land mid-chunk
        for chunk in payload.chunks(300) {
            file.write(chunk).await.unwrap();
        }

        file.drain().await;
        let state = file.get_state();
        assert!(state.is_complete());
        assert_eq!(state.valid_head, Some(part(0, total)));
        assert_eq!(state.valid_tail, Some(part(0, total)));

        let written = volume.contents("/a.bin");
        assert_eq!(&written[..total as usize], &payload[..]);
    }

    #[tokio::test]
    async fn test_head_and_tail_merge() {
        let volume = MemVolume::new();
        let total = 8 * SS;
        let file = PartialFile::create(&volume, "/a.bin".as_ref(), total).unwrap();

        // head: sectors 0 and 1
        file.write(&vec![0xaa; (2 * SS) as usize]).await.unwrap();
        file.drain().await;
        assert_eq!(file.get_valid_head(), Some(part(0, 2 * SS)));
        assert_eq!(file.get_valid_tail(), None);

        // tail: sectors 6 and 7
        file.seek(6 * SS).await;
        file.write(&vec![0xbb; (2 * SS) as usize]).await.unwrap();
        file.drain().await;
        assert_eq!(file.get_valid_head(), Some(part(0, 2 * SS)));
        assert_eq!(file.get_valid_tail(), Some(part(6 * SS, total)));
        assert!(file.has_valid_tail(2 * SS));

        // body: sectors 2..6 close the gap
        file.seek(2 * SS).await;
        file.write(&vec![0xcc; (4 * SS) as usize]).await.unwrap();
        file.drain().await;

        let state = file.get_state();
        assert!(state.is_complete());
        assert_eq!(state.valid_head, Some(part(0, total)));
        assert_eq!(state.valid_tail, Some(part(0, total)));
    }

    #[tokio::test]
    async fn test_seek_within_sector_keeps_buffer() {
        let volume = MemVolume::new();
        let file = PartialFile::create(&volume, "/a.bin".as_ref(), 4 * SS).unwrap();

        file.write(b"abc").await.unwrap();
        // moving within the same sector keeps the buffered bytes
        file.seek(3).await;
        file.write(&vec![0u8; SS as usize - 3]).await.unwrap();
        file.drain().await;

        assert_eq!(file.get_valid_head(), Some(part(0, SS)));
        assert_eq!(&volume.contents("/a.bin")[..3], b"abc");
    }

    #[tokio::test]
    async fn test_seek_away_discards_partial_sector() {
        let volume = MemVolume::new();
        let file = PartialFile::create(&volume, "/a.bin".as_ref(), 4 * SS).unwrap();

        file.write(b"doomed").await.unwrap();
        file.seek(2 * SS).await;
        file.write(&vec![0xbb; SS as usize]).await.unwrap();
        file.drain().await;

        // nothing became valid at the head; the tail got its sector
        let state = file.get_state();
        assert_eq!(state.valid_head, None);
        assert_eq!(state.valid_tail, Some(part(2 * SS, 3 * SS)));
    }

    #[tokio::test]
    async fn test_write_past_end_refused() {
        let volume = MemVolume::new();
        let file = PartialFile::create(&volume, "/a.bin".as_ref(), SS).unwrap();

        file.write(&vec![0u8; SS as usize]).await.unwrap();
        assert_matches!(file.write(b"x").await, Err(WriteError::PastEnd));
    }

    #[tokio::test]
    async fn test_short_final_sector_flushes() {
        let volume = MemVolume::new();
        let total = SS + 10;
        let file = PartialFile::create(&volume, "/a.bin".as_ref(), total).unwrap();

        file.write(&vec![0xee; total as usize]).await.unwrap();
        file.drain().await;

        let state = file.get_state();
        assert!(state.is_complete());
        assert_eq!(state.valid_head, Some(part(0, total)));
    }

    #[tokio::test]
    async fn test_failed_completion_latches_error() {
        let volume = MemVolume::new();
        let file = PartialFile::create(&volume, "/a.bin".as_ref(), 8 * SS).unwrap();

        volume.fail_writes(true);
        file.write(&vec![0u8; SS as usize]).await.unwrap();
        file.drain().await;

        // the device failure arrived via the callback; the next write refuses
        assert_matches!(file.write(b"x").await, Err(WriteError::Latched));
        assert_eq!(file.get_state().valid_head, None);

        volume.fail_writes(false);
        file.reset_error().await;
        file.seek(0).await;
        file.write(&vec![1u8; SS as usize]).await.unwrap();
        file.drain().await;
        assert_eq!(file.get_valid_head(), Some(part(0, SS)));
    }

    #[tokio::test]
    async fn test_poke_failure_aborts_dispatch() {
        let volume = MemVolume::new();
        let file = PartialFile::create(&volume, "/a.bin".as_ref(), 8 * SS).unwrap();

        volume.fail_poke(true);
        let result = file.write(&vec![0u8; (2 * SS) as usize]).await;
        assert_matches!(result, Err(WriteError::LockLost));

        // nothing was submitted, nothing became valid
        file.drain().await;
        assert_eq!(file.get_state().valid_head, None);
    }

    #[tokio::test]
    async fn test_sync_flushes_partial_sector_and_keeps_writing() {
        let volume = MemVolume::new();
        let file = PartialFile::create(&volume, "/a.bin".as_ref(), 4 * SS).unwrap();

        file.write(&vec![0x11; 100]).await.unwrap();
        assert!(file.sync().await);

        // the partially filled sector is already valid on the drive
        assert_eq!(file.get_valid_head(), Some(part(0, SS)));
        assert_eq!(&volume.contents("/a.bin")[..100], &[0x11; 100][..]);

        // and the same sector can still be filled further
        file.write(&vec![0x22; (SS - 100) as usize]).await.unwrap();
        file.drain().await;
        assert_eq!(&volume.contents("/a.bin")[100..SS as usize], &vec![0x22; (SS - 100) as usize][..]);
    }
}
