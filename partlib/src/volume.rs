use std::{
    fmt,
    io,
    path::Path,
    sync::Arc,
};

use thiserror::Error;

/// Size of one sector on the drive. The write path only ever talks to the
/// device in whole sectors of this size.
pub const SECTOR_SIZE: usize = 512;

/// Owned buffer holding exactly one sector worth of data.
pub type SectorBuf = Box<[u8; SECTOR_SIZE]>;

/// Logical unit number identifying the drive a file lives on.
pub type LunNbr = u8;

/// Sector index within a file's sector space.
pub type SectorNbr = u32;

/// Completion callback for a sector write. Receives the write result and the
/// buffer back so it can be returned to its pool. Invoked from the device's
/// writer thread.
pub type CompletionFn = Box<dyn FnOnce(io::Result<()>, SectorBuf) + Send>;

/// A single-sector asynchronous write request.
pub struct WriteRequest {
    pub lun: LunNbr,
    pub sector_nbr: SectorNbr,
    pub data: SectorBuf,
    pub done: CompletionFn,
}

impl fmt::Debug for WriteRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteRequest")
            .field("lun", &self.lun)
            .field("sector_nbr", &self.sector_nbr)
            .finish_non_exhaustive()
    }
}

/// Asynchronous block-write service.
///
/// `submit` queues the request and returns. The completion callback is always
/// invoked exactly once, even when queueing itself fails (in which case it
/// runs with the error before `submit` returns), so the buffer inside the
/// request is never lost.
pub trait BlockDev: Send + Sync {
    fn submit(&self, request: WriteRequest) -> io::Result<()>;
}

/// An open handle held for the lifetime of a partial file so the filesystem
/// cannot hand the file's sectors to somebody else while we write them behind
/// its back.
///
/// `poke` is the cheap validity check performed before every sector
/// submission; returning `false` means the file is no longer the file we
/// preallocated (medium swapped, file deleted) and the write must not happen.
pub trait IdentityLock: Send + Sync {
    fn poke(&self) -> bool;
}

/// Filesystem services consumed by the engine: contiguous preallocation and
/// reopening of an existing preallocation during recovery. Everything else
/// (read-back, stat, unlink, rename) goes through the ordinary `std::fs`
/// interface.
pub trait Volume: Send + Sync {
    /// Create `path` with `size` bytes of contiguous space reserved for it.
    fn preallocate(&self, path: &Path, size: u64) -> Result<ContiguousFile, StorageError>;

    /// Reopen a previously preallocated file. The returned size is what is
    /// actually found on the disk.
    fn reopen(&self, path: &Path) -> Result<ContiguousFile, StorageError>;
}

/// The raw-access view of one preallocated file.
pub struct ContiguousFile {
    pub lun: LunNbr,
    /// Sector number where the file's first byte lives.
    pub first_sector: SectorNbr,
    pub size: u64,
    pub lock: Box<dyn IdentityLock>,
    pub dev: Arc<dyn BlockDev>,
}

impl fmt::Debug for ContiguousFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContiguousFile")
            .field("lun", &self.lun)
            .field("first_sector", &self.first_sector)
            .field("size", &self.size)
            .finish()
    }
}

/// Filesystem/IO failures with their user-facing messages.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum StorageError {
    #[error("USB drive full")]
    DriveFull,
    #[error("File is not contiguous")]
    NotContiguous,
    #[error("Can't lock file in place")]
    CantLock,
    #[error("Failed to write to location")]
    CantCreate,
    #[error("Failed to open file")]
    CantOpen,
    #[error("Failed to create directory")]
    CreateDirectory,
    #[error("Failed to store path to index")]
    StoreIndex,
    #[error("Failed to create backup file")]
    CreateBackup,
    #[error("Failed to open backup file")]
    OpenBackup,
    #[error("Failed to restore backup file")]
    RestoreBackup,
}
