use std::{
    fs::{self, File, OpenOptions},
    io,
    path::Path,
    sync::{
        atomic::{AtomicU8, Ordering},
        mpsc,
        Arc,
    },
    thread,
};

use log::{debug, error};

use crate::fsutil::{link_alive, write_all_at};
use crate::volume::{
    BlockDev, ContiguousFile, IdentityLock, StorageError, Volume, WriteRequest, SECTOR_SIZE,
};

/// Volume backed by an ordinary mounted filesystem.
///
/// Each preallocated file gets its own 512-byte sector space starting at
/// sector 0, and all sector writes for the volume funnel through one writer
/// thread that performs positional writes and invokes the completion
/// callbacks. A raw-device implementation of [`Volume`] would instead map
/// `first_sector` to the LBA of the file's first cluster; nothing above this
/// seam cares about the difference.
pub struct HostVolume {
    jobs: mpsc::Sender<Job>,
    next_lun: AtomicU8,
}

struct Job {
    file: Arc<File>,
    request: WriteRequest,
}

impl HostVolume {
    pub fn new() -> Arc<Self> {
        let (jobs, queue) = mpsc::channel();
        thread::spawn(move || Self::writer_loop(queue));

        Arc::new(Self {
            jobs,
            next_lun: AtomicU8::new(0),
        })
    }

    /// The "USB thread": drains the queue and completes requests out of band
    /// with respect to the task that submitted them.
    fn writer_loop(queue: mpsc::Receiver<Job>) {
        while let Ok(Job { file, request }) = queue.recv() {
            let WriteRequest {
                lun,
                sector_nbr,
                data,
                done,
            } = request;

            let offset = sector_nbr as u64 * SECTOR_SIZE as u64;
            let result = write_all_at(&file, &data[..], offset);
            if let Err(e) = &result {
                error!("Writing sector {} on LUN {} failed: {}", sector_nbr, lun, e);
            }

            done(result, data);
        }
    }

    fn finish_open(&self, path: &Path, size: u64) -> Result<ContiguousFile, StorageError> {
        let writer = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|_| StorageError::CantOpen)?;

        // A separate read-only handle locks the file in place; the writer
        // handle above is the raw-access path that bypasses it.
        let lock = File::open(path).map_err(|_| StorageError::CantLock)?;

        let lun = self.next_lun.fetch_add(1, Ordering::Relaxed);
        debug!("Registered {} as LUN {} ({} bytes)", path.display(), lun, size);

        Ok(ContiguousFile {
            lun,
            first_sector: 0,
            size,
            lock: Box::new(HostLock { file: lock }),
            dev: Arc::new(HostBlockDev {
                file: Arc::new(writer),
                jobs: self.jobs.clone(),
            }),
        })
    }
}

impl Volume for HostVolume {
    fn preallocate(&self, path: &Path, size: u64) -> Result<ContiguousFile, StorageError> {
        let file = match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(f) => f,
            Err(e) => {
                error!("Failed to create {}: {}", path.display(), e);
                return Err(StorageError::CantCreate);
            }
        };

        if let Err(e) = file.set_len(size) {
            error!("Failed to preallocate {} bytes: {}", size, e);
            drop(file);
            let _ = fs::remove_file(path);
            return Err(StorageError::DriveFull);
        }

        drop(file);
        self.finish_open(path, size)
    }

    fn reopen(&self, path: &Path) -> Result<ContiguousFile, StorageError> {
        let size = fs::metadata(path)
            .map_err(|_| StorageError::CantOpen)?
            .len();

        self.finish_open(path, size)
    }
}

struct HostLock {
    file: File,
}

impl IdentityLock for HostLock {
    fn poke(&self) -> bool {
        link_alive(&self.file)
    }
}

struct HostBlockDev {
    file: Arc<File>,
    jobs: mpsc::Sender<Job>,
}

impl BlockDev for HostBlockDev {
    fn submit(&self, request: WriteRequest) -> io::Result<()> {
        match self.jobs.send(Job {
            file: Arc::clone(&self.file),
            request,
        }) {
            Ok(()) => Ok(()),
            Err(mpsc::SendError(job)) => {
                // Writer thread is gone. Complete the request in place so the
                // buffer still makes it back to its pool.
                let WriteRequest { data, done, .. } = job.request;
                done(
                    Err(io::Error::new(io::ErrorKind::BrokenPipe, "writer thread is gone")),
                    data,
                );
                Err(io::Error::new(io::ErrorKind::BrokenPipe, "writer thread is gone"))
            }
        }
    }
}
