//! In-memory fakes for the volume/block-device seams, plus a minimal HTTP
//! responder, shared by the unit tests.

use std::{
    collections::HashMap,
    io,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc,
        Arc, Mutex,
    },
    thread,
};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use crate::volume::{
    BlockDev, ContiguousFile, IdentityLock, StorageError, Volume, WriteRequest, SECTOR_SIZE,
};

/// Volume whose files live in memory, with switches to make pokes and sector
/// writes fail on demand.
pub struct MemVolume {
    files: Mutex<HashMap<PathBuf, Arc<Mutex<Vec<u8>>>>>,
    jobs: mpsc::Sender<MemJob>,
    fail_poke: Arc<AtomicBool>,
    fail_writes: Arc<AtomicBool>,
}

struct MemJob {
    data: Arc<Mutex<Vec<u8>>>,
    fail: Arc<AtomicBool>,
    request: WriteRequest,
}

impl MemVolume {
    pub fn new() -> Self {
        let (jobs, queue) = mpsc::channel::<MemJob>();
        thread::spawn(move || {
            while let Ok(job) = queue.recv() {
                let WriteRequest {
                    sector_nbr, data, done, ..
                } = job.request;

                if job.fail.load(Ordering::Relaxed) {
                    done(Err(io::Error::new(io::ErrorKind::Other, "injected write failure")), data);
                    continue;
                }

                let offset = sector_nbr as usize * SECTOR_SIZE;
                let mut backing = job.data.lock().unwrap();
                let end = (offset + SECTOR_SIZE).min(backing.len());
                backing[offset..end].copy_from_slice(&data[..end - offset]);
                done(Ok(()), data);
            }
        });

        Self {
            files: Mutex::new(HashMap::new()),
            jobs,
            fail_poke: Arc::new(AtomicBool::new(false)),
            fail_writes: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn fail_poke(&self, fail: bool) {
        self.fail_poke.store(fail, Ordering::Relaxed);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Relaxed);
    }

    /// Snapshot of a file's backing store, rounded up to whole sectors.
    pub fn contents(&self, path: impl AsRef<Path>) -> Vec<u8> {
        let files = self.files.lock().unwrap();
        let contents = files[path.as_ref()].lock().unwrap().clone();
        contents
    }

    fn open(&self, path: &Path, size: u64) -> ContiguousFile {
        let backing = {
            let mut files = self.files.lock().unwrap();
            let sectors = (size as usize + SECTOR_SIZE - 1) / SECTOR_SIZE;
            Arc::clone(
                files
                    .entry(path.to_owned())
                    .or_insert_with(|| Arc::new(Mutex::new(vec![0; sectors * SECTOR_SIZE]))),
            )
        };

        ContiguousFile {
            lun: 0,
            first_sector: 0,
            size,
            lock: Box::new(MemLock {
                fail: Arc::clone(&self.fail_poke),
            }),
            dev: Arc::new(MemBlockDev {
                data: backing,
                fail: Arc::clone(&self.fail_writes),
                jobs: self.jobs.clone(),
            }),
        }
    }
}

impl Volume for MemVolume {
    fn preallocate(&self, path: &Path, size: u64) -> Result<ContiguousFile, StorageError> {
        if self.files.lock().unwrap().contains_key(path) {
            return Err(StorageError::CantCreate);
        }
        Ok(self.open(path, size))
    }

    fn reopen(&self, path: &Path) -> Result<ContiguousFile, StorageError> {
        let size = {
            let files = self.files.lock().unwrap();
            let len = files.get(path).ok_or(StorageError::CantOpen)?.lock().unwrap().len();
            len as u64
        };
        Ok(self.open(path, size))
    }
}

struct MemLock {
    fail: Arc<AtomicBool>,
}

impl IdentityLock for MemLock {
    fn poke(&self) -> bool {
        !self.fail.load(Ordering::Relaxed)
    }
}

struct MemBlockDev {
    data: Arc<Mutex<Vec<u8>>>,
    fail: Arc<AtomicBool>,
    jobs: mpsc::Sender<MemJob>,
}

impl BlockDev for MemBlockDev {
    fn submit(&self, request: WriteRequest) -> io::Result<()> {
        self.jobs
            .send(MemJob {
                data: Arc::clone(&self.data),
                fail: Arc::clone(&self.fail),
                request,
            })
            .map_err(|mpsc::SendError(job)| {
                let WriteRequest { data, done, .. } = job.request;
                done(
                    Err(io::Error::new(io::ErrorKind::BrokenPipe, "writer thread is gone")),
                    data,
                );
                io::Error::new(io::ErrorKind::BrokenPipe, "writer thread is gone")
            })
    }
}

/// Byte range parsed out of a request's `Range` header: start and the
/// inclusive end, if present.
pub type SeenRange = Option<(u64, Option<u64>)>;

/// Just enough of an HTTP/1.1 server to satisfy one `reqwest` client: serves
/// a fixed payload, honors `Range`, records what was asked of it.
pub struct TestServer {
    pub url: String,
    pub ranges: Arc<Mutex<Vec<SeenRange>>>,
    pub headers: Arc<Mutex<Vec<String>>>,
}

impl TestServer {
    pub async fn spawn(payload: Vec<u8>) -> TestServer {
        Self::spawn_with_limit(payload, usize::MAX).await
    }

    /// Like [`TestServer::spawn`], but every response body is cut short after
    /// `limit` bytes even though the full length was announced, which a
    /// client sees as a broken connection.
    pub async fn spawn_with_limit(payload: Vec<u8>, limit: usize) -> TestServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/file", listener.local_addr().unwrap());
        let payload = Arc::new(payload);
        let ranges: Arc<Mutex<Vec<SeenRange>>> = Arc::new(Mutex::new(Vec::new()));
        let headers: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

        {
            let payload = Arc::clone(&payload);
            let ranges = Arc::clone(&ranges);
            let headers = Arc::clone(&headers);
            tokio::spawn(async move {
                loop {
                    let Ok((mut socket, _)) = listener.accept().await else {
                        return;
                    };
                    let payload = Arc::clone(&payload);
                    let ranges = Arc::clone(&ranges);
                    let headers = Arc::clone(&headers);

                    tokio::spawn(async move {
                        let mut request = Vec::new();
                        let mut buf = [0u8; 1024];
                        while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                            match socket.read(&mut buf).await {
                                Ok(0) | Err(_) => return,
                                Ok(n) => request.extend_from_slice(&buf[..n]),
                            }
                        }
                        let request = String::from_utf8_lossy(&request).into_owned();
                        headers.lock().unwrap().push(request.clone());

                        let range = request
                            .lines()
                            .find_map(|l| l.to_ascii_lowercase().strip_prefix("range: bytes=").map(str::to_owned))
                            .map(|spec| {
                                let (start, end) = spec.trim().split_once('-').unwrap();
                                (
                                    start.parse::<u64>().unwrap(),
                                    end.parse::<u64>().ok(),
                                )
                            });
                        ranges.lock().unwrap().push(range);

                        let total = payload.len() as u64;
                        let (status, start, end) = match range {
                            Some((start, end)) => {
                                let end = end.map(|e| e + 1).unwrap_or(total).min(total);
                                ("206 Partial Content", start.min(total), end)
                            }
                            None => ("200 OK", 0, total),
                        };

                        let body = &payload[start as usize..end as usize];
                        let head = format!(
                            "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                            status,
                            body.len(),
                        );
                        if socket.write_all(head.as_bytes()).await.is_err() {
                            return;
                        }
                        let serve = body.len().min(limit);
                        let _ = socket.write_all(&body[..serve]).await;
                        let _ = socket.shutdown().await;
                    });
                }
            });
        }

        TestServer { url, ranges, headers }
    }

    pub fn seen_ranges(&self) -> Vec<SeenRange> {
        self.ranges.lock().unwrap().clone()
    }
}
