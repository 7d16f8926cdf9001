//! The backup sidecar: everything needed to pick a transfer up again after a
//! reboot.
//!
//! The file has two parts. A fixed-size head holds the valid-range state in
//! two alternating blocks selected by a parity byte; every refresh writes the
//! block the parity does *not* point at, flushes, and only then flips the
//! parity, so a torn refresh leaves the previous state readable. After the
//! blocks comes a write-once section with the transfer id and the original
//! request, guarded by a CRC-32 so a torn initial write is detected.
//!
//! A zero-byte backup has its own meaning: the transfer was finalized as
//! failed and is only waiting for cleanup.

use std::{
    convert::TryInto,
    fs::{File, OpenOptions},
    io,
    path::Path,
};

use log::debug;
use thiserror::Error;

use crate::download::DownloadRequest;
use crate::fsutil::{read_all_at, write_all_at};
use crate::partial_file::{State, ValidPart};

const CURRENT_VERSION: u8 = 1;

/// Maximum number of request headers that fit in a backup.
pub const MAX_HEADERS: usize = 16;

// State block:
// | Offset | Size | Description                              |
// |--------|------|------------------------------------------|
// | 0      | 1    | Presence flags (bit 0 head, bit 1 tail)  |
// | 1      | 8    | Total size (big endian)                  |
// | 9      | 8    | Head start                               |
// | 17     | 8    | Head end                                 |
// | 25     | 8    | Tail start                               |
// | 33     | 8    | Tail end                                 |
const STATE_BLOCK_SIZE: u64 = 41;

const VERSION_OFFSET: u64 = 0;
const PARITY_OFFSET: u64 = 1;
const STATE1_OFFSET: u64 = 2;
const STATE2_OFFSET: u64 = STATE1_OFFSET + STATE_BLOCK_SIZE;
const REQUEST_OFFSET: u64 = STATE2_OFFSET + STATE_BLOCK_SIZE;

const FLAG_HEAD: u8 = 1 << 0;
const FLAG_TAIL: u8 = 1 << 1;

#[derive(Debug, Error)]
pub enum RestoreError {
    /// Empty backup: the transfer was already finalized as failed.
    #[error("transfer is marked as failed")]
    Failed,
    #[error("backup file is truncated or corrupt")]
    Invalid,
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Everything a backup holds.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RestoredTransfer {
    pub id: u32,
    pub request: DownloadRequest,
    pub state: State,
}

fn encode_state(state: &State) -> [u8; STATE_BLOCK_SIZE as usize] {
    let mut buf = [0u8; STATE_BLOCK_SIZE as usize];
    let mut flags = 0u8;
    if state.valid_head.is_some() {
        flags |= FLAG_HEAD;
    }
    if state.valid_tail.is_some() {
        flags |= FLAG_TAIL;
    }

    buf[0] = flags;
    buf[1..9].copy_from_slice(&state.total_size.to_be_bytes());
    let head = state.valid_head.unwrap_or(ValidPart { start: 0, end: 0 });
    let tail = state.valid_tail.unwrap_or(ValidPart { start: 0, end: 0 });
    buf[9..17].copy_from_slice(&head.start.to_be_bytes());
    buf[17..25].copy_from_slice(&head.end.to_be_bytes());
    buf[25..33].copy_from_slice(&tail.start.to_be_bytes());
    buf[33..41].copy_from_slice(&tail.end.to_be_bytes());

    buf
}

fn decode_state(buf: &[u8]) -> Option<State> {
    let flags = buf[0];
    let field = |i: usize| u64::from_be_bytes(buf[1 + 8 * i..9 + 8 * i].try_into().unwrap());
    let total_size = field(0);

    let range = |start: u64, end: u64| -> Option<ValidPart> {
        if start < end && end <= total_size {
            Some(ValidPart { start, end })
        } else {
            None
        }
    };

    let valid_head = if flags & FLAG_HEAD != 0 {
        let head = range(field(1), field(2))?;
        if head.start != 0 {
            return None;
        }
        Some(head)
    } else {
        None
    };

    let valid_tail = if flags & FLAG_TAIL != 0 {
        Some(range(field(3), field(4))?)
    } else {
        None
    };

    Some(State {
        valid_head,
        valid_tail,
        total_size,
    })
}

fn encode_request(id: u32, request: &DownloadRequest) -> io::Result<Vec<u8>> {
    if request.url.len() > u16::MAX as usize || request.headers.len() > MAX_HEADERS {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "request too large for backup"));
    }

    let mut body = Vec::new();
    body.extend_from_slice(&id.to_be_bytes());
    body.extend_from_slice(&(request.url.len() as u16).to_be_bytes());
    body.extend_from_slice(request.url.as_bytes());
    body.push(request.headers.len() as u8);
    for (name, value) in &request.headers {
        if name.len() > u16::MAX as usize || value.len() > u16::MAX as usize {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "request too large for backup"));
        }
        body.extend_from_slice(&(name.len() as u16).to_be_bytes());
        body.extend_from_slice(name.as_bytes());
        body.extend_from_slice(&(value.len() as u16).to_be_bytes());
        body.extend_from_slice(value.as_bytes());
    }

    let mut section = Vec::with_capacity(body.len() + 4);
    section.extend_from_slice(&crc32fast::hash(&body).to_be_bytes());
    section.extend_from_slice(&body);
    Ok(section)
}

struct RequestReader<'a> {
    buf: &'a [u8],
}

impl<'a> RequestReader<'a> {
    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.buf.len() < n {
            return None;
        }
        let (head, rest) = self.buf.split_at(n);
        self.buf = rest;
        Some(head)
    }

    fn take_u16(&mut self) -> Option<u16> {
        self.take(2).map(|b| u16::from_be_bytes(b.try_into().unwrap()))
    }

    fn take_string(&mut self) -> Option<String> {
        let len = self.take_u16()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).ok()
    }
}

fn decode_request(section: &[u8]) -> Option<(u32, DownloadRequest)> {
    if section.len() < 4 {
        return None;
    }
    let (crc, body) = section.split_at(4);
    if u32::from_be_bytes(crc.try_into().unwrap()) != crc32fast::hash(body) {
        return None;
    }

    let mut reader = RequestReader { buf: body };
    let id = u32::from_be_bytes(reader.take(4)?.try_into().unwrap());
    let url = reader.take_string()?;
    let count = reader.take(1)?[0] as usize;
    if count > MAX_HEADERS {
        return None;
    }

    let mut headers = Vec::with_capacity(count);
    for _ in 0..count {
        let name = reader.take_string()?;
        let value = reader.take_string()?;
        headers.push((name, value));
    }

    Some((id, DownloadRequest { url, headers }))
}

/// Write a brand new backup for a transfer that just started.
pub fn create(path: &Path, id: u32, request: &DownloadRequest, state: &State) -> io::Result<()> {
    let mut content = vec![CURRENT_VERSION, 0];
    content.extend_from_slice(&encode_state(state));
    content.extend_from_slice(&[0u8; STATE_BLOCK_SIZE as usize]);
    content.extend_from_slice(&encode_request(id, request)?);

    let file = File::create(path)?;
    write_all_at(&file, &content, 0)?;
    file.sync_data()?;

    debug!("Backup created for transfer {}", id);
    Ok(())
}

/// Refresh the valid-range state in an existing backup. The previous state
/// block is never overwritten; the parity flip is only persisted after the
/// new block is.
pub fn update(path: &Path, state: &State) -> io::Result<()> {
    let file = OpenOptions::new().read(true).write(true).open(path)?;

    let mut head = [0u8; 2];
    read_all_at(&file, &mut head, 0)?;
    if head[VERSION_OFFSET as usize] != CURRENT_VERSION {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "unrecognized backup version"));
    }

    let new_parity = head[PARITY_OFFSET as usize] == 0;
    let block_offset = if new_parity { STATE2_OFFSET } else { STATE1_OFFSET };

    write_all_at(&file, &encode_state(state), block_offset)?;
    file.sync_data()?;

    write_all_at(&file, &[new_parity as u8], PARITY_OFFSET)?;
    file.sync_data()?;

    debug!("Backup state refreshed (parity {})", new_parity as u8);
    Ok(())
}

/// Read a backup back. Distinguishes the empty "failed" marker from a backup
/// that is damaged and from one that is live.
pub fn restore(path: &Path) -> Result<RestoredTransfer, RestoreError> {
    let content = std::fs::read(path)?;

    if content.is_empty() {
        return Err(RestoreError::Failed);
    }
    if content.len() < REQUEST_OFFSET as usize || content[VERSION_OFFSET as usize] != CURRENT_VERSION {
        return Err(RestoreError::Invalid);
    }

    let block_offset = match content[PARITY_OFFSET as usize] {
        0 => STATE1_OFFSET,
        1 => STATE2_OFFSET,
        _ => return Err(RestoreError::Invalid),
    } as usize;

    let state = decode_state(&content[block_offset..block_offset + STATE_BLOCK_SIZE as usize])
        .ok_or(RestoreError::Invalid)?;
    let (id, request) =
        decode_request(&content[REQUEST_OFFSET as usize..]).ok_or(RestoreError::Invalid)?;

    Ok(RestoredTransfer { id, request, state })
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn request() -> DownloadRequest {
        DownloadRequest {
            url: "http://example.com/model.gcode".to_owned(),
            headers: vec![
                ("Authorization".to_owned(), "Bearer abcdef".to_owned()),
                ("X-Fingerprint".to_owned(), "42".to_owned()),
            ],
        }
    }

    fn state() -> State {
        State {
            valid_head: Some(ValidPart { start: 0, end: 2048 }),
            valid_tail: Some(ValidPart { start: 1044480, end: 1048576 }),
            total_size: 1048576,
        }
    }

    #[test]
    fn test_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("b");

        create(&path, 7, &request(), &state()).unwrap();
        let restored = restore(&path).unwrap();

        assert_eq!(restored.id, 7);
        assert_eq!(restored.request, request());
        assert_eq!(restored.state, state());
    }

    #[test]
    fn test_update_alternates_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("b");

        create(&path, 7, &request(), &State::new(1048576)).unwrap();

        let mut refreshed = state();
        update(&path, &refreshed).unwrap();
        assert_eq!(restore(&path).unwrap().state, refreshed);

        // a second refresh goes to the other block and still reads back
        refreshed.valid_head = Some(ValidPart { start: 0, end: 4096 });
        update(&path, &refreshed).unwrap();
        let restored = restore(&path).unwrap();
        assert_eq!(restored.state, refreshed);
        assert_eq!(restored.id, 7);
    }

    #[test]
    fn test_empty_means_failed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("b");
        std::fs::write(&path, b"").unwrap();

        assert_matches!(restore(&path), Err(RestoreError::Failed));
    }

    #[test]
    fn test_torn_request_section_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("b");

        create(&path, 7, &request(), &state()).unwrap();

        let mut content = std::fs::read(&path).unwrap();
        let flip = REQUEST_OFFSET as usize + 10;
        content[flip] ^= 0xff;
        std::fs::write(&path, &content).unwrap();

        assert_matches!(restore(&path), Err(RestoreError::Invalid));
    }

    #[test]
    fn test_truncated_backup_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("b");

        create(&path, 7, &request(), &state()).unwrap();

        let content = std::fs::read(&path).unwrap();
        std::fs::write(&path, &content[..content.len() - 5]).unwrap();
        assert_matches!(restore(&path), Err(RestoreError::Invalid));

        std::fs::write(&path, &content[..10]).unwrap();
        assert_matches!(restore(&path), Err(RestoreError::Invalid));
    }

    #[test]
    fn test_nonsense_state_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("b");

        create(&path, 7, &request(), &state()).unwrap();

        // head claiming to reach past the total size
        let mut content = std::fs::read(&path).unwrap();
        let bad = State {
            valid_head: Some(ValidPart { start: 0, end: u64::MAX }),
            valid_tail: None,
            total_size: 1048576,
        };
        content[STATE1_OFFSET as usize..(STATE1_OFFSET + STATE_BLOCK_SIZE) as usize]
            .copy_from_slice(&encode_state(&bad));
        std::fs::write(&path, &content).unwrap();

        assert_matches!(restore(&path), Err(RestoreError::Invalid));
    }

    #[test]
    fn test_missing_backup_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        assert_matches!(restore(&dir.path().join("b")), Err(RestoreError::Io(_)));
    }
}
