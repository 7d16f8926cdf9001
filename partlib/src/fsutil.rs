use std::{
    fs::File,
    io,
};

use log::trace;

/// Read data from offset. The file position *will* be changed.
#[cfg(windows)]
pub fn read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::os::windows::fs::FileExt;
    file.seek_read(buf, offset)
}

/// Read data from offset. The file position will *not* be changed.
#[cfg(unix)]
pub fn read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.read_at(buf, offset)
}

/// Read a byte slice of the given size at the specified offset. If the EOF is
/// reached before the reads are complete,
/// [`std::io::ErrorKind::UnexpectedEof`] is returned.
pub fn read_all_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
    trace!("Reading {} bytes at offset {}", buf.len(), offset);

    while !buf.is_empty() {
        let n = read_at(file, buf, offset)?;
        if n == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }

        buf = &mut buf[n..];
        offset += n as u64;
    }

    Ok(())
}

/// Write data to offset. The file position *will* be changed.
#[cfg(windows)]
pub fn write_at(file: &File, buf: &[u8], offset: u64) -> io::Result<usize> {
    use std::os::windows::fs::FileExt;
    file.seek_write(buf, offset)
}

/// Write data to offset. The file position will *not* be changed.
#[cfg(unix)]
pub fn write_at(file: &File, buf: &[u8], offset: u64) -> io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.write_at(buf, offset)
}

/// Write all of the specified data to the specified offset. If the writes
/// cannot make progress, [`std::io::ErrorKind::UnexpectedEof`] is returned.
pub fn write_all_at(file: &File, mut buf: &[u8], mut offset: u64) -> io::Result<()> {
    trace!("Writing {} bytes at offset {}", buf.len(), offset);

    while !buf.is_empty() {
        let n = write_at(file, buf, offset)?;
        if n == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }

        buf = &buf[n..];
        offset += n as u64;
    }

    Ok(())
}

/// Check that an open file handle still refers to a live directory entry.
/// Unlinking the file (or replacing the medium it lives on) drops the link
/// count to zero while the handle itself stays usable, so the link count is
/// the signal to look at.
#[cfg(unix)]
pub fn link_alive(file: &File) -> bool {
    use std::os::unix::fs::MetadataExt;
    file.metadata().map(|m| m.nlink() > 0).unwrap_or(false)
}

/// Check that an open file handle is still usable at all.
#[cfg(not(unix))]
pub fn link_alive(file: &File) -> bool {
    file.metadata().is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_positional_io() {
        let file = tempfile::tempfile().unwrap();

        write_all_at(&file, b"hello world", 3).unwrap();
        write_all_at(&file, b"HELLO", 3).unwrap();

        let mut buf = [0u8; 11];
        read_all_at(&file, &mut buf, 3).unwrap();
        assert_eq!(&buf, b"HELLO world");

        // reading past the data is an UnexpectedEof
        let mut buf = [0u8; 4];
        let err = read_all_at(&file, &mut buf, 12).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[cfg(unix)]
    #[test]
    fn test_link_alive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");

        std::fs::write(&path, b"x").unwrap();
        let file = File::open(&path).unwrap();
        assert!(link_alive(&file));

        std::fs::remove_file(&path).unwrap();
        assert!(!link_alive(&file));
    }
}
