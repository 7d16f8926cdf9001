//! Resumable partial-file transfer engine.
//!
//! Downloads a remote file over HTTP into a contiguously preallocated file
//! on removable media while the file stays readable through the ordinary
//! filesystem interface, tracks which byte ranges are valid (a head growing
//! from the start, a tail growing toward the end), survives network drops,
//! device removal and power loss, and resumes interrupted transfers from a
//! compact backup sidecar.
//!
//! Entry points: [`transfer::Transfers`] to begin, recover and clean up
//! transfers; [`partial_file::PartialFile`] if you only need the
//! concurrent-reader file itself; [`volume::Volume`]/[`volume::BlockDev`]
//! to plug in a different storage backend.

pub mod backup;
pub mod download;
pub mod events;
pub mod filename;
mod fsutil;
pub mod host;
pub mod index;
pub mod monitor;
pub mod order;
pub mod partial_file;
mod sector_pool;
#[cfg(test)]
mod testing;
pub mod transfer;
pub mod volume;

pub use download::{DownloadClient, DownloadRequest};
pub use partial_file::{PartialFile, State, ValidPart};
pub use transfer::{Transfer, TransferState, Transfers};
pub use volume::SECTOR_SIZE;
