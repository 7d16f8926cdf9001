//! Notifications for the file layer: a path sprang into existence (a
//! finished transfer was finalized) or went away (a failed one was removed).

use std::path::Path;

use log::info;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Incident {
    Created,
    Deleted,
}

pub trait EventSink: Send + Sync {
    fn path_changed(&self, path: &Path, incident: Incident);
}

/// Sink for setups with nobody listening; the events only reach the log.
pub struct LogSink;

impl EventSink for LogSink {
    fn path_changed(&self, path: &Path, incident: Incident) {
        info!("Path {}: {:?}", path.display(), incident);
    }
}
