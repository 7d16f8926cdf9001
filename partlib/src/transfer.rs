//! The transfer controller: drives one download from begin (or recovery)
//! through retries, range jumps and finalization, and sweeps up what older
//! sessions left behind.
//!
//! On disk a transfer is a directory `D/` standing where the final file will
//! be, holding the preallocated partial file `D/p` and the backup sidecar
//! `D/b`. A non-empty backup means the transfer is claimable; an empty one
//! means it failed and waits for removal; a missing one means the data is
//! complete and `D/` only needs to be collapsed into a plain file.

use std::{
    fmt,
    fs::{self, File},
    io,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};

use log::{debug, error, info};
use thiserror::Error;

use crate::backup::{self, RestoreError};
use crate::download::{Download, DownloadClient, DownloadRequest, DownloadStartError, DownloadStep};
use crate::events::{EventSink, Incident};
use crate::filename;
use crate::index;
use crate::monitor::{Monitor, Outcome, Slot};
use crate::order::{Action, DownloadOrder};
use crate::partial_file::PartialFile;
use crate::volume::{StorageError, Volume, SECTOR_SIZE};

const PARTIAL_FILENAME: &str = "p";
const BACKUP_FILENAME: &str = "b";

/// Where a finished partial briefly lives while its transfer directory is
/// collapsed into the final file.
const FINALIZE_TEMP: &str = ".partdl-finalize.tmp";

/// How often the backup sidecar is refreshed while data flows.
const BACKUP_UPDATE_INTERVAL: Duration = Duration::from_secs(5);

/// Pause between a connection error and the next attempt.
const ERROR_COOLDOWN: Duration = Duration::from_secs(1);

/// Network retries before a transfer gives up.
const DEFAULT_RETRIES: u32 = 3;

/// The file names making up one transfer, derived from its destination.
#[derive(Clone, Debug)]
pub struct TransferPath {
    destination: PathBuf,
}

impl TransferPath {
    pub fn new(destination: &Path) -> Self {
        Self {
            destination: destination.to_owned(),
        }
    }

    pub fn as_destination(&self) -> &Path {
        &self.destination
    }

    pub fn as_partial(&self) -> PathBuf {
        self.destination.join(PARTIAL_FILENAME)
    }

    pub fn as_backup(&self) -> PathBuf {
        self.destination.join(BACKUP_FILENAME)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TransferState {
    Downloading,
    Retrying,
    Finished,
    Failed,
}

#[derive(Debug, Error)]
pub enum BeginError {
    #[error("no transfer slot available")]
    NoTransferSlot,
    #[error("destination already exists")]
    AlreadyExists,
    #[error("download request refused")]
    RefusedRequest,
    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, Error)]
pub enum RecoverError {
    #[error("no transfer slot available")]
    NoTransferSlot,
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Shared environment the transfers run in.
pub struct Transfers {
    volume: Arc<dyn Volume>,
    client: DownloadClient,
    monitor: Arc<Monitor>,
    events: Arc<dyn EventSink>,
    index_path: PathBuf,
}

impl Transfers {
    pub fn new(
        volume: Arc<dyn Volume>,
        client: DownloadClient,
        monitor: Arc<Monitor>,
        events: Arc<dyn EventSink>,
        index_path: PathBuf,
    ) -> Self {
        Self {
            volume,
            client,
            monitor,
            events,
            index_path,
        }
    }

    pub fn monitor(&self) -> &Arc<Monitor> {
        &self.monitor
    }

    /// Start a brand new transfer into `destination`.
    ///
    /// The empty backup is created before the download touches the disk: a
    /// partial file without a backup is what a *finished* transfer looks
    /// like, and a power cut in between must not leave garbage wearing that
    /// costume.
    pub async fn begin(
        &self,
        destination: &Path,
        request: DownloadRequest,
    ) -> Result<Transfer, BeginError> {
        info!("Starting transfer of {}", destination.display());

        let slot = match self.monitor.allocate(destination, 0, true, None) {
            Some(slot) => slot,
            None => {
                error!("Failed to allocate slot for {}", destination.display());
                return Err(BeginError::NoTransferSlot);
            }
        };

        if fs::symlink_metadata(destination).is_ok() {
            error!("Destination path {} already exists", destination.display());
            return Err(BeginError::AlreadyExists);
        }

        if let Err(e) = fs::create_dir(destination) {
            error!("Failed to create directory {}: {}", destination.display(), e);
            return Err(StorageError::CreateDirectory.into());
        }

        if let Err(e) = index::store(&self.index_path, destination) {
            error!("Failed to store path to index: {}", e);
            return Err(StorageError::StoreIndex.into());
        }

        let path = TransferPath::new(destination);

        if let Err(e) = File::create(path.as_backup()) {
            error!("Failed to create backup file: {}", e);
            return Err(StorageError::CreateBackup.into());
        }

        match Download::begin(&self.client, &request, self.volume.as_ref(), &path.as_partial())
            .await
        {
            Ok(download) => {
                slot.update_expected_size(download.file_size());
                let partial = download.partial_file();

                if let Err(e) =
                    backup::create(&path.as_backup(), slot.id(), &request, &partial.get_state())
                {
                    error!("Failed to create backup file: {}", e);
                    return Err(StorageError::CreateBackup.into());
                }

                info!("Download request initiated");
                Ok(Transfer::new(
                    self,
                    TransferState::Downloading,
                    Some(download),
                    slot,
                    partial,
                ))
            }
            Err(e) => {
                error!("Failed to initiate download: {}", e);
                // remove all the files we might have created
                let _ = fs::remove_file(path.as_partial());
                let _ = fs::remove_file(path.as_backup());
                let _ = fs::remove_dir(path.as_destination());

                Err(match e {
                    DownloadStartError::Storage(storage) => BeginError::Storage(storage),
                    _ => BeginError::RefusedRequest,
                })
            }
        }
    }

    /// Pick up an interrupted transfer found at `destination`. The new
    /// transfer starts in `Retrying` with no active download; the first
    /// `step` restarts it.
    pub async fn recover(&self, destination: &Path) -> Result<Transfer, RecoverError> {
        let path = TransferPath::new(destination);

        let restored = match backup::restore(&path.as_backup()) {
            Ok(restored) => restored,
            Err(RestoreError::Io(e)) if e.kind() == io::ErrorKind::NotFound => {
                error!("Failed to open backup file");
                return Err(StorageError::OpenBackup.into());
            }
            Err(e) => {
                error!("Failed to restore backup file: {}", e);
                return Err(StorageError::RestoreBackup.into());
            }
        };

        let partial =
            match PartialFile::open(self.volume.as_ref(), &path.as_partial(), restored.state) {
                Ok(partial) => partial,
                Err(e) => {
                    error!("Failed to open partial file: {}", e);
                    return Err(e.into());
                }
            };

        let slot = match self.monitor.allocate(
            destination,
            partial.final_size(),
            false,
            Some(restored.id),
        ) {
            Some(slot) => slot,
            None => {
                error!("Failed to allocate slot for {}", destination.display());
                return Err(RecoverError::NoTransferSlot);
            }
        };

        slot.progress(&partial.get_state(), false);

        Ok(Transfer::new(self, TransferState::Retrying, None, slot, partial))
    }

    /// Startup sweep over the transfer index: finalize what finished, remove
    /// what failed, leave what is still claimable. Deletes the index itself
    /// once nothing in it is in progress anymore.
    pub fn cleanup(&self) -> bool {
        Transfer::cleanup_transfers(&self.index_path, self.events.as_ref())
    }
}

pub struct Transfer {
    client: DownloadClient,
    events: Arc<dyn EventSink>,
    slot: Slot,
    path: TransferPath,
    download: Option<Download>,
    order: Option<DownloadOrder>,
    state: TransferState,
    partial: Option<Arc<PartialFile>>,
    last_backup_update: Option<Instant>,
    last_connection_error: Option<Instant>,
    retries_left: u32,
    already_notified: bool,
    restart_requested_by_jump: bool,
    is_printable: bool,
}

impl fmt::Debug for Transfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transfer")
            .field("path", &self.path)
            .field("state", &self.state)
            .field("retries_left", &self.retries_left)
            .field("already_notified", &self.already_notified)
            .field("restart_requested_by_jump", &self.restart_requested_by_jump)
            .field("is_printable", &self.is_printable)
            .finish()
    }
}

impl Transfer {
    fn new(
        env: &Transfers,
        state: TransferState,
        download: Option<Download>,
        slot: Slot,
        partial: Arc<PartialFile>,
    ) -> Self {
        let path = TransferPath::new(slot.destination());
        let is_printable = filename::is_printable(slot.destination());

        Self {
            client: env.client.clone(),
            events: Arc::clone(&env.events),
            slot,
            path,
            download,
            order: None,
            state,
            partial: Some(partial),
            last_backup_update: None,
            last_connection_error: None,
            retries_left: DEFAULT_RETRIES,
            already_notified: false,
            restart_requested_by_jump: false,
            is_printable,
        }
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    pub fn destination(&self) -> &Path {
        self.path.as_destination()
    }

    /// The valid-range state of the file being filled, while the transfer is
    /// live.
    pub fn file_state(&self) -> Option<crate::partial_file::State> {
        self.partial.as_ref().map(|p| p.get_state())
    }

    fn partial(&self) -> &Arc<PartialFile> {
        // only gone once the transfer reached a terminal state
        self.partial.as_ref().expect("no partial file in a terminal state")
    }

    /// Advance the transfer. Cheap when there is nothing to do; meant to be
    /// called in a loop. `is_printing` reports whether the machine is busy
    /// consuming the file right now, which makes the retry budget lenient.
    pub async fn step(&mut self, is_printing: bool) -> TransferState {
        match self.state {
            TransferState::Downloading | TransferState::Retrying => {
                if self.slot.is_stopped() {
                    self.done(TransferState::Failed, Outcome::Stopped).await;
                } else if self.download.is_some() {
                    let result = self.download.as_mut().unwrap().step().await;
                    self.dispatch_download_step(result, is_printing).await;
                } else if self
                    .last_connection_error
                    .map_or(true, |at| at.elapsed() > ERROR_COOLDOWN)
                {
                    self.slot
                        .progress(&self.partial().get_state(), !self.restart_requested_by_jump);
                    self.restart_requested_by_jump = false;
                    if !self.restart_download().await {
                        self.recoverable_failure(is_printing).await;
                    }
                }
            }
            TransferState::Finished | TransferState::Failed => {}
        }

        self.state
    }

    async fn dispatch_download_step(&mut self, result: DownloadStep, is_printing: bool) {
        match result {
            DownloadStep::Continue => {
                self.slot.progress(&self.partial().get_state(), false);
                self.update_backup(false);
                self.init_download_order_if_needed();

                let file_state = self.partial().get_state();
                let order = self.order.as_mut().unwrap();
                match order.step(&file_state) {
                    Action::Continue => {
                        if self.is_printable && !self.already_notified {
                            self.notify_created();
                        }
                    }
                    Action::RangeJump => {
                        // tear the request down; the next tick reopens it at
                        // the new offset
                        self.download = None;
                        self.update_backup(true);
                        self.restart_requested_by_jump = true;
                    }
                    Action::Finished => {
                        self.done(TransferState::Finished, Outcome::Finished).await;
                    }
                }
            }
            DownloadStep::FailedNetwork => self.recoverable_failure(is_printing).await,
            DownloadStep::FailedOther => self.done(TransferState::Failed, Outcome::Error).await,
            DownloadStep::Finished => {
                // The requested range is exhausted. Let the in-flight sectors
                // land, then ask the order whether that was the last one or
                // whether it has more to ask for on the next tick.
                self.download = None;
                self.partial().drain().await;
                self.init_download_order_if_needed();

                let file_state = self.partial().get_state();
                match self.order.as_mut().unwrap().step(&file_state) {
                    Action::Continue => {}
                    Action::RangeJump => {
                        self.update_backup(true);
                        self.restart_requested_by_jump = true;
                    }
                    Action::Finished => {
                        self.done(TransferState::Finished, Outcome::Finished).await;
                    }
                }
            }
        }
    }

    /// Reopen the download where the order policy wants it, straight from the
    /// backup (the original request is not kept in memory).
    async fn restart_download(&mut self) -> bool {
        let restored = match backup::restore(&self.path.as_backup()) {
            Ok(restored) => restored,
            Err(e) => {
                error!("Failed to restore backup file: {}", e);
                self.last_connection_error = Some(Instant::now());
                return false;
            }
        };

        self.init_download_order_if_needed();
        // a write error or timeout from the previous attempt must not poison
        // this one
        self.partial().reset_error().await;

        let file_state = self.partial().get_state();
        let mut position = self.order.as_ref().unwrap().next_offset(&file_state);
        // only whole sectors are ever written; overlap on resume is fine
        position = position / SECTOR_SIZE as u64 * SECTOR_SIZE as u64;

        let mut end_range = None;
        if let Some(tail) = file_state.valid_tail {
            if tail.end == file_state.total_size && position < tail.start {
                // The tail already runs to the end of the file, so the
                // request can stop where the tail starts. HTTP end ranges
                // are inclusive.
                debug_assert!(tail.start % SECTOR_SIZE as u64 == 0);
                end_range = Some(tail.start - 1);
            }
        }

        match Download::resume(
            &self.client,
            &restored.request,
            Arc::clone(self.partial()),
            position,
            end_range,
        )
        .await
        {
            Ok(download) => {
                info!("Download request initiated, position: {}", position);
                self.download = Some(download);
                true
            }
            Err(e) => {
                error!("Failed to restart download: {}", e);
                self.last_connection_error = Some(Instant::now());
                false
            }
        }
    }

    fn init_download_order_if_needed(&mut self) {
        if self.order.is_some() {
            return;
        }
        let file_state = self.partial().get_state();
        self.order = Some(DownloadOrder::for_transfer(
            self.path.as_destination(),
            &file_state,
        ));
    }

    fn update_backup(&mut self, force: bool) {
        let outdated = self
            .last_backup_update
            .map_or(true, |at| at.elapsed() > BACKUP_UPDATE_INTERVAL);
        if !force && !outdated {
            return;
        }

        if let Err(e) = backup::update(&self.path.as_backup(), &self.partial().get_state()) {
            error!("Failed to update backup file: {}", e);
        } else {
            debug!("Backup file updated");
        }
        self.last_backup_update = Some(Instant::now());
    }

    fn notify_created(&mut self) {
        self.events
            .path_changed(self.path.as_destination(), Incident::Created);
        self.already_notified = true;
    }

    async fn recoverable_failure(&mut self, is_printing: bool) {
        if self.retries_left > 0 {
            if !is_printing {
                // never give up on a file the machine is busy consuming
                self.retries_left -= 1;
            }
            self.slot.progress(&self.partial().get_state(), true);
            self.state = TransferState::Retrying;
            self.restart_requested_by_jump = false;
            self.download = None;
        } else {
            self.done(TransferState::Failed, Outcome::Error).await;
        }
    }

    async fn done(&mut self, state: TransferState, outcome: Outcome) {
        self.state = state;
        self.download = None;
        if let Some(partial) = self.partial.take() {
            partial.drain().await;
        }

        if state == TransferState::Finished {
            if let Err(e) = fs::remove_file(self.path.as_backup()) {
                error!("Failed to remove backup file: {}", e);
            }
            if !self.is_printable {
                // Printable files may already be consumed in place, so they
                // are not moved at arbitrary times; everything else is
                // finalized before anyone is told about it.
                Self::cleanup_finalize(&self.path, self.events.as_ref());
            }
        } else {
            // mark as failed: an empty backup file
            if let Err(e) = File::create(self.path.as_backup()) {
                error!("Failed to truncate backup file: {}", e);
            }
        }

        self.slot.done(outcome);
        info!(
            "Transfer {}",
            if state == TransferState::Failed {
                "failed"
            } else {
                "finished"
            }
        );
    }

    /// Drop the active request but keep the transfer claimable: flush what is
    /// buffered, force a backup refresh, walk away. `recover` picks it up
    /// later, in this process or the next one.
    pub async fn interrupt(&mut self) {
        self.download = None;
        if let Some(partial) = &self.partial {
            partial.sync().await;
        }
        if self.state == TransferState::Downloading || self.state == TransferState::Retrying {
            self.update_backup(true);
        }
    }

    /// Walk the transfer index and deal with what previous sessions left
    /// behind. Returns whether every entry was handled cleanly.
    pub fn cleanup_transfers(index_path: &Path, events: &dyn EventSink) -> bool {
        let entries = match index::entries(index_path) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return true,
            Err(e) => {
                error!("Failed to read transfer index: {}", e);
                return false;
            }
        };

        let mut all_ok = true;
        let mut can_cleanup = true;

        for destination in entries {
            let path = TransferPath::new(&destination);

            let backup_meta = fs::metadata(path.as_backup()).ok().filter(|m| m.is_file());
            let backup_found = backup_meta.is_some();
            let backup_is_empty = backup_meta.map_or(false, |m| m.len() == 0);
            let partial_found = fs::metadata(path.as_partial())
                .map(|m| m.is_file())
                .unwrap_or(false);

            if partial_found && !backup_found {
                // all data arrived; only the finalization was cut short
                if !Self::cleanup_finalize(&path, events) {
                    all_ok = false;
                }
            } else if partial_found && backup_is_empty {
                if !Self::cleanup_remove(&path, events) {
                    all_ok = false;
                }
            } else if partial_found && backup_found {
                // still in progress, claimable via recover()
                can_cleanup = false;
            }
        }

        if all_ok && can_cleanup {
            debug!("Transfer index drained, removing it");
            let _ = fs::remove_file(index_path);
        }

        all_ok
    }

    /// Turn a complete transfer directory into the plain file it stood for:
    /// move the partial aside, drop the directory, move the data into its
    /// place.
    fn cleanup_finalize(path: &TransferPath, events: &dyn EventSink) -> bool {
        let Some(parent) = path.as_destination().parent() else {
            return false;
        };
        let temporary = parent.join(FINALIZE_TEMP);
        // a leftover from an earlier interrupted finalization
        let _ = fs::remove_file(&temporary);

        if let Err(e) = fs::rename(path.as_partial(), &temporary) {
            error!("Failed to move partial file to temporary location: {}", e);
            return false;
        }
        if let Err(e) = fs::remove_dir(path.as_destination()) {
            error!("Failed to remove transfer directory: {}", e);
            return false;
        }
        if let Err(e) = fs::rename(&temporary, path.as_destination()) {
            error!("Failed to move temporary file to final location: {}", e);
            return false;
        }

        events.path_changed(path.as_destination(), Incident::Created);
        info!("Transfer {} cleaned up", path.as_destination().display());
        true
    }

    /// Remove a failed transfer. The partial file goes first: if it is still
    /// held open somewhere the removal fails here and the (empty) backup
    /// stays, keeping the directory recognizable for a later sweep.
    fn cleanup_remove(path: &TransferPath, events: &dyn EventSink) -> bool {
        let success = fs::remove_file(path.as_partial()).is_ok()
            && fs::remove_file(path.as_backup()).is_ok()
            && fs::remove_dir(path.as_destination()).is_ok();

        if success {
            events.path_changed(path.as_destination(), Incident::Deleted);
        }
        success
    }
}
