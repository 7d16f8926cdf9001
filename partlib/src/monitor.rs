//! Bookkeeping of transfers in flight, for whoever wants to watch them
//! (a UI, a remote status endpoint).
//!
//! A transfer owns one [`Slot`] for its whole life and reports through it;
//! observers take [`Monitor::status`] snapshots and may ask a transfer to
//! stop. Ids are minted at allocation and survive reboots via the backup, so
//! an observer can follow one logical transfer across power cycles.

use std::{
    fmt,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex,
    },
    time::{SystemTime, UNIX_EPOCH},
};

use log::debug;

use crate::partial_file::State;

/// How many transfers can run at once.
pub const MAX_SLOTS: usize = 4;

/// Terminal result of a transfer.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Outcome {
    Finished,
    Error,
    Stopped,
}

#[derive(Clone, Debug)]
pub struct TransferStatus {
    pub id: u32,
    pub destination: PathBuf,
    pub expected_size: u64,
    pub valid_size: u64,
    /// Bumped whenever progress restarts (retry, range jump); observers
    /// should reset their speed estimates when it changes.
    pub generation: u32,
    pub outcome: Option<Outcome>,
}

struct SlotInfo {
    id: u32,
    destination: PathBuf,
    expected_size: u64,
    valid_size: u64,
    generation: u32,
    stopped: bool,
    outcome: Option<Outcome>,
}

pub struct Monitor {
    slots: Mutex<[Option<SlotInfo>; MAX_SLOTS]>,
    next_id: AtomicU32,
}

impl Monitor {
    pub fn new() -> Arc<Self> {
        // seed ids from the clock so they don't collide across reboots
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(1);

        Arc::new(Self {
            slots: Mutex::new(std::array::from_fn(|_| None)),
            next_id: AtomicU32::new(seed),
        })
    }

    /// Claim a slot for a transfer to `destination`. A recovered transfer
    /// passes `fresh = false` and its old id to keep its identity.
    pub fn allocate(
        self: &Arc<Self>,
        destination: &Path,
        expected_size: u64,
        fresh: bool,
        prior_id: Option<u32>,
    ) -> Option<Slot> {
        let id = match prior_id {
            Some(id) if !fresh => id,
            _ => self.next_id.fetch_add(1, Ordering::Relaxed),
        };

        let mut slots = self.slots.lock().unwrap();
        let index = slots.iter().position(|s| s.is_none())?;
        slots[index] = Some(SlotInfo {
            id,
            destination: destination.to_owned(),
            expected_size,
            valid_size: 0,
            generation: 0,
            stopped: false,
            outcome: None,
        });

        debug!("Allocated transfer slot {} (id {})", index, id);
        Some(Slot {
            monitor: Arc::clone(self),
            index,
            id,
            destination: destination.to_owned(),
        })
    }

    /// Snapshot of every live transfer.
    pub fn status(&self) -> Vec<TransferStatus> {
        let slots = self.slots.lock().unwrap();
        slots
            .iter()
            .flatten()
            .map(|info| TransferStatus {
                id: info.id,
                destination: info.destination.clone(),
                expected_size: info.expected_size,
                valid_size: info.valid_size,
                generation: info.generation,
                outcome: info.outcome,
            })
            .collect()
    }

    /// Ask the transfer with the given id to stop. Honored on its next step.
    pub fn stop(&self, id: u32) -> bool {
        let mut slots = self.slots.lock().unwrap();
        for info in slots.iter_mut().flatten() {
            if info.id == id {
                info.stopped = true;
                return true;
            }
        }
        false
    }

    fn with_slot(&self, index: usize, f: impl FnOnce(&mut SlotInfo)) {
        let mut slots = self.slots.lock().unwrap();
        if let Some(info) = &mut slots[index] {
            f(info);
        }
    }
}

/// A transfer's handle on its monitor entry. Freed on drop.
pub struct Slot {
    monitor: Arc<Monitor>,
    index: usize,
    id: u32,
    destination: PathBuf,
}

impl fmt::Debug for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Slot")
            .field("index", &self.index)
            .field("id", &self.id)
            .field("destination", &self.destination)
            .finish()
    }
}

impl Slot {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn destination(&self) -> &Path {
        &self.destination
    }

    /// Publish the current valid-range state. `reset` marks a restart of
    /// progress rather than its continuation.
    pub fn progress(&self, state: &State, reset: bool) {
        self.monitor.with_slot(self.index, |info| {
            info.valid_size = state.get_valid_size();
            info.expected_size = state.total_size;
            if reset {
                info.generation += 1;
            }
        });
    }

    pub fn update_expected_size(&self, size: u64) {
        self.monitor.with_slot(self.index, |info| info.expected_size = size);
    }

    pub fn is_stopped(&self) -> bool {
        let slots = self.monitor.slots.lock().unwrap();
        slots[self.index].as_ref().map_or(false, |info| info.stopped)
    }

    pub fn done(&self, outcome: Outcome) {
        self.monitor.with_slot(self.index, |info| info.outcome = Some(outcome));
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        let mut slots = self.monitor.slots.lock().unwrap();
        slots[self.index] = None;
    }
}
