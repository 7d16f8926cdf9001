//! Policies deciding where the next download request should start.
//!
//! Plain G-code readers want the file's header (previews) and tail (print
//! stats) early, so those files are fetched head first, then tail, then the
//! body in one long run. Everything else downloads linearly.

use std::path::Path;

use crate::filename;
use crate::partial_file::State;

/// Bytes of the file header fetched before jumping to the tail.
pub const HEAD_SIZE: u64 = 4096;

/// Bytes off the end of the file fetched before filling the body.
pub const TAIL_SIZE: u64 = 4096;

/// Files smaller than this download linearly; the jumps are not worth the
/// extra requests.
pub const MINIMAL_FILE_SIZE: u64 = 64 * 1024;

/// What the transfer loop should do after a policy step.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Action {
    Continue,
    /// Tear down the current request and issue a new one at
    /// [`DownloadOrder::next_offset`].
    RangeJump,
    Finished,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum PlainGcodeState {
    DownloadingHeader,
    DownloadingTail,
    DownloadedBase,
    DownloadingBody,
    Finished,
}

/// Head, then tail, then body.
#[derive(Clone, Copy, Debug)]
pub struct PlainGcodeDownloadOrder {
    state: PlainGcodeState,
}

impl PlainGcodeDownloadOrder {
    /// Pick the starting state from what is already valid, so a recovered
    /// transfer does not re-fetch parts it has.
    fn new(file: &State) -> Self {
        let state = if file.has_valid_head(HEAD_SIZE) {
            if file.has_valid_tail(TAIL_SIZE) {
                if file.is_complete() {
                    PlainGcodeState::Finished
                } else {
                    PlainGcodeState::DownloadedBase
                }
            } else {
                PlainGcodeState::DownloadingTail
            }
        } else {
            PlainGcodeState::DownloadingHeader
        };

        Self { state }
    }

    fn step(&mut self, file: &State) -> Action {
        match self.state {
            PlainGcodeState::DownloadingHeader => {
                if file.has_valid_head(HEAD_SIZE) {
                    self.state = PlainGcodeState::DownloadingTail;
                    return Action::RangeJump;
                }
                Action::Continue
            }
            PlainGcodeState::DownloadingTail => {
                if file.has_valid_tail(TAIL_SIZE) {
                    self.state = PlainGcodeState::DownloadedBase;
                    return Action::RangeJump;
                }
                Action::Continue
            }
            PlainGcodeState::DownloadedBase => {
                self.state = PlainGcodeState::DownloadingBody;
                Action::Continue
            }
            PlainGcodeState::DownloadingBody => {
                if file.is_complete() {
                    self.state = PlainGcodeState::Finished;
                    Action::Finished
                } else {
                    Action::Continue
                }
            }
            PlainGcodeState::Finished => Action::Finished,
        }
    }

    fn next_offset(&self, file: &State) -> u64 {
        match self.state {
            PlainGcodeState::DownloadingHeader => file.valid_head.map_or(0, |head| head.end),
            PlainGcodeState::DownloadingTail => file
                .valid_tail
                .map_or(file.total_size - TAIL_SIZE, |tail| tail.end),
            PlainGcodeState::DownloadedBase
            | PlainGcodeState::DownloadingBody
            | PlainGcodeState::Finished => file.valid_head.map_or(0, |head| head.end),
        }
    }
}

/// Start to finish, in one run.
#[derive(Clone, Copy, Debug, Default)]
pub struct GenericFileDownloadOrder;

impl GenericFileDownloadOrder {
    fn step(&mut self, file: &State) -> Action {
        if file.is_complete() {
            Action::Finished
        } else {
            Action::Continue
        }
    }

    fn next_offset(&self, file: &State) -> u64 {
        file.valid_head.map_or(0, |head| head.end)
    }
}

#[derive(Clone, Copy, Debug)]
pub enum DownloadOrder {
    PlainGcode(PlainGcodeDownloadOrder),
    Generic(GenericFileDownloadOrder),
}

impl DownloadOrder {
    /// Select the policy for a transfer by destination filename and size.
    pub fn for_transfer(destination: &Path, file: &State) -> Self {
        if filename::is_plain_gcode(destination) && file.total_size >= MINIMAL_FILE_SIZE {
            Self::PlainGcode(PlainGcodeDownloadOrder::new(file))
        } else {
            Self::Generic(GenericFileDownloadOrder)
        }
    }

    pub fn step(&mut self, file: &State) -> Action {
        match self {
            Self::PlainGcode(order) => order.step(file),
            Self::Generic(order) => order.step(file),
        }
    }

    /// Where the next request should start. The transfer rounds this down to
    /// a sector boundary before using it.
    pub fn next_offset(&self, file: &State) -> u64 {
        match self {
            Self::PlainGcode(order) => order.next_offset(file),
            Self::Generic(order) => order.next_offset(file),
        }
    }
}
