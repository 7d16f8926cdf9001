//! Terminal meter for downloads that fill a file from both ends.
//!
//! Unlike an ordinary progress bar, the meter takes the sizes of the two
//! valid ranges of the file being filled: the bar grows inward from the left
//! for the head and from the right for the tail, so a range-jumping download
//! looks like what it is.

mod format;

use format::{BinarySize, ClockDuration};

use std::{
    collections::VecDeque,
    io::Write,
    time::{Duration, Instant},
};

use crossterm::{
    cursor::MoveToColumn,
    style::Print,
    terminal::{Clear, ClearType},
    tty::IsTty,
    QueueableCommand,
    Result,
};

/// Width of the bar portion in characters.
const BAR_WIDTH: usize = 30;

/// Time window for the moving-average speed.
const SPEED_WINDOW: Duration = Duration::from_secs(10);

/// Receives progress values and keeps enough of them to compute the average
/// progression speed over a fixed window of time.
#[derive(Debug)]
struct SpeedWindow {
    buf: VecDeque<(Instant, u64)>,
}

impl SpeedWindow {
    fn new() -> Self {
        Self { buf: VecDeque::new() }
    }

    fn reset(&mut self) {
        self.buf.clear();
    }

    fn record(&mut self, value: u64) {
        let now = Instant::now();

        // a value running backwards means progress restarted under us
        if matches!(self.buf.back(), Some((_, last)) if *last > value) {
            self.buf.clear();
        }
        self.buf.push_back((now, value));

        while matches!(self.buf.front(), Some((at, _)) if now - *at > SPEED_WINDOW) {
            self.buf.pop_front();
        }
    }

    fn bytes_per_sec(&self) -> f64 {
        match (self.buf.front(), self.buf.back()) {
            (Some(first), Some(last)) if first.0 != last.0 => {
                (last.1 - first.1) as f64 / (last.0 - first.0).as_secs_f64()
            }
            _ => 0.0,
        }
    }
}

/// How the meter should be drawn.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MeterDrawMode {
    /// Overwrite the same line during each rendering frame. For interactive
    /// terminals.
    Interactive,
    /// Append a new line during each rendering frame. For output redirected
    /// to a file and for mixing with log messages.
    Append,
    /// Do not draw at all.
    None,
}

impl MeterDrawMode {
    fn default_fps(self) -> f64 {
        match self {
            Self::Interactive => 15.0,
            Self::Append => 0.2,
            Self::None => 0.0,
        }
    }
}

/// The meter itself, drawing to any terminal-ish `Write`.
pub struct Meter<T: Write + IsTty> {
    term: T,
    total: u64,
    head: u64,
    tail: u64,
    valid: u64,
    mode: MeterDrawMode,
    fps: f64,
    started: Instant,
    last_draw: Option<Instant>,
    speed: SpeedWindow,
}

impl<T: Write + IsTty> Meter<T> {
    /// Construct a meter for a file of `total` bytes. The draw mode defaults
    /// to interactive when the terminal is a tty and append otherwise.
    pub fn new(term: T, total: u64) -> Self {
        let mode = if term.is_tty() {
            MeterDrawMode::Interactive
        } else {
            MeterDrawMode::Append
        };

        Self {
            term,
            total,
            head: 0,
            tail: 0,
            valid: 0,
            mode,
            fps: mode.default_fps(),
            started: Instant::now(),
            last_draw: None,
            speed: SpeedWindow::new(),
        }
    }

    pub fn mode(&self) -> MeterDrawMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: MeterDrawMode) {
        self.mode = mode;
        self.fps = mode.default_fps();
    }

    pub fn set_total(&mut self, total: u64) {
        self.total = total;
    }

    /// Forget the speed history, eg. after a retry, so the average is not
    /// polluted by the stall.
    pub fn reset_speed(&mut self) {
        self.speed.reset();
    }

    /// Feed the current head/tail extents and total valid byte count; redraw
    /// if a rendering frame is due.
    pub fn update(&mut self, head: u64, tail: u64, valid: u64) -> Result<()> {
        self.head = head;
        self.tail = tail;
        self.valid = valid;
        self.speed.record(valid);

        let due = match self.last_draw {
            None => true,
            Some(at) => self.fps > 0.0 && at.elapsed().as_secs_f64() >= 1.0 / self.fps,
        };
        if due {
            self.draw()?;
        }

        Ok(())
    }

    /// Print a message above the meter without tearing the bar line.
    pub fn println(&mut self, msg: &str) -> Result<()> {
        if self.mode == MeterDrawMode::Interactive {
            self.term
                .queue(MoveToColumn(0))?
                .queue(Clear(ClearType::CurrentLine))?;
        }
        self.term.queue(Print(msg))?.queue(Print("\n"))?;
        if self.mode == MeterDrawMode::Interactive {
            self.draw()?;
        }
        self.term.flush()?;

        Ok(())
    }

    /// Draw one final frame and move to a fresh line.
    pub fn finish(&mut self) -> Result<()> {
        if self.mode != MeterDrawMode::None {
            self.draw()?;
            self.term.queue(Print("\n"))?;
            self.term.flush()?;
        }

        Ok(())
    }

    fn render_line(&self) -> String {
        let head_cells = scale(self.head, self.total);
        let tail_cells = scale(self.tail, self.total);
        let bar: String = (0..BAR_WIDTH)
            .map(|i| {
                if i < head_cells || i >= BAR_WIDTH - tail_cells {
                    '#'
                } else {
                    '-'
                }
            })
            .collect();

        let percent = if self.total > 0 {
            self.valid * 100 / self.total
        } else {
            0
        };

        let speed = self.speed.bytes_per_sec();
        let eta = if speed > 0.0 && self.valid < self.total {
            let remaining = (self.total - self.valid) as f64 / speed;
            format!(" ETA {}", ClockDuration(Duration::from_secs_f64(remaining)))
        } else {
            String::new()
        };

        format!(
            "[{}] {:3}% {} / {} {}/s elapsed {}{}",
            bar,
            percent,
            BinarySize(self.valid),
            BinarySize(self.total),
            BinarySize(speed as u64),
            ClockDuration(self.started.elapsed()),
            eta,
        )
    }

    fn draw(&mut self) -> Result<()> {
        match self.mode {
            MeterDrawMode::Interactive => {
                let line = self.render_line();
                self.term
                    .queue(MoveToColumn(0))?
                    .queue(Clear(ClearType::CurrentLine))?
                    .queue(Print(line))?;
                self.term.flush()?;
            }
            MeterDrawMode::Append => {
                let line = self.render_line();
                self.term.queue(Print(line))?.queue(Print("\n"))?;
                self.term.flush()?;
            }
            MeterDrawMode::None => {}
        }

        self.last_draw = Some(Instant::now());
        Ok(())
    }
}

/// Bar cells covered by `value` out of `total`.
fn scale(value: u64, total: u64) -> usize {
    if total == 0 {
        return 0;
    }
    ((value as f64 / total as f64) * BAR_WIDTH as f64).round() as usize
}
