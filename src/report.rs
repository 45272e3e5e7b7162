//! Human readable status reporting.
//!
//! Status lines are meant for whoever watches the update: an attached display or the host.
//! They are independent of the developer logging, which only exists with the `defmt` feature.

use core::fmt::Write as _;

use serde::Serialize;

/// Longest status message, in bytes. Longer messages are truncated.
pub const MESSAGE_CAPACITY: usize = 100;

pub type Message = heapless::String<MESSAGE_CAPACITY>;

/// Render a status message, truncating whatever does not fit.
pub fn format_message(args: core::fmt::Arguments<'_>) -> Message {
    let mut message = Message::new();
    let _ = message.write_fmt(args);
    message
}

/// Consumer of status messages, also serviced once per updater step.
pub trait Diagnostics {
    /// Emit a single status line.
    ///
    /// `text` never contains quotes, backslashes or newlines.
    fn message(&mut self, text: &str);

    /// Housekeeping that has to happen at a bounded interval, like kicking the watchdog or blinking a heartbeat LED.
    fn tick(&mut self) {}
}

impl<D: Diagnostics + ?Sized> Diagnostics for &mut D {
    fn message(&mut self, text: &str) {
        (**self).message(text)
    }

    fn tick(&mut self) {
        (**self).tick()
    }
}

#[derive(Serialize)]
struct StatusLine<'a> {
    message: &'a str,
}

/// Writes every message as a single line JSON object: `{"message":"..."}`.
///
/// Writing is best-effort: a failing writer must not hold up the update.
pub struct JsonLines<W> {
    writer: W,
}

impl<W: embedded_io::Write> JsonLines<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn release(self) -> W {
        self.writer
    }
}

impl<W: embedded_io::Write> Diagnostics for JsonLines<W> {
    fn message(&mut self, text: &str) {
        let mut buffer = [0u8; MESSAGE_CAPACITY + 16];
        let Ok(len) = serde_json_core::to_slice(&StatusLine { message: text }, &mut buffer) else {
            warn!("status message does not fit");
            return;
        };

        let written = self
            .writer
            .write_all(&buffer[..len])
            .and_then(|()| self.writer.write_all(b"\n"))
            .and_then(|()| self.writer.flush());
        if written.is_err() {
            warn!("status message not written");
        }
    }
}

/// Tracks which progress thresholds have been reported.
///
/// Every threshold is reported at most once, and reported percentages never decrease.
#[derive(Clone, Debug)]
pub struct Progress {
    increment: u32,
    next: u32,
}

impl Progress {
    /// Report every `increment` percent.
    pub const fn new(increment: u8) -> Self {
        Self {
            increment: increment as u32,
            next: increment as u32,
        }
    }

    /// Start over from zero, for when the image is written again.
    pub fn reset(&mut self) {
        self.next = self.increment;
    }

    /// Percentage to report after `done` of `total` bytes, if that crosses a new threshold.
    pub fn update(&mut self, done: u32, total: u32) -> Option<u32> {
        if total == 0 || self.increment == 0 {
            return None;
        }

        let percent = (u64::from(done) * 100 / u64::from(total)).min(100) as u32;
        if percent < self.next {
            return None;
        }

        while self.next <= percent {
            self.next += self.increment;
        }
        Some(percent)
    }
}
