//! Status line rendering.
//!
//! One line on stderr, redrawn in place: progress percent, instantaneous
//! send rate, sent and reply counters, then the post-scan drain countdown.
//! The status monitor owns stderr; `--quiet` turns every call into a
//! no-op.

use std::io::Write;
use std::time::Instant;

const CURSOR_HIDE: &str = "\x1b[?25l";
const CURSOR_SHOW: &str = "\x1b[?25h";
const LINE_CLEAR: &str = "\x1b[2K";

pub struct StatusLine {
    quiet: bool,
    last_tick: Instant,
    last_sent: u64,
}

impl StatusLine {
    pub fn new(quiet: bool) -> Self {
        Self {
            quiet,
            last_tick: Instant::now(),
            last_sent: 0,
        }
    }

    pub fn begin(&self) {
        if !self.quiet {
            eprint!("{CURSOR_HIDE}");
        }
    }

    /// Redraw the progress line and update the rate window.
    pub fn tick(&mut self, sent: u64, probe: u64, recv: u64, total: u64) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_tick).as_secs_f64();
        let rate = if elapsed > 0.0 {
            (sent.saturating_sub(self.last_sent)) as f64 / elapsed
        } else {
            0.0
        };
        self.last_tick = now;
        self.last_sent = sent;

        if self.quiet {
            return;
        }
        let percent = if total > 0 {
            probe as f64 * 100.0 / total as f64
        } else {
            100.0
        };
        eprint!(
            "\r{LINE_CLEAR}Progress: {percent:6.2}% Rate: {:.2}kpps Sent: {sent} Replies: {recv} ",
            rate / 1000.0
        );
        let _ = std::io::stderr().flush();
    }

    /// Drain countdown shown once per second after the last probe.
    pub fn waiting(&self, seconds_left: u64) {
        if self.quiet {
            return;
        }
        eprint!("\r{LINE_CLEAR}Waiting for {seconds_left} seconds...");
        let _ = std::io::stderr().flush();
    }

    pub fn finish(&self) {
        if !self.quiet {
            eprint!("\r{LINE_CLEAR}{CURSOR_SHOW}");
            let _ = std::io::stderr().flush();
        }
    }
}
