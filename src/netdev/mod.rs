//! Abstract link-layer device.
//!
//! The engine treats every driver identically through [`Netdev`]: a
//! blocking single-frame `inject` and a polling `capture` into a
//! caller-owned scratch buffer. The send and receive workers use disjoint
//! operations on a shared handle; drivers either expose independent
//! TX/RX paths or serialise internally.
//!
//! [`MockNetdev`] records injected frames and replays pre-queued inbound
//! frames, so the whole engine runs in unit tests without privileges.

#[cfg(target_os = "linux")]
pub mod raw_sock;

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

#[cfg(target_os = "linux")]
pub use raw_sock::RawSockNetdev;

/// Link-layer driver errors.
#[derive(Debug, thiserror::Error)]
pub enum NetdevError {
    #[error("failed to open device '{0}': {1}")]
    OpenFailed(String, String),

    #[error("inject failed: {0}")]
    InjectFailed(String),

    #[error("capture failed: {0}")]
    CaptureFailed(String),

    #[error("captured frame of {got} bytes exceeds the {cap}-byte buffer")]
    FrameTooLarge { got: usize, cap: usize },
}

/// Raw link-layer reader/writer.
///
/// Opening is the driver constructor and closing is `Drop`; the C-style
/// `get_buf`/`release` buffer hand-off becomes the `buf` argument of
/// [`Netdev::capture`], whose borrow ends when the caller is done with the
/// frame.
pub trait Netdev: Send + Sync {
    /// Blocking send of one complete link-layer frame.
    fn inject(&self, frame: &[u8]) -> Result<(), NetdevError>;

    /// Poll briefly for one inbound frame, copying it into `buf` and
    /// returning its length, or `None` when nothing arrived within the
    /// poll window.
    fn capture(&self, buf: &mut [u8]) -> Result<Option<usize>, NetdevError>;

    /// Device name for diagnostics.
    fn name(&self) -> &str;
}

// ─────────────────────────────────────────────────────────────────────────────
// Mock driver
// ─────────────────────────────────────────────────────────────────────────────

/// In-memory driver for tests: injected frames are recorded in order,
/// captures replay frames queued by the test.
#[derive(Debug, Default)]
pub struct MockNetdev {
    sent: Mutex<Vec<Vec<u8>>>,
    rx: Mutex<VecDeque<Vec<u8>>>,
    fail_next_inject: Mutex<bool>,
}

impl MockNetdev {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a frame to be returned by a later `capture` call.
    pub fn queue_rx_frame(&self, frame: Vec<u8>) {
        self.rx.lock().unwrap().push_back(frame);
    }

    /// Number of frames injected so far.
    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    /// Snapshot of all injected frames, in order.
    pub fn sent_frames(&self) -> Vec<Vec<u8>> {
        self.sent.lock().unwrap().clone()
    }

    /// Make the next `inject` fail.
    pub fn fail_next_inject(&self) {
        *self.fail_next_inject.lock().unwrap() = true;
    }
}

impl Netdev for MockNetdev {
    fn inject(&self, frame: &[u8]) -> Result<(), NetdevError> {
        let mut fail = self.fail_next_inject.lock().unwrap();
        if *fail {
            *fail = false;
            return Err(NetdevError::InjectFailed("mock inject failure".into()));
        }
        self.sent.lock().unwrap().push(frame.to_vec());
        Ok(())
    }

    fn capture(&self, buf: &mut [u8]) -> Result<Option<usize>, NetdevError> {
        let frame = self.rx.lock().unwrap().pop_front();
        match frame {
            Some(frame) => {
                if frame.len() > buf.len() {
                    return Err(NetdevError::FrameTooLarge {
                        got: frame.len(),
                        cap: buf.len(),
                    });
                }
                buf[..frame.len()].copy_from_slice(&frame);
                Ok(Some(frame.len()))
            }
            None => {
                // Emulate the driver poll window so idle capture loops do
                // not spin hot in tests.
                std::thread::sleep(Duration::from_micros(200));
                Ok(None)
            }
        }
    }

    fn name(&self) -> &str {
        "mock"
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
