use std::cell::Cell;
use std::rc::Rc;

/// Source of "now" in milliseconds.
///
/// Values must be monotonic within a context. Contexts exchanging storage
/// records compare each other's timestamps, so implementations should share
/// an epoch across windows of the same origin (the web implementation uses
/// `performance.timeOrigin + performance.now()`).
pub trait TimeSource {
    fn now_ms(&self) -> i64;
}

impl<T: TimeSource + ?Sized> TimeSource for Rc<T> {
    fn now_ms(&self) -> i64 {
        (**self).now_ms()
    }
}

/// Hand-driven clock for tests and the simulator. Clones share one counter,
/// so every context built from the same clock sees the same time.
#[derive(Clone, Debug, Default)]
pub struct ManualTimeSource {
    now: Rc<Cell<i64>>,
}

impl ManualTimeSource {
    pub fn starting_at(now_ms: i64) -> Self {
        Self {
            now: Rc::new(Cell::new(now_ms)),
        }
    }

    pub fn set(&self, now_ms: i64) {
        self.now.set(now_ms);
    }

    pub fn advance(&self, delta_ms: i64) {
        self.now.set(self.now.get() + delta_ms);
    }
}

impl TimeSource for ManualTimeSource {
    fn now_ms(&self) -> i64 {
        self.now.get()
    }
}

/// Clock offset from a base, for contexts whose monotonic clocks disagree.
#[derive(Clone, Debug)]
pub struct SkewedTimeSource<T> {
    base: T,
    skew_ms: i64,
}

impl<T: TimeSource> SkewedTimeSource<T> {
    pub fn new(base: T, skew_ms: i64) -> Self {
        Self { base, skew_ms }
    }
}

impl<T: TimeSource> TimeSource for SkewedTimeSource<T> {
    fn now_ms(&self) -> i64 {
        self.base.now_ms() + self.skew_ms
    }
}

/// Native monotonic clock anchored to the Unix epoch at construction.
#[cfg(not(target_arch = "wasm32"))]
#[derive(Clone, Debug)]
pub struct SystemTimeSource {
    origin: std::time::Instant,
    origin_epoch_ms: i64,
}

#[cfg(not(target_arch = "wasm32"))]
impl SystemTimeSource {
    pub fn new() -> Self {
        let origin_epoch_ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        Self {
            origin: std::time::Instant::now(),
            origin_epoch_ms,
        }
    }
}

#[cfg(not(target_arch = "wasm32"))]
impl Default for SystemTimeSource {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(not(target_arch = "wasm32"))]
impl TimeSource for SystemTimeSource {
    fn now_ms(&self) -> i64 {
        self.origin_epoch_ms + self.origin.elapsed().as_millis() as i64
    }
}
