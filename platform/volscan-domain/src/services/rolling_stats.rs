use crate::value_objects::candle::Candle;
use crate::value_objects::symbol::Symbol;
use crate::value_objects::timeframe::buckets_covering;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

// Exact recomputation cadence; bounds accumulated floating-point drift from add/remove pairs.
const RESYNC_EVERY: u64 = 4096;
const CANCELLATION_RATIO: f64 = 1e-6;

/// Point-in-time volume statistics of one symbol's trailing window.
///
/// `n == 0` means insufficient data; mean and std_dev are then both 0.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct VolumeStats {
    pub n: usize,
    pub mean: f64,
    /// Population standard deviation.
    pub std_dev: f64,
    pub newest_period_end: Option<i64>,
}

impl VolumeStats {
    /// Two-pass batch computation over raw volumes.
    pub fn from_volumes(volumes: &[f64], newest_period_end: Option<i64>) -> Self {
        if volumes.is_empty() {
            return Self::default();
        }
        let n = volumes.len() as f64;
        let mean = volumes.iter().sum::<f64>() / n;
        let var = volumes.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n;
        Self {
            n: volumes.len(),
            mean,
            std_dev: var.max(0.0).sqrt(),
            newest_period_end,
        }
    }
}

/// Trailing-window summary of one symbol.
///
/// Window membership is `now - window_seconds < period_end <= now`. Entries are kept in a
/// ring buffer of `(period_end, volume)` so that a contribution can be reversed exactly
/// when it ages out; mean and M2 are maintained with add/remove Welford updates.
#[derive(Debug, Clone)]
pub struct SymbolWindowState {
    window_seconds: i64,
    capacity: usize,
    entries: VecDeque<(i64, f64)>,
    mean: f64,
    m2: f64,
    window_start: Option<i64>,
    folds_since_resync: u64,
}

impl SymbolWindowState {
    pub fn new(window_seconds: i64, capacity: usize) -> Self {
        Self {
            window_seconds,
            capacity: capacity.max(1),
            entries: VecDeque::with_capacity(capacity.max(1)),
            mean: 0.0,
            m2: 0.0,
            window_start: None,
            folds_since_resync: 0,
        }
    }

    pub fn count(&self) -> usize {
        self.entries.len()
    }

    pub fn sum_volume(&self) -> f64 {
        self.mean * self.entries.len() as f64
    }

    pub fn sum_squared_volume(&self) -> f64 {
        let n = self.entries.len() as f64;
        self.m2 + n * self.mean * self.mean
    }

    /// Exclusive lower bound of the window after the latest eviction.
    pub fn window_start(&self) -> Option<i64> {
        self.window_start
    }

    pub fn newest_period_end(&self) -> Option<i64> {
        self.entries.back().map(|(end, _)| *end)
    }

    /// Drops entries that fell out of the window ending at `now`. The window never moves back.
    pub fn evict(&mut self, now: i64) {
        let cutoff = now.saturating_sub(self.window_seconds);
        let cutoff = match self.window_start {
            Some(current) if current >= cutoff => current,
            _ => {
                self.window_start = Some(cutoff);
                cutoff
            }
        };

        while let Some(&(end, volume)) = self.entries.front() {
            if end > cutoff {
                break;
            }
            self.entries.pop_front();
            self.remove(volume);
        }
    }

    /// Folds one finalized observation. Returns `false` when it was ignored because it is not
    /// newer than the newest folded entry (re-delivery) or already outside the window.
    pub fn fold(&mut self, period_end: i64, volume: f64) -> bool {
        if !volume.is_finite() {
            return false;
        }
        if let Some(newest) = self.newest_period_end() {
            if period_end <= newest {
                return false;
            }
        }

        self.evict(period_end);
        if self.window_start.is_some_and(|start| period_end <= start) {
            return false;
        }

        self.entries.push_back((period_end, volume));
        self.add(volume);
        while self.entries.len() > self.capacity {
            if let Some((_, front)) = self.entries.pop_front() {
                self.remove(front);
            }
        }

        self.folds_since_resync += 1;
        if self.folds_since_resync >= RESYNC_EVERY {
            self.resync();
        }
        true
    }

    pub fn stats_at(&mut self, now: i64) -> VolumeStats {
        self.evict(now);
        match self.newest_period_end() {
            None => VolumeStats::default(),
            Some(newest) if newest <= now => {
                let n = self.entries.len();
                VolumeStats {
                    n,
                    mean: self.mean,
                    std_dev: (self.m2 / n as f64).max(0.0).sqrt(),
                    newest_period_end: Some(newest),
                }
            }
            Some(_) => {
                // Entries newer than `now` are not part of this snapshot.
                let visible: Vec<(i64, f64)> = self
                    .entries
                    .iter()
                    .copied()
                    .filter(|(end, _)| *end <= now)
                    .collect();
                let volumes: Vec<f64> = visible.iter().map(|(_, v)| *v).collect();
                VolumeStats::from_volumes(&volumes, visible.last().map(|(end, _)| *end))
            }
        }
    }

    fn add(&mut self, x: f64) {
        let n = self.entries.len() as f64;
        let delta = x - self.mean;
        self.mean += delta / n;
        self.m2 += delta * (x - self.mean);
    }

    // Called after the entry was already popped, so `entries.len()` is the new count.
    fn remove(&mut self, x: f64) {
        let remaining = self.entries.len();
        if remaining == 0 {
            self.mean = 0.0;
            self.m2 = 0.0;
            return;
        }
        let n_prev = (remaining + 1) as f64;
        let m2_prev = self.m2;
        let mean_prev = self.mean;
        let mean_new = mean_prev + (mean_prev - x) / (n_prev - 1.0);
        self.m2 -= (x - mean_prev) * (x - mean_new);
        self.mean = mean_new;
        // Removing a dominant outlier cancels almost all of M2; the remainder is then mostly
        // rounding error, so recompute it from the buffer.
        if m2_prev > 0.0 && self.m2 <= m2_prev * CANCELLATION_RATIO {
            self.resync();
        }
        if self.m2 < 0.0 {
            self.m2 = 0.0;
        }
    }

    fn resync(&mut self) {
        self.folds_since_resync = 0;
        let n = self.entries.len();
        if n == 0 {
            self.mean = 0.0;
            self.m2 = 0.0;
            return;
        }
        let mean = self.entries.iter().map(|(_, v)| v).sum::<f64>() / n as f64;
        self.m2 = self
            .entries
            .iter()
            .map(|(_, v)| (v - mean) * (v - mean))
            .sum();
        self.mean = mean;
    }
}

/// Per-symbol rolling volume statistics shared by all pipeline workers.
///
/// Each symbol's state sits behind its own lock, so updates for different symbols do not
/// contend; the outer map lock is only taken for writing when a symbol is first seen.
/// Upper bound on the per-symbol ring buffer.
pub const MAX_WINDOW_CANDLES: usize = 100_000;

#[derive(Debug)]
pub struct RollingStatsEngine {
    window_seconds: i64,
    capacity: usize,
    states: RwLock<HashMap<Symbol, Arc<Mutex<SymbolWindowState>>>>,
}

impl RollingStatsEngine {
    pub fn new(window_seconds: i64, step_seconds: i64) -> Result<Self, String> {
        if step_seconds <= 0 {
            return Err("step_seconds must be > 0".to_string());
        }
        if window_seconds < step_seconds {
            return Err(format!(
                "window ({window_seconds}s) must cover at least one bucket ({step_seconds}s)"
            ));
        }
        let capacity = usize::try_from(buckets_covering(window_seconds, step_seconds))
            .ok()
            .filter(|capacity| *capacity <= MAX_WINDOW_CANDLES)
            .ok_or_else(|| {
                format!("window ({window_seconds}s) exceeds {MAX_WINDOW_CANDLES} buckets")
            })?;
        Ok(Self {
            window_seconds,
            capacity,
            states: RwLock::new(HashMap::new()),
        })
    }

    pub fn window_seconds(&self) -> i64 {
        self.window_seconds
    }

    /// Ring buffer size per symbol, in candles.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn tracked_symbols(&self) -> usize {
        self.states.read().len()
    }

    pub fn update(&self, symbol: &Symbol, candle: &Candle) -> bool {
        self.state(symbol)
            .lock()
            .fold(candle.period_end, candle.volume)
    }

    pub fn snapshot(&self, symbol: &Symbol, now: i64) -> VolumeStats {
        let Some(state) = self.states.read().get(symbol).cloned() else {
            return VolumeStats::default();
        };
        let mut guard = state.lock();
        guard.stats_at(now)
    }

    /// Copy of a symbol's window state, for inspection.
    pub fn window_state(&self, symbol: &Symbol) -> Option<SymbolWindowState> {
        let state = self.states.read().get(symbol).cloned()?;
        let guard = state.lock();
        Some(guard.clone())
    }

    fn state(&self, symbol: &Symbol) -> Arc<Mutex<SymbolWindowState>> {
        if let Some(state) = self.states.read().get(symbol) {
            return state.clone();
        }
        self.states
            .write()
            .entry(symbol.clone())
            .or_insert_with(|| {
                Arc::new(Mutex::new(SymbolWindowState::new(
                    self.window_seconds,
                    self.capacity,
                )))
            })
            .clone()
    }
}
