//! Aggregated-derivative (AGD) intensity detector (spec §4.5).
//!
//! Grounded on the original `inputs/agd/input.py`: a sliding window of the
//! last `capacity` positive derivatives, reset to empty on any negative
//! derivative, compared against ordered thresholds to produce a discrete
//! level.

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::warn;

use crate::bus::{AgdSample, Bus, LevelChangeRequest, SetThresholdRequest, ThresholdChanged};

pub struct AgdState {
    capacity: usize,
    thresholds: Vec<i64>,
    ring: VecDeque<i64>,
    sum: i64,
    last_reading: Option<i64>,
    last_level: u32,
}

impl AgdState {
    pub fn new(capacity: usize, thresholds: Vec<i64>) -> Self {
        Self {
            capacity: capacity.max(1),
            thresholds,
            ring: VecDeque::with_capacity(capacity.max(1)),
            sum: 0,
            last_reading: None,
            last_level: 0,
        }
    }

    pub fn sum(&self) -> i64 {
        self.sum
    }

    pub fn last_level(&self) -> u32 {
        self.last_level
    }

    /// Applies one reading to the running aggregation and returns the
    /// resulting `(sum, level)`, publishing `change_play_level` (if the
    /// level changed) and `agd_output` (always) on `bus` (spec §4.5
    /// algorithm steps 1–6).
    pub async fn apply(&mut self, reading: i64, source: &'static str, bus: &Bus) -> (i64, u32) {
        let Some(previous) = self.last_reading else {
            self.last_reading = Some(reading);
            bus.agd_output
                .publish(AgdSample {
                    raw: reading as f64,
                    agd: self.sum,
                })
                .await;
            return (self.sum, self.last_level);
        };

        let delta = reading - previous;
        self.last_reading = Some(reading);

        if delta < 0 {
            self.sum = 0;
            self.ring.clear();
        } else if self.ring.len() < self.capacity {
            self.ring.push_back(delta);
            self.sum += delta;
        } else {
            let oldest = self.ring.pop_front().unwrap_or(0);
            self.ring.push_back(delta);
            self.sum += delta - oldest;
        }

        let level = self.level_for_sum();
        if level != self.last_level {
            self.last_level = level;
            bus.change_play_level
                .publish(LevelChangeRequest { level, source })
                .await;
        }

        bus.agd_output
            .publish(AgdSample {
                raw: reading as f64,
                agd: self.sum,
            })
            .await;

        (self.sum, level)
    }

    fn level_for_sum(&self) -> u32 {
        let mut level = 0u32;
        for (idx, threshold) in self.thresholds.iter().enumerate() {
            if self.sum >= *threshold {
                level = (idx + 1) as u32;
            }
        }
        level
    }

    /// 1-indexed per spec §4.5; out-of-range is ignored with a warning.
    pub async fn set_threshold(&mut self, k: usize, value: i64, bus: &Bus) {
        if k == 0 || k > self.thresholds.len() {
            warn!(k, value, "set_threshold: index out of range, ignoring");
            return;
        }
        self.thresholds[k - 1] = value;
        bus.threshold_changed
            .publish(ThresholdChanged { level: k, value })
            .await;
    }

    /// Recomputes the aggregation from scratch over `readings`, used as the
    /// reference implementation that the streaming variant must match
    /// (spec §4.5, P1).
    pub fn reference_sum(capacity: usize, readings: &[i64]) -> i64 {
        let capacity = capacity.max(1);
        let mut ring: VecDeque<i64> = VecDeque::with_capacity(capacity);
        let mut sum = 0i64;
        for window in readings.windows(2) {
            let delta = window[1] - window[0];
            if delta < 0 {
                sum = 0;
                ring.clear();
                continue;
            }
            if ring.len() == capacity {
                let oldest = ring.pop_front().unwrap_or(0);
                sum += delta - oldest;
            } else {
                sum += delta;
            }
            ring.push_back(delta);
        }
        sum
    }
}

/// Pairs a shared, lockable `AgdState` with the `Bus`, and attaches a
/// `set_threshold_request` handler so web/control-surface requests take
/// effect on the live state (spec §6 `set_agd_threshold`).
pub struct AgdDetector {
    state: Arc<tokio::sync::Mutex<AgdState>>,
    bus: Arc<Bus>,
    source: &'static str,
}

impl AgdDetector {
    pub async fn new(capacity: usize, thresholds: Vec<i64>, source: &'static str, bus: Arc<Bus>) -> Self {
        let state = Arc::new(tokio::sync::Mutex::new(AgdState::new(capacity, thresholds)));

        let handler_state = state.clone();
        let handler_bus = bus.clone();
        bus.set_threshold_request
            .attach(move |req: SetThresholdRequest| {
                let handler_state = handler_state.clone();
                let handler_bus = handler_bus.clone();
                async move {
                    handler_state
                        .lock()
                        .await
                        .set_threshold(req.level, req.value, &handler_bus)
                        .await;
                    Ok(())
                }
            })
            .await;

        Self { state, bus, source }
    }

    pub async fn feed(&self, reading: i64) -> (i64, u32) {
        self.state.lock().await.apply(reading, self.source, &self.bus).await
    }

    pub async fn sum(&self) -> i64 {
        self.state.lock().await.sum()
    }

    pub async fn last_level(&self) -> u32 {
        self.state.lock().await.last_level()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scenario_s1_matches_spec_table() {
        // spec.md §8 (S1): capacity=5, thresholds=[10,20,30],
        // readings 10,12,15,19,20,20,19,22.
        let bus = Arc::new(Bus::default());
        let detector = AgdDetector::new(5, vec![10, 20, 30], "test", bus.clone()).await;

        let mut level_changes = Vec::new();
        bus.change_play_level
            .attach(move |req| async move {
                let _ = &req;
                Ok(())
            })
            .await;

        let readings = [10, 12, 15, 19, 20, 20, 19, 22];
        let mut sums = Vec::new();
        let mut levels = Vec::new();
        for r in readings {
            let (sum, level) = detector.feed(r).await;
            sums.push(sum);
            levels.push(level);
        }
        level_changes.extend(levels.clone());

        assert_eq!(sums, vec![0, 2, 5, 9, 10, 10, 0, 3]);
        // 0->1 at the 4th reading (19), 1->0 at the 7th reading (19, after reset).
        assert_eq!(levels, vec![0, 0, 0, 1, 1, 1, 0, 0]);
    }

    #[tokio::test]
    async fn capacity_one_emits_raw_derivatives() {
        // B1: capacity=1 means the ring holds just the latest derivative.
        let bus = Arc::new(Bus::default());
        let detector = AgdDetector::new(1, vec![5], "test", bus).await;
        detector.feed(10).await;
        let (sum, _) = detector.feed(13).await;
        assert_eq!(sum, 3);
        let (sum, _) = detector.feed(15).await;
        assert_eq!(sum, 2);
    }

    #[tokio::test]
    async fn empty_thresholds_level_always_zero() {
        // B2.
        let bus = Arc::new(Bus::default());
        let detector = AgdDetector::new(5, vec![], "test", bus).await;
        for r in [1, 5, 20, 100] {
            let (_, level) = detector.feed(r).await;
            assert_eq!(level, 0);
        }
    }

    #[tokio::test]
    async fn streaming_matches_reference_for_every_prefix() {
        // P1.
        let readings = [10, 12, 15, 19, 20, 20, 19, 22, 5, 40];
        let bus = Arc::new(Bus::default());
        let detector = AgdDetector::new(4, vec![10], "test", bus).await;

        for end in 2..=readings.len() {
            // Re-derive the streaming sum for this prefix by replaying.
            let mut fresh = AgdState::new(4, vec![10]);
            let bus2 = Arc::new(Bus::default());
            let mut last = 0i64;
            for r in &readings[..end] {
                let (sum, _) = fresh.apply(*r, "test", &bus2).await;
                last = sum;
            }
            let reference = AgdState::reference_sum(4, &readings[..end]);
            assert_eq!(last, reference, "prefix len {end}");
        }
        // exercise the shared detector too, to ensure feed() delegates correctly.
        let (sum, _) = detector.feed(readings[0]).await;
        assert_eq!(sum, 0);
    }

    #[tokio::test]
    async fn set_threshold_out_of_range_is_ignored() {
        let bus = Arc::new(Bus::default());
        let mut state = AgdState::new(4, vec![10, 20]);
        state.set_threshold(0, 99, &bus).await;
        state.set_threshold(3, 99, &bus).await;
        assert_eq!(state.thresholds, vec![10, 20]);
    }

    #[tokio::test]
    async fn set_threshold_publishes_threshold_changed() {
        let bus = Arc::new(Bus::default());
        let seen = Arc::new(tokio::sync::Mutex::new(None));
        let seen2 = seen.clone();
        bus.threshold_changed
            .attach(move |t: ThresholdChanged| {
                let seen2 = seen2.clone();
                async move {
                    *seen2.lock().await = Some(t);
                    Ok(())
                }
            })
            .await;

        let mut state = AgdState::new(4, vec![10, 20]);
        state.set_threshold(2, 25, &bus).await;
        assert_eq!(state.thresholds, vec![10, 25]);
        assert_eq!(
            *seen.lock().await,
            Some(ThresholdChanged { level: 2, value: 25 })
        );
    }
}
