// Copyright 2023 The Hive Project
// SPDX-License-Identifier: BSD-3-Clause

//! Streaming mean/stddev accumulators used by connection health tracking.

use std::collections::VecDeque;

use serde::Serialize;

const SQRT_2: f64 = std::f64::consts::SQRT_2;

/// Unbounded streaming accumulator of count, mean and standard deviation.
#[derive(Debug, Clone, Default)]
pub struct Accumulator {
    n: u64,
    sum: f64,
    square_sum: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StatsSummary {
    pub mean: f64,
    pub stddev: f64,
    pub n: u64,
}

impl Accumulator {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn add(&mut self, value: f64) {
        self.n += 1;
        self.sum += value;
        self.square_sum += value * value;
    }

    pub fn remove(&mut self, value: f64) {
        self.n = self.n.saturating_sub(1);
        self.sum -= value;
        self.square_sum -= value * value;
    }

    pub fn len(&self) -> u64 {
        self.n
    }

    pub fn is_empty(&self) -> bool {
        self.n == 0
    }

    pub fn mean(&self) -> f64 {
        if self.n == 0 {
            return 0.0;
        }
        self.sum / self.n as f64
    }

    pub fn stddev(&self) -> f64 {
        if self.n == 0 {
            return 0.0;
        }
        let mean = self.mean();
        // Guard against negative variance from floating point cancellation
        (self.square_sum / self.n as f64 - mean * mean).max(0.0).sqrt()
    }

    pub fn stats(&self) -> StatsSummary {
        StatsSummary {
            mean: self.mean(),
            stddev: self.stddev(),
            n: self.n,
        }
    }
}

/// A bounded window of samples over an [`Accumulator`], plus an unbounded total accumulator.
///
/// `factor` scales every added sample; connection round-trips are recorded in seconds and stored
/// in milliseconds with `factor = 1000`.
#[derive(Debug, Clone)]
pub struct SampleWindow {
    window: Accumulator,
    total: Accumulator,
    values: VecDeque<f64>,
    size: usize,
    factor: f64,
}

impl SampleWindow {
    pub fn new(size: usize, factor: f64) -> Self {
        Self {
            window: Accumulator::new(),
            total: Accumulator::new(),
            values: VecDeque::with_capacity(size),
            size,
            factor,
        }
    }

    pub fn is_full(&self) -> bool {
        self.values.len() == self.size
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn add(&mut self, value: f64) {
        let value = value * self.factor;
        self.window.add(value);
        self.total.add(value);
        if self.is_full() {
            if let Some(oldest) = self.values.pop_front() {
                self.window.remove(oldest);
            }
        }
        self.values.push_back(value);
    }

    pub fn mean(&self) -> f64 {
        self.window.mean()
    }

    pub fn stddev(&self) -> f64 {
        self.window.stddev()
    }

    pub fn stats(&self) -> StatsSummary {
        self.window.stats()
    }

    pub fn total(&self) -> &Accumulator {
        &self.total
    }

    /// The probability of observing a sample at least as large as `value`, under a normal
    /// distribution fitted to the current window. `value` is in unscaled units.
    pub fn p(&self, value: f64) -> f64 {
        let stddev = self.stddev();
        if stddev == 0.0 {
            return if value * self.factor == self.mean() { 1.0 } else { 0.0 };
        }
        1.0 - erf((value * self.factor - self.mean()).abs() / (stddev * SQRT_2))
    }
}

/// Abramowitz & Stegun 7.1.26 approximation of the error function (max error ~1.5e-7).
fn erf(x: f64) -> f64 {
    const A1: f64 = 0.254829592;
    const A2: f64 = -0.284496736;
    const A3: f64 = 1.421413741;
    const A4: f64 = -1.453152027;
    const A5: f64 = 1.061405429;
    const P: f64 = 0.3275911;

    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs();
    let t = 1.0 / (1.0 + P * x);
    let y = 1.0 - (((((A5 * t + A4) * t) + A3) * t + A2) * t + A1) * t * (-x * x).exp();
    sign * y
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn accumulator_mean_and_stddev() {
        let mut acc = Accumulator::new();
        for v in [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0] {
            acc.add(v);
        }
        assert!((acc.mean() - 5.0).abs() < f64::EPSILON);
        assert!((acc.stddev() - 2.0).abs() < 1e-9);
        acc.remove(9.0);
        assert_eq!(acc.len(), 7);
    }

    #[test]
    fn empty_accumulator_is_zero() {
        let acc = Accumulator::new();
        assert_eq!(acc.mean(), 0.0);
        assert_eq!(acc.stddev(), 0.0);
    }

    #[test]
    fn window_evicts_oldest() {
        let mut window = SampleWindow::new(3, 1.0);
        for v in [1.0, 2.0, 3.0] {
            window.add(v);
        }
        assert!(window.is_full());
        assert!((window.mean() - 2.0).abs() < f64::EPSILON);
        window.add(10.0);
        // 1.0 dropped out of the window but stays in the total
        assert!((window.mean() - 5.0).abs() < f64::EPSILON);
        assert_eq!(window.total().len(), 4);
    }

    #[test]
    fn window_applies_factor() {
        let mut window = SampleWindow::new(10, 1000.0);
        window.add(0.5);
        assert!((window.mean() - 500.0).abs() < f64::EPSILON);
    }

    #[test]
    fn tail_probability() {
        let mut window = SampleWindow::new(100, 1.0);
        for i in 0..100 {
            window.add(1.0 + (i % 10) as f64 * 0.01);
        }
        // A value near the mean is likely, a far outlier is not
        assert!(window.p(1.05) > 0.5);
        assert!(window.p(10.0) < 1e-6);
    }

    #[test]
    fn zero_variance_window() {
        let mut window = SampleWindow::new(10, 1.0);
        for _ in 0..5 {
            window.add(2.0);
        }
        assert_eq!(window.p(2.0), 1.0);
        assert_eq!(window.p(3.0), 0.0);
    }

    #[test]
    fn erf_reference_values() {
        assert!(erf(0.0).abs() < 1e-7);
        assert!((erf(1.0) - 0.8427007929).abs() < 1e-6);
        assert!((erf(-1.0) + 0.8427007929).abs() < 1e-6);
        assert!((erf(3.0) - 0.9999779095).abs() < 1e-6);
    }
}
