//! Per-stage timing and value counters.

use crate::floating_type_mod::FT;
use num_traits::Float;
use std::{
    collections::HashMap,
    fmt::{Display, Write},
    time::{Duration, Instant},
};

#[derive(Clone, Debug)]
struct Counter<T> {
    values: Vec<T>,
    last_start: Instant,
}
impl<T> Counter<T> {
    fn new() -> Self {
        Counter::<T> {
            last_start: Instant::now(),
            values: Vec::new(),
        }
    }
    fn add_value(&mut self, v: T) {
        self.values.push(v);
    }
}
impl Counter<FT> {
    fn avg(&self) -> FT {
        self.values.iter().cloned().sum::<FT>() / self.values.len() as FT
    }
    fn min(&self) -> FT {
        self.values.iter().cloned().fold(FT::MAX, |a, b| a.min(b))
    }
    fn max(&self) -> FT {
        self.values.iter().cloned().fold(FT::MIN, |a, b| a.max(b))
    }
}
impl Counter<Duration> {
    fn begin(&mut self) {
        self.last_start = Instant::now();
    }

    fn end(&mut self) {
        self.values.push(Instant::now() - self.last_start);
    }

    fn avg(&self) -> Duration {
        self.values.iter().cloned().sum::<Duration>() / self.values.len() as u32
    }

    fn sum(&self) -> Duration {
        self.values.iter().cloned().sum::<Duration>()
    }
}

/// Wall-clock time per named stage (`simulation-step`, `advect`, `jacobi`, ...).
/// Disabled counters record nothing.
#[derive(Clone, Debug, Default)]
pub struct PerformanceCounters {
    counters: HashMap<String, Counter<Duration>>,
    values: HashMap<String, Counter<FT>>,
    enabled: bool,
}

impl PerformanceCounters {
    pub fn new(enabled: bool) -> PerformanceCounters {
        PerformanceCounters {
            counters: HashMap::default(),
            values: HashMap::default(),
            enabled,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn begin(&mut self, id: &str) {
        if self.enabled {
            self.counters
                .entry(id.to_string())
                .or_insert_with(Counter::<Duration>::new)
                .begin();
        }
    }

    pub fn end(&mut self, id: &str) {
        if self.enabled {
            if let Some(counter) = self.counters.get_mut(id) {
                counter.end();
            }
        }
    }

    /// Records a duration that was measured elsewhere, e.g. reported by a worker.
    pub fn add_duration(&mut self, id: &str, duration: Duration) {
        if self.enabled {
            self.counters
                .entry(id.to_string())
                .or_insert_with(Counter::<Duration>::new)
                .add_value(duration);
        }
    }

    pub fn add_value(&mut self, id: &str, v: FT) {
        if self.enabled {
            self.values
                .entry(id.to_string())
                .or_insert_with(Counter::<FT>::new)
                .add_value(v);
        }
    }

    /// Number of recorded samples of a stage.
    pub fn samples(&self, id: &str) -> usize {
        self.counters.get(id).map_or(0, |c| c.values.len())
    }

    pub fn total(&self, id: &str) -> Duration {
        self.counters.get(id).map_or(Duration::ZERO, |c| c.sum())
    }

    /// Folds the samples of `other` into `self`.
    pub fn merge(&mut self, other: &PerformanceCounters) {
        if !self.enabled {
            return;
        }
        for (id, counter) in &other.counters {
            self.counters
                .entry(id.clone())
                .or_insert_with(Counter::<Duration>::new)
                .values
                .extend_from_slice(&counter.values);
        }
        for (id, counter) in &other.values {
            self.values
                .entry(id.clone())
                .or_insert_with(Counter::<FT>::new)
                .values
                .extend_from_slice(&counter.values);
        }
    }
}

pub fn write_statistics(pcounters: &PerformanceCounters) -> String {
    let mut s = String::new();

    writeln!(
        s,
        "simulation-time: {:.3}ms",
        pcounters.total("simulation-step").as_secs_f64() * 1000.
    )
    .unwrap();
    writeln!(s).unwrap();

    let mut v = pcounters
        .counters
        .iter()
        .filter(|(_, c)| !c.values.is_empty())
        .collect::<Vec<_>>();
    v.sort_by(|x, y| x.0.cmp(y.0));
    for (label, pcounter) in v {
        writeln!(
            s,
            "{}: avg:{:.3}ms sum:{:.3}ms n:{}",
            label,
            pcounter.avg().as_secs_f64() * 1000.,
            pcounter.sum().as_secs_f64() * 1000.,
            pcounter.values.len()
        )
        .unwrap();
    }
    writeln!(s).unwrap();

    let mut v = pcounters
        .values
        .iter()
        .filter(|(_, c)| !c.values.is_empty())
        .collect::<Vec<_>>();
    v.sort_by(|x, y| x.0.cmp(y.0));
    for (label, vcounter) in v {
        writeln!(
            s,
            "{}: min:{} max:{} avg:{}",
            label,
            vcounter.min(),
            vcounter.max(),
            vcounter.avg()
        )
        .unwrap();
    }

    s
}

pub fn is_ft_approx_eq<F: Float>(a: F, b: F, tolerance: F) -> bool {
    assert!(!a.is_nan());
    assert!(!b.is_nan());
    b <= a + tolerance && b >= a - tolerance
}

pub fn assert_ft_approx_eq<F: Float + Display>(a: F, b: F, tolerance: F, s: impl FnOnce() -> String) {
    if !is_ft_approx_eq(a, b, tolerance) {
        panic!(
            "{} value not equal with a tolerance of {}:\n\ta={}\n\tb={}\n",
            s(),
            tolerance,
            a,
            b
        );
    }
}
