use std::{ops::AddAssign, time::Duration};

use hdrhistogram::{sync::Recorder, Histogram, SyncHistogram};
use quanta::Clock;

/// Task latency histogram shared by all workers of one pool, in nanoseconds.
pub struct Latency(SyncHistogram<u64>);

#[derive(Clone)]
pub struct LocalLatency {
    recorder: Recorder<u64>,
    clock: Clock,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LatencySummary {
    pub count: u64,
    pub mean: Duration,
    pub p99: Duration,
    pub max: Duration,
}

impl Default for Latency {
    fn default() -> Self {
        // two significant figures never fails to construct
        Self(Histogram::new(2).map(Into::into).unwrap_or_else(|_| unreachable!()))
    }
}

impl Latency {
    pub fn local(&self) -> LocalLatency {
        LocalLatency {
            recorder: self.0.recorder(),
            clock: Clock::new(),
        }
    }

    pub fn summary(&mut self) -> LatencySummary {
        // idle workers never phase in, do not wait for them
        self.0.refresh_timeout(Duration::from_millis(10));
        let hist = &self.0;
        LatencySummary {
            count: hist.len(),
            mean: Duration::from_nanos(hist.mean() as _),
            p99: Duration::from_nanos(hist.value_at_quantile(0.99)),
            max: Duration::from_nanos(hist.max()),
        }
    }
}

pub struct Measure(u64);

impl LocalLatency {
    pub fn measure(&self) -> Measure {
        Measure(self.clock.start())
    }
}

impl AddAssign<Measure> for LocalLatency {
    fn add_assign(&mut self, measure: Measure) {
        let nanos = self.clock.delta(measure.0, self.clock.end()).as_nanos() as u64;
        // saturating record never fails with auto-resize histograms
        let _ = self.recorder.record(nanos.max(1));
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn records_from_multiple_threads() {
        let mut latency = Latency::default();
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let mut local = latency.local();
                thread::spawn(move || {
                    let measure = local.measure();
                    thread::sleep(Duration::from_millis(1));
                    local += measure;
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let summary = latency.summary();
        assert_eq!(summary.count, 2);
        assert!(summary.max >= Duration::from_millis(1));
    }
}
