//! Rolling average of an instance's round-trip times.
use std::collections::VecDeque;
use std::sync::RwLock;
use std::time::Duration;

/// Reported by `average` until a sample has been included.
pub const UNKNOWN_PING_TIME: Duration = Duration::from_secs(u64::MAX);

/// Averages the last `window` round-trip samples. One writer, many readers.
#[derive(Debug)]
pub struct PingTimeAggregator {
    window: usize,
    samples: RwLock<Samples>,
}

#[derive(Debug)]
struct Samples {
    values: VecDeque<Duration>,
    average: Duration,
}

impl PingTimeAggregator {
    /// Creates an aggregator over the last `window` samples. A window of
    /// zero is treated as one.
    pub fn new(window: usize) -> PingTimeAggregator {
        let window = window.max(1);
        PingTimeAggregator {
            window: window,
            samples: RwLock::new(Samples {
                values: VecDeque::with_capacity(window),
                average: UNKNOWN_PING_TIME,
            }),
        }
    }

    pub fn window(&self) -> usize {
        self.window
    }

    /// The mean of the retained samples, rounded down to the nanosecond, or
    /// `UNKNOWN_PING_TIME` if there are none.
    pub fn average(&self) -> Duration {
        match self.samples.read() {
            Ok(samples) => samples.average,
            Err(poisoned) => poisoned.into_inner().average,
        }
    }

    /// Adds a sample, dropping the oldest one once the window is full, and
    /// returns the new average.
    pub fn include(&self, sample: Duration) -> Duration {
        let mut samples = match self.samples.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if samples.values.len() == self.window {
            samples.values.pop_front();
        }
        samples.values.push_back(sample);

        let total: u128 = samples.values.iter().map(|d| d.as_nanos()).sum();
        let mean = total / samples.values.len() as u128;
        samples.average = Duration::new((mean / 1_000_000_000) as u64, (mean % 1_000_000_000) as u32);
        samples.average
    }

    /// Forgets every sample.
    pub fn clear(&self) {
        let mut samples = match self.samples.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        samples.values.clear();
        samples.average = UNKNOWN_PING_TIME;
    }

    pub fn len(&self) -> usize {
        match self.samples.read() {
            Ok(samples) => samples.values.len(),
            Err(poisoned) => poisoned.into_inner().values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
