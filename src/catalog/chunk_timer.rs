//! Per-chunk throughput of the catalog processor.
//!
//! [`ChunkTimer`] is fed once per drained chunk with the chunk size. It keeps the
//! wall time of the last chunk and a smoothed time per source,
//! `ema ← α·(dt / n) + (1 − α)·ema`, seeded by the first chunk. Chunks are not all
//! the same size (the last one of a catalog is usually shorter), so the average is
//! kept per source rather than per chunk. The remaining-time estimate is that
//! average times the number of sources left.
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct ChunkTimer {
    started: Instant,
    lap: Instant,
    alpha: f64,
    per_source_ns: Option<f64>,
    last_chunk: Duration,
    chunks: usize,
    sources: usize,
}

impl ChunkTimer {
    /// `alpha` is the weight of the newest chunk, clamped to `(0, 1]`.
    pub fn new(alpha: f64) -> Self {
        let now = Instant::now();
        Self {
            started: now,
            lap: now,
            alpha: alpha.clamp(f64::EPSILON, 1.0),
            per_source_ns: None,
            last_chunk: Duration::ZERO,
            chunks: 0,
            sources: 0,
        }
    }

    /// Close the running lap as a chunk of `size` sources.
    pub fn lap(&mut self, size: usize) -> Duration {
        let now = Instant::now();
        let elapsed = now.duration_since(self.lap);
        self.lap = now;
        self.record(size, elapsed);
        elapsed
    }

    /// Account a chunk of `size` sources that took `elapsed`. Empty chunks only
    /// count as chunks.
    pub fn record(&mut self, size: usize, elapsed: Duration) {
        self.chunks += 1;
        self.last_chunk = elapsed;
        if size == 0 {
            return;
        }
        self.sources += size;
        let sample = elapsed.as_nanos() as f64 / size as f64;
        self.per_source_ns = Some(match self.per_source_ns {
            None => sample,
            Some(ema) => self.alpha * sample + (1.0 - self.alpha) * ema,
        });
    }

    #[inline]
    pub fn last_chunk(&self) -> Duration {
        self.last_chunk
    }

    /// Smoothed time per source, zero before the first non-empty chunk.
    pub fn per_source(&self) -> Duration {
        self.per_source_ns
            .map_or(Duration::ZERO, |ns| Duration::from_nanos(ns as u64))
    }

    /// Estimated time to fit the sources still missing to reach `total`.
    pub fn remaining(&self, total: usize) -> Duration {
        let left = total.saturating_sub(self.sources);
        self.per_source_ns.map_or(Duration::ZERO, |ns| {
            Duration::from_nanos((ns * left as f64) as u64)
        })
    }

    #[inline]
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    #[inline]
    pub fn chunks(&self) -> usize {
        self.chunks
    }

    #[inline]
    pub fn sources(&self) -> usize {
        self.sources
    }
}

/// Short human rendering: `"850µs"`, `"12.5ms"`, `"4.20s"` or `"3m05s"`.
pub fn human_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs >= 60 {
        format!("{}m{:02}s", secs / 60, secs % 60)
    } else if secs >= 1 {
        format!("{:.2}s", d.as_secs_f64())
    } else if d.as_micros() >= 1_000 {
        format!("{:.1}ms", d.as_secs_f64() * 1e3)
    } else {
        format!("{}µs", d.as_micros())
    }
}
