//! # Catalog processing
//!
//! Drives a [`SourceFitOrchestrator`] over a whole catalog, chunk by chunk, either on
//! the calling thread or on a fixed-size worker pool.
//!
//! ## Scheduling
//! -----------------
//! * Sources are pulled from the input `chunk_size` at a time; only one chunk and its
//!   results are alive at any moment.
//! * In parallel mode a chunk of `N` sources is cut into at most `T` contiguous
//!   sub-ranges of `ceil(N / T)` sources. Each sub-range is fitted by one pool task
//!   writing into its own result slot; `rayon::ThreadPool::scope` is the barrier.
//! * Results are forwarded to the [`OutputSink`] in input order, whatever the order in
//!   which the workers finished. The next chunk starts once the sink has drained the
//!   current one.
//! * The first error (reader, fit or sink) aborts the run. Results of the failing
//!   chunk are not forwarded.
//!
//! ## Progress
//! -----------------
//! The optional callback receives `(processed, total)` at most once per
//! `progress_interval`, plus once at the end. With the `progress` feature an
//! `indicatif` bar is drawn as well.
use std::time::{Duration, Instant};

use log::debug;
use rayon::{ThreadPool, ThreadPoolBuilder};

#[cfg(feature = "progress")]
use indicatif::{ProgressBar, ProgressStyle};

use crate::photometry::Source;
use crate::phz_errors::PhzError;
use crate::phz_params::PhzParams;
use crate::source_fit::{SourceFitOrchestrator, SourceResult};

pub mod chunk_timer;

use chunk_timer::{human_duration, ChunkTimer};

/// Consumer of per-source results.
pub trait OutputSink {
    fn handle(&mut self, result: SourceResult) -> Result<(), PhzError>;
}

impl OutputSink for Vec<SourceResult> {
    fn handle(&mut self, result: SourceResult) -> Result<(), PhzError> {
        self.push(result);
        Ok(())
    }
}

impl<F> OutputSink for F
where
    F: FnMut(SourceResult) -> Result<(), PhzError>,
{
    fn handle(&mut self, result: SourceResult) -> Result<(), PhzError> {
        self(result)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStrategy {
    Sequential,
    /// Fixed-size pool of the given number of worker threads.
    Parallel(usize),
}

impl ExecutionStrategy {
    /// `Sequential` for a single worker, `Parallel(workers)` otherwise.
    pub fn from_workers(workers: usize) -> Self {
        if workers <= 1 {
            ExecutionStrategy::Sequential
        } else {
            ExecutionStrategy::Parallel(workers)
        }
    }
}

/// Chunked, optionally parallel, fit of a catalog.
pub struct CatalogProcessor<'a, 'g> {
    orchestrator: &'a SourceFitOrchestrator<'g>,
    strategy: ExecutionStrategy,
    pool: Option<ThreadPool>,
    chunk_size: usize,
    progress_interval: Duration,
}

impl<'a, 'g> CatalogProcessor<'a, 'g> {
    /// Build a processor with the scheduling settings of `params`.
    ///
    /// Return
    /// ----------
    /// * `Err(PhzError::ThreadPool)` when the worker pool cannot be created.
    pub fn new(
        orchestrator: &'a SourceFitOrchestrator<'g>,
        params: &PhzParams,
    ) -> Result<Self, PhzError> {
        Self::with_strategy(
            orchestrator,
            ExecutionStrategy::from_workers(params.workers),
            params.chunk_size,
        )
        .map(|p| p.progress_interval(params.progress_interval))
    }

    pub fn with_strategy(
        orchestrator: &'a SourceFitOrchestrator<'g>,
        strategy: ExecutionStrategy,
        chunk_size: usize,
    ) -> Result<Self, PhzError> {
        if chunk_size == 0 {
            return Err(PhzError::InvalidParameter("chunk_size must be >= 1".into()));
        }
        let pool = match strategy {
            ExecutionStrategy::Sequential => None,
            ExecutionStrategy::Parallel(0) => {
                return Err(PhzError::InvalidParameter("workers must be >= 1".into()))
            }
            ExecutionStrategy::Parallel(workers) => {
                Some(ThreadPoolBuilder::new().num_threads(workers).build()?)
            }
        };
        Ok(Self {
            orchestrator,
            strategy,
            pool,
            chunk_size,
            progress_interval: Duration::from_millis(500),
        })
    }

    pub fn progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    #[inline]
    pub fn strategy(&self) -> ExecutionStrategy {
        self.strategy
    }

    /// Fit every source of `sources` and hand the results to `sink`.
    ///
    /// Return
    /// ----------
    /// * The number of sources processed.
    pub fn process(
        &self,
        sources: &[Source],
        sink: &mut impl OutputSink,
    ) -> Result<usize, PhzError> {
        self.process_with_progress(sources, sink, |_, _| {})
    }

    /// [`CatalogProcessor::process`] with a throttled `(processed, total)` callback.
    pub fn process_with_progress(
        &self,
        sources: &[Source],
        sink: &mut impl OutputSink,
        progress: impl FnMut(usize, usize),
    ) -> Result<usize, PhzError> {
        let mut reporter = Reporter::new(progress, sources.len(), self.progress_interval);
        for chunk in sources.chunks(self.chunk_size) {
            self.drain_chunk(chunk, sink, &mut reporter)?;
        }
        Ok(reporter.finish())
    }

    /// Fit a streamed catalog.
    ///
    /// Arguments
    /// -----------------
    /// * `sources` – the reader; an `Err` item aborts the run.
    /// * `total` – expected number of sources, only used for progress reports.
    /// * `sink` – receives the results in input order.
    /// * `progress` – throttled `(processed, total)` callback.
    ///
    /// Return
    /// ----------
    /// * The number of sources processed, or the first error met.
    pub fn process_stream<I>(
        &self,
        sources: I,
        total: usize,
        sink: &mut impl OutputSink,
        progress: impl FnMut(usize, usize),
    ) -> Result<usize, PhzError>
    where
        I: IntoIterator<Item = Result<Source, PhzError>>,
    {
        let mut reporter = Reporter::new(progress, total, self.progress_interval);
        let mut chunk = Vec::with_capacity(self.chunk_size);
        for source in sources {
            chunk.push(source?);
            if chunk.len() == self.chunk_size {
                self.drain_chunk(&chunk, sink, &mut reporter)?;
                chunk.clear();
            }
        }
        if !chunk.is_empty() {
            self.drain_chunk(&chunk, sink, &mut reporter)?;
        }
        Ok(reporter.finish())
    }

    fn drain_chunk<F: FnMut(usize, usize)>(
        &self,
        chunk: &[Source],
        sink: &mut impl OutputSink,
        reporter: &mut Reporter<F>,
    ) -> Result<(), PhzError> {
        let results = self.fit_chunk(chunk)?;
        for result in results {
            sink.handle(result)?;
        }
        reporter.chunk_done(chunk.len());
        Ok(())
    }

    /// Fit one chunk, results in input order.
    pub fn fit_chunk(&self, chunk: &[Source]) -> Result<Vec<SourceResult>, PhzError> {
        match &self.pool {
            None => chunk.iter().map(|s| self.orchestrator.fit(s)).collect(),
            Some(pool) => self.fit_chunk_parallel(pool, chunk),
        }
    }

    fn fit_chunk_parallel(
        &self,
        pool: &ThreadPool,
        chunk: &[Source],
    ) -> Result<Vec<SourceResult>, PhzError> {
        let workers = pool.current_num_threads().max(1);
        let per_worker = chunk.len().div_ceil(workers).max(1);
        let ranges: Vec<&[Source]> = chunk.chunks(per_worker).collect();
        let mut slots: Vec<Option<Result<Vec<SourceResult>, PhzError>>> =
            ranges.iter().map(|_| None).collect();

        let orchestrator = self.orchestrator;
        pool.scope(|scope| {
            for (range, slot) in ranges.iter().zip(slots.iter_mut()) {
                scope.spawn(move |_| {
                    *slot = Some(range.iter().map(|s| orchestrator.fit(s)).collect());
                });
            }
        });

        let mut results = Vec::with_capacity(chunk.len());
        for slot in slots {
            let range = slot.ok_or_else(|| {
                PhzError::ThreadPool("a worker finished without a result".into())
            })?;
            results.extend(range?);
        }
        Ok(results)
    }
}

struct Reporter<F: FnMut(usize, usize)> {
    callback: F,
    total: usize,
    processed: usize,
    reported: Option<usize>,
    interval: Duration,
    last_report: Option<Instant>,
    timer: ChunkTimer,
    #[cfg(feature = "progress")]
    bar: ProgressBar,
}

impl<F: FnMut(usize, usize)> Reporter<F> {
    fn new(callback: F, total: usize, interval: Duration) -> Self {
        #[cfg(feature = "progress")]
        let bar = {
            let bar = ProgressBar::new((total as u64).max(1));
            if let Ok(style) = ProgressStyle::with_template(
                "{bar:40.cyan/blue} {pos}/{len} ({percent:>3}%) | {per_sec} | ETA {eta_precise} | {msg}",
            ) {
                bar.set_style(style);
            }
            bar.enable_steady_tick(Duration::from_millis(200));
            bar
        };
        Self {
            callback,
            total,
            processed: 0,
            reported: None,
            interval,
            last_report: None,
            timer: ChunkTimer::new(0.2),
            #[cfg(feature = "progress")]
            bar,
        }
    }

    fn chunk_done(&mut self, size: usize) {
        self.processed += size;
        let last = self.timer.lap(size);
        let total = self.total.max(self.processed);
        debug!(
            "chunk {} of {size} sources fitted in {} ({} per source), {}/{total} done, about {} left",
            self.timer.chunks(),
            human_duration(last),
            human_duration(self.timer.per_source()),
            self.processed,
            human_duration(self.timer.remaining(total))
        );
        #[cfg(feature = "progress")]
        {
            self.bar.inc(size as u64);
            self.bar.set_message(format!(
                "last chunk: {}, {} per source",
                human_duration(last),
                human_duration(self.timer.per_source())
            ));
        }
        if self.last_report.is_none_or(|t| t.elapsed() >= self.interval) {
            self.report();
        }
    }

    fn report(&mut self) {
        (self.callback)(self.processed, self.total.max(self.processed));
        self.reported = Some(self.processed);
        self.last_report = Some(Instant::now());
    }

    fn finish(mut self) -> usize {
        if self.reported != Some(self.processed) {
            self.report();
        }
        debug!(
            "{} sources in {} chunks, {}",
            self.processed,
            self.timer.chunks(),
            human_duration(self.timer.elapsed())
        );
        #[cfg(feature = "progress")]
        {
            self.bar.disable_steady_tick();
            self.bar.finish_and_clear();
        }
        self.processed
    }
}
