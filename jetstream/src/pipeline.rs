//! Parallel read/resample lanes feeding a shared shuffle buffer.
//!
//! ```text
//!   file queue (crossbeam MPMC, `repeat` shuffled epochs)
//!        |            |            |
//!     lane 0       lane 1  ...  lane L-1     open -> read chunk -> resample
//!        |            |            |         -> gen substitution
//!        +------------+------------+
//!                     v
//!        ShuffleQueue (capacity 5B, min_after_dequeue 2B)
//!                     v
//!        Pipeline::next_batch() -> Batch of B random buffered events
//! ```
//!
//! Lanes block on a full buffer; the consumer blocks until the buffer holds
//! `B + min_after_dequeue` events. Every wait is sliced so a cancelled or dead
//! peer is noticed within [`WAIT_SLICE`]. The last lane to finish closes the
//! buffer, after which the consumer drains it in batches of at most B and then
//! sees end of stream.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{self, Receiver};
use parking_lot::{Condvar, Mutex};
use rand::prelude::*;
use rand::rngs::SmallRng;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::record::{Batch, EventRecord};
use crate::resampler::{GenSubstitution, Resampler};
use crate::schema::{FeatureSchema, SchemaError};
use crate::source::{SourceError, SourceFactory};
use crate::store::{StoreError, WeightStore};

/// Environment variable overriding the lane count.
pub const LANES_ENV: &str = "OMP_NUM_THREADS";
pub const DEFAULT_MAX_LANES: usize = 6;
/// Upper bound on how long any blocked producer or consumer sleeps before
/// re-checking cancellation.
pub const WAIT_SLICE: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid pipeline config: {0}")]
    Config(String),

    #[error("no input files")]
    NoInputs,

    #[error("resampling is enabled but no weight store was given")]
    MissingStore,

    /// The weight store was built for different truth classes.
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    /// A file failed the pre-flight check; no lane was started.
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error("failed to spawn lane thread: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("lane {lane} failed on {}: {source}", path.display())]
    Lane {
        lane: usize,
        path: PathBuf,
        #[source]
        source: SourceError,
    },

    #[error("lane {lane} panicked")]
    LanePanicked { lane: usize },

    #[error("pipeline was cancelled")]
    Cancelled,
}

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Events per output batch (B).
    pub batch_size: usize,
    /// Upper bound on parallel lanes; the actual count is `min(files, max_lanes)`.
    pub max_lanes: usize,
    /// Number of passes over the file list.
    pub repeat: usize,
    /// Shuffle the file order of every pass.
    pub shuffle_files: bool,
    /// Resample against the weight store; off passes events through unchanged.
    pub resample: bool,
    pub seed: u64,
    /// Records per source read; `None` uses `max(10, B / 20)`.
    pub reader_chunk: Option<usize>,
    pub gen_substitution: GenSubstitution,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            max_lanes: DEFAULT_MAX_LANES,
            repeat: 1,
            shuffle_files: true,
            resample: true,
            seed: 42,
            reader_chunk: None,
            gen_substitution: GenSubstitution::default(),
        }
    }
}

impl PipelineConfig {
    /// Shuffle buffer capacity: 5B.
    pub fn capacity(&self) -> usize {
        5 * self.batch_size
    }

    /// Events that must stay buffered after every full dequeue: 2B.
    pub fn min_after_dequeue(&self) -> usize {
        2 * self.batch_size
    }

    pub fn chunk_size(&self) -> usize {
        self.reader_chunk
            .unwrap_or_else(|| (self.batch_size / 20).max(10))
            .max(1)
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.batch_size == 0 {
            return Err(PipelineError::Config("batch_size must be > 0".into()));
        }
        if self.max_lanes == 0 {
            return Err(PipelineError::Config("max_lanes must be > 0".into()));
        }
        if self.repeat == 0 {
            return Err(PipelineError::Config("repeat must be > 0".into()));
        }
        Ok(())
    }
}

/// Lane count resolved from the process environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaneLimit(pub usize);

impl LaneLimit {
    /// Read [`LANES_ENV`]. Unset gives the default; an unparseable value gives
    /// the default plus a warning.
    pub fn from_env() -> Self {
        Self::parse(std::env::var(LANES_ENV).ok().as_deref())
    }

    pub fn parse(value: Option<&str>) -> Self {
        let Some(raw) = value else {
            return Self(DEFAULT_MAX_LANES);
        };
        match raw.trim().parse::<usize>() {
            Ok(n) => Self(n.max(1)),
            Err(e) => {
                warn!(
                    "{}={:?} is not a lane count ({}), using {}",
                    LANES_ENV, raw, e, DEFAULT_MAX_LANES
                );
                Self(DEFAULT_MAX_LANES)
            }
        }
    }

    pub fn get(self) -> usize {
        self.0
    }
}

// ============================================================================
// Cancellation
// ============================================================================

type WakeFn = Box<dyn Fn() + Send + Sync>;

struct TokenInner {
    cancelled: AtomicBool,
    wakers: Mutex<Vec<WakeFn>>,
}

/// Cloneable stop signal shared by the consumer, every lane and the buffer.
#[derive(Clone)]
pub struct CancellationToken {
    inner: Arc<TokenInner>,
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self {
            inner: Arc::new(TokenInner {
                cancelled: AtomicBool::new(false),
                wakers: Mutex::new(Vec::new()),
            }),
        }
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the flag and wake everything registered with [`Self::on_cancel`].
    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        for wake in self.inner.wakers.lock().iter() {
            wake();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Relaxed)
    }

    /// Run `wake` when the token is cancelled.
    pub fn on_cancel(&self, wake: impl Fn() + Send + Sync + 'static) {
        self.inner.wakers.lock().push(Box::new(wake));
    }
}

// ============================================================================
// Shuffle Queue
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("queue was cancelled")]
    Cancelled,
    #[error("queue is closed")]
    Closed,
}

struct QueueState<T> {
    items: Vec<T>,
    closed: bool,
    rng: SmallRng,
    high_water: usize,
}

struct QueueShared<T> {
    state: Mutex<QueueState<T>>,
    not_full: Condvar,
    not_empty: Condvar,
    capacity: usize,
    batch_size: usize,
    min_after_dequeue: usize,
    token: CancellationToken,
}

impl<T> QueueShared<T> {
    fn wake_all(&self) {
        self.not_full.notify_all();
        self.not_empty.notify_all();
    }
}

/// Bounded buffer that hands out uniformly random batches.
///
/// Many producers, one (or more) consumers. Cloning shares the same buffer.
pub struct ShuffleQueue<T> {
    shared: Arc<QueueShared<T>>,
}

impl<T> Clone for ShuffleQueue<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Send + 'static> ShuffleQueue<T> {
    /// # Panics
    /// Panics if `capacity < batch_size + min_after_dequeue` or `batch_size == 0`,
    /// since a full dequeue could then never happen.
    pub fn new(
        capacity: usize,
        batch_size: usize,
        min_after_dequeue: usize,
        seed: u64,
        token: CancellationToken,
    ) -> Self {
        assert!(batch_size > 0, "batch_size must be > 0");
        assert!(
            capacity >= batch_size + min_after_dequeue,
            "capacity {capacity} cannot hold batch {batch_size} + min_after_dequeue {min_after_dequeue}"
        );
        let shared = Arc::new(QueueShared {
            state: Mutex::new(QueueState {
                items: Vec::with_capacity(capacity),
                closed: false,
                rng: SmallRng::seed_from_u64(seed),
                high_water: 0,
            }),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
            capacity,
            batch_size,
            min_after_dequeue,
            token: token.clone(),
        });
        let weak: Weak<QueueShared<T>> = Arc::downgrade(&shared);
        token.on_cancel(move || {
            if let Some(shared) = weak.upgrade() {
                shared.wake_all();
            }
        });
        Self { shared }
    }
}

impl<T> ShuffleQueue<T> {
    /// Add all of `items`, blocking while the buffer is full.
    ///
    /// Items are inserted as space frees up, so the buffer never holds more
    /// than `capacity`. Fails once the queue is cancelled or closed; items not
    /// yet inserted are dropped.
    pub fn enqueue_many(&self, items: Vec<T>) -> Result<(), QueueError> {
        let shared = &*self.shared;
        let mut pending = items.into_iter().peekable();
        let mut state = shared.state.lock();
        while pending.peek().is_some() {
            if shared.token.is_cancelled() {
                return Err(QueueError::Cancelled);
            }
            if state.closed {
                return Err(QueueError::Closed);
            }
            let space = shared.capacity - state.items.len();
            if space == 0 {
                shared.not_full.wait_for(&mut state, WAIT_SLICE);
                continue;
            }
            state.items.extend(pending.by_ref().take(space));
            state.high_water = state.high_water.max(state.items.len());
            shared.not_empty.notify_one();
        }
        Ok(())
    }

    /// Remove a batch of uniformly random elements.
    ///
    /// Blocks until `batch_size + min_after_dequeue` elements are buffered.
    /// Once closed, the rest is handed out in batches of at most `batch_size`
    /// and then `Ok(None)` marks the end of stream.
    pub fn dequeue_batch(&self) -> Result<Option<Vec<T>>, QueueError> {
        let shared = &*self.shared;
        let mut state = shared.state.lock();
        loop {
            if shared.token.is_cancelled() {
                return Err(QueueError::Cancelled);
            }
            let len = state.items.len();
            let take = if len >= shared.batch_size + shared.min_after_dequeue {
                shared.batch_size
            } else if state.closed {
                if len == 0 {
                    return Ok(None);
                }
                len.min(shared.batch_size)
            } else {
                shared.not_empty.wait_for(&mut state, WAIT_SLICE);
                continue;
            };

            let state = &mut *state;
            let mut out = Vec::with_capacity(take);
            for _ in 0..take {
                let i = state.rng.random_range(0..state.items.len());
                out.push(state.items.swap_remove(i));
            }
            shared.not_full.notify_all();
            return Ok(Some(out));
        }
    }

    /// No more input: wake everyone so the consumer can drain.
    pub fn close(&self) {
        self.shared.state.lock().closed = true;
        self.shared.wake_all();
    }

    pub fn len(&self) -> usize {
        self.shared.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Largest number of elements ever buffered at once.
    pub fn high_water(&self) -> usize {
        self.shared.state.lock().high_water
    }
}

// ============================================================================
// Lanes
// ============================================================================

/// Why a lane stopped early.
enum LaneStop {
    /// Cancelled or closed by someone else.
    Stopped,
    Failed(SourceError),
}

impl From<QueueError> for LaneStop {
    fn from(_: QueueError) -> Self {
        LaneStop::Stopped
    }
}

impl From<SourceError> for LaneStop {
    fn from(e: SourceError) -> Self {
        LaneStop::Failed(e)
    }
}

struct Lane {
    id: usize,
    files: Receiver<PathBuf>,
    factory: Arc<dyn SourceFactory>,
    resampler: Option<Resampler>,
    gen_substitution: GenSubstitution,
    chunk: usize,
    queue: ShuffleQueue<EventRecord>,
    token: CancellationToken,
    failure: Arc<Mutex<Option<PipelineError>>>,
    active: Arc<AtomicUsize>,
}

impl Lane {
    fn run(mut self) {
        debug!("Lane {} started", self.id);
        let mut files_done = 0usize;
        while let Ok(path) = self.files.recv() {
            if self.token.is_cancelled() {
                break;
            }
            match self.read_file(&path) {
                Ok(n) => {
                    files_done += 1;
                    debug!("Lane {}: {} ({} events read)", self.id, path.display(), n);
                }
                Err(LaneStop::Stopped) => break,
                Err(LaneStop::Failed(source)) => {
                    warn!("Lane {} failed on {}: {}", self.id, path.display(), source);
                    self.fail(PipelineError::Lane {
                        lane: self.id,
                        path,
                        source,
                    });
                    break;
                }
            }
        }
        match &self.resampler {
            Some(r) => {
                let s = r.stats();
                debug!(
                    "Lane {} exiting after {} files: {} seen, {} emitted, {} dropped",
                    self.id, files_done, s.seen, s.emitted, s.dropped
                );
            }
            None => debug!("Lane {} exiting after {} files", self.id, files_done),
        }
    }

    /// Record the first failure and stop every other lane and the consumer.
    fn fail(&self, err: PipelineError) {
        {
            let mut failure = self.failure.lock();
            if failure.is_none() {
                *failure = Some(err);
            }
        }
        self.token.cancel();
        self.queue.close();
    }

    fn read_file(&mut self, path: &Path) -> Result<u64, LaneStop> {
        let mut source = self.factory.open(path, self.chunk)?;
        let mut n = 0u64;
        while let Some(records) = source.next_batch()? {
            if self.token.is_cancelled() {
                return Err(LaneStop::Stopped);
            }
            n += records.len() as u64;
            let mut out = match &mut self.resampler {
                Some(r) => r.resample(records),
                None => records,
            };
            for rec in &mut out {
                self.gen_substitution.apply(rec);
            }
            if !out.is_empty() {
                self.queue.enqueue_many(out)?;
            }
        }
        Ok(n)
    }
}

// Runs on normal exit and while unwinding out of `run`.
impl Drop for Lane {
    fn drop(&mut self) {
        if std::thread::panicking() {
            warn!("Lane {} panicked", self.id);
            self.fail(PipelineError::LanePanicked { lane: self.id });
        }
        if self.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            debug!("Last lane done, closing shuffle queue");
            self.queue.close();
        }
    }
}

// ============================================================================
// Pipeline
// ============================================================================

/// Running pipeline: lane threads plus the shuffle buffer they feed.
pub struct Pipeline {
    config: PipelineConfig,
    schema: Arc<FeatureSchema>,
    queue: ShuffleQueue<EventRecord>,
    token: CancellationToken,
    failure: Arc<Mutex<Option<PipelineError>>>,
    lanes: Vec<JoinHandle<()>>,
}

impl Pipeline {
    /// Validate every input file, then start `min(files, max_lanes)` lanes.
    ///
    /// Nothing is spawned if any file fails validation.
    pub fn spawn(
        config: PipelineConfig,
        schema: Arc<FeatureSchema>,
        files: Vec<PathBuf>,
        factory: Arc<dyn SourceFactory>,
        store: Option<Arc<WeightStore>>,
    ) -> Result<Self, PipelineError> {
        config.validate()?;
        if files.is_empty() {
            return Err(PipelineError::NoInputs);
        }
        let kinematics = schema.kinematic_columns()?;
        let store = match (config.resample, store) {
            (true, None) => return Err(PipelineError::MissingStore),
            (true, Some(store)) => {
                store.check_classes(&schema.truth)?;
                Some(store)
            }
            (false, _) => None,
        };
        if !config.gen_substitution.predicate.can_match(schema.num_classes()) {
            warn!(
                "Gen substitution predicate {:?} can never match {} classes; gen fields pass through unchanged",
                config.gen_substitution.predicate,
                schema.num_classes()
            );
        }
        for path in &files {
            factory.validate(path)?;
        }

        // -- File queue --
        let (file_tx, file_rx) = channel::unbounded();
        let mut order_rng = SmallRng::seed_from_u64(config.seed.wrapping_add(1));
        for _ in 0..config.repeat {
            let mut epoch = files.clone();
            if config.shuffle_files {
                epoch.shuffle(&mut order_rng);
            }
            for path in epoch {
                // The receiver is alive in this scope.
                let _ = file_tx.send(path);
            }
        }
        drop(file_tx);

        let token = CancellationToken::new();
        let queue = ShuffleQueue::new(
            config.capacity(),
            config.batch_size,
            config.min_after_dequeue(),
            config.seed.wrapping_add(2),
            token.clone(),
        );
        let failure = Arc::new(Mutex::new(None));
        let num_lanes = files.len().min(config.max_lanes);
        let active = Arc::new(AtomicUsize::new(num_lanes));

        info!(
            "Pipeline: {} files x {} passes, {} lanes, batch {} (capacity {}, min_after_dequeue {}), resample={}",
            files.len(),
            config.repeat,
            num_lanes,
            config.batch_size,
            config.capacity(),
            config.min_after_dequeue(),
            config.resample
        );

        let mut pipeline = Self {
            config,
            schema,
            queue,
            token,
            failure,
            lanes: Vec::with_capacity(num_lanes),
        };

        for id in 0..num_lanes {
            let lane = Lane {
                id,
                files: file_rx.clone(),
                factory: Arc::clone(&factory),
                resampler: store.as_ref().map(|s| {
                    Resampler::new(
                        Arc::clone(s),
                        kinematics,
                        pipeline.config.seed.wrapping_add((id as u64 + 1) * 1000),
                    )
                }),
                gen_substitution: pipeline.config.gen_substitution.clone(),
                chunk: pipeline.config.chunk_size(),
                queue: pipeline.queue.clone(),
                token: pipeline.token.clone(),
                failure: Arc::clone(&pipeline.failure),
                active: Arc::clone(&active),
            };
            let handle = std::thread::Builder::new()
                .name(format!("jetstream-lane-{id}"))
                .spawn(move || lane.run());
            match handle {
                Ok(h) => pipeline.lanes.push(h),
                Err(e) => {
                    // Dropping `pipeline` stops and joins the lanes already running.
                    return Err(PipelineError::Spawn(e));
                }
            }
        }

        Ok(pipeline)
    }

    /// Next shuffled batch; `Ok(None)` is the normal end of stream.
    ///
    /// A lane failure is reported once as [`PipelineError::Lane`]; later calls
    /// return [`PipelineError::Cancelled`].
    pub fn next_batch(&self) -> Result<Option<Batch>, PipelineError> {
        if let Some(err) = self.failure.lock().take() {
            return Err(err);
        }
        match self.queue.dequeue_batch() {
            Ok(Some(records)) => Ok(Some(Batch::from_records(&records, &self.schema))),
            Ok(None) | Err(QueueError::Closed) => match self.failure.lock().take() {
                Some(err) => Err(err),
                None => Ok(None),
            },
            Err(QueueError::Cancelled) => {
                Err(self.failure.lock().take().unwrap_or(PipelineError::Cancelled))
            }
        }
    }

    /// Handle for stopping the pipeline from elsewhere (e.g. a signal handler).
    pub fn cancel_token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn schema(&self) -> &FeatureSchema {
        &self.schema
    }

    pub fn num_lanes(&self) -> usize {
        self.lanes.len()
    }

    /// Events currently buffered.
    pub fn buffered(&self) -> usize {
        self.queue.len()
    }

    pub fn high_water(&self) -> usize {
        self.queue.high_water()
    }

    /// Stop all lanes and join them. Safe to call more than once.
    pub fn shutdown(&mut self) {
        if self.lanes.is_empty() {
            return;
        }
        self.token.cancel();
        self.queue.close();
        for handle in self.lanes.drain(..) {
            if handle.join().is_err() {
                warn!("A pipeline lane panicked");
            }
        }
        info!("Pipeline shut down.");
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resampler::ClassPredicate;
    use crate::schema::{FeatureGroup, KinematicColumns, TruthClass};
    use crate::source::{MemorySourceFactory, RecordSource};
    use crate::weights::WeightBuilder;
    use std::time::Instant;

    fn schema(k: usize) -> Arc<FeatureSchema> {
        let empty = FeatureGroup {
            branches: vec![],
            max: 0,
        };
        Arc::new(FeatureSchema {
            truth: (0..k)
                .map(|i| TruthClass {
                    name: format!("c{i}"),
                    selection: format!("is{i}"),
                })
                .collect(),
            globalvars: vec!["global_pt".into(), "global_eta".into()],
            cpf: empty.clone(),
            npf: empty.clone(),
            sv: empty,
            gen_vars: vec!["gen".into()],
        })
    }

    fn event(class: usize, k: usize, pt: f32, eta: f32, gen_value: f32) -> EventRecord {
        let mut truth = vec![0.0; k];
        truth[class] = 1.0;
        EventRecord {
            truth,
            globalvars: vec![pt, eta],
            gen_vars: vec![gen_value],
            ..Default::default()
        }
    }

    fn drain(pipeline: &Pipeline) -> Result<Vec<Batch>, PipelineError> {
        let mut out = Vec::new();
        while let Some(batch) = pipeline.next_batch()? {
            out.push(batch);
        }
        Ok(out)
    }

    #[test]
    fn test_lane_limit_parsing() {
        assert_eq!(LaneLimit::parse(None).get(), DEFAULT_MAX_LANES);
        assert_eq!(LaneLimit::parse(Some("3")).get(), 3);
        assert_eq!(LaneLimit::parse(Some(" 4 ")).get(), 4);
        assert_eq!(LaneLimit::parse(Some("0")).get(), 1);
        assert_eq!(LaneLimit::parse(Some("lots")).get(), DEFAULT_MAX_LANES);
        assert_eq!(LaneLimit::parse(Some("")).get(), DEFAULT_MAX_LANES);
    }

    #[test]
    fn test_config_derived_sizes() {
        let config = PipelineConfig::default();
        assert_eq!(config.capacity(), 500);
        assert_eq!(config.min_after_dequeue(), 200);
        assert_eq!(config.chunk_size(), 10);
        let big = PipelineConfig {
            batch_size: 1000,
            ..Default::default()
        };
        assert_eq!(big.chunk_size(), 50);
        let zero = PipelineConfig {
            batch_size: 0,
            ..Default::default()
        };
        assert!(matches!(zero.validate(), Err(PipelineError::Config(_))));
    }

    #[test]
    fn test_queue_waits_for_min_fill_and_respects_capacity() {
        let token = CancellationToken::new();
        let queue: ShuffleQueue<u32> = ShuffleQueue::new(20, 4, 8, 0, token);

        queue.enqueue_many((0..11).collect()).unwrap();
        let (tx, rx) = channel::unbounded();
        let consumer = {
            let queue = queue.clone();
            std::thread::spawn(move || {
                while let Ok(Some(batch)) = queue.dequeue_batch() {
                    tx.send(batch).unwrap();
                }
            })
        };
        // 11 < 4 + 8: nothing may come out yet.
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());

        queue.enqueue_many(vec![11]).unwrap();
        let first = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(first.len(), 4);

        let producer = {
            let queue = queue.clone();
            std::thread::spawn(move || {
                for chunk in (12..500).collect::<Vec<u32>>().chunks(7) {
                    queue.enqueue_many(chunk.to_vec()).unwrap();
                }
            })
        };
        producer.join().unwrap();
        queue.close();
        consumer.join().unwrap();

        let mut seen: Vec<u32> = first;
        seen.extend(rx.try_iter().flatten());
        seen.sort_unstable();
        assert_eq!(seen, (0..500).collect::<Vec<u32>>());
        assert!(queue.high_water() <= 20, "high water {}", queue.high_water());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_closed_queue_flushes_partial_batches() {
        let queue: ShuffleQueue<u32> = ShuffleQueue::new(20, 4, 8, 0, CancellationToken::new());
        queue.enqueue_many((0..6).collect()).unwrap();
        queue.close();
        assert_eq!(queue.dequeue_batch().unwrap().unwrap().len(), 4);
        assert_eq!(queue.dequeue_batch().unwrap().unwrap().len(), 2);
        assert_eq!(queue.dequeue_batch().unwrap(), None);
        assert_eq!(queue.enqueue_many(vec![1]), Err(QueueError::Closed));
    }

    #[test]
    fn test_cancel_unblocks_producer_and_consumer() {
        let token = CancellationToken::new();
        let full: ShuffleQueue<u32> = ShuffleQueue::new(10, 2, 4, 0, token.clone());
        let empty: ShuffleQueue<u32> = ShuffleQueue::new(10, 2, 4, 0, token.clone());
        full.enqueue_many((0..10).collect()).unwrap();

        let producer = {
            let full = full.clone();
            std::thread::spawn(move || full.enqueue_many(vec![1, 2, 3]))
        };
        let consumer = {
            let empty = empty.clone();
            std::thread::spawn(move || empty.dequeue_batch())
        };
        std::thread::sleep(Duration::from_millis(100));
        let start = Instant::now();
        token.cancel();
        assert_eq!(producer.join().unwrap(), Err(QueueError::Cancelled));
        assert_eq!(consumer.join().unwrap(), Err(QueueError::Cancelled));
        assert!(start.elapsed() < Duration::from_secs(2));
        assert_eq!(full.len(), 10);
    }

    /// Four classes, three events each. Class 0's only bin has one raw count
    /// and is suppressed; classes 1..=3 get integer weights 4, 2, 2.
    #[test]
    fn test_end_to_end_rebalancing() {
        let k = 4;
        let schema = schema(k);
        let (bin_a, bin_b, bin_c) = ((1.4, 0.0), (2.0, 0.0), (2.5, 1.5));

        // avg_events = (1 + 4 + 8 + 1907) / 30 / 4 = 16
        let mut builder = WeightBuilder::with_classes(k, KinematicColumns::default());
        let mut fill = |class: usize, (pt, eta): (f32, f32), n: usize| {
            for _ in 0..n {
                builder.fill(&event(class, k, pt, eta, 0.0));
            }
        };
        fill(0, bin_a, 1);
        fill(1, bin_b, 4);
        fill(2, bin_b, 8);
        fill(3, bin_b, 8);
        fill(3, bin_c, 1899);
        let table = builder.finish();
        assert!((table.avg_events - 16.0).abs() < 1e-9);
        let store = Arc::new(WeightStore::new(schema.truth.clone(), table).unwrap());
        assert_eq!(store.lookup(0, 1.4, 0.0), 0.0);

        let mut factory = MemorySourceFactory::default();
        for class in 0..k {
            let (pt, eta) = if class == 0 { bin_a } else { bin_b };
            let records = (0..3).map(|_| event(class, k, pt, eta, 1.5)).collect();
            factory = factory.with_file(format!("file_{class}"), records);
        }
        let config = PipelineConfig {
            batch_size: 4,
            max_lanes: 2,
            gen_substitution: GenSubstitution {
                predicate: ClassPredicate::Index(3),
                sentinel: 0.0,
            },
            ..Default::default()
        };
        let files = factory.paths();
        let pipeline = Pipeline::spawn(
            config,
            Arc::clone(&schema),
            files,
            Arc::new(factory),
            Some(store),
        )
        .unwrap();
        assert_eq!(pipeline.num_lanes(), 2);

        let batches = drain(&pipeline).unwrap();
        let mut per_class = [0usize; 4];
        for batch in &batches {
            assert!(batch.batch_size <= 4);
            for i in 0..batch.batch_size {
                let class = batch.class_of(i).unwrap();
                per_class[class] += 1;
                let expected_gen = if class == 3 { 0.0 } else { 1.5 };
                assert_eq!(batch.gen_row(i), &[expected_gen]);
            }
        }
        assert_eq!(per_class, [0, 12, 6, 6]);
        assert!(pipeline.high_water() <= 20);
        assert!(pipeline.next_batch().unwrap().is_none());
    }

    #[test]
    fn test_passthrough_without_resampling() {
        let k = 2;
        let mut factory = MemorySourceFactory::default();
        for f in 0..3 {
            let records = (0..10).map(|i| event(i % k, k, 9.0, 9.0, 1.0)).collect();
            factory = factory.with_file(format!("f{f}"), records);
        }
        let config = PipelineConfig {
            batch_size: 8,
            repeat: 2,
            resample: false,
            ..Default::default()
        };
        let files = factory.paths();
        let pipeline = Pipeline::spawn(config, schema(k), files, Arc::new(factory), None).unwrap();
        assert_eq!(pipeline.num_lanes(), 3);
        let total: usize = drain(&pipeline).unwrap().iter().map(|b| b.batch_size).sum();
        assert_eq!(total, 60);
    }

    #[test]
    fn test_setup_errors_start_no_lanes() {
        let factory = Arc::new(MemorySourceFactory::default().with_file("a", vec![]));
        let files = vec![PathBuf::from("a"), PathBuf::from("missing")];
        let config = PipelineConfig {
            resample: false,
            ..Default::default()
        };
        match Pipeline::spawn(config.clone(), schema(2), files, factory.clone(), None) {
            Err(PipelineError::Source(SourceError::NotFound(p))) => assert_eq!(p, PathBuf::from("missing")),
            other => panic!("expected NotFound, got {:?}", other.map(|_| ())),
        }
        assert!(matches!(
            Pipeline::spawn(config, schema(2), vec![], factory.clone(), None),
            Err(PipelineError::NoInputs)
        ));
        assert!(matches!(
            Pipeline::spawn(PipelineConfig::default(), schema(2), vec!["a".into()], factory.clone(), None),
            Err(PipelineError::MissingStore)
        ));

        // A store built for other class definitions is refused.
        let mut stale = (*schema(2)).clone();
        stale.truth[1].selection = "old_flag".into();
        let mut builder = WeightBuilder::new(&stale).unwrap();
        builder.fill(&event(0, 2, 2.0, 0.0, 1.0));
        let store = Arc::new(WeightStore::new(stale.truth.clone(), builder.finish()).unwrap());
        assert!(matches!(
            Pipeline::spawn(
                PipelineConfig::default(),
                schema(2),
                vec!["a".into()],
                factory,
                Some(store)
            ),
            Err(PipelineError::Store(StoreError::ClassDefinition { index: 1, .. }))
        ));
    }

    #[test]
    fn test_lane_failure_is_reported() {
        let k = 2;
        let records = (0..5).map(|i| event(i % k, k, 2.0, 0.0, 1.0)).collect();
        let factory = MemorySourceFactory::default()
            .with_file("good", records)
            .with_corrupt_file("bad");
        let config = PipelineConfig {
            batch_size: 4,
            resample: false,
            ..Default::default()
        };
        let files = factory.paths();
        let pipeline = Pipeline::spawn(config, schema(k), files, Arc::new(factory), None).unwrap();
        match drain(&pipeline) {
            Err(PipelineError::Lane { path, .. }) => assert_eq!(path, PathBuf::from("bad")),
            other => panic!("expected lane failure, got {:?}", other.map(|b| b.len())),
        }
        assert!(matches!(pipeline.next_batch(), Err(PipelineError::Cancelled)));
    }

    struct PanickingSource;

    impl RecordSource for PanickingSource {
        fn next_batch(&mut self) -> Result<Option<Vec<EventRecord>>, SourceError> {
            panic!("decoder bug");
        }
    }

    struct PanickingFactory;

    impl SourceFactory for PanickingFactory {
        fn open(
            &self,
            _path: &Path,
            _chunk: usize,
        ) -> Result<Box<dyn RecordSource + Send>, SourceError> {
            Ok(Box::new(PanickingSource))
        }

        fn validate(&self, _path: &Path) -> Result<(), SourceError> {
            Ok(())
        }
    }

    #[test]
    fn test_lane_panic_ends_stream_with_error() {
        let config = PipelineConfig {
            batch_size: 4,
            resample: false,
            ..Default::default()
        };
        let files = vec![PathBuf::from("boom")];
        let pipeline =
            Pipeline::spawn(config, schema(2), files, Arc::new(PanickingFactory), None).unwrap();

        let start = Instant::now();
        let result = drain(&pipeline);
        assert!(start.elapsed() < Duration::from_secs(2));
        assert!(matches!(result, Err(PipelineError::LanePanicked { lane: 0 })));
        assert!(matches!(pipeline.next_batch(), Err(PipelineError::Cancelled)));
    }

    #[test]
    fn test_drop_joins_blocked_lanes() {
        let k = 2;
        let records: Vec<EventRecord> = (0..1_000).map(|i| event(i % k, k, 2.0, 0.0, 1.0)).collect();
        let factory = MemorySourceFactory::default().with_file("big", records);
        let config = PipelineConfig {
            batch_size: 2,
            resample: false,
            ..Default::default()
        };
        let files = factory.paths();
        let pipeline = Pipeline::spawn(config, schema(k), files, Arc::new(factory), None).unwrap();
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(pipeline.buffered(), 10);

        let start = Instant::now();
        drop(pipeline);
        assert!(start.elapsed() < Duration::from_secs(2));
    }
}
