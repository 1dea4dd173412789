use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::*;

use cinder_primitives::block::BlockPosition;

use crate::batch::Batch;
use crate::promise::Shared;
use crate::task::{Task, TaskState};

/// Consumer-side hooks a download pipeline is parameterised over.
///
/// The manager calls these with its internal lock held, so
/// implementations must not call back into the manager synchronously;
/// hand work to a channel or queue instead.
pub trait DownloadSink: Send + Sync + Sized + 'static {
    /// Payload produced by the download stage.
    type Download: Clone + Send + 'static;

    /// Output produced by the processing stage.
    type Finished: Clone + Send + 'static;

    /// Caller-defined tag carried by tasks and batches, checked when a
    /// payload arrives with metadata attached.
    type Extra: Clone + PartialEq + Send + Sync + 'static;

    /// Batch size to allocate given the number of unallocated tasks.
    fn batch_size(&self, unallocated: usize) -> usize;

    /// Signals workers that allocatable work exists.
    fn batch_ready(&self) {}

    /// Chance to pre-resolve a freshly queued task from local storage.
    fn check_task(&self, _task: &TaskOf<Self>) {}

    /// Hands tasks (already in `Processing` state) off for processing.
    fn queue_processing(&self, tasks: Vec<Arc<TaskOf<Self>>>);

    /// Persists a new tip.  Positions are strictly increasing between
    /// resets.
    fn update_tip(&self, position: &BlockPosition, finished: &Self::Finished);

    /// Requests a `state_machine` tick from another thread.
    fn trigger_state_machine(&self);
}

pub type TaskOf<S> =
    Task<<S as DownloadSink>::Download, <S as DownloadSink>::Finished, <S as DownloadSink>::Extra>;

/// Anchor supplied with a reorg'd `update_position` call, used when the
/// truncation empties the buffer: the position and processed output of
/// the block the new tasks build on.
pub type Previous<F> = Option<(BlockPosition, Shared<F>)>;

struct Inner<S: DownloadSink> {
    previous: Shared<S::Finished>,
    done: BlockPosition,
    known: BlockPosition,
    last_batch: i64,
    next_task_id: u64,
    buffer: VecDeque<Arc<TaskOf<S>>>,
    /// Buffer index of the first unallocated task.
    next: usize,
}

pub(crate) struct ManagerShared<S: DownloadSink> {
    sink: S,
    label: String,
    max_queue: usize,
    inner: Mutex<Inner<S>>,
}

/// Owns a sliding buffer of download tasks over consecutive positions
/// and drives them through the download/processing pipeline.
pub struct DownloadManager<S: DownloadSink> {
    shared: Arc<ManagerShared<S>>,
}

impl<S: DownloadSink> Clone for DownloadManager<S> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<S: DownloadSink> DownloadManager<S> {
    /// Creates a pipeline whose first task will chain onto `previous`,
    /// with both tip markers at `position`.  A `max_queue` of zero means
    /// no buffer bound.
    pub fn new(
        sink: S,
        position: BlockPosition,
        previous: Shared<S::Finished>,
        label: impl Into<String>,
        max_queue: usize,
    ) -> Self {
        Self {
            shared: Arc::new(ManagerShared {
                sink,
                label: label.into(),
                max_queue,
                inner: Mutex::new(Inner {
                    previous,
                    done: position,
                    known: position,
                    last_batch: -1,
                    next_task_id: 0,
                    buffer: VecDeque::new(),
                    next: 0,
                }),
            }),
        }
    }

    pub fn sink(&self) -> &S {
        &self.shared.sink
    }

    pub fn known(&self) -> BlockPosition {
        self.shared.inner.lock().known
    }

    pub fn done(&self) -> BlockPosition {
        self.shared.inner.lock().done
    }

    pub fn buffer_size(&self) -> usize {
        self.shared.inner.lock().buffer.len()
    }

    /// Abandons all buffered work and rebases the pipeline on
    /// `position`/`previous`.  Used for reorgs deeper than the buffer
    /// and for checkpoint failures.
    ///
    /// `previous` must already be fulfilled.
    pub fn reset(&self, position: BlockPosition, previous: Shared<S::Finished>) {
        debug!(label = %self.shared.label, %position, "resetting download manager");

        let mut inner = self.shared.inner.lock();
        inner.previous = previous;
        inner.done = position;
        inner.known = position;
        inner.buffer.clear();
        inner.next = 0;

        match inner.previous.get() {
            Ok(finished) => self.shared.sink.update_tip(&position, &finished),
            Err(err) => error!(label = %self.shared.label, %err, "reset seed failed"),
        }
    }

    /// Extends (or, on reorg, truncates and re-extends) the buffer with
    /// new positions.  `positions` must be consecutive ascending
    /// heights; `prior` supplies the chain anchor when the incoming
    /// start truncates the entire buffer.
    pub fn update_position(
        &self,
        positions: Vec<BlockPosition>,
        extra: S::Extra,
        prior: Previous<S::Finished>,
    ) {
        if positions.is_empty() {
            return;
        }

        let mut inner = self.shared.inner.lock();
        let start = positions[0];

        if let Some((prior_pos, _)) = &prior {
            assert!(
                prior_pos.height() <= start.height(),
                "download: prior anchor above new positions"
            );
        }

        if inner.known.height() >= start.height() {
            // A sibling chain replaces the tail of the buffer.
            let mut last_good: Option<(usize, Arc<TaskOf<S>>)> = None;
            let mut cut = None;

            for (i, task) in inner.buffer.iter().enumerate() {
                if task.position().height() < start.height() {
                    last_good = Some((i, task.clone()));
                    continue;
                }
                cut = Some(i);
                break;
            }

            if let Some(cut) = cut {
                inner.buffer.truncate(cut);
            }

            let (position, finished, index) = match last_good {
                Some((i, task)) => (*task.position(), task.output(), i),
                None => {
                    assert!(
                        inner.buffer.is_empty(),
                        "download: no surviving task but buffer non-empty"
                    );
                    let (pos, fin) = prior.expect("download: reorg to empty buffer without prior");
                    (pos, fin, 0)
                }
            };

            if inner.done > start {
                match finished.get() {
                    Ok(data) => self.shared.sink.update_tip(&position, &data),
                    Err(err) => {
                        error!(label = %self.shared.label, %err, "reorg anchor output failed")
                    }
                }
                inner.done = position;
                inner.previous = finished;
            }

            inner.next = inner.next.min(index);
        }

        let mut previous = match inner.buffer.back() {
            Some(task) => task.output(),
            None => inner.previous.clone(),
        };

        for position in positions {
            if self.shared.max_queue != 0 && inner.buffer.len() >= self.shared.max_queue {
                break;
            }

            let id = inner.next_task_id;
            inner.next_task_id += 1;
            let task = Arc::new(Task::new(position, previous, extra.clone(), id));
            previous = task.output();
            self.shared.sink.check_task(&task);
            inner.buffer.push_back(task);
        }

        inner.known = *inner
            .buffer
            .back()
            .expect("download: buffer empty after update_position")
            .position();

        assert!(inner.done.height() <= inner.known.height());

        drop(inner);
        self.shared.sink.trigger_state_machine();
    }

    /// Allocates up to `batch_size` tasks starting at the first
    /// unallocated buffer index.  Returns an empty batch when caught up
    /// or nothing is allocatable.
    pub fn allocate_batch(&self, extra: S::Extra) -> Batch<S> {
        let mut inner = self.shared.inner.lock();

        if inner.caught_up() {
            trace!(label = %self.shared.label, "caught up");
            return Batch::empty(extra);
        }

        debug_assert!(!inner.buffer.is_empty());

        let unallocated = inner.unallocated();
        let size = unallocated.min(self.shared.sink.batch_size(unallocated));
        if size == 0 {
            return Batch::empty(extra);
        }

        let mut tasks = Vec::with_capacity(size);
        for task in inner.buffer.iter().skip(inner.next) {
            if !task.cas(TaskState::New, TaskState::Downloading) {
                if tasks.is_empty() {
                    continue;
                }
                break;
            }

            trace!(
                label = %self.shared.label,
                position = %task.position(),
                "queueing item for download"
            );
            tasks.push(task.clone());

            if tasks.len() == size {
                break;
            }
        }

        if tasks.is_empty() {
            return Batch::empty(extra);
        }

        inner.last_batch += 1;
        inner.next += tasks.len();
        debug_assert!(inner.next <= inner.buffer.len());

        Batch::new(
            inner.last_batch,
            tasks,
            extra,
            Arc::downgrade(&self.shared),
        )
    }

    /// Advances the pipeline: commits the processed prefix to the tip,
    /// promotes contiguously downloaded tasks to processing, and signals
    /// for more downloads if work remains.  Returns whether any of that
    /// still applies.
    pub fn state_machine(&self) -> bool {
        let mut inner = self.shared.inner.lock();

        if inner.caught_up() {
            return false;
        }

        debug_assert!(!inner.buffer.is_empty());

        // Commit the longest fully processed prefix.
        let mut processed = 0;
        let mut returned_task = None;
        for (index, task) in inner.buffer.iter().enumerate() {
            let state = task.state();
            if state != TaskState::Processed {
                // A task returned to New (failed processing or an
                // abandoned batch) must become allocatable again.
                if state == TaskState::New {
                    returned_task = Some(index);
                }
                break;
            }
            processed += 1;
        }
        if let Some(index) = returned_task {
            inner.next = inner.next.min(index);
        }

        if processed > 0 {
            let last = inner.buffer[processed - 1].clone();
            match last.output().get() {
                Ok(data) => {
                    self.shared.sink.update_tip(last.position(), &data);
                    inner.done = *last.position();
                    inner.previous = last.output();
                }
                Err(err) => {
                    // A task cannot be Processed with a failed output.
                    error!(label = %self.shared.label, %err, "processed task with failed output");
                }
            }

            inner.buffer.drain(..processed);
            inner.next = inner.next.saturating_sub(processed);
        }

        debug_assert!(inner.done.height() <= inner.known.height());

        // Promote the contiguously downloaded run for processing.
        let mut process = Vec::new();
        for task in inner.buffer.iter() {
            if !task.cas(TaskState::Downloaded, TaskState::Processing) {
                break;
            }
            process.push(task.clone());
        }

        if !process.is_empty() {
            self.shared.sink.queue_processing(process);
        }

        if inner.caught_up() {
            return false;
        }

        if inner.unallocated() > 0 {
            self.shared.sink.batch_ready();
        }

        true
    }
}

impl<S: DownloadSink> ManagerShared<S> {
    /// Called from a batch's drop.  Verifies which tasks actually
    /// downloaded and returns the rest to the allocatable pool.  If the
    /// batch's tasks were truncated out of the buffer the whole batch is
    /// discarded silently.
    pub(crate) fn finish_downloading(&self, tasks: &[Arc<TaskOf<S>>]) {
        {
            let mut inner = self.inner.lock();
            debug_assert!(!tasks.is_empty());

            let first = &tasks[0];
            let Some(start) = inner
                .buffer
                .iter()
                .position(|task| task.position() == first.position())
            else {
                return;
            };

            for (offset, batch_task) in tasks.iter().enumerate() {
                let index = start + offset;
                let Some(buffer_task) = inner.buffer.get(index) else {
                    break;
                };
                if !Arc::ptr_eq(buffer_task, batch_task) {
                    break;
                }

                // Confirm the download completed; anything else goes
                // back to the pool.
                if batch_task.cas(TaskState::Downloaded, TaskState::Update) {
                    batch_task.set_state(TaskState::Downloaded);
                } else {
                    inner.next = inner.next.min(index);
                    batch_task.cas(TaskState::Downloading, TaskState::New);
                }
            }
        }

        self.sink.trigger_state_machine();
    }
}

impl<S: DownloadSink> Inner<S> {
    fn caught_up(&self) -> bool {
        self.done == self.known
    }

    fn unallocated(&self) -> usize {
        let outstanding = (self.known.height() - self.done.height()) as usize;
        debug_assert!(self.next <= outstanding);
        debug_assert!(self.next <= self.buffer.len());
        outstanding - self.next
    }
}
