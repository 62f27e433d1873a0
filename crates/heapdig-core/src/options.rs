//! Analysis configuration.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::roots::RootOptions;

/// Tuning knobs for one analysis run
///
/// ```rust
/// use heapdig_core::AnalysisOptions;
///
/// let options = AnalysisOptions::default().with_workers(2).with_batch_size(64);
/// assert_eq!(options.workers, 2);
/// assert!(!options.is_aborted());
/// ```
#[derive(Debug, Clone)]
pub struct AnalysisOptions
{
    /// Graph worker threads; `0` means one per available CPU
    pub workers: usize,
    /// Claims handed to a worker at a time
    pub batch_size: usize,
    /// Frames walked per execution context
    pub max_frames: usize,
    /// Treat register values pointing into writable memory as roots
    pub register_roots: bool,
    /// Cooperative cancellation, checked between batches
    pub abort: Arc<AtomicBool>,
}

impl Default for AnalysisOptions
{
    fn default() -> Self
    {
        let roots = RootOptions::default();
        Self {
            workers: 0,
            batch_size: 256,
            max_frames: roots.max_frames,
            register_roots: roots.register_roots,
            abort: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl AnalysisOptions
{
    pub fn with_workers(mut self, workers: usize) -> Self
    {
        self.workers = workers;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self
    {
        self.batch_size = batch_size;
        self
    }

    pub fn with_max_frames(mut self, max_frames: usize) -> Self
    {
        self.max_frames = max_frames;
        self
    }

    pub fn with_abort(mut self, abort: Arc<AtomicBool>) -> Self
    {
        self.abort = abort;
        self
    }

    pub fn is_aborted(&self) -> bool
    {
        self.abort.load(Ordering::Relaxed)
    }

    /// Worker count with `0` resolved against the machine
    pub fn effective_workers(&self) -> usize
    {
        match self.workers {
            0 => std::thread::available_parallelism().map_or(1, usize::from),
            workers => workers,
        }
    }

    pub fn root_options(&self) -> RootOptions
    {
        RootOptions {
            max_frames: self.max_frames,
            register_roots: self.register_roots,
        }
    }
}
