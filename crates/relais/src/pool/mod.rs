//! Worker pool orchestrator.
//!
//! A pool owns one [`Service`] per worker. A run slices the input into
//! indexed chunks, puts every chunk on a shared queue, and starts one task per
//! worker. Each task drives only its own service, so at most one call is in
//! flight per host. Chunks finish in any order; the [`ResultMap`] puts them
//! back in index order once every task has joined.
//!
//! Failure handling:
//! - a line the service rejects or loses keeps its original text
//! - a worker whose service goes down hands its unfinished chunk back to the
//!   queue and stops; the rest of the pool picks it up
//! - a run fails only if some chunk could not be processed by anyone
//!
//! Cancelling a run (dropping the future of [`WorkerPool::process_lines`])
//! aborts its tasks. Workers stay in the pool and are reusable by the next
//! run; a host whose call was cut short is replaced on its next request.

mod processor;
mod queue;
mod results;

pub use processor::{LineProcessor, TextCommand};
pub use queue::{WorkItem, WorkQueue};
pub use results::{DuplicateChunk, ResultMap};

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::chunk::{chunk_size, slice};
use crate::client::{ClientError, ClientState, HostLauncher, Reply, Service, ServiceClient};
use crate::config::{ConfigError, PoolConfig};

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("invalid pool configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("worker {worker} failed to start: {source}")]
    Startup {
        worker: usize,
        #[source]
        source: ClientError,
    },

    #[error("no live workers in the pool")]
    NoWorkers,

    #[error("run incomplete: no result for chunks {missing:?}")]
    Incomplete { missing: Vec<usize> },

    #[error("worker {worker} panicked: {message}")]
    WorkerPanicked { worker: usize, message: String },
}

/// Counters for one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunStats {
    pub chunks: usize,
    pub lines: usize,
    /// Lines whose original text was kept because the service gave no usable
    /// answer.
    pub fallbacks: usize,
    /// Unfinished chunks handed back to the queue by a worker going down.
    pub requeued: usize,
    /// Workers removed from the pool during the run.
    pub lost_workers: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Processed {
    pub lines: Vec<String>,
    pub stats: RunStats,
}

/// Result of [`WorkerPool::process_text`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedText {
    pub text: String,
    pub stats: RunStats,
}

/// One pool slot. The pool keeps the `Arc`; a run's task only borrows the
/// service through the lock, so aborting the task hands it back.
struct Worker {
    id: usize,
    service: Mutex<Box<dyn Service>>,
}

impl Worker {
    fn new(id: usize, service: Box<dyn Service>) -> Arc<Self> {
        Arc::new(Self {
            id,
            service: Mutex::new(service),
        })
    }
}

#[derive(Debug)]
struct WorkerTally {
    fallbacks: usize,
    requeued: usize,
    /// Cleared when the service stopped accepting requests.
    alive: bool,
}

impl Default for WorkerTally {
    fn default() -> Self {
        Self {
            fallbacks: 0,
            requeued: 0,
            alive: true,
        }
    }
}

/// Tasks of one round. Dropping it before the join aborts whatever is
/// still running.
struct Round {
    tasks: Vec<(usize, JoinHandle<WorkerTally>)>,
}

impl Drop for Round {
    fn drop(&mut self) {
        for (id, task) in &self.tasks {
            if !task.is_finished() {
                tracing::warn!(worker = id, "Run cancelled, aborting worker task");
                task.abort();
            }
        }
    }
}

pub struct WorkerPool {
    workers: Vec<Arc<Worker>>,
    config: PoolConfig,
}

impl WorkerPool {
    /// Launch `config.workers` hosts one after another, `config.stagger`
    /// apart. If any host fails to come up, the ones already running are shut
    /// down and the pool is not built.
    pub async fn start(
        launcher: Arc<dyn HostLauncher>,
        config: PoolConfig,
    ) -> Result<Self, PoolError> {
        config.validate()?;

        let mut workers: Vec<Arc<Worker>> = Vec::with_capacity(config.workers);
        for id in 0..config.workers {
            if id > 0 && !config.stagger.is_zero() {
                tokio::time::sleep(config.stagger).await;
            }
            match ServiceClient::start(id, Arc::clone(&launcher), config.client.clone()).await {
                Ok(client) => workers.push(Worker::new(id, Box::new(client))),
                Err(source) => {
                    tracing::error!(worker = id, error = %source, "Worker failed to start, aborting pool");
                    for worker in &workers {
                        worker.service.lock().await.stop().await;
                    }
                    return Err(PoolError::Startup { worker: id, source });
                }
            }
        }

        tracing::info!(workers = workers.len(), "Worker pool ready");
        Ok(Self { workers, config })
    }

    /// Build a pool over services that are already running. Worker ids follow
    /// iteration order.
    pub fn from_services(
        services: impl IntoIterator<Item = Box<dyn Service>>,
        config: PoolConfig,
    ) -> Result<Self, PoolError> {
        let workers: Vec<Arc<Worker>> = services
            .into_iter()
            .enumerate()
            .map(|(id, service)| Worker::new(id, service))
            .collect();
        let config = PoolConfig {
            workers: workers.len(),
            ..config
        };
        config.validate()?;
        Ok(Self { workers, config })
    }

    /// Live workers.
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Process every line through the pool and return the outputs in input
    /// order, one output line per input line.
    ///
    /// Cancel-safe: if the returned future is dropped, the run's tasks are
    /// aborted and every worker remains in the pool.
    pub async fn process_lines(
        &mut self,
        lines: Vec<String>,
        processor: Arc<dyn LineProcessor>,
    ) -> Result<Processed, PoolError> {
        let mut stats = RunStats {
            lines: lines.len(),
            ..RunStats::default()
        };
        if lines.is_empty() {
            return Ok(Processed {
                lines: Vec::new(),
                stats,
            });
        }
        if self.workers.is_empty() {
            return Err(PoolError::NoWorkers);
        }

        let size = chunk_size(
            lines.len(),
            self.workers.len(),
            self.config.fan_out,
            self.config.min_chunk,
        );
        let chunks = slice(lines, size);
        stats.chunks = chunks.len();
        tracing::info!(
            lines = stats.lines,
            chunks = stats.chunks,
            chunk_size = size,
            workers = self.workers.len(),
            "Starting run"
        );

        let queue = Arc::new(WorkQueue::new(chunks));
        let results = Arc::new(ResultMap::new());

        loop {
            let mut round = Round {
                tasks: self
                    .workers
                    .iter()
                    .map(|worker| {
                        let task = tokio::spawn(run_worker(
                            Arc::clone(worker),
                            Arc::clone(&queue),
                            Arc::clone(&results),
                            Arc::clone(&processor),
                        ));
                        (worker.id, task)
                    })
                    .collect(),
            };

            // Barrier: every chunk taken this round is either stored or back
            // on the queue once all tasks have joined.
            let mut panicked = None;
            let mut lost = HashSet::new();
            for (id, task) in &mut round.tasks {
                let id = *id;
                match task.await {
                    Ok(tally) => {
                        stats.fallbacks += tally.fallbacks;
                        stats.requeued += tally.requeued;
                        if !tally.alive {
                            lost.insert(id);
                        }
                    }
                    Err(e) => {
                        tracing::error!(worker = id, error = %e, "Worker task failed");
                        lost.insert(id);
                        if panicked.is_none() {
                            panicked = Some(PoolError::WorkerPanicked {
                                worker: id,
                                message: e.to_string(),
                            });
                        }
                    }
                }
            }
            drop(round);

            for worker in self.workers.iter().filter(|w| lost.contains(&w.id)) {
                tracing::warn!(worker = worker.id, "Worker lost, removing it from the pool");
                worker.service.lock().await.stop().await;
            }
            stats.lost_workers += lost.len();
            self.workers.retain(|w| !lost.contains(&w.id));

            if let Some(err) = panicked {
                return Err(err);
            }

            if queue.is_empty() {
                break;
            }
            if self.workers.is_empty() {
                tracing::error!(pending = queue.len(), "All workers lost with chunks pending");
                break;
            }
            tracing::info!(
                pending = queue.len(),
                workers = self.workers.len(),
                "Redistributing unfinished chunks"
            );
        }

        let lines = results
            .assemble(stats.chunks)
            .map_err(|missing| PoolError::Incomplete { missing })?;
        tracing::info!(
            lines = lines.len(),
            fallbacks = stats.fallbacks,
            requeued = stats.requeued,
            lost_workers = stats.lost_workers,
            "Run complete"
        );
        Ok(Processed { lines, stats })
    }

    /// Process `text` line by line. Each line keeps its own terminator
    /// (`\n`, `\r\n`, or none for a final unterminated line).
    pub async fn process_text(
        &mut self,
        text: &str,
        processor: Arc<dyn LineProcessor>,
    ) -> Result<ProcessedText, PoolError> {
        let (lines, endings): (Vec<String>, Vec<&str>) = split_lines(text).unzip();
        let processed = self.process_lines(lines, processor).await?;

        let mut output = String::with_capacity(text.len());
        for (line, ending) in processed.lines.iter().zip(endings) {
            output.push_str(line);
            output.push_str(ending);
        }
        Ok(ProcessedText {
            text: output,
            stats: processed.stats,
        })
    }

    /// Stop every host. The pool is empty afterwards.
    pub async fn shutdown(&mut self) {
        tracing::info!(workers = self.workers.len(), "Shutting down worker pool");
        for worker in self.workers.drain(..) {
            worker.service.lock().await.stop().await;
            tracing::debug!(worker = worker.id, "Worker stopped");
        }
    }
}

/// Split `text` into lines, each paired with the terminator it had (`"\n"`,
/// `"\r\n"`, or `""` for an unterminated last line).
fn split_lines(text: &str) -> impl Iterator<Item = (String, &str)> {
    text.split_inclusive('\n').map(|piece| {
        let ending = if piece.ends_with("\r\n") {
            2
        } else if piece.ends_with('\n') {
            1
        } else {
            0
        };
        let (body, ending) = piece.split_at(piece.len() - ending);
        (body.to_string(), ending)
    })
}

async fn run_worker(
    worker: Arc<Worker>,
    queue: Arc<WorkQueue>,
    results: Arc<ResultMap>,
    processor: Arc<dyn LineProcessor>,
) -> WorkerTally {
    let mut tally = WorkerTally::default();
    let mut service = worker.service.lock().await;
    if service.state() == ClientState::Down {
        tally.alive = false;
        return tally;
    }

    while let Some(mut item) = queue.pop() {
        let index = item.index();
        if item.cursor() > 0 {
            tracing::debug!(worker = worker.id, chunk = index, from_line = item.cursor(), "Resuming chunk");
        }
        let alive = process_item(
            worker.id,
            &mut **service,
            &mut item,
            processor.as_ref(),
            &mut tally,
        )
        .await;

        if item.is_done() {
            let lines = item.output;
            tracing::debug!(worker = worker.id, chunk = index, lines = lines.len(), "Chunk done");
            if let Err(e) = results.insert(index, lines) {
                tracing::error!(worker = worker.id, error = %e, "Discarding duplicate chunk result");
            }
        } else {
            tracing::warn!(
                worker = worker.id,
                chunk = index,
                done = item.cursor(),
                total = item.chunk.len(),
                "Returning unfinished chunk to the queue"
            );
            tally.requeued += 1;
            queue.requeue(item);
        }

        if !alive {
            tally.alive = false;
            break;
        }
    }

    tally
}

/// Run the remaining lines of `item` through the worker's service. Returns
/// `false` once the service is down.
async fn process_item(
    worker: usize,
    service: &mut dyn Service,
    item: &mut WorkItem,
    processor: &dyn LineProcessor,
    tally: &mut WorkerTally,
) -> bool {
    while !item.is_done() {
        let line = &item.chunk.lines[item.output.len()];
        let Some(request) = processor.request(line) else {
            item.output.push(line.clone());
            continue;
        };

        let answer = match service.request(request).await {
            Ok(Reply::Data(data)) => processor.response(line, &data),
            Ok(Reply::Error(error)) => {
                tracing::debug!(worker, chunk = item.chunk.index, %error, "Line rejected, keeping original");
                None
            }
            Ok(Reply::Lost(fault)) => {
                tracing::warn!(worker, chunk = item.chunk.index, %fault, "Line lost to host fault, keeping original");
                None
            }
            Err(ClientError::Rejected(error)) => {
                tracing::warn!(worker, chunk = item.chunk.index, %error, "Line not sendable, keeping original");
                None
            }
            // Never sent; another worker can still try this line.
            Err(ClientError::Down) => return false,
            Err(e) => {
                tracing::error!(worker, chunk = item.chunk.index, error = %e, "Service went down");
                tally.fallbacks += 1;
                item.output.push(line.clone());
                return false;
            }
        };

        match answer {
            Some(output) => item.output.push(output),
            None => {
                tally.fallbacks += 1;
                item.output.push(line.clone());
            }
        }
    }
    true
}
