//! Bounded worker pool for batch dispatch.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread;

use crate::error::BridgeError;
use crate::http::{HttpMethod, HttpResponse};
use crate::request::{BatchResults, Dispatch, Request, RequestOptions};
use crate::stream::SseEvent;

/// Upper bound on concurrent workers.
pub const MAX_WORKERS: usize = 50;

/// Runs `job` over `jobs` on at most `limit` scoped threads and returns the results in
/// input order. Jobs beyond the worker count wait in a shared queue.
pub(crate) fn run_bounded<T, R, F>(jobs: Vec<T>, limit: usize, job: F) -> Vec<R>
where
    T: Send,
    R: Send,
    F: Fn(T) -> R + Sync,
{
    let total = jobs.len();
    let workers = limit.clamp(1, MAX_WORKERS).min(total);
    if workers == 0 {
        return Vec::new();
    }

    let queue = Mutex::new(jobs.into_iter().enumerate());
    let results = Mutex::new(Vec::with_capacity(total));
    thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| {
                loop {
                    let next = queue
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .next();
                    let Some((idx, item)) = next else {
                        break;
                    };
                    let output = job(item);
                    results
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .push((idx, output));
                }
            });
        }
    });

    let mut results = results
        .into_inner()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    results.sort_by_key(|(idx, _)| *idx);
    results.into_iter().map(|(_, output)| output).collect()
}

/// What a [`RequestTask`] does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    /// Plain call; several URLs make it a batch.
    Http(HttpMethod),
    /// SSE call against the first URL; events are collected until the stream closes.
    Sse(HttpMethod),
}

/// One unit of work for [`RequestPool::execute_all`].
#[derive(Debug, Clone)]
pub struct RequestTask {
    pub task_id: String,
    pub kind: TaskKind,
    pub urls: Vec<String>,
    pub options: RequestOptions,
}

impl RequestTask {
    pub fn new(task_id: impl Into<String>, kind: TaskKind, urls: Vec<String>) -> Self {
        Self {
            task_id: task_id.into(),
            kind,
            urls,
            options: RequestOptions::default(),
        }
    }

    pub fn with_options(mut self, options: RequestOptions) -> Self {
        self.options = options;
        self
    }
}

/// Value produced by a successful task.
#[derive(Debug)]
pub enum TaskOutput {
    Response(HttpResponse),
    Batch(BatchResults),
    Events(Vec<SseEvent>),
}

#[derive(Debug)]
pub struct TaskResult {
    pub task_id: String,
    /// The task's value, or a description of its failure.
    pub outcome: Result<TaskOutput, String>,
}

impl TaskResult {
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }
}

/// Runs heterogeneous request tasks in parallel over one shared [`Request`] session.
pub struct RequestPool {
    request: Arc<Request>,
    max_workers: usize,
}

impl RequestPool {
    pub fn new(request: Arc<Request>) -> Self {
        Self {
            request,
            max_workers: MAX_WORKERS,
        }
    }

    /// Caps concurrency below [`MAX_WORKERS`].
    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers.clamp(1, MAX_WORKERS);
        self
    }

    /// Executes every task and blocks until all have finished.
    ///
    /// One result is returned per task, in task order. A failing task never affects
    /// its siblings.
    pub fn execute_all(&self, tasks: Vec<RequestTask>) -> Vec<TaskResult> {
        let request = self.request.as_ref();
        run_bounded(tasks, self.max_workers, |task| {
            let outcome = run_task(request, &task).map_err(|err| err.to_string());
            if let Err(message) = &outcome {
                tracing::debug!(task_id = %task.task_id, error = %message, "request task failed");
            }
            TaskResult {
                task_id: task.task_id,
                outcome,
            }
        })
    }
}

fn run_task(request: &Request, task: &RequestTask) -> Result<TaskOutput, BridgeError> {
    match task.kind {
        TaskKind::Http(method) => match request.dispatch(method, &task.urls, &task.options)? {
            Dispatch::Single(response) => Ok(TaskOutput::Response(response)),
            Dispatch::Batch(results) => Ok(TaskOutput::Batch(results)),
        },
        TaskKind::Sse(method) => {
            let url = task
                .urls
                .first()
                .ok_or_else(|| BridgeError::validation("SSE task requires a URL"))?;
            let events = request
                .request_sse(method, url, &task.options)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(TaskOutput::Events(events))
        }
    }
}

/// Groups batch outcomes into successes and failures, keyed by URL.
///
/// # Examples
///
/// ```
/// use std::collections::HashMap;
/// use llm_bridge::{BatchResults, partition_batch};
///
/// let results: BatchResults =
///     HashMap::from([("http://127.0.0.1:1/".to_string(), Err("refused".to_string()))]);
/// let (ok, failed) = partition_batch(results);
/// assert!(ok.is_empty());
/// assert_eq!(failed["http://127.0.0.1:1/"], "refused");
/// ```
pub fn partition_batch(
    results: BatchResults,
) -> (HashMap<String, HttpResponse>, HashMap<String, String>) {
    let mut ok = HashMap::new();
    let mut failed = HashMap::new();
    for (url, outcome) in results {
        match outcome {
            Ok(response) => {
                ok.insert(url, response);
            }
            Err(message) => {
                failed.insert(url, message);
            }
        }
    }
    (ok, failed)
}
