//! Host-side pool supervision.
//!
//! The pool owns `N` worker children and three disjoint structures: the
//! free list, the busy map, and a strict-FIFO overflow queue. All of that
//! state lives inside one supervisor task; the [`InterpreterPool`] handle
//! talks to it over an mpsc command channel and every submission gets its
//! verdict back over a oneshot channel that fires exactly once.
//!
//! A worker that exits (crash, kill, OOM) is removed from both sets and
//! replaced, and its in-flight job goes back to the *head* of the queue
//! with its original responder, so a misbehaving script can neither eat a
//! pool slot nor swallow a caller's callback.

use crate::pool::protocol::{VerifyReply, VerifyRequest, read_frame_async, write_frame_async};
use crate::types::encoding::{Decode, Encode};
use crate::utils::log::Logger;
use crate::vm::machine::Job;
use duelchain_derive::Error;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::time::sleep;

/// Configuration options for the pool.
pub struct PoolOptions {
    /// Number of worker processes to keep alive.
    pub workers: usize,
    /// Maximum queued jobs before submissions are rejected; `None` keeps
    /// the queue unbounded.
    pub max_queue: Option<usize>,
    /// Worker executable; defaults to the current executable, which
    /// re-enters itself via its `worker` subcommand.
    pub worker_program: Option<PathBuf>,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            workers: 4,
            max_queue: None,
            worker_program: None,
        }
    }
}

/// Errors surfaced to pool callers.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The overflow queue hit its configured cap.
    #[error("verification queue is full")]
    QueueFull,
    /// The pool has shut down; no verdict will be produced.
    #[error("interpreter pool is shut down")]
    Closed,
    /// A worker process could not be started.
    #[error("failed to spawn worker: {0}")]
    Spawn(String),
}

/// The outcome of one job.
///
/// `result` is the chain verdict. `error` carries the worker's reason
/// when it could not evaluate the job as given (malformed reply, bad
/// request); such outcomes always have `result == false`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Verdict {
    pub result: bool,
    pub error: Option<String>,
}

type WorkerId = u64;
type Responder = oneshot::Sender<Result<Verdict, PoolError>>;

enum PoolCommand {
    Submit { job: Job, responder: Responder },
    WorkerPids { responder: oneshot::Sender<Vec<u32>> },
    Shutdown,
}

enum WorkerEvent {
    /// One framed reply arrived from a worker.
    Reply { worker: WorkerId, frame: Vec<u8> },
    /// A worker's stdout reached EOF or errored: the process is gone.
    Exited { worker: WorkerId },
}

/// Handle to a running interpreter pool.
///
/// Cheap to clone; all clones feed the same supervisor.
#[derive(Clone)]
pub struct InterpreterPool {
    commands: mpsc::Sender<PoolCommand>,
}

impl InterpreterPool {
    /// Starts the pool, forking its workers up front.
    pub async fn start(options: PoolOptions) -> Result<InterpreterPool, PoolError> {
        let program = match options.worker_program {
            Some(program) => program,
            None => std::env::current_exe().map_err(|e| PoolError::Spawn(e.to_string()))?,
        };

        let (commands_tx, commands_rx) = mpsc::channel(1024);
        let (events_tx, events_rx) = mpsc::channel(1024);
        let mut supervisor = Supervisor {
            program,
            next_worker: 0,
            workers: HashMap::new(),
            free: VecDeque::new(),
            busy: HashMap::new(),
            queue: VecDeque::new(),
            max_queue: options.max_queue,
            events_tx,
            logger: Logger::new("pool"),
        };

        for _ in 0..options.workers.max(1) {
            let worker = supervisor.spawn_worker()?;
            supervisor.free.push_back(worker);
        }

        tokio::spawn(supervisor.run(commands_rx, events_rx));
        Ok(InterpreterPool {
            commands: commands_tx,
        })
    }

    /// Submits a job and waits for its verdict.
    ///
    /// Queued behind other jobs in strict submission order when every
    /// worker is busy. The returned future resolves exactly once, even if
    /// the worker evaluating the job crashes and the job is re-run.
    pub async fn submit(&self, job: Job) -> Result<Verdict, PoolError> {
        let (responder, receiver) = oneshot::channel();
        self.commands
            .send(PoolCommand::Submit { job, responder })
            .await
            .map_err(|_| PoolError::Closed)?;
        receiver.await.map_err(|_| PoolError::Closed)?
    }

    /// Returns the PIDs of the current worker processes.
    pub async fn worker_pids(&self) -> Vec<u32> {
        let (responder, receiver) = oneshot::channel();
        if self
            .commands
            .send(PoolCommand::WorkerPids { responder })
            .await
            .is_err()
        {
            return Vec::new();
        }
        receiver.await.unwrap_or_default()
    }

    /// Stops the supervisor and kills the workers. Pending jobs resolve
    /// with [`PoolError::Closed`].
    pub async fn shutdown(&self) {
        let _ = self.commands.send(PoolCommand::Shutdown).await;
    }
}

struct InFlight {
    job: Job,
    responder: Responder,
}

struct WorkerHandle {
    pid: u32,
    stdin: ChildStdin,
    child: Child,
}

struct Supervisor {
    program: PathBuf,
    next_worker: WorkerId,
    workers: HashMap<WorkerId, WorkerHandle>,
    free: VecDeque<WorkerId>,
    busy: HashMap<WorkerId, InFlight>,
    queue: VecDeque<(Job, Responder)>,
    max_queue: Option<usize>,
    events_tx: mpsc::Sender<WorkerEvent>,
    logger: Logger,
}

impl Supervisor {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<PoolCommand>,
        mut events: mpsc::Receiver<WorkerEvent>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(PoolCommand::Submit { job, responder }) => {
                        self.handle_submit(job, responder).await;
                    }
                    Some(PoolCommand::WorkerPids { responder }) => {
                        let _ = responder.send(self.pids());
                    }
                    Some(PoolCommand::Shutdown) | None => break,
                },
                // The supervisor holds an events sender, so this channel
                // never closes from under the select.
                Some(event) = events.recv() => match event {
                    WorkerEvent::Reply { worker, frame } => {
                        self.handle_reply(worker, frame).await;
                    }
                    WorkerEvent::Exited { worker } => {
                        self.handle_exit(worker).await;
                    }
                },
            }
        }
        self.shutdown().await;
    }

    fn pids(&self) -> Vec<u32> {
        self.workers.values().map(|handle| handle.pid).collect()
    }

    async fn handle_submit(&mut self, job: Job, responder: Responder) {
        if let Some(worker) = self.free.pop_front() {
            if !self.try_dispatch(worker, job, responder).await {
                self.retire(worker).await;
                self.drain_queue().await;
            }
            return;
        }
        if let Some(cap) = self.max_queue
            && self.queue.len() >= cap
        {
            let _ = responder.send(Err(PoolError::QueueFull));
            return;
        }
        self.queue.push_back((job, responder));
    }

    /// Ships a job to a worker already removed from the free list.
    ///
    /// On a pipe failure the job goes back to the head of the queue and
    /// `false` is returned; the caller retires the worker.
    async fn try_dispatch(&mut self, worker: WorkerId, job: Job, responder: Responder) -> bool {
        let Some(handle) = self.workers.get_mut(&worker) else {
            self.queue.push_front((job, responder));
            return false;
        };
        let request = VerifyRequest::from_job(&job).to_bytes();
        if let Err(e) = write_frame_async(&mut handle.stdin, &request).await {
            self.logger
                .warn(&format!("write to worker {} failed: {e}", handle.pid));
            self.queue.push_front((job, responder));
            return false;
        }
        self.busy.insert(worker, InFlight { job, responder });
        true
    }

    /// Hands queued jobs to free workers, oldest job first.
    async fn drain_queue(&mut self) {
        while !self.queue.is_empty() {
            let Some(worker) = self.free.pop_front() else {
                return;
            };
            let (job, responder) = self
                .queue
                .pop_front()
                .expect("queue emptiness checked above");
            if !self.try_dispatch(worker, job, responder).await {
                self.retire(worker).await;
            }
        }
    }

    async fn handle_reply(&mut self, worker: WorkerId, frame: Vec<u8>) {
        let Some(inflight) = self.busy.remove(&worker) else {
            self.logger
                .warn(&format!("dropping unexpected reply from worker {worker}"));
            return;
        };
        let verdict = match VerifyReply::from_bytes(&frame) {
            Ok(reply) => Verdict {
                result: reply.result,
                error: reply.error,
            },
            Err(e) => Verdict {
                result: false,
                error: Some(format!("malformed worker reply: {e}")),
            },
        };
        let _ = inflight.responder.send(Ok(verdict));
        self.free.push_back(worker);
        self.drain_queue().await;
    }

    async fn handle_exit(&mut self, worker: WorkerId) {
        // A worker retired for a pipe failure may still deliver its EOF
        // event afterwards; that is not a second exit.
        if !self.workers.contains_key(&worker) {
            return;
        }
        self.logger.warn(&format!(
            "worker {} exited, respawning",
            self.workers[&worker].pid
        ));
        self.retire(worker).await;
        self.drain_queue().await;
    }

    /// Removes a worker from every structure, resubmits its in-flight job
    /// at the head of the queue, and spawns a replacement.
    async fn retire(&mut self, worker: WorkerId) {
        if let Some(handle) = self.workers.remove(&worker) {
            let mut child = handle.child;
            tokio::spawn(async move {
                // Kill if still alive, and reap either way.
                let _ = child.kill().await;
            });
        }
        self.free.retain(|w| *w != worker);
        if let Some(inflight) = self.busy.remove(&worker) {
            self.queue.push_front((inflight.job, inflight.responder));
        }

        match self.spawn_worker_with_retry().await {
            Ok(replacement) => self.free.push_back(replacement),
            Err(e) => {
                self.logger.error(&format!("{e}"));
                if self.workers.is_empty() {
                    // No worker will ever pick these up; fail the
                    // callbacks rather than leaving them pending forever.
                    for (_, responder) in self.queue.drain(..) {
                        let _ = responder.send(Err(PoolError::Spawn(e.to_string())));
                    }
                }
            }
        }
    }

    /// Spawns a replacement worker, retrying with exponential backoff.
    async fn spawn_worker_with_retry(&mut self) -> Result<WorkerId, PoolError> {
        let mut delay = Duration::from_millis(100);
        let mut last_error = None;
        for _ in 0..5 {
            match self.spawn_worker() {
                Ok(worker) => return Ok(worker),
                Err(e) => {
                    self.logger.warn(&format!("{e}, retrying in {delay:?}"));
                    last_error = Some(e);
                    sleep(delay).await;
                    delay *= 2;
                }
            }
        }
        Err(last_error.unwrap_or_else(|| PoolError::Spawn("unknown".to_string())))
    }

    /// Forks one worker child and wires its stdout into the event loop.
    fn spawn_worker(&mut self) -> Result<WorkerId, PoolError> {
        let mut child = Command::new(&self.program)
            .arg("worker")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| PoolError::Spawn(e.to_string()))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| PoolError::Spawn("worker stdin not piped".to_string()))?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| PoolError::Spawn("worker stdout not piped".to_string()))?;

        let worker = self.next_worker;
        self.next_worker += 1;
        let pid = child.id().unwrap_or_default();

        let events = self.events_tx.clone();
        tokio::spawn(async move {
            loop {
                match read_frame_async(&mut stdout).await {
                    Ok(Some(frame)) => {
                        if events
                            .send(WorkerEvent::Reply { worker, frame })
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                    Ok(None) | Err(_) => {
                        let _ = events.send(WorkerEvent::Exited { worker }).await;
                        return;
                    }
                }
            }
        });

        self.workers.insert(worker, WorkerHandle { pid, stdin, child });
        self.logger.info(&format!("worker {pid} ready"));
        Ok(worker)
    }

    /// Fails every pending callback and kills the children.
    async fn shutdown(mut self) {
        for (_, inflight) in self.busy.drain() {
            let _ = inflight.responder.send(Err(PoolError::Closed));
        }
        for (_, responder) in self.queue.drain(..) {
            let _ = responder.send(Err(PoolError::Closed));
        }
        for (_, handle) in self.workers.drain() {
            let mut child = handle.child;
            let _ = child.kill().await;
        }
        self.logger.info("pool shut down");
    }
}
