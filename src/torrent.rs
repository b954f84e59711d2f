//! The swarm scheduler: distributes one [`PieceTask`] per piece across a
//! set of ready peer sessions, retries on failure, and hands verified
//! results to the assembler.
//!
//! A peer-lacks-piece requeue is handled by bounded polling (push the
//! task back, wait a small cooldown, try again) rather than a per-piece
//! wait-list that workers subscribe to: polling is correctness-neutral
//! here since a re-enqueued task is always picked up again by whichever
//! worker next reaches the front of the queue, and it is considerably
//! simpler to reason about than a notification list keyed by piece index.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex, Notify};

use crate::{
    download::{download_piece, PieceResult, PieceTask},
    error::Result,
    peer::PeerSession,
    TorrentDescriptor,
};

/// The engine's cancellation signal: level-triggered, so once signalled
/// it remains signalled. Shared by the scheduler's internal workers and,
/// through [`crate::engine::Engine`], by the caller — cloning and holding
/// onto one before starting a download is how external cancellation is
/// driven.
#[derive(Clone)]
pub struct Cancellation {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl Cancellation {
    pub fn new() -> Self {
        Self { flag: Arc::new(AtomicBool::new(false)), notify: Arc::new(Notify::new()) }
    }

    pub fn signal(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_signalled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Waits until [`Self::signal`] has been called, returning
    /// immediately if it already has. Every suspension point inside a
    /// worker races this so cancellation is interrupting, not polled.
    pub(crate) async fn wait(&self) {
        if self.is_signalled() {
            return;
        }
        self.notify.notified().await;
    }
}

impl Default for Cancellation {
    fn default() -> Self {
        Self::new()
    }
}

/// The bounded task queue: at most `num_pieces` entries at
/// any time, shared by every worker. [`Self::pop`] blocks until a task is
/// available; callers race it against [`Cancellation::wait`] so an empty,
/// permanently-stalled queue can't strand a worker.
struct TaskQueue {
    tasks: Mutex<VecDeque<PieceTask>>,
    notify: Notify,
}

impl TaskQueue {
    fn seeded(tasks: VecDeque<PieceTask>) -> Self {
        Self { tasks: Mutex::new(tasks), notify: Notify::new() }
    }

    async fn pop(&self) -> PieceTask {
        loop {
            if let Some(task) = self.tasks.lock().await.pop_front() {
                return task;
            }
            self.notify.notified().await;
        }
    }

    async fn push_back(&self, task: PieceTask) {
        self.tasks.lock().await.push_back(task);
        self.notify.notify_one();
    }
}

/// Runs the scheduler to completion: spawns one worker per peer session
/// plus a supervisor that tracks piece coverage, and returns a channel of
/// verified results for the assembler.
///
/// `sessions` must each already be past handshake and bitfield exchange;
/// this function takes ownership of them for the duration of the
/// download. `cancellation` is the caller's handle for external
/// cancellation: signalling it at any point causes every worker to stop
/// within one suspension point and the returned channel to close, which
/// the assembler then surfaces as [`crate::error::Error::Incomplete`] if
/// coverage wasn't yet full.
pub(crate) async fn run(
    descriptor: Arc<TorrentDescriptor>,
    sessions: Vec<PeerSession>,
    request_timeout: Duration,
    piece_requeue_cooldown: Duration,
    cancellation: Cancellation,
) -> Result<mpsc::Receiver<PieceResult>> {
    let num_pieces = descriptor.piece_count();
    let mut initial_tasks = VecDeque::with_capacity(num_pieces);
    for index in 0..num_pieces {
        let piece_size = descriptor.piece_size(index)?;
        initial_tasks.push_back(PieceTask {
            index,
            piece_size,
            expected_digest: descriptor.piece_digests[index],
        });
    }

    let queue = Arc::new(TaskQueue::seeded(initial_tasks));
    // workers publish into this internal channel; the supervisor below is
    // the only one that knows when coverage is complete, so it alone
    // decides when to signal cancellation and close the externally
    // visible channel.
    let (internal_tx, internal_rx) = mpsc::channel(num_pieces);
    let (external_tx, external_rx) = mpsc::channel(num_pieces);

    for session in sessions {
        let queue = Arc::clone(&queue);
        let internal_tx = internal_tx.clone();
        let cancellation = cancellation.clone();
        tokio::spawn(worker_loop(
            session,
            queue,
            internal_tx,
            cancellation,
            request_timeout,
            piece_requeue_cooldown,
        ));
    }
    // the scheduler's own sender must be dropped so the internal channel
    // closes once every worker (each holding a clone) has exited.
    drop(internal_tx);

    tokio::spawn(supervise(num_pieces, internal_rx, external_tx, cancellation));

    Ok(external_rx)
}

/// Forwards verified results to the caller-facing channel while tracking
/// piece coverage; signals cancellation as soon as every piece has been
/// seen at least once so workers still blocked on an empty queue wake up
/// and exit instead of waiting for tasks that will never come.
async fn supervise(
    num_pieces: usize,
    mut internal_rx: mpsc::Receiver<PieceResult>,
    external_tx: mpsc::Sender<PieceResult>,
    cancellation: Cancellation,
) {
    let mut covered = HashSet::with_capacity(num_pieces);
    while let Some(result) = internal_rx.recv().await {
        covered.insert(result.index);
        if external_tx.send(result).await.is_err() {
            // the assembler gave up; nothing left to forward to.
            break;
        }
        if covered.len() == num_pieces {
            cancellation.signal();
        }
    }
    // all workers have exited (coverage complete, cancellation from the
    // caller, or every session failed); make sure nothing is left waiting
    // and let the assembler observe channel closure.
    cancellation.signal();
}

async fn worker_loop(
    mut session: PeerSession,
    queue: Arc<TaskQueue>,
    results_tx: mpsc::Sender<PieceResult>,
    cancellation: Cancellation,
    request_timeout: Duration,
    piece_requeue_cooldown: Duration,
) {
    loop {
        let task = tokio::select! {
            biased;
            _ = cancellation.wait() => {
                session.close();
                break;
            }
            task = queue.pop() => task,
        };

        if !session.has_piece(task.index) {
            queue.push_back(task).await;
            // Nothing has read this session's socket yet if it has never
            // had a task to download, so without this the initial
            // bitfield (and any later `have`s) would never be consumed
            // and the session would never become eligible for anything.
            // Pumping one frame (bounded by the cooldown) advances that
            // state; a timeout just means the peer had nothing to say.
            tokio::select! {
                biased;
                _ = cancellation.wait() => {
                    session.close();
                    break;
                }
                frame = tokio::time::timeout(piece_requeue_cooldown, session.recv_frame()) => {
                    match frame {
                        Ok(Ok(Some(_))) => {}
                        Ok(Ok(None)) => {
                            session.close();
                            break;
                        }
                        Ok(Err(err)) => {
                            log::warn!(
                                "Session {} failed while idle: {}",
                                session.addr(),
                                err
                            );
                            session.close();
                            break;
                        }
                        Err(_) => {}
                    }
                }
            }
            continue;
        }

        let outcome = tokio::select! {
            biased;
            _ = cancellation.wait() => None,
            result = download_piece(&mut session, &task, request_timeout) => Some(result),
        };

        match outcome {
            None => {
                // cancelled mid-download: the in-flight request is
                // abandoned, so the task must go back for whoever (if
                // anyone) is still running.
                queue.push_back(task).await;
                session.close();
                break;
            }
            Some(Ok(result)) => {
                if results_tx.send(result).await.is_err() {
                    // the supervisor is gone; nothing left to do.
                    break;
                }
            }
            Some(Err(err)) => {
                log::warn!(
                    "Piece {} failed on peer {}: {}",
                    task.index,
                    session.addr(),
                    err
                );
                queue.push_back(task).await;
                // a session that failed once is unlikely to recover
                // mid-download (transport errors, protocol violations);
                // closing it here lets the worker exit instead of
                // hammering a dead connection.
                session.close();
                break;
            }
        }
    }
}
