use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, select, unbounded, Receiver, Sender};
use tracing::{debug, warn};

use crate::error::{OtaruError, Result};

/// Something that can flush its pending changes.
pub trait Syncer: Send + Sync {
    fn sync(&self) -> Result<()>;

    /// Label for logs.
    fn name(&self) -> &str {
        "syncer"
    }
}

/// Source of work for idle sync workers.
pub trait SyncCandidatesProvider: Send + Sync {
    /// Up to `limit` syncers that should be flushed now.
    fn find_sync_candidates(&self, limit: usize) -> Vec<Arc<dyn Syncer>>;
}

struct Job {
    syncer: Arc<dyn Syncer>,
    reply: Option<Sender<Result<()>>>,
}

enum Command {
    SyncAll(Vec<Arc<dyn Syncer>>, Sender<Result<()>>),
    Quit,
}

/// Fixed pool of threads flushing dirty entries in the background.
///
/// A producer thread wakes up every grace period, counts idle workers, and
/// asks the provider for that many candidates. Explicit [`SyncWorker::sync_all`]
/// requests take priority over provider candidates.
pub struct SyncWorker {
    cmd_tx: Sender<Command>,
    producer: Option<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
}

impl SyncWorker {
    pub fn new(
        provider: Arc<dyn SyncCandidatesProvider>,
        num_workers: usize,
        grace_period: Duration,
    ) -> Self {
        let num_workers = num_workers.max(1);
        let (cmd_tx, cmd_rx) = unbounded();
        let (job_tx, job_rx) = bounded::<Job>(num_workers);
        let starving: Arc<Vec<AtomicBool>> =
            Arc::new((0..num_workers).map(|_| AtomicBool::new(false)).collect());

        let workers = (0..num_workers)
            .map(|id| {
                let job_rx = job_rx.clone();
                let starving = Arc::clone(&starving);
                std::thread::Builder::new()
                    .name(format!("otaru-sync-{id}"))
                    .spawn(move || worker_main(id, job_rx, &starving))
            })
            .filter_map(|spawned| match spawned {
                Ok(handle) => Some(handle),
                Err(e) => {
                    warn!(error = %e, "failed to spawn sync worker");
                    None
                }
            })
            .collect();

        let producer = std::thread::Builder::new()
            .name("otaru-sync-producer".into())
            .spawn(move || producer_main(provider, cmd_rx, job_tx, &starving, grace_period));
        let producer = match producer {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!(error = %e, "failed to spawn sync producer");
                None
            }
        };

        Self {
            cmd_tx,
            producer,
            workers,
        }
    }

    /// Sync every item on the pool and wait for all of them. Returns the
    /// errors of the items that failed.
    pub fn sync_all(&self, syncers: Vec<Arc<dyn Syncer>>) -> Vec<OtaruError> {
        if syncers.is_empty() {
            return Vec::new();
        }
        let n = syncers.len();
        let (reply_tx, reply_rx) = unbounded();
        if self.producer.is_none() {
            return sync_inline(syncers);
        }
        if let Err(e) = self.cmd_tx.send(Command::SyncAll(syncers, reply_tx)) {
            let Command::SyncAll(syncers, _) = e.into_inner() else {
                return Vec::new();
            };
            return sync_inline(syncers);
        }
        reply_rx
            .iter()
            .take(n)
            .filter_map(|r| r.err())
            .collect()
    }

    /// Finish pending work and stop all threads.
    pub fn quit(&mut self) {
        let Some(producer) = self.producer.take() else {
            return;
        };
        let _ = self.cmd_tx.send(Command::Quit);
        if producer.join().is_err() {
            warn!("sync producer panicked");
        }
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                warn!("sync worker panicked");
            }
        }
        debug!("sync workers stopped");
    }
}

impl Drop for SyncWorker {
    fn drop(&mut self) {
        self.quit();
    }
}

fn sync_inline(syncers: Vec<Arc<dyn Syncer>>) -> Vec<OtaruError> {
    syncers.iter().filter_map(|s| s.sync().err()).collect()
}

fn worker_main(id: usize, job_rx: Receiver<Job>, starving: &[AtomicBool]) {
    starving[id].store(true, Ordering::SeqCst);
    for job in job_rx.iter() {
        starving[id].store(false, Ordering::SeqCst);
        debug!(worker = id, syncer = job.syncer.name(), "syncing");
        let res = job.syncer.sync();
        if let Err(e) = &res {
            warn!(worker = id, syncer = job.syncer.name(), error = %e, "sync failed");
        }
        if let Some(reply) = job.reply {
            let _ = reply.send(res);
        }
        starving[id].store(true, Ordering::SeqCst);
    }
}

fn producer_main(
    provider: Arc<dyn SyncCandidatesProvider>,
    cmd_rx: Receiver<Command>,
    job_tx: Sender<Job>,
    starving: &[AtomicBool],
    grace_period: Duration,
) {
    let mut pending: VecDeque<Job> = VecDeque::new();
    let mut quitting = false;
    loop {
        let timeout = if quitting {
            grace_period.min(Duration::from_millis(5))
        } else {
            grace_period
        };
        select! {
            recv(cmd_rx) -> cmd => match cmd {
                Ok(Command::SyncAll(syncers, reply)) => {
                    pending.extend(syncers.into_iter().map(|syncer| Job {
                        syncer,
                        reply: Some(reply.clone()),
                    }));
                }
                Ok(Command::Quit) | Err(_) => quitting = true,
            },
            default(timeout) => {}
        }

        let nfree = starving.iter().filter(|s| s.load(Ordering::SeqCst)).count();
        if nfree == 0 {
            continue;
        }

        let npop = nfree.min(pending.len());
        let mut dispatched = 0;
        for job in pending.drain(..npop) {
            if job_tx.send(job).is_err() {
                return;
            }
            dispatched += 1;
        }

        if !quitting && nfree > npop {
            let candidates = provider.find_sync_candidates(nfree - npop);
            if !candidates.is_empty() {
                debug!(
                    starving = nfree,
                    pending = npop,
                    candidates = candidates.len(),
                    "dispatching sync candidates"
                );
            }
            for syncer in candidates {
                if job_tx.send(Job { syncer, reply: None }).is_err() {
                    return;
                }
                dispatched += 1;
            }
        }

        if quitting && dispatched == 0 && pending.is_empty() {
            // Dropping job_tx lets the workers drain and exit.
            return;
        }
    }
}
