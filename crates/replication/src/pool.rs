use crossbeam_channel::{unbounded, Receiver, Sender};
use engine::{MergeClaim, PartStore};
use part::PartMeta;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use tracing::debug;

/// One merge to compute: the claimed inputs of a store.
pub struct MergeJob {
    pub store: Arc<PartStore>,
    pub claim: MergeClaim,
}

/// A computed merge. The claim is still held.
pub struct MergeDone {
    pub claim: MergeClaim,
    pub result: anyhow::Result<PartMeta>,
}

/// Worker threads computing merges of disjoint part sets in parallel.
///
/// Jobs and results travel over crossbeam channels; workers exit when the
/// pool is dropped.
pub struct MergePool {
    jobs: Option<Sender<(usize, MergeJob)>>,
    done: Receiver<(usize, MergeDone)>,
    workers: Vec<JoinHandle<()>>,
    batch: Mutex<()>,
}

impl MergePool {
    pub fn new(workers: usize) -> std::io::Result<Self> {
        let (job_tx, job_rx) = unbounded::<(usize, MergeJob)>();
        let (done_tx, done_rx) = unbounded();
        let mut handles = Vec::with_capacity(workers.max(1));
        for i in 0..workers.max(1) {
            let jobs = job_rx.clone();
            let done = done_tx.clone();
            let handle = thread::Builder::new()
                .name(format!("merge-{}", i))
                .spawn(move || {
                    for (id, job) in jobs.iter() {
                        let result = job.store.prepare_merge(job.claim.parts());
                        if done.send((id, MergeDone { claim: job.claim, result })).is_err() {
                            break;
                        }
                    }
                })?;
            handles.push(handle);
        }
        Ok(Self {
            jobs: Some(job_tx),
            done: done_rx,
            workers: handles,
            batch: Mutex::new(()),
        })
    }

    #[must_use]
    pub fn workers(&self) -> usize {
        self.workers.len()
    }

    /// Computes every job and returns the results in submission order.
    pub fn run(&self, jobs: Vec<MergeJob>) -> Vec<MergeDone> {
        let _batch = self.batch.lock();
        let total = jobs.len();
        let mut results: Vec<Option<MergeDone>> = (0..total).map(|_| None).collect();
        let mut sent = 0;
        for (id, job) in jobs.into_iter().enumerate() {
            let queued = match &self.jobs {
                Some(tx) => tx.send((id, job)).map_err(|e| e.into_inner().1),
                None => Err(job),
            };
            match queued {
                Ok(()) => sent += 1,
                // No workers left: compute on the caller's thread.
                Err(job) => {
                    let result = job.store.prepare_merge(job.claim.parts());
                    results[id] = Some(MergeDone { claim: job.claim, result });
                }
            }
        }
        for _ in 0..sent {
            match self.done.recv() {
                Ok((id, done)) => results[id] = Some(done),
                Err(_) => break,
            }
        }
        debug!(jobs = total, "merge batch finished");
        results.into_iter().flatten().collect()
    }
}

impl Drop for MergePool {
    fn drop(&mut self) {
        self.jobs.take();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

impl std::fmt::Debug for MergePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MergePool").field("workers", &self.workers.len()).finish()
    }
}
