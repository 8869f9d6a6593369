use crate::{config::SlaveConfig, messages::JobId, transport::Rank};
use parking_lot::{Condvar, Mutex};
use std::{
    collections::{BTreeMap, BTreeSet},
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{sync_channel, SyncSender},
    },
    time::Duration,
};
use tracing::trace;

const JOB_INITIALIZATION_POLL: Duration = Duration::from_millis(100);

/// what the transport thread hands to a worker thread waiting for work
#[derive(Debug, PartialEq, Eq)]
pub enum Inbound {
    Task(Vec<u8>),
    Stop,
}

/// a worker thread waiting for its next task
#[derive(Debug)]
pub struct PendingReceive {
    pub thread: usize,
    pub reply: SyncSender<Inbound>,
}

/// a worker thread waiting for its result to be delivered
#[derive(Debug)]
pub struct PendingSend {
    pub thread: usize,
    pub payload: Vec<u8>,
    pub done: SyncSender<()>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Running,
    /// told to stop, still cleaning up
    Stopping,
    Stopped,
}

/// State shared between the transport thread and the worker threads of one rank
#[derive(Debug)]
pub struct RankContext {
    pub rank: Rank,
    pub cores: usize,
    pub local_dir: PathBuf,
    pub archive_dir: Option<PathBuf>,
    receiving: Mutex<Vec<PendingReceive>>,
    sending: Mutex<Vec<PendingSend>>,
    workers: Mutex<BTreeMap<usize, WorkerState>>,
    initialized_jobs: Mutex<BTreeSet<JobId>>,
    job_initialized: Condvar,
    abort: AtomicBool,
    explode_lock: Mutex<()>,
}

impl RankContext {
    pub fn new(rank: Rank, config: &SlaveConfig) -> Self {
        Self {
            rank,
            cores: config.cores,
            local_dir: config.tmp_dir.clone(),
            archive_dir: config.archive_dir.clone(),
            receiving: Mutex::new(Vec::new()),
            sending: Mutex::new(Vec::new()),
            workers: Mutex::new(BTreeMap::new()),
            initialized_jobs: Mutex::new(BTreeSet::new()),
            job_initialized: Condvar::new(),
            abort: AtomicBool::new(false),
            explode_lock: Mutex::new(()),
        }
    }

    pub fn explode_lock(&self) -> &Mutex<()> {
        &self.explode_lock
    }

    /// every worker thread slot is marked running at the start of a task execution step
    pub fn reset_workers(&self) {
        *self.workers.lock() = (0..self.cores)
            .map(|thread| (thread, WorkerState::Running))
            .collect();
    }

    pub fn set_worker_state(&self, thread: usize, state: WorkerState) {
        trace!(thread, state = ?state, "worker state changed");

        self.workers.lock().insert(thread, state);
    }

    pub fn worker_state(&self, thread: usize) -> Option<WorkerState> {
        self.workers.lock().get(&thread).copied()
    }

    pub fn all_workers_stopped(&self) -> bool {
        self.workers
            .lock()
            .values()
            .all(|state| *state == WorkerState::Stopped)
    }

    pub fn request_abort(&self) {
        self.abort.store(true, Ordering::SeqCst);
        // wake up the threads waiting for a job initialization
        let _jobs = self.initialized_jobs.lock();
        self.job_initialized.notify_all();
    }

    pub fn abort_requested(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }

    /// Block until the transport thread delivers a task or a stop request
    ///
    /// An aborting rank answers with a stop request.
    pub fn request_task(&self, thread: usize) -> Inbound {
        let (reply, inbound) = sync_channel(1);
        {
            let mut receiving = self.receiving.lock();
            if self.abort_requested() {
                return Inbound::Stop;
            }
            receiving.push(PendingReceive { thread, reply });
        }

        inbound.recv().unwrap_or(Inbound::Stop)
    }

    /// block until the transport thread has sent `payload`, false if the rank aborted first
    pub fn deliver_result(&self, thread: usize, payload: Vec<u8>) -> bool {
        let (done, delivered) = sync_channel(1);
        {
            let mut sending = self.sending.lock();
            if self.abort_requested() {
                return false;
            }
            sending.push(PendingSend {
                thread,
                payload,
                done,
            });
        }

        delivered.recv().is_ok()
    }

    pub fn take_receiving(&self) -> Vec<PendingReceive> {
        std::mem::take(&mut *self.receiving.lock())
    }

    pub fn take_sending(&self) -> Vec<PendingSend> {
        std::mem::take(&mut *self.sending.lock())
    }

    /// release every worker thread blocked on a hand-off, to be used once the rank aborts
    pub fn drain_pending(&self) {
        self.request_abort();

        drop(self.take_receiving());
        drop(self.take_sending());
    }

    pub fn mark_job_initialized(&self, job_id: JobId) {
        self.initialized_jobs.lock().insert(job_id);
        self.job_initialized.notify_all();
    }

    /// block until a worker thread initialized `job_id`, false if the rank aborted first
    pub fn wait_job_initialized(&self, job_id: JobId) -> bool {
        let mut jobs = self.initialized_jobs.lock();

        loop {
            if jobs.contains(&job_id) {
                return true;
            }
            if self.abort_requested() {
                return false;
            }

            trace!(job = job_id, "waiting for the job initialization");
            self.job_initialized
                .wait_for(&mut jobs, JOB_INITIALIZATION_POLL);
        }
    }

    pub fn forget_job(&self, job_id: JobId) -> bool {
        self.initialized_jobs.lock().remove(&job_id)
    }

    /// remove and return every initialized job
    pub fn take_initialized_jobs(&self) -> BTreeSet<JobId> {
        std::mem::take(&mut *self.initialized_jobs.lock())
    }
}
