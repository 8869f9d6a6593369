pub mod context;
mod worker;

use crate::{
    config::SlaveConfig,
    exec::ExecError,
    messages::{self, CommonFile, JobId, MessageError},
    staging::{self, StagingError},
    step::{Channel, Length, Step, StepError},
    transport::{Transport, TransportError, MASTER_RANK},
};
use context::{Inbound, PendingReceive, PendingSend, RankContext, WorkerState};
use std::{
    io,
    sync::Arc,
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};
use thiserror::Error;
use tracing::{debug, error, info, info_span, trace, warn};

/// pause of the multiplexing loop when an iteration made no progress
const IDLE_SLEEP: Duration = Duration::from_millis(10);
/// period of the free space report while idling
const SPACE_REPORT_PERIOD: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Error)]
pub enum SlaveError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Step(#[from] StepError),
    #[error(transparent)]
    Message(#[from] MessageError),
    #[error(transparent)]
    Staging(#[from] StagingError),
    #[error(transparent)]
    Exec(#[from] ExecError),
    #[error("Worker rank must not run on rank {MASTER_RANK}")]
    CoordinatorRank,
    #[error("Abort requested by a worker thread")]
    AbortRequested,
    #[error("Job {0} is unknown on this rank")]
    UnknownJob(JobId),
    #[error("Failed to spawn worker thread {0}")]
    Spawn(usize, #[source] io::Error),
    #[error("Worker thread {0} panicked")]
    WorkerPanicked(usize),
}

enum ReceiveStage<T: Transport> {
    Length(T::ReceiveRequest),
    Buffer(T::ReceiveRequest, usize),
}

/// a task request of a worker thread being received
struct ActiveReceive<T: Transport> {
    pending: PendingReceive,
    stage: ReceiveStage<T>,
}

/// a result of a worker thread being sent
struct ActiveSend<T: Transport> {
    thread: usize,
    done: std::sync::mpsc::SyncSender<()>,
    length: T::SendRequest,
    buffer: T::SendRequest,
}

enum Advance<V> {
    Pending,
    Progressed,
    Done(V),
}

enum Received {
    Task(Vec<u8>),
    Switch(Step),
}

/// Run a worker rank until the coordinator shuts the cluster down
///
/// The calling thread becomes the transport thread of the rank. On failure the whole transport
/// group is aborted so that no other rank stays blocked in a collective.
pub fn run_slave<T: Transport>(transport: T, config: &SlaveConfig) -> Result<(), SlaveError> {
    let span = info_span!("slave", rank = transport.rank());
    let _enter = span.enter();

    match serve(&transport, config) {
        Ok(()) => {
            transport.finalize()?;
            debug!("stopped");

            Ok(())
        }
        Err(error) => {
            error!(error = ?error, "Worker rank failed: {error}");
            transport.abort(-1);

            Err(error)
        }
    }
}

fn serve<T: Transport>(transport: &T, config: &SlaveConfig) -> Result<(), SlaveError> {
    let rank = transport.rank();
    if rank == MASTER_RANK {
        return Err(SlaveError::CoordinatorRank);
    }

    let context = Arc::new(RankContext::new(rank, config));
    let common_dir = staging::common_dir(&context.local_dir, rank);
    staging::recreate_dir(&common_dir)?;

    match staging::space(&context.local_dir) {
        Ok((available, capacity)) => info!(
            processor = transport.processor_name(),
            "started ({}k/{}k available on {})",
            available / 1024,
            capacity / 1024,
            context.local_dir.to_string_lossy()
        ),
        Err(error) => warn!(error = ?error, "Failed to query the free space: {error}"),
    }

    // start synchronization with the coordinator
    transport.barrier()?;

    let mut step = Step::CommonFilesBroadcast;
    while step != Step::Shutdown {
        debug!("switch to {step}");

        let next = match step {
            Step::CommonFilesBroadcast => common_files_step(transport, &common_dir)?,
            Step::TasksExecution => tasks_execution_step(transport, &context)?,
            Step::Shutdown => break,
        };

        if next == step {
            return Err(StepError::UnexpectedStep(next).into());
        }
        step.transition(next)?;
        step = next;
    }

    debug!("switch to {step}");
    staging::remove_dir(&common_dir)?;

    Ok(())
}

/// receive run scoped file chunks until the coordinator announces the next step
fn common_files_step<T: Transport>(
    transport: &T,
    common_dir: &std::path::Path,
) -> Result<Step, SlaveError> {
    loop {
        let mut length = [0u8; 4];
        transport.broadcast(MASTER_RANK, &mut length)?;

        let length = match Length::decode(&length)? {
            Length::Switch(next) => return Ok(next),
            Length::Bytes(length) => length,
        };

        let mut buffer = vec![0u8; length];
        transport.broadcast(MASTER_RANK, &mut buffer)?;

        let common_file: CommonFile = messages::decode(&buffer)?;
        debug!(
            "receiving chunk {} of run scoped file '{}'",
            common_file.chunk, common_file.name
        );

        if let Some(path) = staging::write_common_file_chunk(common_dir, &common_file)? {
            debug!(
                "assembled the {} chunks of run scoped file {}",
                common_file.chunk + 1,
                path.to_string_lossy()
            );
        }

        // unblock the coordinator
        transport.barrier()?;
    }
}

fn spawn_workers(context: &Arc<RankContext>) -> Result<Vec<JoinHandle<()>>, SlaveError> {
    (0..context.cores)
        .map(|thread| {
            let context = context.clone();

            thread::Builder::new()
                .name(format!("worker-{}-{thread}", context.rank))
                .spawn(move || worker::run(context, thread))
                .map_err(|error| SlaveError::Spawn(thread, error))
        })
        .collect()
}

fn tasks_execution_step<T: Transport>(
    transport: &T,
    context: &Arc<RankContext>,
) -> Result<Step, SlaveError> {
    context.reset_workers();

    let workers = match spawn_workers(context) {
        Ok(workers) => workers,
        Err(error) => {
            context.drain_pending();
            return Err(error);
        }
    };

    let next = match multiplex(transport, context) {
        Ok(next) => next,
        Err(error) => {
            // the workers are left detached, the rank is going down
            context.drain_pending();
            return Err(error);
        }
    };

    // coordinator/worker ranks synchronization
    transport.barrier()?;

    for job_id in context.take_initialized_jobs() {
        staging::remove_dir(&staging::job_dir(&context.local_dir, context.rank, job_id))?;
    }

    for (thread, handle) in workers.into_iter().enumerate() {
        handle
            .join()
            .map_err(|_| SlaveError::WorkerPanicked(thread))?;
    }

    next.ok_or(StepError::UnexpectedStep(Step::TasksExecution).into())
}

fn advance_receive<T: Transport>(
    transport: &T,
    active: &mut ActiveReceive<T>,
) -> Result<Advance<Received>, SlaveError> {
    let thread = active.pending.thread;

    match active.stage {
        ReceiveStage::Length(ref mut request) => {
            let Some(bytes) = transport.test_receive(request)? else {
                return Ok(Advance::Pending);
            };

            match Length::decode(&bytes)? {
                Length::Switch(next) => Ok(Advance::Done(Received::Switch(next))),
                Length::Bytes(length) => {
                    let request =
                        transport.immediate_receive(MASTER_RANK, Channel::JobBuffer.tag(thread))?;
                    active.stage = ReceiveStage::Buffer(request, length);

                    Ok(Advance::Progressed)
                }
            }
        }
        ReceiveStage::Buffer(ref mut request, length) => match transport.test_receive(request)? {
            Some(buffer) if buffer.len() != length => Err(TransportError::LengthMismatch {
                expected: length,
                actual: buffer.len(),
            }
            .into()),
            Some(buffer) => Ok(Advance::Done(Received::Task(buffer))),
            None => Ok(Advance::Pending),
        },
    }
}

/// Serve the hand-off queues of the worker threads until all of them stopped
///
/// Returns the step announced by the coordinator through the stop sentinels.
fn multiplex<T: Transport>(
    transport: &T,
    context: &RankContext,
) -> Result<Option<Step>, SlaveError> {
    let mut receives: Vec<ActiveReceive<T>> = Vec::new();
    let mut sends: Vec<ActiveSend<T>> = Vec::new();
    let mut next = None;
    let mut last_report = Instant::now();

    while !context.all_workers_stopped() {
        if context.abort_requested() {
            return Err(SlaveError::AbortRequested);
        }

        let mut progress = false;

        for pending in context.take_receiving() {
            let request =
                transport.immediate_receive(MASTER_RANK, Channel::JobLength.tag(pending.thread))?;
            receives.push(ActiveReceive {
                pending,
                stage: ReceiveStage::Length(request),
            });
            progress = true;
        }

        let mut waiting = Vec::with_capacity(receives.len());
        for mut active in receives.drain(..) {
            match advance_receive(transport, &mut active)? {
                Advance::Pending => waiting.push(active),
                Advance::Progressed => {
                    progress = true;
                    waiting.push(active);
                }
                Advance::Done(received) => {
                    progress = true;

                    let inbound = match received {
                        Received::Task(buffer) => Inbound::Task(buffer),
                        Received::Switch(step) => {
                            // every slot must announce the same step
                            if *next.get_or_insert(step) != step {
                                return Err(StepError::UnexpectedStep(step).into());
                            }
                            trace!(
                                thread = active.pending.thread,
                                "stop requested, switching to {step}"
                            );
                            context.set_worker_state(active.pending.thread, WorkerState::Stopping);

                            Inbound::Stop
                        }
                    };

                    // a worker gone away is noticed through its state
                    let _ = active.pending.reply.send(inbound);
                }
            }
        }
        receives = waiting;

        for PendingSend {
            thread,
            payload,
            done,
        } in context.take_sending()
        {
            trace!(thread, bytes = payload.len(), "sending result");

            let length = Length::encode(payload.len())?;
            sends.push(ActiveSend {
                thread,
                done,
                length: transport.immediate_send(
                    MASTER_RANK,
                    Channel::ResultLength.tag(thread),
                    length.to_vec(),
                )?,
                buffer: transport.immediate_send(
                    MASTER_RANK,
                    Channel::ResultBuffer.tag(thread),
                    payload,
                )?,
            });
            progress = true;
        }

        let mut in_flight = Vec::with_capacity(sends.len());
        for mut active in sends.drain(..) {
            if transport.test_send(&mut active.buffer)? {
                transport.wait_send(active.length)?;
                trace!(thread = active.thread, "result sent");

                let _ = active.done.send(());
                progress = true;
            } else {
                in_flight.push(active);
            }
        }
        sends = in_flight;

        if !progress {
            if last_report.elapsed() >= SPACE_REPORT_PERIOD {
                last_report = Instant::now();
                match staging::space(&context.local_dir) {
                    Ok((available, capacity)) => info!(
                        "{}k/{}k available on {}",
                        available / 1024,
                        capacity / 1024,
                        context.local_dir.to_string_lossy()
                    ),
                    Err(error) => warn!(error = ?error, "Failed to query the free space: {error}"),
                }
            }

            thread::sleep(IDLE_SLEEP);
        }
    }

    // a failing worker thread stops before the loop can see its abort request
    if context.abort_requested() {
        return Err(SlaveError::AbortRequested);
    }

    Ok(next)
}
