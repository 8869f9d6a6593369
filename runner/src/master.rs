use crate::{
    step::{self, Channel, Length, Step, StepError, Transition},
    transport::{Rank, Transport, TransportError, MASTER_RANK},
};
use std::{
    collections::HashMap,
    thread::{self, ThreadId},
};
use thiserror::Error;
use tracing::{debug, error, info, trace};

pub type TaskId = i32;

#[derive(Debug, Error)]
pub enum MasterError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Step(#[from] StepError),
    #[error("The coordinator must run on rank {MASTER_RANK}, not on rank {0}")]
    NotCoordinator(Rank),
    #[error("All transport calls must be made from the thread that initialized the coordinator")]
    WrongThread,
    #[error("Slot {thread} of rank {rank} is not addressable")]
    InvalidSlot { rank: Rank, thread: usize },
    #[error("Slot {thread} of rank {rank} is still running task {task}")]
    SlotBusy {
        rank: Rank,
        thread: usize,
        task: TaskId,
    },
    #[error("Task {0} is already running")]
    DuplicateTask(TaskId),
    #[error("Task {0} is not running")]
    UnknownTask(TaskId),
    #[error("Cannot leave the task execution step with {0} task(s) in flight")]
    TasksInFlight(usize),
}

/// a task as seen by the orchestrator, addressed to one worker thread of one rank
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MpiTask {
    pub id: TaskId,
    pub rank: Rank,
    pub thread: usize,
    pub message: Vec<u8>,
    pub result: Option<Vec<u8>>,
}

impl MpiTask {
    pub fn new(id: TaskId, rank: Rank, thread: usize, message: Vec<u8>) -> Self {
        Self {
            id,
            rank,
            thread,
            message,
            result: None,
        }
    }
}

enum ReceiveState<T: Transport> {
    Length(T::ReceiveRequest),
    Buffer {
        request: T::ReceiveRequest,
        length: usize,
    },
}

/// in-flight transfers of one dispatched task
struct TaskContext<T: Transport> {
    rank: Rank,
    thread: usize,
    length_send: Option<T::SendRequest>,
    buffer_send: Option<T::SendRequest>,
    receive: ReceiveState<T>,
}

/// Dispatches tasks to the worker ranks and collects their results without blocking
///
/// The orchestrator picks the (rank, thread) slot of every task, the coordinator only checks that
/// a slot never carries two tasks at once.
pub struct Coordinator<T: Transport> {
    transport: T,
    cores_per_rank: usize,
    step: Step,
    owner: ThreadId,
    contexts: HashMap<TaskId, TaskContext<T>>,
    busy_slots: HashMap<(Rank, usize), TaskId>,
}

impl<T: Transport> Coordinator<T> {
    /// wait for every worker rank to start, the calling thread becomes the transport owner
    pub fn init(transport: T, cores_per_rank: usize) -> Result<Self, MasterError> {
        step::check_cores(cores_per_rank)?;

        let rank = transport.rank();
        if rank != MASTER_RANK {
            return Err(MasterError::NotCoordinator(rank));
        }

        debug!(
            processor = transport.processor_name(),
            size = transport.size(),
            "waiting for the worker ranks to start"
        );
        transport.barrier()?;

        info!(
            size = transport.size(),
            version = transport.version(),
            "coordinator started"
        );

        Ok(Self {
            transport,
            cores_per_rank,
            step: Step::CommonFilesBroadcast,
            owner: thread::current().id(),
            contexts: HashMap::new(),
            busy_slots: HashMap::new(),
        })
    }

    /// number of ranks, coordinator included
    pub fn cluster_size(&self) -> usize {
        self.transport.size()
    }

    pub fn version(&self) -> String {
        self.transport.version()
    }

    pub fn cores_per_rank(&self) -> usize {
        self.cores_per_rank
    }

    pub fn step(&self) -> Step {
        self.step
    }

    /// number of tasks whose result has not been collected yet
    pub fn running_count(&self) -> usize {
        self.contexts.len()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    fn check_thread(&self) -> Result<(), MasterError> {
        if thread::current().id() == self.owner {
            Ok(())
        } else {
            Err(MasterError::WrongThread)
        }
    }

    /// Abort the whole transport group
    ///
    /// Every worker rank fails with `TransportError::Aborted` instead of waiting for a coordinator
    /// that will not come back.
    pub fn abort(&self) {
        self.transport.abort(-1);
    }

    /// protocol and transport failures are fatal to the cluster
    fn escalate<V>(&self, result: Result<V, MasterError>) -> Result<V, MasterError> {
        result.map_err(|error| {
            error!(error = ?error, "Coordinator failed: {error}");
            self.abort();

            error
        })
    }

    fn ensure_step(&mut self, next: Step) -> Result<(), MasterError> {
        let result = self.switch_step(next);
        self.escalate(result)
    }

    fn switch_step(&mut self, next: Step) -> Result<(), MasterError> {
        let transition = self.step.transition(next)?;

        match transition {
            Transition::Stay => return Ok(()),
            Transition::Broadcast(sentinel) => {
                debug!("switching worker ranks to {next}");

                let mut length = sentinel.to_le_bytes();
                self.transport.broadcast(MASTER_RANK, &mut length)?;
            }
            Transition::DrainSlots(sentinel) => {
                if !self.contexts.is_empty() {
                    return Err(MasterError::TasksInFlight(self.contexts.len()));
                }

                debug!("switching worker threads to {next}");

                let length = sentinel.to_le_bytes();
                for rank in 1..self.transport.size() as Rank {
                    for thread in 0..self.cores_per_rank {
                        self.transport
                            .send(rank, Channel::JobLength.tag(thread), &length)?;
                    }
                }

                self.transport.barrier()?;
            }
        }

        self.step = next;

        Ok(())
    }

    fn check_slot(&self, task: &MpiTask) -> Result<(), MasterError> {
        if task.rank <= MASTER_RANK
            || task.rank as usize >= self.transport.size()
            || task.thread >= self.cores_per_rank
        {
            return Err(MasterError::InvalidSlot {
                rank: task.rank,
                thread: task.thread,
            });
        }

        if self.contexts.contains_key(&task.id) {
            return Err(MasterError::DuplicateTask(task.id));
        }

        match self.busy_slots.get(&(task.rank, task.thread)) {
            Some(running) => Err(MasterError::SlotBusy {
                rank: task.rank,
                thread: task.thread,
                task: *running,
            }),
            None => Ok(()),
        }
    }

    /// Post the length and payload of every task and the receive of its result length
    ///
    /// Never waits for any transfer to complete.
    #[tracing::instrument(level = "debug", skip_all, fields(count = tasks.len()))]
    pub fn start_tasks(&mut self, tasks: &[MpiTask]) -> Result<(), MasterError> {
        self.check_thread()?;
        self.ensure_step(Step::TasksExecution)?;

        for task in tasks {
            self.check_slot(task)?;

            trace!(
                task = task.id,
                rank = task.rank,
                thread = task.thread,
                "starting task"
            );

            let length = Length::encode(task.message.len())?;
            let posted = self.post_task(task, length);
            let context = self.escalate(posted)?;

            self.contexts.insert(task.id, context);
            self.busy_slots.insert((task.rank, task.thread), task.id);
        }

        Ok(())
    }

    fn post_task(&self, task: &MpiTask, length: [u8; 4]) -> Result<TaskContext<T>, MasterError> {
        let length_send = self.transport.immediate_send(
            task.rank,
            Channel::JobLength.tag(task.thread),
            length.to_vec(),
        )?;
        let buffer_send = self.transport.immediate_send(
            task.rank,
            Channel::JobBuffer.tag(task.thread),
            task.message.clone(),
        )?;
        let receive = self
            .transport
            .immediate_receive(task.rank, Channel::ResultLength.tag(task.thread))?;

        Ok(TaskContext {
            rank: task.rank,
            thread: task.thread,
            length_send: Some(length_send),
            buffer_send: Some(buffer_send),
            receive: ReceiveState::Length(receive),
        })
    }

    /// advance the transfers of one task, the result once fully received
    fn poll(transport: &T, context: &mut TaskContext<T>) -> Result<Option<Vec<u8>>, MasterError> {
        match context.receive {
            ReceiveState::Length(ref mut request) => {
                let Some(bytes) = transport.test_receive(request)? else {
                    return Ok(None);
                };
                let length = match Length::decode(&bytes)? {
                    Length::Bytes(length) => length,
                    Length::Switch(step) => return Err(StepError::UnexpectedStep(step).into()),
                };

                // the worker answered, so it consumed both messages of the task
                for request in [context.length_send.take(), context.buffer_send.take()]
                    .into_iter()
                    .flatten()
                {
                    transport.wait_send(request)?;
                }

                let request = transport
                    .immediate_receive(context.rank, Channel::ResultBuffer.tag(context.thread))?;
                context.receive = ReceiveState::Buffer { request, length };

                Ok(None)
            }
            ReceiveState::Buffer {
                ref mut request,
                length,
            } => match transport.test_receive(request)? {
                Some(bytes) if bytes.len() != length => Err(TransportError::LengthMismatch {
                    expected: length,
                    actual: bytes.len(),
                }
                .into()),
                received => Ok(received),
            },
        }
    }

    /// Move every task of `running` whose result has arrived into `completed`
    ///
    /// Unfinished tasks stay in `running` in their original order, also when an error interrupts the
    /// check. An empty `running` list is a no-op that does not touch the transport.
    pub fn check_tasks_completion(
        &mut self,
        running: &mut Vec<MpiTask>,
        completed: &mut Vec<MpiTask>,
    ) -> Result<(), MasterError> {
        self.check_thread()?;

        if running.is_empty() {
            return Ok(());
        }

        let expected = self.step.expect(Step::TasksExecution).map_err(MasterError::from);
        self.escalate(expected)?;

        let mut index = 0;
        while index < running.len() {
            let id = running[index].id;
            let context = self
                .contexts
                .get_mut(&id)
                .ok_or(MasterError::UnknownTask(id))?;

            let polled = Self::poll(&self.transport, context);
            match self.escalate(polled)? {
                Some(result) => {
                    trace!(task = id, bytes = result.len(), "task completed");

                    if let Some(context) = self.contexts.remove(&id) {
                        self.busy_slots.remove(&(context.rank, context.thread));
                    }

                    let mut task = running.remove(index);
                    task.result = Some(result);
                    completed.push(task);
                }
                None => index += 1,
            }
        }

        Ok(())
    }

    /// send a run scoped file chunk to every worker rank and wait until all of them stored it
    #[tracing::instrument(level = "debug", skip_all, fields(bytes = file.len()))]
    pub fn broadcast_common_file(&mut self, file: &[u8]) -> Result<(), MasterError> {
        self.check_thread()?;
        let mut length = Length::encode(file.len())?;
        self.ensure_step(Step::CommonFilesBroadcast)?;

        let broadcast = self.broadcast_chunk(&mut length, file);
        self.escalate(broadcast)
    }

    fn broadcast_chunk(&self, length: &mut [u8; 4], file: &[u8]) -> Result<(), MasterError> {
        self.transport.broadcast(MASTER_RANK, length)?;

        let mut payload = file.to_vec();
        self.transport.broadcast(MASTER_RANK, &mut payload)?;

        self.transport.barrier()?;

        Ok(())
    }

    /// Switch every rank to the shutdown step and finalize the transport
    ///
    /// A coordinator that cannot switch, tasks still in flight included, aborts the transport group.
    pub fn shutdown(mut self) -> Result<(), MasterError> {
        debug!("stopping");

        self.ensure_step(Step::Shutdown)?;
        self.transport.finalize()?;

        debug!("stopped");

        Ok(())
    }
}
