use super::{Rank, Tag, Transport, TransportError};
use parking_lot::{Condvar, Mutex};
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};
use tracing::{error, trace};

/// (destination, source, tag)
type Envelope = (Rank, Rank, Tag);

#[derive(Debug, Default)]
struct State {
    mailboxes: HashMap<Envelope, VecDeque<Vec<u8>>>,
    broadcasts: Vec<VecDeque<Vec<u8>>>,
    barrier_waiting: usize,
    barrier_generation: u64,
    aborted: Option<i32>,
}

#[derive(Debug)]
struct Shared {
    size: usize,
    state: Mutex<State>,
    changed: Condvar,
}

/// In-process transport group, every rank is driven by its own thread
///
/// Sends are eager, messages between a (source, destination, tag) triple are delivered in order.
#[derive(Debug)]
pub struct LocalCluster;

impl LocalCluster {
    /// create `size` connected transports, the one at index `r` has rank `r`
    pub fn new(size: usize) -> Vec<LocalTransport> {
        let shared = Arc::new(Shared {
            size,
            state: Mutex::new(State {
                broadcasts: vec![VecDeque::new(); size],
                ..State::default()
            }),
            changed: Condvar::new(),
        });

        (0..size)
            .map(|rank| LocalTransport {
                rank: rank as Rank,
                shared: shared.clone(),
                calls: AtomicUsize::new(0),
            })
            .collect()
    }
}

#[derive(Debug)]
pub struct LocalTransport {
    rank: Rank,
    shared: Arc<Shared>,
    calls: AtomicUsize,
}

#[derive(Debug)]
pub struct LocalSendRequest {
    completed: bool,
}

#[derive(Debug)]
pub struct LocalReceiveRequest {
    source: Rank,
    tag: Tag,
}

impl LocalTransport {
    /// number of transport primitives this rank has called so far
    pub fn operation_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn count(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }

    fn check_rank(&self, rank: Rank) -> Result<(), TransportError> {
        if rank < 0 || rank as usize >= self.shared.size {
            Err(TransportError::InvalidRank(rank))
        } else {
            Ok(())
        }
    }

    fn check_aborted(state: &State) -> Result<(), TransportError> {
        match state.aborted {
            Some(code) => Err(TransportError::Aborted(code)),
            None => Ok(()),
        }
    }

    fn post(&self, dest: Rank, tag: Tag, buffer: Vec<u8>) -> Result<(), TransportError> {
        self.check_rank(dest)?;

        let mut state = self.shared.state.lock();
        Self::check_aborted(&state)?;

        trace!(source = self.rank, dest, tag, bytes = buffer.len(), "posting message");
        state
            .mailboxes
            .entry((dest, self.rank, tag))
            .or_default()
            .push_back(buffer);

        Ok(())
    }
}

impl Transport for LocalTransport {
    type SendRequest = LocalSendRequest;
    type ReceiveRequest = LocalReceiveRequest;

    fn rank(&self) -> Rank {
        self.rank
    }

    fn size(&self) -> usize {
        self.shared.size
    }

    fn version(&self) -> String {
        format!("local in-process transport {}", env!("CARGO_PKG_VERSION"))
    }

    fn processor_name(&self) -> String {
        nix::unistd::gethostname()
            .map(|hostname| hostname.to_string_lossy().into_owned())
            .unwrap_or_else(|_| String::from("localhost"))
    }

    fn immediate_send(
        &self,
        dest: Rank,
        tag: Tag,
        buffer: Vec<u8>,
    ) -> Result<Self::SendRequest, TransportError> {
        self.count();
        self.post(dest, tag, buffer)?;

        Ok(LocalSendRequest { completed: true })
    }

    fn test_send(&self, request: &mut Self::SendRequest) -> Result<bool, TransportError> {
        self.count();
        Self::check_aborted(&self.shared.state.lock())?;

        Ok(request.completed)
    }

    fn wait_send(&self, _request: Self::SendRequest) -> Result<(), TransportError> {
        self.count();
        Self::check_aborted(&self.shared.state.lock())
    }

    fn immediate_receive(
        &self,
        source: Rank,
        tag: Tag,
    ) -> Result<Self::ReceiveRequest, TransportError> {
        self.count();
        self.check_rank(source)?;

        Ok(LocalReceiveRequest { source, tag })
    }

    fn test_receive(
        &self,
        request: &mut Self::ReceiveRequest,
    ) -> Result<Option<Vec<u8>>, TransportError> {
        self.count();

        let mut state = self.shared.state.lock();
        Self::check_aborted(&state)?;

        Ok(state
            .mailboxes
            .get_mut(&(self.rank, request.source, request.tag))
            .and_then(VecDeque::pop_front))
    }

    fn send(&self, dest: Rank, tag: Tag, buffer: &[u8]) -> Result<(), TransportError> {
        self.count();
        self.post(dest, tag, buffer.to_vec())
    }

    fn broadcast(&self, root: Rank, buffer: &mut [u8]) -> Result<(), TransportError> {
        self.count();
        self.check_rank(root)?;

        let mut state = self.shared.state.lock();
        Self::check_aborted(&state)?;

        if root == self.rank {
            for (rank, queue) in state.broadcasts.iter_mut().enumerate() {
                if rank as Rank != root {
                    queue.push_back(buffer.to_vec());
                }
            }
            self.shared.changed.notify_all();

            return Ok(());
        }

        loop {
            Self::check_aborted(&state)?;

            if let Some(message) = state.broadcasts[self.rank as usize].pop_front() {
                if message.len() != buffer.len() {
                    return Err(TransportError::BroadcastMismatch {
                        expected: buffer.len(),
                        actual: message.len(),
                    });
                }
                buffer.copy_from_slice(&message);

                return Ok(());
            }

            self.shared.changed.wait(&mut state);
        }
    }

    fn barrier(&self) -> Result<(), TransportError> {
        self.count();

        let mut state = self.shared.state.lock();
        Self::check_aborted(&state)?;

        let generation = state.barrier_generation;
        state.barrier_waiting += 1;

        if state.barrier_waiting == self.shared.size {
            state.barrier_waiting = 0;
            state.barrier_generation += 1;
            self.shared.changed.notify_all();

            return Ok(());
        }

        while state.barrier_generation == generation {
            Self::check_aborted(&state)?;
            self.shared.changed.wait(&mut state);
        }

        Ok(())
    }

    fn finalize(self) -> Result<(), TransportError> {
        self.count();
        Self::check_aborted(&self.shared.state.lock())
    }

    fn abort(&self, code: i32) {
        error!(rank = self.rank, code, "Aborting the transport group");

        let mut state = self.shared.state.lock();
        state.aborted.get_or_insert(code);
        self.shared.changed.notify_all();
    }
}
