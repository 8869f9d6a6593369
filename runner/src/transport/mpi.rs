use super::{Rank, Tag, Transport, TransportError};
use mpi::{
    environment::Universe,
    request::{Request, StaticScope},
    topology::SimpleCommunicator,
    traits::*,
    Threading,
};
use nix::sys::signal::{signal, SigHandler, Signal};
use tracing::{debug, error, warn};

/// MPI backed transport, must be created and used from one single thread
pub struct MpiTransport {
    universe: Universe,
    world: SimpleCommunicator,
}

/// buffer leaked for the lifetime of the underlying non-blocking send
pub struct MpiSendRequest {
    request: Option<Request<'static, [u8], StaticScope>>,
    buffer: *mut [u8],
}

impl MpiSendRequest {
    fn release(&mut self) {
        if self.request.is_none() && !self.buffer.is_null() {
            // SAFETY: the buffer was produced by `Box::leak` in `immediate_send` and MPI no longer
            // references it once the request has completed
            drop(unsafe { Box::from_raw(self.buffer) });
            self.buffer = std::ptr::slice_from_raw_parts_mut(std::ptr::null_mut(), 0);
        }
    }
}

pub struct MpiReceiveRequest {
    source: Rank,
    tag: Tag,
}

impl MpiTransport {
    pub fn initialize() -> Result<Self, TransportError> {
        let (universe, threading) =
            mpi::initialize_with_threading(Threading::Funneled).ok_or(TransportError::Init)?;

        if threading < Threading::Funneled {
            error!(threading = ?threading, "MPI does not provide the funneled threading level");

            return Err(TransportError::Init);
        }

        // OpenMPI installs its own SIGCHLD handler which breaks waiting on child processes
        // SAFETY: restores the default disposition, no handler code is installed
        if let Err(error) = unsafe { signal(Signal::SIGCHLD, SigHandler::SigDfl) } {
            warn!(error = ?error, "Failed to reset the SIGCHLD handler");
        }

        let world = universe.world();

        debug!(rank = world.rank(), size = world.size(), "MPI initialized");

        Ok(Self { universe, world })
    }
}

impl Transport for MpiTransport {
    type SendRequest = MpiSendRequest;
    type ReceiveRequest = MpiReceiveRequest;

    fn rank(&self) -> Rank {
        self.world.rank()
    }

    fn size(&self) -> usize {
        self.world.size() as usize
    }

    fn version(&self) -> String {
        mpi::environment::library_version().unwrap_or_else(|_| String::from("unknown"))
    }

    fn processor_name(&self) -> String {
        mpi::environment::processor_name().unwrap_or_else(|_| String::from("unknown"))
    }

    fn immediate_send(
        &self,
        dest: Rank,
        tag: Tag,
        buffer: Vec<u8>,
    ) -> Result<Self::SendRequest, TransportError> {
        if dest < 0 || dest >= self.world.size() {
            return Err(TransportError::InvalidRank(dest));
        }

        let leaked: &'static mut [u8] = Box::leak(buffer.into_boxed_slice());
        let pointer: *mut [u8] = leaked;
        // SAFETY: the allocation stays alive until `release` after completion
        let shared: &'static [u8] = unsafe { &*pointer };
        let request = self
            .world
            .process_at_rank(dest)
            .immediate_send_with_tag(StaticScope, shared, tag);

        Ok(MpiSendRequest {
            request: Some(request),
            buffer: pointer,
        })
    }

    fn test_send(&self, request: &mut Self::SendRequest) -> Result<bool, TransportError> {
        match request.request.take() {
            Some(pending) => match pending.test() {
                Ok(_status) => {
                    request.release();
                    Ok(true)
                }
                Err(pending) => {
                    request.request = Some(pending);
                    Ok(false)
                }
            },
            None => Ok(true),
        }
    }

    fn wait_send(&self, mut request: Self::SendRequest) -> Result<(), TransportError> {
        if let Some(pending) = request.request.take() {
            pending.wait();
        }
        request.release();

        Ok(())
    }

    fn immediate_receive(
        &self,
        source: Rank,
        tag: Tag,
    ) -> Result<Self::ReceiveRequest, TransportError> {
        if source < 0 || source >= self.world.size() {
            return Err(TransportError::InvalidRank(source));
        }

        Ok(MpiReceiveRequest { source, tag })
    }

    fn test_receive(
        &self,
        request: &mut Self::ReceiveRequest,
    ) -> Result<Option<Vec<u8>>, TransportError> {
        let process = self.world.process_at_rank(request.source);

        Ok(process
            .immediate_matched_probe_with_tag(request.tag)
            .map(|(message, _status)| message.matched_receive_vec::<u8>().0))
    }

    fn send(&self, dest: Rank, tag: Tag, buffer: &[u8]) -> Result<(), TransportError> {
        if dest < 0 || dest >= self.world.size() {
            return Err(TransportError::InvalidRank(dest));
        }

        self.world.process_at_rank(dest).send_with_tag(buffer, tag);

        Ok(())
    }

    fn broadcast(&self, root: Rank, buffer: &mut [u8]) -> Result<(), TransportError> {
        self.world.process_at_rank(root).broadcast_into(buffer);

        Ok(())
    }

    fn barrier(&self) -> Result<(), TransportError> {
        self.world.barrier();

        Ok(())
    }

    fn finalize(self) -> Result<(), TransportError> {
        // MPI_Finalize is called when the universe is dropped
        let Self { universe, world } = self;
        drop(world);
        drop(universe);

        Ok(())
    }

    fn abort(&self, code: i32) {
        error!(rank = self.world.rank(), code, "Aborting the MPI job");

        self.world.abort(code)
    }
}
