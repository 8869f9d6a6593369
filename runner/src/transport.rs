pub mod local;
#[cfg(feature = "distributed")]
pub mod mpi;

use thiserror::Error;

/// process identity within the transport group, 0 is the coordinator
pub type Rank = i32;
/// message tag, see `step::Channel`
pub type Tag = i32;

pub const MASTER_RANK: Rank = 0;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Failed to initialize the transport")]
    Init,
    #[error("Transport group aborted with code {0}")]
    Aborted(i32),
    #[error("Rank {0} is not part of the transport group")]
    InvalidRank(Rank),
    #[error("Broadcast length mismatch (expected {expected}, got {actual})")]
    BroadcastMismatch { expected: usize, actual: usize },
    #[error("Received {actual} bytes where {expected} were announced")]
    LengthMismatch { expected: usize, actual: usize },
}

/// Point-to-point and collective primitives used by the coordinator and the workers
///
/// All calls of one rank must come from the single thread owning the transport. Non-blocking
/// operations hand out request handles that must be driven to completion with the matching
/// `test_*`/`wait_*` call.
pub trait Transport {
    type SendRequest;
    type ReceiveRequest;

    fn rank(&self) -> Rank;
    fn size(&self) -> usize;
    fn version(&self) -> String;
    fn processor_name(&self) -> String;

    /// start sending `buffer`, the request owns the buffer until completion
    fn immediate_send(
        &self,
        dest: Rank,
        tag: Tag,
        buffer: Vec<u8>,
    ) -> Result<Self::SendRequest, TransportError>;

    /// true once the send has completed, never blocks
    fn test_send(&self, request: &mut Self::SendRequest) -> Result<bool, TransportError>;

    /// block until the send has completed and release its resources
    fn wait_send(&self, request: Self::SendRequest) -> Result<(), TransportError>;

    fn immediate_receive(&self, source: Rank, tag: Tag)
        -> Result<Self::ReceiveRequest, TransportError>;

    /// the received message once available, never blocks
    fn test_receive(
        &self,
        request: &mut Self::ReceiveRequest,
    ) -> Result<Option<Vec<u8>>, TransportError>;

    fn send(&self, dest: Rank, tag: Tag, buffer: &[u8]) -> Result<(), TransportError>;

    /// collective: `root` provides `buffer`, every other rank receives into it
    fn broadcast(&self, root: Rank, buffer: &mut [u8]) -> Result<(), TransportError>;

    fn barrier(&self) -> Result<(), TransportError>;

    fn finalize(self) -> Result<(), TransportError>
    where
        Self: Sized;

    /// abort the whole transport group so that no rank hangs in a collective
    fn abort(&self, code: i32);
}
