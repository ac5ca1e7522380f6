//! Transport endpoints.
//!
//! A [`Destination`] is one concrete endpoint of a physical link: it frames
//! outbound register/command/data traffic for its medium, and classifies
//! inbound frames as bulk data or register replies using its configured
//! [`DataSourceSet`]. Four variants are provided:
//!
//! - [`MappedDest`]: direct memory-mapped register space, synchronous
//! - [`PacketDest`]: lane/virtual-channel packet transport
//! - [`AxisDest`]: AXI-stream character device with sideband routing
//! - [`UdpDest`]: connectionless datagrams with continuation framing
//!
//! The packet and AXI variants are generic over a small port trait so the
//! actual device driver binding stays outside this crate; tests drive them
//! with in-memory stubs.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::{
    codec::{CommandFrame, FrameError, RegisterReply, RegisterRequest},
    protocol::{DataSourceSet, Routing, SourceKey, TxKind},
};

pub(crate) mod axis;
pub(crate) mod mapped;
pub(crate) mod packet;
pub(crate) mod set;
pub(crate) mod udp;

pub use axis::{AxisDest, AxisMeta, AxisPort};
pub use mapped::{MappedDest, Span};
pub use packet::{PacketDest, PacketMeta, PacketPort};
pub use udp::UdpDest;

/// Failures at the OS or device-driver boundary of a destination.
///
/// Transport errors are fatal to the current operation only; the link stays
/// open and the caller may retry. Malformed frames are absorbed by the
/// receive path and surface only through counters.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("destination is not open")]
    NotOpen,

    #[error("frame of {got} bytes exceeds the maximum frame size of {max}")]
    FrameTooLarge { got: usize, max: usize },

    #[error("malformed frame: {0}")]
    Malformed(#[from] FrameError),
}

/// One outbound frame, already resolved to a destination.
#[derive(Debug, Clone)]
pub struct TxFrame {
    pub(crate) payload: TxPayload,
    pub(crate) routing: Routing,
}

impl TxFrame {
    pub(crate) fn new(payload: TxPayload, routing: Routing) -> Self {
        Self { payload, routing }
    }

    pub fn kind(&self) -> TxKind {
        match self.payload {
            TxPayload::Register(RegisterRequest::Read { .. }) => TxKind::RegisterRead,
            TxPayload::Register(RegisterRequest::Write { .. }) => TxKind::RegisterWrite,
            TxPayload::Command(_) => TxKind::Command,
            TxPayload::Data(_) => TxKind::Data,
        }
    }

    pub fn routing(&self) -> Routing {
        self.routing
    }

    pub fn payload(&self) -> &TxPayload {
        &self.payload
    }
}

/// The wire content of an outbound frame.
#[derive(Debug, Clone)]
pub enum TxPayload {
    Register(RegisterRequest),
    Command(CommandFrame),
    Data(Bytes),
}

/// Outcome of a transmit.
///
/// Synchronous destinations complete register traffic inline and return the
/// reply here; framed destinations always return `reply: None` and deliver
/// the response through [`Destination::receive`].
#[derive(Debug)]
pub struct TxResult {
    pub bytes: usize,
    pub reply: Option<RegisterReply>,
}

impl TxResult {
    /// A transmit with no inline reply.
    pub fn sent(bytes: usize) -> Self {
        Self { bytes, reply: None }
    }
}

/// One classified inbound frame.
#[derive(Debug)]
pub enum RxFrame {
    /// Bulk acquisition data from a configured data source.
    Data { source: SourceKey, payload: Bytes },
    /// A register-class frame for the transaction engine.
    Register(RegisterReply),
}

/// One concrete transport endpoint.
///
/// Implementations are driven by the link's pump tasks: the I/O task calls
/// `transmit`, the receive task polls `receive`. Both take `&self`; any
/// per-direction cursor state is interior.
#[async_trait]
pub trait Destination: Send + Sync {
    /// True when register access completes inside `transmit` and the
    /// outbound queue must be bypassed.
    fn is_synchronous(&self) -> bool {
        false
    }

    /// The data-source keys that classify inbound frames as bulk data.
    fn data_sources(&self) -> &DataSourceSet;

    /// Opens the endpoint. `index` is the destination's position in the
    /// link's set, `max_frame` the largest frame in bytes either direction
    /// will carry.
    async fn open(&self, index: u32, max_frame: usize) -> Result<(), TransportError>;

    /// Closes the endpoint. Idempotent.
    async fn close(&self);

    /// Frames and transmits one request. Returns bytes sent, plus the
    /// inline reply on synchronous destinations.
    async fn transmit(&self, frame: TxFrame) -> Result<TxResult, TransportError>;

    /// Polls for one inbound frame. `Ok(None)` means no data is currently
    /// available; malformed frames surface as
    /// [`TransportError::Malformed`].
    async fn receive(&self) -> Result<Option<RxFrame>, TransportError>;
}

/// Largest register payload representable inside `max_frame` bytes: the
/// frame overhead is context, op word and status.
pub(crate) const fn max_register_words(max_frame: usize) -> usize {
    let words = max_frame / crate::protocol::WORD_BYTES;
    words.saturating_sub(3)
}
