//! Fiber packet-lane transport.
//!
//! Frames travel on a (lane, virtual channel) pair selected by the routing
//! word. The device driver binding is abstracted behind [`PacketPort`]; the
//! destination owns framing, sanity checks and data/register
//! classification.

use std::{io, sync::Mutex};

use async_trait::async_trait;

use crate::{
    codec::{self, FrameError, WCodec, WireCodec},
    dest::{Destination, RxFrame, TransportError, TxFrame, TxPayload, TxResult, max_register_words},
    protocol::{DataSourceSet, SourceKey, WORD_BYTES, Word},
};

/// Sideband metadata the driver reports with every received frame.
#[derive(Debug, Clone, Copy, Default)]
pub struct PacketMeta {
    pub lane: u8,
    pub vc: u8,
    /// End-of-frame-error flag.
    pub eof_error: bool,
    pub fifo_error: bool,
    pub length_error: bool,
}

impl PacketMeta {
    fn has_error(&self) -> bool {
        self.eof_error || self.fifo_error || self.length_error
    }
}

/// Low-level lane/VC framed device port.
///
/// `recv` is non-blocking: `Ok(None)` means no frame is pending. Concrete
/// implementations bind a driver character device; tests use in-memory
/// stubs.
pub trait PacketPort: Send + Sync {
    fn open(&self, max_frame: usize) -> io::Result<()>;
    fn close(&self);
    fn send(&self, words: &[Word], lane: u8, vc: u8) -> io::Result<usize>;
    fn recv(&self, max_words: usize) -> io::Result<Option<(Vec<Word>, PacketMeta)>>;
}

pub struct PacketDest<P> {
    port: P,
    sources: DataSourceSet,
    state: Mutex<Option<OpenState>>,
}

#[derive(Clone, Copy)]
struct OpenState {
    index: u32,
    max_frame: usize,
}

impl<P: PacketPort> PacketDest<P> {
    pub fn new(port: P, sources: DataSourceSet) -> Self {
        Self {
            port,
            sources,
            state: Mutex::new(None),
        }
    }

    /// The underlying device port.
    pub fn port(&self) -> &P {
        &self.port
    }

    fn open_state(&self) -> Result<OpenState, TransportError> {
        self.state
            .lock()
            .expect("packet state lock")
            .ok_or(TransportError::NotOpen)
    }
}

#[async_trait]
impl<P: PacketPort> Destination for PacketDest<P> {
    fn data_sources(&self) -> &DataSourceSet {
        &self.sources
    }

    async fn open(&self, index: u32, max_frame: usize) -> Result<(), TransportError> {
        self.port.open(max_frame)?;
        tracing::debug!(index, max_frame, "packet destination open");
        *self.state.lock().expect("packet state lock") = Some(OpenState { index, max_frame });
        Ok(())
    }

    async fn close(&self) {
        if self.state.lock().expect("packet state lock").take().is_some() {
            self.port.close();
        }
    }

    async fn transmit(&self, frame: TxFrame) -> Result<TxResult, TransportError> {
        let state = self.open_state()?;
        let kind = frame.kind();
        let (lane, vc) = frame.routing.lane_vc(kind);

        let codec = WireCodec::new();
        let mut words = Vec::new();
        match frame.payload {
            TxPayload::Register(request) => codec.write(&mut words, &request),
            TxPayload::Command(mut cmd) => {
                // Command strobes carry no context echo on this transport.
                cmd.context = 0;
                codec.write(&mut words, &cmd);
            }
            TxPayload::Data(payload) => {
                words = codec::bytes_to_words(&payload)?;
            }
        }

        let bytes = words.len() * WORD_BYTES;
        if bytes > state.max_frame {
            return Err(TransportError::FrameTooLarge {
                got: bytes,
                max: state.max_frame,
            });
        }

        let sent = self.port.send(&words, lane, vc)?;
        Ok(TxResult::sent(sent * WORD_BYTES))
    }

    async fn receive(&self) -> Result<Option<RxFrame>, TransportError> {
        let state = self.open_state()?;

        let Some((words, meta)) = self.port.recv(state.max_frame / WORD_BYTES)? else {
            return Ok(None);
        };

        if meta.has_error() || words.len() < WireCodec::MIN_REGISTER_FRAME {
            tracing::warn!(
                len = words.len(),
                lane = meta.lane,
                vc = meta.vc,
                eof = meta.eof_error,
                fifo = meta.fifo_error,
                length = meta.length_error,
                "discarding bad packet frame"
            );
            return Err(TransportError::Malformed(FrameError::TooShort(words.len())));
        }

        let key = SourceKey::packet(meta.lane, meta.vc);
        if self.sources.is_data_source(key) {
            return Ok(Some(RxFrame::Data {
                source: key,
                payload: codec::words_to_bytes(&words),
            }));
        }

        let reply = WireCodec::new().read_reply(&words, max_register_words(state.max_frame))?;
        Ok(Some(RxFrame::Register(reply)))
    }
}
