//! AXI-stream character-device transport.
//!
//! Start-of-frame and error conditions ride in sideband "user" bits instead
//! of in-band framing, and a dest byte replaces the lane/VC pair for
//! routing. The wire word layout otherwise matches the packet-lane
//! transport.

use std::{io, sync::Mutex};

use async_trait::async_trait;

use crate::{
    codec::{self, FrameError, WCodec, WireCodec},
    dest::{Destination, RxFrame, TransportError, TxFrame, TxPayload, TxResult, max_register_words},
    protocol::{DataSourceSet, SourceKey, WORD_BYTES, Word},
};

/// First-user bit marking start of frame.
const SOF: u8 = 0x2;

/// Sideband metadata attached to every AXI-stream frame.
#[derive(Debug, Clone, Copy, Default)]
pub struct AxisMeta {
    pub first_user: u8,
    /// Non-zero signals an in-band error condition on the closing beat.
    pub last_user: u8,
    pub dest: u8,
}

/// Low-level AXI-stream DMA port.
///
/// `recv` is non-blocking: `Ok(None)` means no frame is pending.
pub trait AxisPort: Send + Sync {
    fn open(&self, max_frame: usize) -> io::Result<()>;
    fn close(&self);
    fn send(&self, words: &[Word], meta: AxisMeta) -> io::Result<usize>;
    fn recv(&self, max_words: usize) -> io::Result<Option<(Vec<Word>, AxisMeta)>>;
}

pub struct AxisDest<P> {
    port: P,
    sources: DataSourceSet,
    state: Mutex<Option<usize>>,
}

impl<P: AxisPort> AxisDest<P> {
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

    fn max_frame(&self) -> Result<usize, TransportError> {
        self.state
            .lock()
            .expect("axis state lock")
            .ok_or(TransportError::NotOpen)
    }
}

#[async_trait]
impl<P: AxisPort> Destination for AxisDest<P> {
    fn data_sources(&self) -> &DataSourceSet {
        &self.sources
    }

    async fn open(&self, index: u32, max_frame: usize) -> Result<(), TransportError> {
        self.port.open(max_frame)?;
        tracing::debug!(index, max_frame, "axis destination open");
        *self.state.lock().expect("axis state lock") = Some(max_frame);
        Ok(())
    }

    async fn close(&self) {
        if self.state.lock().expect("axis state lock").take().is_some() {
            self.port.close();
        }
    }

    async fn transmit(&self, frame: TxFrame) -> Result<TxResult, TransportError> {
        let max_frame = self.max_frame()?;
        let kind = frame.kind();
        let dest = frame.routing.dest(kind);

        let codec = WireCodec::new();
        let mut words = Vec::new();
        match frame.payload {
            TxPayload::Register(request) => codec.write(&mut words, &request),
            TxPayload::Command(cmd) => codec.write(&mut words, &cmd),
            TxPayload::Data(payload) => {
                words = codec::bytes_to_words(&payload)?;
            }
        }

        let bytes = words.len() * WORD_BYTES;
        if bytes > max_frame {
            return Err(TransportError::FrameTooLarge {
                got: bytes,
                max: max_frame,
            });
        }

        let meta = AxisMeta {
            first_user: SOF,
            last_user: 0,
            dest,
        };
        let sent = self.port.send(&words, meta)?;
        Ok(TxResult::sent(sent * WORD_BYTES))
    }

    async fn receive(&self) -> Result<Option<RxFrame>, TransportError> {
        let max_frame = self.max_frame()?;

        let Some((words, meta)) = self.port.recv(max_frame / WORD_BYTES)? else {
            return Ok(None);
        };

        if meta.last_user != 0 || words.len() < WireCodec::MIN_REGISTER_FRAME {
            tracing::warn!(
                len = words.len(),
                dest = meta.dest,
                last_user = meta.last_user,
                "discarding bad axis frame"
            );
            return Err(TransportError::Malformed(FrameError::TooShort(words.len())));
        }

        let key = SourceKey::axis(meta.dest);
        if self.sources.is_data_source(key) {
            return Ok(Some(RxFrame::Data {
                source: key,
                payload: codec::words_to_bytes(&words),
            }));
        }

        let reply = WireCodec::new().read_reply(&words, max_register_words(max_frame))?;
        Ok(Some(RxFrame::Register(reply)))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;
    use crate::{codec::RegisterRequest, protocol::Routing};

    #[derive(Default)]
    struct StubPort {
        sent: Mutex<Vec<(Vec<Word>, AxisMeta)>>,
        inbound: Mutex<VecDeque<(Vec<Word>, AxisMeta)>>,
    }

    impl AxisPort for StubPort {
        fn open(&self, _max_frame: usize) -> io::Result<()> {
            Ok(())
        }

        fn close(&self) {}

        fn send(&self, words: &[Word], meta: AxisMeta) -> io::Result<usize> {
            self.sent.lock().unwrap().push((words.to_vec(), meta));
            Ok(words.len())
        }

        fn recv(&self, _max_words: usize) -> io::Result<Option<(Vec<Word>, AxisMeta)>> {
            Ok(self.inbound.lock().unwrap().pop_front())
        }
    }

    fn routing() -> Routing {
        Routing::stream(0, 0x10, 0x20, 0x80)
    }

    #[tokio::test]
    async fn write_request_targets_register_dest() {
        let dest = AxisDest::new(StubPort::default(), DataSourceSet::default());
        dest.open(0, 2048).await.unwrap();

        dest.transmit(TxFrame::new(
            TxPayload::Register(RegisterRequest::Write {
                context: 0x7,
                address: 0x100,
                data: vec![0xCAFE],
            }),
            routing(),
        ))
        .await
        .unwrap();

        let sent = dest.port.sent.lock().unwrap();
        let (words, meta) = &sent[0];
        assert_eq!(meta.dest, 0x10);
        assert_eq!(meta.first_user, SOF);
        assert_eq!(words, &vec![0x7, (1 << 30) | (0x100 >> 2), 0xCAFE, 0]);
    }

    #[tokio::test]
    async fn dest_byte_classifies_data() {
        let dest = AxisDest::new(
            StubPort::default(),
            DataSourceSet::new([SourceKey::axis(0x80)]),
        );
        dest.open(0, 2048).await.unwrap();

        dest.port.inbound.lock().unwrap().push_back((
            vec![1, 2, 3, 4],
            AxisMeta {
                dest: 0x80,
                ..Default::default()
            },
        ));

        assert!(matches!(
            dest.receive().await.unwrap().unwrap(),
            RxFrame::Data { .. }
        ));
    }

    #[tokio::test]
    async fn last_user_error_rejects_frame() {
        let dest = AxisDest::new(StubPort::default(), DataSourceSet::default());
        dest.open(0, 2048).await.unwrap();

        dest.port.inbound.lock().unwrap().push_back((
            vec![1, 2, 3, 4],
            AxisMeta {
                last_user: 1,
                ..Default::default()
            },
        ));

        assert!(matches!(
            dest.receive().await.unwrap_err(),
            TransportError::Malformed(_)
        ));
    }
}
