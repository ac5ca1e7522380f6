//! Connectionless UDP transport.
//!
//! Each datagram opens with a header word carrying the destination tag and
//! a continuation bit; payload words are network byte order. Logical frames
//! above the datagram budget are fragmented on transmit and reassembled at
//! a position cursor on receive (see [`crate::codec::udp`]).

use std::{io, sync::Mutex};

use async_trait::async_trait;
use tokio::net::UdpSocket;

use crate::{
    codec::{
        self, WCodec, WireCodec,
        udp::{MAX_DATAGRAM, Reassembler, UdpFrame, encode_datagrams},
    },
    dest::{Destination, RxFrame, TransportError, TxFrame, TxPayload, TxResult, max_register_words},
    protocol::{DataSourceSet, SourceKey, WORD_BYTES},
};

pub struct UdpDest {
    host: String,
    port: u16,
    sources: DataSourceSet,
    /// Per-datagram byte budget; frames above it fragment.
    datagram_budget: usize,
    socket: Mutex<Option<std::sync::Arc<UdpSocket>>>,
    rx: Mutex<RxState>,
}

#[derive(Default)]
struct RxState {
    reassembler: Reassembler,
    buf: Vec<u8>,
    max_frame: usize,
}

impl UdpDest {
    pub fn new(host: impl Into<String>, port: u16, sources: DataSourceSet) -> Self {
        Self {
            host: host.into(),
            port,
            sources,
            datagram_budget: MAX_DATAGRAM,
            socket: Mutex::new(None),
            rx: Mutex::new(RxState::default()),
        }
    }

    /// Overrides the per-datagram byte budget (e.g. to stay under a path
    /// MTU). The budget must hold the header word plus at least one payload
    /// word.
    pub fn with_datagram_budget(mut self, budget: usize) -> Self {
        self.datagram_budget = budget.max(2 * WORD_BYTES);
        self
    }

    fn socket(&self) -> Result<std::sync::Arc<UdpSocket>, TransportError> {
        self.socket
            .lock()
            .expect("udp socket lock")
            .clone()
            .ok_or(TransportError::NotOpen)
    }
}

#[async_trait]
impl Destination for UdpDest {
    fn data_sources(&self) -> &DataSourceSet {
        &self.sources
    }

    async fn open(&self, index: u32, max_frame: usize) -> Result<(), TransportError> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect((self.host.as_str(), self.port)).await?;
        tracing::debug!(index, host = %self.host, port = self.port, "udp destination open");

        let mut rx = self.rx.lock().expect("udp rx lock");
        rx.reassembler = Reassembler::new();
        // Room for a full datagram: budget plus its header word.
        rx.buf = vec![0; max_frame.max(self.datagram_budget) + WORD_BYTES];
        rx.max_frame = max_frame;
        drop(rx);

        *self.socket.lock().expect("udp socket lock") = Some(std::sync::Arc::new(socket));
        Ok(())
    }

    async fn close(&self) {
        self.socket.lock().expect("udp socket lock").take();
    }

    async fn transmit(&self, frame: TxFrame) -> Result<TxResult, TransportError> {
        let socket = self.socket()?;
        let kind = frame.kind();
        let tag = frame.routing.dest(kind);

        let codec = WireCodec::new();
        let mut words = Vec::new();
        match frame.payload {
            TxPayload::Register(request) => codec.write(&mut words, &request),
            TxPayload::Command(cmd) => codec.write(&mut words, &cmd),
            TxPayload::Data(payload) => {
                words = codec::bytes_to_words(&payload)?;
            }
        }

        let mut sent = 0;
        for dgram in encode_datagrams(tag, &words, self.datagram_budget) {
            sent += socket.send(&dgram).await?;
        }
        Ok(TxResult::sent(sent))
    }

    async fn receive(&self) -> Result<Option<RxFrame>, TransportError> {
        let socket = self.socket()?;
        let mut rx = self.rx.lock().expect("udp rx lock");
        let max_frame = rx.max_frame;
        let RxState { reassembler, buf, .. } = &mut *rx;

        let n = match socket.try_recv(buf) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let Some(frame) = reassembler.push(&buf[..n], &self.sources)? else {
            // Mid-frame: more continuation datagrams expected.
            return Ok(None);
        };

        match frame {
            UdpFrame::Data { tag, words } => Ok(Some(RxFrame::Data {
                source: SourceKey::udp(tag),
                payload: codec::words_to_bytes(&words),
            })),
            UdpFrame::Register { words } => {
                let reply = WireCodec::new().read_reply(&words, max_register_words(max_frame))?;
                Ok(Some(RxFrame::Register(reply)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::{codec::RegisterRequest, protocol::Routing};

    /// Binds a peer socket the destination talks to, returning both ends.
    async fn pair(sources: DataSourceSet) -> (UdpDest, UdpSocket) {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = peer.local_addr().unwrap().port();
        let dest = UdpDest::new("127.0.0.1", port, sources);
        dest.open(0, 2048).await.unwrap();
        (dest, peer)
    }

    fn routing() -> Routing {
        Routing::stream(0, 0x00, 0x01, 0x80)
    }

    #[tokio::test]
    async fn read_request_is_network_order() {
        let (dest, peer) = pair(DataSourceSet::default()).await;

        dest.transmit(TxFrame::new(
            TxPayload::Register(RegisterRequest::Read {
                context: 0x11,
                address: 0x40,
                count: 4,
            }),
            routing(),
        ))
        .await
        .unwrap();

        let mut buf = [0u8; 64];
        let n = peer.recv(&mut buf).await.unwrap();
        assert_eq!(n, 20);
        // Header word: tag 0, no continuation.
        assert_eq!(&buf[..4], &[0, 0, 0, 0]);
        // Context then op word, big endian.
        assert_eq!(&buf[4..8], &[0, 0, 0, 0x11]);
        assert_eq!(&buf[8..12], &[0, 0, 0, 0x10]);
    }

    #[tokio::test]
    async fn fragmented_data_is_reassembled() {
        let sources = DataSourceSet::new([SourceKey::udp(0x80)]);
        let (dest, peer) = pair(sources).await;
        let dest_addr = {
            let socket = dest.socket().unwrap();
            std::net::SocketAddr::from(([127, 0, 0, 1], socket.local_addr().unwrap().port()))
        };

        let words: Vec<u32> = (0..32).collect();
        let dgrams = encode_datagrams(0x80, &words, 12 * WORD_BYTES);
        assert!(dgrams.len() >= 2);
        for d in &dgrams {
            peer.send_to(d, dest_addr).await.unwrap();
        }

        // try_recv needs the datagrams to have landed.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let mut got = None;
        for _ in 0..dgrams.len() {
            if let Some(frame) = dest.receive().await.unwrap() {
                got = Some(frame);
            }
        }
        match got.expect("reassembled frame") {
            RxFrame::Data { source, payload } => {
                assert!(source.matches(SourceKey::udp(0x80)));
                assert_eq!(payload, codec::words_to_bytes(&words));
            }
            other => panic!("expected data frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn large_data_transmit_fragments() {
        let sources = DataSourceSet::new([SourceKey::udp(0x80)]);
        let (dest, peer) = pair(sources).await;
        let dest = dest.with_datagram_budget_reopen().await;

        let payload: Vec<u8> = (0..64u8).collect();
        dest.transmit(TxFrame::new(
            TxPayload::Data(Bytes::from(payload)),
            routing(),
        ))
        .await
        .unwrap();

        let mut buf = [0u8; 128];
        let n1 = peer.recv(&mut buf).await.unwrap();
        let first_header = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        assert_eq!(first_header, 0x8080_0000);
        let n2 = peer.recv(&mut buf).await.unwrap();
        let last_header = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        assert_eq!(last_header, 0x8000_0000);
        assert_eq!(n1 + n2, 64 + 8);
    }

    impl UdpDest {
        /// Rebuilds the destination with a tiny datagram budget, reopened
        /// against the same peer.
        async fn with_datagram_budget_reopen(self) -> UdpDest {
            let rebuilt = UdpDest::new(self.host.clone(), self.port, self.sources.clone())
                .with_datagram_budget(10 * WORD_BYTES);
            rebuilt.open(0, 2048).await.unwrap();
            rebuilt
        }
    }

    #[tokio::test]
    async fn no_pending_datagram_reports_no_data() {
        let (dest, _peer) = pair(DataSourceSet::default()).await;
        assert!(dest.receive().await.unwrap().is_none());
    }
}
