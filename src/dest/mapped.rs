//! Memory-mapped register space.
//!
//! Register access goes straight through a set of mapped address spans in
//! the calling task; there is no wire, no receive path and no completion
//! latency. The engine observes `is_synchronous()` and bypasses the
//! outbound queue entirely.

use std::sync::Mutex;

use async_trait::async_trait;
use memmap2::MmapMut;

use crate::{
    codec::{RegisterReply, RegisterRequest},
    dest::{Destination, TransportError, TxFrame, TxPayload, TxResult},
    protocol::{DataSourceSet, WORD_BYTES, Word},
};

/// One mappable address span: `base` is the device byte address, `size` the
/// span length in bytes.
#[derive(Debug, Clone, Copy)]
pub struct Span {
    pub base: u32,
    pub size: usize,
}

impl Span {
    pub const fn new(base: u32, size: usize) -> Self {
        Self { base, size }
    }

    const fn contains_word(&self, address: u32) -> bool {
        address >= self.base
            && (address as usize) + WORD_BYTES <= self.base as usize + self.size
    }
}

enum Backing {
    /// Anonymous in-memory spans. Used for bring-up and tests; the original
    /// calls this emulation mode.
    Anonymous,
    /// A device file (`/dev/mem` style) mapped at each span's base offset.
    Device(std::path::PathBuf),
}

pub struct MappedDest {
    spans: Vec<Span>,
    backing: Backing,
    sources: DataSourceSet,
    maps: Mutex<Vec<MmapMut>>,
}

impl MappedDest {
    /// Maps `spans` of a device file. The file offset of each mapping is
    /// the span's base address.
    pub fn device(path: impl Into<std::path::PathBuf>, spans: impl IntoIterator<Item = Span>) -> Self {
        Self {
            spans: spans.into_iter().collect(),
            backing: Backing::Device(path.into()),
            sources: DataSourceSet::default(),
            maps: Mutex::new(Vec::new()),
        }
    }

    /// Backs every span with anonymous zeroed memory instead of a device.
    pub fn anonymous(spans: impl IntoIterator<Item = Span>) -> Self {
        Self {
            spans: spans.into_iter().collect(),
            backing: Backing::Anonymous,
            sources: DataSourceSet::default(),
            maps: Mutex::new(Vec::new()),
        }
    }

    /// Locates the span and in-map byte offset for a word address.
    fn locate(&self, address: u32) -> Option<(usize, usize)> {
        self.spans
            .iter()
            .position(|s| s.contains_word(address))
            .map(|idx| (idx, (address - self.spans[idx].base) as usize))
    }

    /// Reads one word, reporting a fault for unmapped addresses.
    fn read_word(&self, maps: &[MmapMut], address: u32, fault: &mut bool) -> Word {
        match self.locate(address) {
            Some((span, off)) => {
                // SAFETY: locate() guarantees off + WORD_BYTES is inside the
                // mapping, which lives as long as `maps` is borrowed.
                unsafe { (maps[span].as_ptr().add(off) as *const Word).read_volatile() }
            }
            None => {
                *fault = true;
                0
            }
        }
    }

    /// Writes one word, reporting a fault for unmapped addresses.
    fn write_word(&self, maps: &mut [MmapMut], address: u32, value: Word, fault: &mut bool) {
        match self.locate(address) {
            Some((span, off)) => {
                // SAFETY: locate() guarantees off + WORD_BYTES is inside the
                // mapping, which is exclusively borrowed here.
                unsafe { (maps[span].as_mut_ptr().add(off) as *mut Word).write_volatile(value) }
            }
            None => *fault = true,
        }
    }
}

#[async_trait]
impl Destination for MappedDest {
    fn is_synchronous(&self) -> bool {
        true
    }

    fn data_sources(&self) -> &DataSourceSet {
        &self.sources
    }

    async fn open(&self, index: u32, _max_frame: usize) -> Result<(), TransportError> {
        let mut maps = Vec::with_capacity(self.spans.len());
        match &self.backing {
            Backing::Anonymous => {
                for span in &self.spans {
                    maps.push(MmapMut::map_anon(span.size)?);
                }
            }
            Backing::Device(path) => {
                let file = std::fs::OpenOptions::new().read(true).write(true).open(path)?;
                for span in &self.spans {
                    // SAFETY: mapping a device file the caller named for
                    // register access; the mapping is dropped on close().
                    let map = unsafe {
                        memmap2::MmapOptions::new()
                            .offset(span.base as u64)
                            .len(span.size)
                            .map_mut(&file)?
                    };
                    maps.push(map);
                }
            }
        }
        tracing::debug!(index, spans = self.spans.len(), "mapped destination open");
        *self.maps.lock().expect("mapped span lock") = maps;
        Ok(())
    }

    async fn close(&self) {
        self.maps.lock().expect("mapped span lock").clear();
    }

    async fn transmit(&self, frame: TxFrame) -> Result<TxResult, TransportError> {
        let mut maps = self.maps.lock().expect("mapped span lock");
        if maps.is_empty() {
            return Err(TransportError::NotOpen);
        }

        match frame.payload {
            TxPayload::Register(RegisterRequest::Write { context, address, data }) => {
                let mut fault = false;
                for (i, word) in data.iter().enumerate() {
                    self.write_word(&mut maps, address + (i * WORD_BYTES) as u32, *word, &mut fault);
                }
                Ok(TxResult {
                    bytes: data.len() * WORD_BYTES,
                    reply: Some(RegisterReply {
                        context,
                        address,
                        write: true,
                        data,
                        status: fault as u32,
                    }),
                })
            }
            TxPayload::Register(RegisterRequest::Read { context, address, count }) => {
                let mut fault = false;
                let data: Vec<Word> = (0..count)
                    .map(|i| self.read_word(&maps, address + (i * WORD_BYTES) as u32, &mut fault))
                    .collect();
                Ok(TxResult {
                    bytes: count * WORD_BYTES,
                    reply: Some(RegisterReply {
                        context,
                        address,
                        write: false,
                        data,
                        status: fault as u32,
                    }),
                })
            }
            TxPayload::Command(cmd) => {
                // A command strobe writes 1 at the opcode address.
                let mut fault = false;
                self.write_word(&mut maps, cmd.opcode, 1, &mut fault);
                Ok(TxResult::sent(WORD_BYTES))
            }
            // No bulk-data path through mapped space.
            TxPayload::Data(_) => Ok(TxResult::sent(0)),
        }
    }

    async fn receive(&self) -> Result<Option<super::RxFrame>, TransportError> {
        // Register completion is observed inline in transmit().
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Routing;

    fn frame(payload: TxPayload) -> TxFrame {
        TxFrame::new(payload, Routing::default())
    }

    #[tokio::test]
    async fn write_then_read_back() {
        let dest = MappedDest::anonymous([Span::new(0x0, 0x100)]);
        dest.open(0, 2048).await.unwrap();

        let tx = dest
            .transmit(frame(TxPayload::Register(RegisterRequest::Write {
                context: 1,
                address: 0x10,
                data: vec![0xDEAD_BEEF],
            })))
            .await
            .unwrap();
        assert_eq!(tx.reply.as_ref().unwrap().status, 0);

        let rx = dest
            .transmit(frame(TxPayload::Register(RegisterRequest::Read {
                context: 2,
                address: 0x10,
                count: 1,
            })))
            .await
            .unwrap();
        let reply = rx.reply.unwrap();
        assert_eq!(reply.data, vec![0xDEAD_BEEF]);
        assert_eq!(reply.status, 0);
    }

    #[tokio::test]
    async fn unmapped_access_faults() {
        let dest = MappedDest::anonymous([Span::new(0x1000, 0x10)]);
        dest.open(0, 2048).await.unwrap();

        let rx = dest
            .transmit(frame(TxPayload::Register(RegisterRequest::Read {
                context: 0,
                address: 0x2000,
                count: 1,
            })))
            .await
            .unwrap();
        assert_eq!(rx.reply.unwrap().status, 1);

        // A read straddling the end of the span also faults.
        let rx = dest
            .transmit(frame(TxPayload::Register(RegisterRequest::Read {
                context: 0,
                address: 0x100C,
                count: 2,
            })))
            .await
            .unwrap();
        assert_eq!(rx.reply.unwrap().status, 1);
    }

    #[tokio::test]
    async fn closed_destination_rejects_traffic() {
        let dest = MappedDest::anonymous([Span::new(0x0, 0x10)]);
        let err = dest
            .transmit(frame(TxPayload::Register(RegisterRequest::Read {
                context: 0,
                address: 0x0,
                count: 1,
            })))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::NotOpen));
    }

    #[tokio::test]
    async fn receive_reports_no_data() {
        let dest = MappedDest::anonymous([Span::new(0x0, 0x10)]);
        dest.open(0, 2048).await.unwrap();
        assert!(dest.is_synchronous());
        assert!(dest.receive().await.unwrap().is_none());
    }
}
