//! Datagram framing for the UDP transport.
//!
//! Every datagram is prefixed with one network-byte-order header word:
//! bits 31:24 carry the destination tag, bit 23 is the continuation flag.
//! All payload words are network byte order. A logical frame larger than
//! the datagram budget is split across several datagrams with the
//! continuation flag set on all but the last.
//!
//! There is no sequence number: a lost middle fragment is indistinguishable
//! from a truncated final frame. That half-reliability is a property of the
//! transport and is preserved here rather than papered over.

use bytes::{Buf, BufMut, BytesMut};

use crate::{
    codec::FrameError,
    protocol::{DataSourceSet, SourceKey, WORD_BYTES, Word},
};

/// Continuation flag in the datagram header word.
const CONTINUE: Word = 0x0080_0000;

/// Tag byte in the datagram header word.
const TAG_SHIFT: u32 = 24;

/// Smallest acceptable datagram: header word plus two payload words.
const MIN_DATAGRAM: usize = 3 * WORD_BYTES;

/// Default per-datagram budget, matching the device driver's transfer cap.
pub(crate) const MAX_DATAGRAM: usize = 16_000;

pub(crate) const fn header(tag: u8, more: bool) -> Word {
    let mut h = (tag as Word) << TAG_SHIFT;
    if more {
        h |= CONTINUE;
    }
    h
}

/// Splits `words` into one or more wire datagrams under `max_bytes` each.
///
/// The continuation flag is set on every datagram except the final one, so
/// a single-datagram frame carries a clear flag.
pub(crate) fn encode_datagrams(tag: u8, words: &[Word], max_bytes: usize) -> Vec<BytesMut> {
    let budget = (max_bytes / WORD_BYTES).saturating_sub(1).max(1);
    let mut out = Vec::with_capacity(words.len().div_ceil(budget));

    let mut chunks = words.chunks(budget).peekable();
    loop {
        let Some(chunk) = chunks.next() else { break };
        let more = chunks.peek().is_some();

        let mut dgram = BytesMut::with_capacity((chunk.len() + 1) * WORD_BYTES);
        dgram.put_u32(header(tag, more));
        for w in chunk {
            dgram.put_u32(*w);
        }
        out.push(dgram);
    }

    if out.is_empty() {
        let mut dgram = BytesMut::with_capacity(WORD_BYTES);
        dgram.put_u32(header(tag, false));
        out.push(dgram);
    }

    out
}

/// One completed inbound unit from the reassembler.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum UdpFrame {
    /// A fully reassembled bulk-data frame.
    Data { tag: u8, words: Vec<Word> },
    /// A register-class frame. Never spans datagrams.
    Register { words: Vec<Word> },
}

/// Accumulates fragmented data frames at a position cursor.
///
/// The cursor grows while continued data datagrams arrive and resets when a
/// non-continued datagram completes the frame. Register-class datagrams
/// also reset it: an interleaved register reply means whatever partial data
/// frame was in flight is unrecoverable.
#[derive(Debug, Default)]
pub(crate) struct Reassembler {
    cursor: Vec<Word>,
}

impl Reassembler {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Feeds one raw datagram. Returns a completed frame, or `None` while a
    /// fragmented frame is still accumulating.
    pub(crate) fn push(
        &mut self,
        datagram: &[u8],
        sources: &DataSourceSet,
    ) -> Result<Option<UdpFrame>, FrameError> {
        if datagram.len() % WORD_BYTES != 0 {
            return Err(FrameError::NotWordAligned(datagram.len()));
        }
        if datagram.len() < MIN_DATAGRAM {
            return Err(FrameError::TooShort(datagram.len() / WORD_BYTES));
        }

        let mut buf = datagram;
        let header = buf.get_u32();
        let tag = (header >> TAG_SHIFT) as u8;
        let more = header & CONTINUE != 0;

        if sources.is_data_source(SourceKey::udp(tag)) {
            while buf.has_remaining() {
                self.cursor.push(buf.get_u32());
            }
            if more {
                return Ok(None);
            }
            let words = std::mem::take(&mut self.cursor);
            return Ok(Some(UdpFrame::Data { tag, words }));
        }

        // Register-class traffic never fragments; drop any stale partial
        // data frame so the cursor restarts clean.
        self.cursor.clear();

        let mut words = Vec::with_capacity(buf.remaining() / WORD_BYTES);
        while buf.has_remaining() {
            words.push(buf.get_u32());
        }
        Ok(Some(UdpFrame::Register { words }))
    }

    /// True while a partially received data frame is buffered.
    #[cfg(test)]
    pub(crate) fn is_mid_frame(&self) -> bool {
        !self.cursor.is_empty()
    }
}
