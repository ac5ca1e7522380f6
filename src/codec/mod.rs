//! Word-frame encode/decode shared by every framed transport.
//!
//! The packet-lane and AXI-stream transports exchange the same word layout;
//! UDP wraps it in a datagram header and network byte order (see
//! [`udp`]). Frames that fail a size or capacity sanity check are rejected
//! before any word reaches a register shadow.

use thiserror::Error;

use crate::protocol::{Word, op};

pub(crate) mod udp;

/// Serializes a message into a buffer.
pub(crate) trait WCodec<Message, Buffer> {
    type Output;
    fn write(self, buffer: Buffer, message: Message) -> Self::Output;
}

/// Deserializes a message out of a buffer.
pub(crate) trait RCodec<Message, Buffer> {
    type Error;
    fn read(self, buffer: Buffer) -> Result<Message, Self::Error>;
}

/// Frame-level sanity failures. These discard the offending frame; they
/// never partially apply.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    /// Frame shorter than the fixed header + status layout allows.
    #[error("frame of {0} words is below the minimum frame size")]
    TooShort(usize),

    /// Byte stream length is not a whole number of words.
    #[error("frame of {0} bytes is not word aligned")]
    NotWordAligned(usize),

    /// Register payload exceeds the declared register capacity.
    #[error("register payload of {got} words exceeds capacity of {max}")]
    Oversized { got: usize, max: usize },
}

/// A register request as it appears on the wire.
///
/// Writes carry the shadow data followed by a zero status word; reads are a
/// fixed four-word frame asking for `count` words back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterRequest {
    Read {
        context: u32,
        address: u32,
        count: usize,
    },
    Write {
        context: u32,
        address: u32,
        data: Vec<Word>,
    },
}

impl RegisterRequest {
    /// Words this request occupies once encoded.
    pub fn encoded_len(&self) -> usize {
        match self {
            Self::Read { .. } => 4,
            Self::Write { data, .. } => data.len() + 3,
        }
    }
}

/// A decoded register-class response frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterReply {
    pub context: u32,
    pub address: u32,
    pub write: bool,
    pub data: Vec<Word>,
    pub status: u32,
}

/// A command strobe frame: a fixed four-word frame carrying the opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandFrame {
    pub context: u32,
    pub opcode: u32,
}

/// Reinterprets a word frame as its native-endian byte image.
pub(crate) fn words_to_bytes(words: &[Word]) -> bytes::Bytes {
    let mut buf = bytes::BytesMut::with_capacity(words.len() * crate::protocol::WORD_BYTES);
    for w in words {
        buf.extend_from_slice(&w.to_ne_bytes());
    }
    buf.freeze()
}

/// Reinterprets a native-endian byte image as a word frame.
pub(crate) fn bytes_to_words(bytes: &[u8]) -> Result<Vec<Word>, FrameError> {
    if bytes.len() % crate::protocol::WORD_BYTES != 0 {
        return Err(FrameError::NotWordAligned(bytes.len()));
    }
    Ok(bytes
        .chunks_exact(crate::protocol::WORD_BYTES)
        .map(|c| Word::from_ne_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

#[derive(Clone, Copy)]
pub(crate) struct WireCodec;

impl WireCodec {
    pub(crate) const fn new() -> Self {
        Self
    }

    /// Smallest register-class frame: context, op word, one payload word,
    /// status.
    pub(crate) const MIN_REGISTER_FRAME: usize = 4;
}

impl WCodec<&RegisterRequest, &mut Vec<Word>> for WireCodec {
    type Output = ();

    fn write(self, buffer: &mut Vec<Word>, message: &RegisterRequest) -> Self::Output {
        match message {
            RegisterRequest::Read {
                context,
                address,
                count,
            } => {
                buffer.push(*context);
                buffer.push(op::pack(*address, false));
                buffer.push((count.saturating_sub(1)) as Word);
                buffer.push(0);
            }
            RegisterRequest::Write {
                context,
                address,
                data,
            } => {
                buffer.push(*context);
                buffer.push(op::pack(*address, true));
                buffer.extend_from_slice(data);
                buffer.push(0);
            }
        }
    }
}

impl RCodec<RegisterRequest, &[Word]> for WireCodec {
    type Error = FrameError;

    fn read(self, buffer: &[Word]) -> Result<RegisterRequest, Self::Error> {
        if buffer.len() < Self::MIN_REGISTER_FRAME {
            return Err(FrameError::TooShort(buffer.len()));
        }

        let context = buffer[0];
        let address = op::address(buffer[1]);
        if op::is_write(buffer[1]) {
            // Trailing word is the zero status placeholder.
            Ok(RegisterRequest::Write {
                context,
                address,
                data: buffer[2..buffer.len() - 1].to_vec(),
            })
        } else {
            Ok(RegisterRequest::Read {
                context,
                address,
                count: buffer[2] as usize + 1,
            })
        }
    }
}

impl WCodec<&CommandFrame, &mut Vec<Word>> for WireCodec {
    type Output = ();

    fn write(self, buffer: &mut Vec<Word>, message: &CommandFrame) -> Self::Output {
        buffer.push(message.context);
        buffer.push(message.opcode & 0xFF);
        buffer.push(0);
        buffer.push(0);
    }
}

impl WireCodec {
    /// Decodes a register-class response frame, enforcing the declared
    /// register capacity. `max_words` is the largest payload any register on
    /// this link may carry.
    pub(crate) fn read_reply(self, buffer: &[Word], max_words: usize) -> Result<RegisterReply, FrameError> {
        if buffer.len() < Self::MIN_REGISTER_FRAME {
            return Err(FrameError::TooShort(buffer.len()));
        }

        let payload = buffer.len() - 3;
        if payload > max_words {
            return Err(FrameError::Oversized {
                got: payload,
                max: max_words,
            });
        }

        Ok(RegisterReply {
            context: buffer[0],
            address: op::address(buffer[1]),
            write: op::is_write(buffer[1]),
            data: buffer[2..buffer.len() - 1].to_vec(),
            status: buffer[buffer.len() - 1],
        })
    }
}
