//! ISO 15765-2 frame codec (classic CAN, normal addressing)
//!
//! Pure functions over frame payloads plus the two small state machines that
//! both sides of a conversation need: a [`Segmenter`] that cuts a payload into
//! first/consecutive frames and a [`Reassembler`] that puts them back together.

use std::time::Duration;

use super::IsoTpError;
use crate::transport::CLASSIC_CAN_MAX_DLC;

/// Largest payload expressible with a 12-bit first-frame length
pub const MAX_PAYLOAD_LEN: usize = 4095;

/// Payload bytes carried by a single frame
pub const SINGLE_FRAME_CAPACITY: usize = 7;

/// Payload bytes carried by a first frame
pub const FIRST_FRAME_CAPACITY: usize = 6;

/// Payload bytes carried by a consecutive frame
pub const CONSECUTIVE_FRAME_CAPACITY: usize = 7;

/// Flow status carried in a flow control frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowStatus {
    ContinueToSend,
    Wait,
    Overflow,
}

/// Decoded protocol control information
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pci<'a> {
    Single {
        data: &'a [u8],
    },
    First {
        total_len: usize,
        data: &'a [u8],
    },
    Consecutive {
        sn: u8,
        data: &'a [u8],
    },
    FlowControl {
        status: FlowStatus,
        block_size: u8,
        st_min: Duration,
    },
}

/// Decode the PCI of a raw frame payload
pub fn decode(frame: &[u8]) -> Result<Pci<'_>, IsoTpError> {
    let first = *frame
        .first()
        .ok_or_else(|| IsoTpError::InvalidFrame("empty frame".to_string()))?;

    match first >> 4 {
        0x0 => {
            let len = (first & 0x0F) as usize;
            if len == 0 || len > SINGLE_FRAME_CAPACITY || frame.len() < 1 + len {
                return Err(IsoTpError::InvalidFrame(format!(
                    "single frame length {} in {}-byte frame",
                    len,
                    frame.len()
                )));
            }
            Ok(Pci::Single {
                data: &frame[1..1 + len],
            })
        }
        0x1 => {
            if frame.len() < 2 {
                return Err(IsoTpError::InvalidFrame("truncated first frame".to_string()));
            }
            let total_len = (((first & 0x0F) as usize) << 8) | frame[1] as usize;
            if total_len <= SINGLE_FRAME_CAPACITY {
                return Err(IsoTpError::InvalidFrame(format!(
                    "first frame announces {} bytes",
                    total_len
                )));
            }
            let end = frame.len().min(2 + FIRST_FRAME_CAPACITY);
            Ok(Pci::First {
                total_len,
                data: &frame[2..end],
            })
        }
        0x2 => Ok(Pci::Consecutive {
            sn: first & 0x0F,
            data: &frame[1..],
        }),
        0x3 => {
            if frame.len() < 3 {
                return Err(IsoTpError::InvalidFrame(
                    "truncated flow control frame".to_string(),
                ));
            }
            let status = match first & 0x0F {
                0 => FlowStatus::ContinueToSend,
                1 => FlowStatus::Wait,
                2 => FlowStatus::Overflow,
                other => {
                    return Err(IsoTpError::InvalidFrame(format!(
                        "reserved flow status {}",
                        other
                    )))
                }
            };
            Ok(Pci::FlowControl {
                status,
                block_size: frame[1],
                st_min: st_min_from_byte(frame[2]),
            })
        }
        other => Err(IsoTpError::InvalidFrame(format!(
            "unknown PCI type 0x{:X}",
            other
        ))),
    }
}

fn pad(mut frame: Vec<u8>, padding: Option<u8>) -> Vec<u8> {
    if let Some(byte) = padding {
        frame.resize(CLASSIC_CAN_MAX_DLC, byte);
    }
    frame
}

/// Build a single frame; `payload` must fit in seven bytes
pub fn single_frame(payload: &[u8], padding: Option<u8>) -> Vec<u8> {
    debug_assert!(!payload.is_empty() && payload.len() <= SINGLE_FRAME_CAPACITY);
    let mut frame = Vec::with_capacity(CLASSIC_CAN_MAX_DLC);
    frame.push(payload.len() as u8);
    frame.extend_from_slice(payload);
    pad(frame, padding)
}

/// Build a first frame announcing `total_len` bytes
pub fn first_frame(total_len: usize, chunk: &[u8], padding: Option<u8>) -> Vec<u8> {
    let mut frame = Vec::with_capacity(CLASSIC_CAN_MAX_DLC);
    frame.push(0x10 | ((total_len >> 8) & 0x0F) as u8);
    frame.push((total_len & 0xFF) as u8);
    frame.extend_from_slice(chunk);
    pad(frame, padding)
}

/// Build a consecutive frame with sequence number `sn` (0..=15)
pub fn consecutive_frame(sn: u8, chunk: &[u8], padding: Option<u8>) -> Vec<u8> {
    let mut frame = Vec::with_capacity(CLASSIC_CAN_MAX_DLC);
    frame.push(0x20 | (sn & 0x0F));
    frame.extend_from_slice(chunk);
    pad(frame, padding)
}

/// Build a flow control frame
pub fn flow_control(
    status: FlowStatus,
    block_size: u8,
    st_min: Duration,
    padding: Option<u8>,
) -> Vec<u8> {
    let fs = match status {
        FlowStatus::ContinueToSend => 0,
        FlowStatus::Wait => 1,
        FlowStatus::Overflow => 2,
    };
    pad(
        vec![0x30 | fs, block_size, st_min_to_byte(st_min)],
        padding,
    )
}

/// Decode an STmin byte (0x00-0x7F ms, 0xF1-0xF9 100-900 us, reserved values
/// are treated as the 127 ms maximum)
pub fn st_min_from_byte(byte: u8) -> Duration {
    match byte {
        0x00..=0x7F => Duration::from_millis(byte as u64),
        0xF1..=0xF9 => Duration::from_micros((byte - 0xF0) as u64 * 100),
        _ => Duration::from_millis(0x7F),
    }
}

/// Encode an STmin duration, rounding to the nearest representable value
pub fn st_min_to_byte(st_min: Duration) -> u8 {
    let micros = st_min.as_micros();
    if micros == 0 {
        0x00
    } else if micros < 1000 {
        0xF0 + ((micros + 99) / 100).min(9) as u8
    } else {
        st_min.as_millis().min(0x7F) as u8
    }
}

/// Cuts one payload into ISO-TP frames
#[derive(Debug)]
pub struct Segmenter<'a> {
    payload: &'a [u8],
    offset: usize,
    sn: u8,
    padding: Option<u8>,
}

impl<'a> Segmenter<'a> {
    pub fn new(payload: &'a [u8], padding: Option<u8>) -> Result<Self, IsoTpError> {
        if payload.is_empty() {
            return Err(IsoTpError::InvalidFrame("empty payload".to_string()));
        }
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(IsoTpError::PayloadTooLarge(payload.len()));
        }
        Ok(Self {
            payload,
            offset: 0,
            sn: 1,
            padding,
        })
    }

    /// Whether the payload fits a single frame
    pub fn is_single(&self) -> bool {
        self.payload.len() <= SINGLE_FRAME_CAPACITY
    }

    /// First frame to put on the bus (single frame or first frame)
    pub fn start(&mut self) -> Vec<u8> {
        if self.is_single() {
            self.offset = self.payload.len();
            return single_frame(self.payload, self.padding);
        }
        self.offset = FIRST_FRAME_CAPACITY;
        first_frame(
            self.payload.len(),
            &self.payload[..FIRST_FRAME_CAPACITY],
            self.padding,
        )
    }

    /// Next consecutive frame, `None` once the payload is exhausted
    pub fn next_consecutive(&mut self) -> Option<Vec<u8>> {
        if self.offset >= self.payload.len() {
            return None;
        }
        let end = (self.offset + CONSECUTIVE_FRAME_CAPACITY).min(self.payload.len());
        let frame = consecutive_frame(self.sn, &self.payload[self.offset..end], self.padding);
        self.offset = end;
        self.sn = (self.sn + 1) & 0x0F;
        Some(frame)
    }

    pub fn is_done(&self) -> bool {
        self.offset >= self.payload.len()
    }
}

/// Progress reported by the [`Reassembler`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RxProgress {
    /// A first frame was accepted; the receiver must answer with flow control
    FlowControlRequired,
    /// A consecutive frame was accepted and more are expected
    InProgress,
    /// A block of `block_size` frames is complete; send the next flow control
    BlockComplete,
    /// Whole payload received
    Complete(Vec<u8>),
}

/// Reassembles one payload at a time from single/first/consecutive frames
#[derive(Debug, Default)]
pub struct Reassembler {
    buffer: Vec<u8>,
    expected_len: usize,
    next_sn: u8,
    block_size: u8,
    in_block: u8,
    receiving: bool,
}

impl Reassembler {
    /// `block_size` is the value this side advertises in its flow control
    /// frames (0 = no further flow control after the first one).
    pub fn new(block_size: u8) -> Self {
        Self {
            block_size,
            ..Default::default()
        }
    }

    pub fn is_receiving(&self) -> bool {
        self.receiving
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
        self.expected_len = 0;
        self.next_sn = 0;
        self.in_block = 0;
        self.receiving = false;
    }

    /// Feed one frame payload. Flow control frames are rejected here; the
    /// sending side handles those.
    pub fn on_frame(&mut self, frame: &[u8]) -> Result<RxProgress, IsoTpError> {
        match decode(frame)? {
            Pci::Single { data } => {
                self.reset();
                Ok(RxProgress::Complete(data.to_vec()))
            }
            Pci::First { total_len, data } => {
                self.reset();
                self.buffer.reserve(total_len);
                self.buffer.extend_from_slice(data);
                self.expected_len = total_len;
                self.next_sn = 1;
                self.receiving = true;
                Ok(RxProgress::FlowControlRequired)
            }
            Pci::Consecutive { sn, data } => {
                if !self.receiving {
                    return Err(IsoTpError::UnexpectedFrame(
                        "consecutive frame without first frame".to_string(),
                    ));
                }
                if sn != self.next_sn {
                    let expected = self.next_sn;
                    self.reset();
                    return Err(IsoTpError::SequenceError { expected, got: sn });
                }
                let remaining = self.expected_len - self.buffer.len();
                self.buffer
                    .extend_from_slice(&data[..data.len().min(remaining)]);
                self.next_sn = (self.next_sn + 1) & 0x0F;

                if self.buffer.len() >= self.expected_len {
                    let payload = std::mem::take(&mut self.buffer);
                    self.reset();
                    return Ok(RxProgress::Complete(payload));
                }

                if self.block_size > 0 {
                    self.in_block += 1;
                    if self.in_block >= self.block_size {
                        self.in_block = 0;
                        return Ok(RxProgress::BlockComplete);
                    }
                }
                Ok(RxProgress::InProgress)
            }
            Pci::FlowControl { .. } => Err(IsoTpError::UnexpectedFrame(
                "flow control while receiving".to_string(),
            )),
        }
    }
}
