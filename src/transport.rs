//! Wire framing for both transports.
//!
//! The codecs here are plain state machines over byte buffers; the server
//! module owns the sockets and the serial port and feeds them. Keeping the
//! framing synchronous makes split-delivery behavior directly testable,
//! which matters most for RTU where a frame boundary is decided by a length
//! oracle with an idle-timer fallback.

use std::time::Duration;

use bytes::BytesMut;
use crc::{Crc, CRC_16_MODBUS};

use crate::{MAX_RTU_FRAME_SIZE, MAX_TCP_FRAME_SIZE};

const CRC_MODBUS: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// MBAP header size up to and including the length field.
const MBAP_PREFIX_SIZE: usize = 6;

/// Smallest meaningful TCP ADU: MBAP header (7) plus one PDU byte.
const MIN_TCP_ADU_SIZE: usize = 8;

/// Smallest meaningful RTU ADU: address, function code, CRC.
const MIN_RTU_ADU_SIZE: usize = 4;

/// CRC-16/MODBUS over a byte slice (init 0xFFFF, poly 0xA001 reflected).
pub fn crc16(data: &[u8]) -> u16 {
    CRC_MODBUS.checksum(data)
}

/// Parsed MBAP header of a Modbus/TCP ADU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbapHeader {
    pub transaction_id: u16,
    pub protocol_id: u16,
    pub length: u16,
    pub unit_id: u8,
}

impl MbapHeader {
    /// Parse the 7-byte header off the front of an ADU.
    pub fn parse(adu: &[u8]) -> Option<Self> {
        if adu.len() < 7 {
            return None;
        }
        Some(Self {
            transaction_id: u16::from_be_bytes([adu[0], adu[1]]),
            protocol_id: u16::from_be_bytes([adu[2], adu[3]]),
            length: u16::from_be_bytes([adu[4], adu[5]]),
            unit_id: adu[6],
        })
    }
}

/// Per-connection reassembly buffer for Modbus/TCP.
///
/// Bytes are appended as they arrive; complete ADUs are drained one at a
/// time. The MBAP length field alone decides frame boundaries, so pipelined
/// requests in a single segment come out as separate frames.
#[derive(Debug, Default)]
pub struct TcpFrameBuffer {
    buf: BytesMut,
}

impl TcpFrameBuffer {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(MAX_TCP_FRAME_SIZE),
        }
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Writable view for `read_buf`-style appends.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    /// Pop the next complete ADU, or `None` until more bytes arrive.
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        if self.buf.len() < MIN_TCP_ADU_SIZE {
            return None;
        }
        let length = u16::from_be_bytes([self.buf[4], self.buf[5]]) as usize;
        let total = MBAP_PREFIX_SIZE + length;
        if self.buf.len() < total {
            return None;
        }
        let frame = self.buf.split_to(total);
        Some(frame.to_vec())
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

/// Build a Modbus/TCP response ADU around a response PDU, echoing the
/// request's transaction id and unit id.
pub fn build_tcp_response(transaction_id: u16, unit_id: u8, pdu: &[u8]) -> Vec<u8> {
    let mut adu = Vec::with_capacity(7 + pdu.len());
    adu.extend_from_slice(&transaction_id.to_be_bytes());
    adu.extend_from_slice(&0u16.to_be_bytes());
    adu.extend_from_slice(&((pdu.len() + 1) as u16).to_be_bytes());
    adu.push(unit_id);
    adu.extend_from_slice(pdu);
    adu
}

/// Expected RTU frame length for the buffered bytes so far, slave address
/// and CRC included. `None` when more bytes are needed before the length
/// can be predicted.
///
/// Unknown function codes fall back to the 4-byte minimum so the idle timer
/// does not have to fire for garbage traffic.
pub fn expected_frame_length(buf: &[u8]) -> Option<usize> {
    if buf.len() < 2 {
        return None;
    }
    match buf[1] {
        // addr + fc + start(2) + qty/value(2) + crc(2)
        0x01..=0x06 => Some(8),
        // addr + fc + start(2) + qty(2) + byte count(1) + data + crc(2)
        0x0F | 0x10 => {
            if buf.len() >= 7 {
                Some(7 + buf[6] as usize + 2)
            } else {
                None
            }
        }
        // addr + fc + byte count(1) + data + crc(2)
        0x14 | 0x15 => {
            if buf.len() >= 3 {
                Some(3 + buf[2] as usize + 2)
            } else {
                None
            }
        }
        // addr + fc + address(2) + crc(2)
        0xCB | 0xCC => Some(6),
        _ => Some(MIN_RTU_ADU_SIZE),
    }
}

/// Idle interval after which a partially buffered RTU frame is flushed:
/// at least 50 ms, or 35 character times. Far above the standard's 3.5
/// character times to ride out USB-serial latency.
pub fn rtu_idle_interval(baud_rate: u32) -> Duration {
    let char_time_ms = 11_000 / baud_rate.max(1);
    Duration::from_millis(u64::from(char_time_ms.saturating_mul(35)).max(50))
}

/// Byte-stream reassembler for one serial port.
///
/// Feed incoming chunks with [`extend`](Self::extend), then ask
/// [`try_complete`](Self::try_complete) whether the length oracle considers
/// the frame finished. When the port goes quiet instead,
/// [`flush`](Self::flush) hands back whatever accumulated.
#[derive(Debug, Default)]
pub struct RtuFrameAssembler {
    buf: BytesMut,
}

impl RtuFrameAssembler {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(MAX_RTU_FRAME_SIZE),
        }
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Take the frame if the length oracle says it is complete. The buffer
    /// is emptied either way once a frame is taken.
    pub fn try_complete(&mut self) -> Option<Vec<u8>> {
        let expected = expected_frame_length(&self.buf)?;
        if self.buf.len() < expected {
            return None;
        }
        let frame = self.buf[..expected].to_vec();
        self.buf.clear();
        Some(frame)
    }

    /// Idle timer fired: whatever is buffered is the frame.
    pub fn flush(&mut self) -> Option<Vec<u8>> {
        if self.buf.is_empty() {
            return None;
        }
        let frame = self.buf.to_vec();
        self.buf.clear();
        Some(frame)
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

/// Validate an RTU ADU and split it into slave address and PDU.
///
/// Returns `None` for short frames and CRC mismatches; both are dropped
/// silently at the transport per the frame-local error policy.
pub fn parse_rtu_frame(frame: &[u8]) -> Option<(u8, &[u8])> {
    if frame.len() < MIN_RTU_ADU_SIZE {
        return None;
    }
    let payload_len = frame.len() - 2;
    let received = u16::from_le_bytes([frame[payload_len], frame[payload_len + 1]]);
    let computed = crc16(&frame[..payload_len]);
    if received != computed {
        return None;
    }
    Some((frame[0], &frame[1..payload_len]))
}

/// Build an RTU response ADU: slave address, PDU, CRC-16 little-endian.
pub fn build_rtu_response(slave_address: u8, pdu: &[u8]) -> Vec<u8> {
    let mut adu = Vec::with_capacity(1 + pdu.len() + 2);
    adu.push(slave_address);
    adu.extend_from_slice(pdu);
    let crc = crc16(&adu);
    adu.extend_from_slice(&crc.to_le_bytes());
    adu
}
