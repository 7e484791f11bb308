//! Framing: 4 bytes BE payload_size + 4-byte type tag + type-specific payload.
//! `payload_size` counts the tag and the payload, not the size field itself.

use crate::protocol::{Packet, PacketError, PacketType, TYPE_TAG_LEN};

const LEN_SIZE: usize = 4;

/// Upper bound on `payload_size` for stream frames.
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024; // 16 MiB

/// Largest frame (size field included) that fits one IPv4 UDP datagram.
pub const MAX_DATAGRAM_LEN: usize = 65_507;

/// Smallest valid frame: size field plus type tag, empty payload.
pub const MIN_FRAME_LEN: usize = LEN_SIZE + TYPE_TAG_LEN;

/// Encode a packet into a single frame.
pub fn encode_frame(packet: &Packet) -> Result<Vec<u8>, FrameEncodeError> {
    let payload = packet.payload();
    let size = TYPE_TAG_LEN + payload.len();
    if size > MAX_FRAME_LEN as usize {
        return Err(FrameEncodeError::TooLarge(size));
    }
    let mut out = Vec::with_capacity(LEN_SIZE + size);
    out.extend_from_slice(&(size as u32).to_be_bytes());
    out.extend_from_slice(&packet.packet_type().tag());
    out.extend_from_slice(payload);
    Ok(out)
}

/// Encode a packet for a connectionless send; the whole frame must fit one datagram.
pub fn encode_datagram(packet: &Packet) -> Result<Vec<u8>, FrameEncodeError> {
    let frame = encode_frame(packet)?;
    if frame.len() > MAX_DATAGRAM_LEN {
        return Err(FrameEncodeError::DatagramTooLarge(frame.len()));
    }
    Ok(frame)
}

/// Error encoding a packet into a frame.
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("frame too large ({0} bytes)")]
    TooLarge(usize),
    #[error("frame of {0} bytes does not fit in one datagram")]
    DatagramTooLarge(usize),
}

/// Decode one frame from the front of a stream buffer. Returns the packet and the number
/// of bytes consumed. Returns [`FrameDecodeError::NeedMore`] until the whole frame is buffered.
pub fn decode_frame(bytes: &[u8]) -> Result<(Packet, usize), FrameDecodeError> {
    if bytes.len() < LEN_SIZE {
        return Err(FrameDecodeError::NeedMore);
    }
    let size = read_size(bytes)?;
    if bytes.len() < LEN_SIZE + size {
        return Err(FrameDecodeError::NeedMore);
    }
    let packet = decode_body(&bytes[LEN_SIZE..LEN_SIZE + size])?;
    Ok((packet, LEN_SIZE + size))
}

/// Decode a whole datagram. Bytes past `payload_size` are discarded.
pub fn decode_datagram(bytes: &[u8]) -> Result<Packet, FrameDecodeError> {
    if bytes.len() < MIN_FRAME_LEN {
        return Err(FrameDecodeError::TooShort(bytes.len()));
    }
    let size = read_size(bytes)?;
    let available = bytes.len() - LEN_SIZE;
    if available < size {
        return Err(FrameDecodeError::Truncated {
            expected: size,
            actual: available,
        });
    }
    decode_body(&bytes[LEN_SIZE..LEN_SIZE + size])
}

/// Read and bound-check `payload_size` from the first four bytes.
fn read_size(bytes: &[u8]) -> Result<usize, FrameDecodeError> {
    let size = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    if size > MAX_FRAME_LEN {
        return Err(FrameDecodeError::TooLarge(size));
    }
    let size = size as usize;
    if size < TYPE_TAG_LEN {
        return Err(FrameDecodeError::TooShort(LEN_SIZE + size));
    }
    Ok(size)
}

fn decode_body(body: &[u8]) -> Result<Packet, FrameDecodeError> {
    let (tag, payload) = body.split_at(TYPE_TAG_LEN);
    let kind = PacketType::from_tag(tag)?;
    Ok(Packet::from_parts(kind, payload.to_vec()))
}

/// Error decoding a frame.
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame too short ({0} bytes)")]
    TooShort(usize),
    #[error("truncated frame: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },
    #[error("frame too large ({0} bytes)")]
    TooLarge(u32),
    #[error(transparent)]
    Packet(#[from] PacketError),
}
