//! Wire framing for both transports
//!
//! Reliable stream: `[u32 big-endian length][bincode packet]`, one packet per frame.
//! Datagram: `[u8 packet count][bincode packet]...`, so a datagram needs
//! `1 + MAX_PACKET_SIZE` bytes to carry even a single full-size packet.

use crate::error::{NetError, Result};
use crate::{Packet, MAX_FRAME_SIZE, MAX_PACKET_SIZE};
use tokio::io::{AsyncRead, AsyncReadExt};

const DATAGRAM_HEADER: usize = 1;
const MAX_PACKETS_PER_DATAGRAM: usize = u8::MAX as usize;

pub fn encode_packet(packet: &Packet) -> Result<Vec<u8>> {
    Ok(bincode::serialize(packet)?)
}

pub fn decode_packet(bytes: &[u8]) -> Result<Packet> {
    Ok(bincode::deserialize(bytes)?)
}

/// Encoded size without allocating
pub fn packet_size(packet: &Packet) -> Result<usize> {
    Ok(bincode::serialized_size(packet)? as usize)
}

/// Encodes one length-prefixed frame
pub fn encode_frame(packet: &Packet) -> Result<Vec<u8>> {
    let body = encode_packet(packet)?;
    if body.len() > MAX_FRAME_SIZE {
        return Err(NetError::PacketTooLarge {
            size: body.len(),
            limit: MAX_FRAME_SIZE,
        });
    }
    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Encodes a batch into one contiguous buffer so it can go out in a single write
pub fn encode_frames<'a, I>(packets: I) -> Result<Vec<u8>>
where
    I: IntoIterator<Item = &'a Packet>,
{
    let mut out = Vec::new();
    for packet in packets {
        out.extend_from_slice(&encode_frame(packet)?);
    }
    Ok(out)
}

/// Reads the next frame body. Returns `Ok(None)` on a clean end of stream.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len == 0 || len > MAX_FRAME_SIZE {
        return Err(NetError::MalformedFrame(format!("frame length {}", len)));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(body))
}

/// Packs a batch into as few datagrams as fit under `max_datagram_size`
pub fn encode_datagrams<'a, I>(packets: I, max_datagram_size: usize) -> Result<Vec<Vec<u8>>>
where
    I: IntoIterator<Item = &'a Packet>,
{
    let mut datagrams = Vec::new();
    let mut current: Vec<u8> = vec![0];

    for packet in packets {
        let body = encode_packet(packet)?;
        let limit = MAX_PACKET_SIZE.min(max_datagram_size.saturating_sub(DATAGRAM_HEADER));
        if body.len() > limit {
            return Err(NetError::PacketTooLarge {
                size: body.len(),
                limit,
            });
        }

        let count = current[0] as usize;
        if count == MAX_PACKETS_PER_DATAGRAM || current.len() + body.len() > max_datagram_size {
            datagrams.push(std::mem::replace(&mut current, vec![0]));
        }
        current[0] += 1;
        current.extend_from_slice(&body);
    }

    if current[0] > 0 {
        datagrams.push(current);
    }
    Ok(datagrams)
}

pub fn decode_datagram(bytes: &[u8]) -> Result<Vec<Packet>> {
    let (&count, mut rest) = bytes
        .split_first()
        .ok_or_else(|| NetError::MalformedFrame("empty datagram".into()))?;
    if count == 0 {
        return Err(NetError::MalformedFrame("datagram without packets".into()));
    }

    let mut packets = Vec::with_capacity(count as usize);
    for _ in 0..count {
        packets.push(bincode::deserialize_from(&mut rest)?);
    }
    if !rest.is_empty() {
        return Err(NetError::MalformedFrame(format!(
            "{} trailing bytes in datagram",
            rest.len()
        )));
    }
    Ok(packets)
}
