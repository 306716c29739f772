//! The framed multiplexing protocol spoken on every tunnel control socket.
//!
//! Every frame is `length(u32 BE) | opcode(u8) | id(u32 BE) | payload`, where `length` counts the
//! whole frame including the 9-byte header. See the module-level docs in `tunnel/mod.rs` for the
//! opcode semantics; this module only knows how to get bytes on and off the wire.

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const HEADER_LEN: u32 = 9;
pub const MAX_FRAME_LEN: u32 = 4096;
/// Largest payload a `Data` frame may carry so the whole frame still fits under `MAX_FRAME_LEN`.
pub const MAX_DATA_PAYLOAD: usize = (MAX_FRAME_LEN - HEADER_LEN) as usize;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame too short: {0} bytes")]
    FrameTooShort(u32),
    #[error("frame too long: {0} bytes")]
    FrameTooLong(u32),
    #[error("unknown opcode: {0}")]
    UnknownOpcode(u8),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Init = 0,
    Open = 1,
    Data = 2,
    Close = 3,
    Getid = 4,
    Keep = 5,
    Start = 6,
    Stop = 7,
}

impl Opcode {
    fn from_u8(v: u8) -> Result<Self, ProtocolError> {
        match v {
            0 => Ok(Opcode::Init),
            1 => Ok(Opcode::Open),
            2 => Ok(Opcode::Data),
            3 => Ok(Opcode::Close),
            4 => Ok(Opcode::Getid),
            5 => Ok(Opcode::Keep),
            6 => Ok(Opcode::Start),
            7 => Ok(Opcode::Stop),
            other => Err(ProtocolError::UnknownOpcode(other)),
        }
    }
}

/// Write one frame as a single contiguous buffer, looping on partial writes.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    w: &mut W,
    op: Opcode,
    id: u32,
    payload: &[u8],
) -> Result<(), ProtocolError> {
    let total = HEADER_LEN + payload.len() as u32;
    let mut buf = BytesMut::with_capacity(total as usize);
    buf.extend_from_slice(&total.to_be_bytes());
    buf.extend_from_slice(&[op as u8]);
    buf.extend_from_slice(&id.to_be_bytes());
    buf.extend_from_slice(payload);

    w.write_all(&buf).await?;
    Ok(())
}

/// Read exactly one frame: 4 bytes of length, then `length - 4` bytes of opcode+id+payload.
///
/// Short reads are fatal, as are lengths outside `[HEADER_LEN, MAX_FRAME_LEN]`.
pub async fn read_frame<R: AsyncRead + Unpin>(
    r: &mut R,
) -> Result<(Opcode, u32, Bytes), ProtocolError> {
    let total = r.read_u32().await?;
    if total < HEADER_LEN {
        return Err(ProtocolError::FrameTooShort(total));
    }
    if total > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLong(total));
    }

    let mut rest = BytesMut::zeroed((total - 4) as usize);
    r.read_exact(&mut rest).await?;

    let op = Opcode::from_u8(rest[0])?;
    let id = u32::from_be_bytes([rest[1], rest[2], rest[3], rest[4]]);
    let payload = rest.freeze().split_off(5);
    Ok((op, id, payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn roundtrip_empty_payload() {
        let (mut a, mut b) = tokio::io::duplex(64);
        tokio::spawn(async move { write_frame(&mut a, Opcode::Keep, 0, &[]).await });

        let (op, id, payload) = read_frame(&mut b).await.unwrap();
        assert_eq!(op, Opcode::Keep);
        assert_eq!(id, 0);
        assert!(payload.is_empty());
    }

    #[tokio::test]
    async fn roundtrip_max_payload() {
        let payload = vec![0xAB; MAX_DATA_PAYLOAD];
        let (mut a, mut b) = tokio::io::duplex(MAX_FRAME_LEN as usize + 16);
        let p = payload.clone();
        tokio::spawn(async move { write_frame(&mut a, Opcode::Data, 42, &p).await });

        let (op, id, got) = read_frame(&mut b).await.unwrap();
        assert_eq!(op, Opcode::Data);
        assert_eq!(id, 42);
        assert_eq!(got, payload);
    }

    #[tokio::test]
    async fn rejects_undersize_length_without_reading_payload() {
        let (mut a, mut b) = tokio::io::duplex(64);
        tokio::spawn(async move {
            a.write_all(&3u32.to_be_bytes()).await.unwrap();
        });

        let err = read_frame(&mut b).await.unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooShort(3)));
    }

    #[tokio::test]
    async fn rejects_oversize_length() {
        let (mut a, mut b) = tokio::io::duplex(64);
        tokio::spawn(async move {
            a.write_all(&5000u32.to_be_bytes()).await.unwrap();
        });

        let err = read_frame(&mut b).await.unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLong(5000)));
    }

    #[tokio::test]
    async fn rejects_unknown_opcode() {
        let (mut a, mut b) = tokio::io::duplex(64);
        tokio::spawn(async move {
            a.write_all(&9u32.to_be_bytes()).await.unwrap();
            a.write_all(&[99]).await.unwrap();
            a.write_all(&0u32.to_be_bytes()).await.unwrap();
        });

        let err = read_frame(&mut b).await.unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownOpcode(99)));
    }
}
