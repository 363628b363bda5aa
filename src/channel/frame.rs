//! Wire framing between agent and controller
//!
//! ```text
//! tag u8 ('Q' | 'R') | sequence u64 LE | length u32 LE | payload
//! ```

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{CapturedMessage, MessageKind};
use crate::il2cpp::offsets::MAX_ARRAY_BYTES;

pub const HEADER_LEN: usize = 1 + 8 + 4;

/// Largest payload accepted off the wire
pub const MAX_PAYLOAD: usize = MAX_ARRAY_BYTES;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("unknown message tag 0x{0:02x}")]
    UnknownTag(u8),
    #[error("payload of {0} bytes exceeds the frame limit")]
    TooLarge(usize),
    #[error("connection closed mid-frame")]
    Truncated,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub fn encode_header(message: &CapturedMessage) -> Result<[u8; HEADER_LEN], FrameError> {
    let len = message.bytes().len();
    if len > MAX_PAYLOAD {
        return Err(FrameError::TooLarge(len));
    }

    let mut header = [0u8; HEADER_LEN];
    header[0] = message.kind().tag();
    header[1..9].copy_from_slice(&message.sequence().to_le_bytes());
    header[9..13].copy_from_slice(&(len as u32).to_le_bytes());
    Ok(header)
}

pub async fn write_frame<W>(writer: &mut W, message: &CapturedMessage) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let header = encode_header(message)?;
    writer.write_all(&header).await?;
    writer.write_all(message.bytes()).await?;
    Ok(())
}

/// Read one frame; `Ok(None)` on a clean end of stream between frames
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<CapturedMessage>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    let mut filled = 0;
    while filled < HEADER_LEN {
        let n = reader.read(&mut header[filled..]).await?;
        if n == 0 {
            return if filled == 0 { Ok(None) } else { Err(FrameError::Truncated) };
        }
        filled += n;
    }

    let kind = MessageKind::from_tag(header[0]).ok_or(FrameError::UnknownTag(header[0]))?;
    let mut sequence = [0u8; 8];
    sequence.copy_from_slice(&header[1..9]);
    let mut len = [0u8; 4];
    len.copy_from_slice(&header[9..13]);
    let len = u32::from_le_bytes(len) as usize;
    if len > MAX_PAYLOAD {
        return Err(FrameError::TooLarge(len));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await.map_err(|err| match err.kind() {
        std::io::ErrorKind::UnexpectedEof => FrameError::Truncated,
        _ => FrameError::Io(err),
    })?;

    Ok(Some(CapturedMessage::new(kind, u64::from_le_bytes(sequence), payload)))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn encoded(messages: &[CapturedMessage]) -> Vec<u8> {
        let mut buf = Vec::new();
        for message in messages {
            write_frame(&mut buf, message).await.unwrap();
        }
        buf
    }

    #[tokio::test]
    async fn test_frames_back_to_back() {
        let first = CapturedMessage::new(MessageKind::Request, 7, vec![0x81, 0xa1, b'x', 0x05]);
        let second = CapturedMessage::new(MessageKind::Response, 0, vec![0xc0]);
        let buf = encoded(&[first.clone(), second.clone()]).await;
        assert_eq!(buf[0], b'Q');
        assert_eq!(&buf[1..9], &7u64.to_le_bytes());

        let mut reader = buf.as_slice();
        assert_eq!(read_frame(&mut reader).await.unwrap(), Some(first));
        assert_eq!(read_frame(&mut reader).await.unwrap(), Some(second));
        assert_eq!(read_frame(&mut reader).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_unknown_tag() {
        let mut buf = encoded(&[CapturedMessage::new(MessageKind::Request, 1, vec![1])]).await;
        buf[0] = b'X';
        let result = read_frame(&mut buf.as_slice()).await;
        assert!(matches!(result, Err(FrameError::UnknownTag(b'X'))));
    }

    #[tokio::test]
    async fn test_oversized_length_rejected_before_allocating() {
        let mut buf = vec![b'R'];
        buf.extend_from_slice(&0u64.to_le_bytes());
        buf.extend_from_slice(&u32::MAX.to_le_bytes());
        let result = read_frame(&mut buf.as_slice()).await;
        assert!(matches!(result, Err(FrameError::TooLarge(_))));
    }

    #[tokio::test]
    async fn test_truncated_frames() {
        let buf = encoded(&[CapturedMessage::new(MessageKind::Response, 3, vec![1, 2, 3, 4])]).await;

        let result = read_frame(&mut &buf[..5]).await;
        assert!(matches!(result, Err(FrameError::Truncated)));

        let result = read_frame(&mut &buf[..buf.len() - 1]).await;
        assert!(matches!(result, Err(FrameError::Truncated)));
    }
}
