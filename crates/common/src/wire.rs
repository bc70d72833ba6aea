//! Length-prefixed framing shared by the batch ingest and cache-query
//! protocols: a 4-byte big-endian length followed by the payload. Payload
//! bodies are bounded by [`MAX_LENGTH`]; anything larger is a protocol
//! error, not something to buffer.

use std::io;

use tokio::io::{
    AsyncRead,
    AsyncReadExt,
    AsyncWrite,
    AsyncWriteExt,
};

/// Upper bound on a frame body.
pub const MAX_LENGTH: usize = 1 << 20;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame of {0} bytes exceeds the {MAX_LENGTH} byte maximum")]
    Oversize(usize),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Read one frame. Returns `Ok(None)` on a clean EOF before the length
/// prefix; EOF mid-frame is an I/O error.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<Vec<u8>>, FrameError> {
    let mut len_prefix = [0u8; 4];
    match reader.read_exact(&mut len_prefix).await {
        Ok(_) => {},
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let length = u32::from_be_bytes(len_prefix) as usize;
    if length > MAX_LENGTH {
        return Err(FrameError::Oversize(length));
    }
    let mut body = vec![0u8; length];
    reader.read_exact(&mut body).await?;
    Ok(Some(body))
}

pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    body: &[u8],
) -> Result<(), FrameError> {
    if body.len() > MAX_LENGTH {
        return Err(FrameError::Oversize(body.len()));
    }
    writer.write_all(&(body.len() as u32).to_be_bytes()).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{
        read_frame,
        write_frame,
        FrameError,
        MAX_LENGTH,
    };

    #[tokio::test]
    async fn test_round_trip() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"carbon.agents.a1.cpu").await.unwrap();
        write_frame(&mut buf, b"").await.unwrap();
        let mut reader = buf.as_slice();
        assert_eq!(
            read_frame(&mut reader).await.unwrap().as_deref(),
            Some(b"carbon.agents.a1.cpu".as_slice())
        );
        assert_eq!(read_frame(&mut reader).await.unwrap().as_deref(), Some(b"".as_slice()));
        assert!(read_frame(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversize_length_prefix_rejected() {
        let mut buf = ((MAX_LENGTH + 1) as u32).to_be_bytes().to_vec();
        buf.extend_from_slice(&[0u8; 16]);
        let mut reader = buf.as_slice();
        assert!(matches!(
            read_frame(&mut reader).await,
            Err(FrameError::Oversize(_))
        ));
    }

    #[tokio::test]
    async fn test_truncated_body_is_an_error() {
        let mut buf = 8u32.to_be_bytes().to_vec();
        buf.extend_from_slice(b"abc");
        let mut reader = buf.as_slice();
        assert!(matches!(read_frame(&mut reader).await, Err(FrameError::Io(_))));
    }
}
