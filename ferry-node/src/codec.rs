//! Async stream side of the wire format: one frame in, one frame out.

use ferry_core::wire::{self, FrameDecodeError, FrameEncodeError, LEN_SIZE};
use ferry_core::Message;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The peer closed the stream between frames.
    #[error("end of stream")]
    EndOfStream,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Decode(#[from] FrameDecodeError),
    #[error(transparent)]
    Encode(#[from] FrameEncodeError),
}

/// Read exactly one frame and decode it. A close in the middle of a frame is an I/O error,
/// a close before its first byte is `EndOfStream`.
pub async fn read_message<R>(reader: &mut R) -> Result<Message, CodecError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; LEN_SIZE];
    let n = reader.read(&mut header).await?;
    if n == 0 {
        return Err(CodecError::EndOfStream);
    }
    reader.read_exact(&mut header[n..]).await?;
    let len = wire::body_len(header)?;
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(wire::decode_body(&body)?)
}

/// Encode the whole frame first so a single `write_all` carries it.
pub async fn write_message<W>(writer: &mut W, msg: &Message) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin,
{
    let frame = wire::encode_frame(msg)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_core::{FileResponse, MessageType, RequestId};

    #[tokio::test]
    async fn frames_cross_a_stream() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let req = Message::file_request("peer2", "greet.txt");
        let resp = Message::file_response(
            "peer1",
            "",
            FileResponse::new("greet.txt".into(), b"hello".to_vec(), RequestId::new()),
        );
        write_message(&mut a, &req).await.unwrap();
        write_message(&mut a, &resp).await.unwrap();
        assert_eq!(read_message(&mut b).await.unwrap(), req);
        assert_eq!(read_message(&mut b).await.unwrap(), resp);
    }

    #[tokio::test]
    async fn clean_close_is_end_of_stream() {
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);
        assert!(matches!(
            read_message(&mut b).await,
            Err(CodecError::EndOfStream)
        ));
    }

    #[tokio::test]
    async fn truncated_frame_is_io_error() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let frame = wire::encode_frame(&Message::file_request("", "x")).unwrap();
        a.write_all(&frame[..frame.len() - 3]).await.unwrap();
        drop(a);
        assert!(matches!(read_message(&mut b).await, Err(CodecError::Io(_))));
    }

    #[tokio::test]
    async fn reserved_type_is_decode_error() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&2u32.to_le_bytes()).await.unwrap();
        a.write_all(&[MessageType::Stream.as_u8(), 0]).await.unwrap();
        assert!(matches!(
            read_message(&mut b).await,
            Err(CodecError::Decode(FrameDecodeError::Unregistered(
                MessageType::Stream
            )))
        ));
    }
}
