//! Framing: length-prefix (4 bytes LE) + tag byte + bincode envelope.

use serde::{Deserialize, Serialize};

use crate::protocol::{FileRequest, FileResponse, Message, MessageType, Payload};

pub const LEN_SIZE: usize = 4;
pub const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024; // 64 MiB

/// Envelope fields as they appear after the tag byte. The payload struct is chosen by the tag.
#[derive(Serialize)]
struct EnvelopeRef<'a, P> {
    from: &'a str,
    from_addr: &'a str,
    payload: &'a P,
}

#[derive(Deserialize)]
struct Envelope<P> {
    from: String,
    from_addr: String,
    payload: P,
}

fn serialize_envelope<P: Serialize>(msg: &Message, payload: &P) -> bincode::Result<Vec<u8>> {
    bincode::serialize(&EnvelopeRef {
        from: &msg.from,
        from_addr: &msg.from_addr,
        payload,
    })
}

/// Encode a message into a single frame: 4 bytes LE length + tag + bincode envelope.
pub fn encode_frame(msg: &Message) -> Result<Vec<u8>, FrameEncodeError> {
    let envelope = match &msg.payload {
        Payload::FileRequest(req) => serialize_envelope(msg, req)?,
        Payload::FileResponse(resp) => serialize_envelope(msg, resp)?,
    };
    let body_len = envelope.len() + 1;
    if body_len > MAX_FRAME_LEN as usize {
        return Err(FrameEncodeError::TooLarge);
    }
    let mut out = Vec::with_capacity(LEN_SIZE + body_len);
    out.extend_from_slice(&(body_len as u32).to_le_bytes());
    out.push(msg.message_type().as_u8());
    out.extend_from_slice(&envelope);
    Ok(out)
}

/// Error encoding a message into a frame (bincode or size limit).
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] bincode::Error),
    #[error("frame too large")]
    TooLarge,
}

/// Body length announced by a frame header. Rejects lengths the decoder would never accept.
pub fn body_len(header: [u8; LEN_SIZE]) -> Result<usize, FrameDecodeError> {
    let len = u32::from_le_bytes(header);
    if len > MAX_FRAME_LEN {
        return Err(FrameDecodeError::TooLarge);
    }
    if len == 0 {
        return Err(FrameDecodeError::Empty);
    }
    Ok(len as usize)
}

/// Decode one frame from the front of `bytes`. Returns the message and the number of bytes consumed.
/// Call with partial buffer; returns error if not enough bytes (caller should try again after more data).
pub fn decode_frame(bytes: &[u8]) -> Result<(Message, usize), FrameDecodeError> {
    if bytes.len() < LEN_SIZE {
        return Err(FrameDecodeError::NeedMore);
    }
    let len = body_len([bytes[0], bytes[1], bytes[2], bytes[3]])?;
    if bytes.len() < LEN_SIZE + len {
        return Err(FrameDecodeError::NeedMore);
    }
    let msg = decode_body(&bytes[LEN_SIZE..LEN_SIZE + len])?;
    Ok((msg, LEN_SIZE + len))
}

/// Decode a frame body (tag + envelope). The tag alone decides the payload variant.
pub fn decode_body(body: &[u8]) -> Result<Message, FrameDecodeError> {
    let (&tag, envelope) = body.split_first().ok_or(FrameDecodeError::Empty)?;
    let msg_type = MessageType::try_from(tag).map_err(FrameDecodeError::UnknownType)?;
    match msg_type {
        MessageType::FileRequest => {
            let env: Envelope<FileRequest> = bincode::deserialize(envelope)?;
            Ok(Message {
                from: env.from,
                from_addr: env.from_addr,
                payload: Payload::FileRequest(env.payload),
            })
        }
        MessageType::FileResponse => {
            let env: Envelope<FileResponse> = bincode::deserialize(envelope)?;
            Ok(Message {
                from: env.from,
                from_addr: env.from_addr,
                payload: Payload::FileResponse(env.payload),
            })
        }
        reserved => Err(FrameDecodeError::Unregistered(reserved)),
    }
}

/// Error decoding a frame.
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame too large")]
    TooLarge,
    #[error("empty frame")]
    Empty,
    #[error("unknown message type {0:#x}")]
    UnknownType(u8),
    #[error("no payload registered for message type {0:?}")]
    Unregistered(MessageType),
    #[error("decode error: {0}")]
    Decode(#[from] bincode::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::RequestId;

    fn sample_request() -> Message {
        Message::file_request("peer2", "greet.txt")
    }

    fn sample_response() -> Message {
        Message::file_response(
            "peer1",
            "localhost:3000",
            FileResponse::new("greet.txt".into(), b"hello".to_vec(), RequestId::new()),
        )
    }

    #[test]
    fn roundtrip_request() {
        let msg = sample_request();
        let frame = encode_frame(&msg).unwrap();
        assert_eq!(frame[LEN_SIZE], MessageType::FileRequest.as_u8());
        let (decoded, n) = decode_frame(&frame).unwrap();
        assert_eq!(n, frame.len());
        assert_eq!(decoded, msg);
    }

    #[test]
    fn roundtrip_response_keeps_reserved_fields() {
        let mut msg = sample_response();
        if let Payload::FileResponse(resp) = &mut msg.payload {
            resp.checksum = Some([7u8; 32]);
            resp.num_chunks = Some(3);
        }
        let frame = encode_frame(&msg).unwrap();
        let (decoded, _) = decode_frame(&frame).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn partial_read_need_more() {
        let frame = encode_frame(&sample_request()).unwrap();
        assert!(matches!(
            decode_frame(&frame[..2]),
            Err(FrameDecodeError::NeedMore)
        ));
        assert!(matches!(
            decode_frame(&frame[..LEN_SIZE + 1]),
            Err(FrameDecodeError::NeedMore)
        ));
    }

    #[test]
    fn multiple_messages() {
        let fa = encode_frame(&sample_request()).unwrap();
        let fb = encode_frame(&sample_response()).unwrap();
        let mut buf = Vec::new();
        buf.extend_from_slice(&fa);
        buf.extend_from_slice(&fb);
        let (m1, n1) = decode_frame(&buf).unwrap();
        assert_eq!(n1, fa.len());
        let (m2, n2) = decode_frame(&buf[n1..]).unwrap();
        assert_eq!(n2, fb.len());
        assert_eq!(m1.message_type(), MessageType::FileRequest);
        assert_eq!(m2.message_type(), MessageType::FileResponse);
    }

    #[test]
    fn unknown_tag_fails() {
        let mut frame = encode_frame(&sample_request()).unwrap();
        frame[LEN_SIZE] = 0x42;
        assert!(matches!(
            decode_frame(&frame),
            Err(FrameDecodeError::UnknownType(0x42))
        ));
    }

    #[test]
    fn reserved_tags_fail() {
        for reserved in [
            MessageType::Stream,
            MessageType::Normal,
            MessageType::ChunkRequest,
            MessageType::ChunkData,
        ] {
            let mut frame = encode_frame(&sample_request()).unwrap();
            frame[LEN_SIZE] = reserved.as_u8();
            match decode_frame(&frame) {
                Err(FrameDecodeError::Unregistered(t)) => assert_eq!(t, reserved),
                other => panic!("{reserved:?} decoded as {other:?}"),
            }
        }
    }

    #[test]
    fn tag_mismatch_is_a_decode_error() {
        // A request body announced as a response must not be guessed into shape.
        let mut frame = encode_frame(&sample_request()).unwrap();
        frame[LEN_SIZE] = MessageType::FileResponse.as_u8();
        assert!(matches!(
            decode_frame(&frame),
            Err(FrameDecodeError::Decode(_))
        ));
    }

    #[test]
    fn oversized_header_rejected() {
        let header = (MAX_FRAME_LEN + 1).to_le_bytes();
        assert!(matches!(body_len(header), Err(FrameDecodeError::TooLarge)));
        assert!(matches!(
            body_len(0u32.to_le_bytes()),
            Err(FrameDecodeError::Empty)
        ));
    }
}
