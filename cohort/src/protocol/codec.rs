use crate::error::{CohortError, Result};
use crate::protocol::header::{HEADER_SIZE, Header, MessageType};
use crate::protocol::message::CohortMessage;
use crate::types::PROTOCOL_VERSION;

/// Encode a `CohortMessage` into a framed byte buffer: `[header][rkyv payload]`.
pub fn encode_message(msg: &CohortMessage) -> Result<Vec<u8>> {
    let payload = rkyv::to_bytes::<rkyv::rancor::Error>(msg)
        .map_err(|e| CohortError::EncodeFailed(e.to_string()))?;

    if payload.len() > u32::MAX as usize {
        return Err(CohortError::EncodeFailed(format!(
            "payload too large for framed header: {} bytes exceeds u32::MAX",
            payload.len()
        )));
    }

    let message_type = match msg {
        CohortMessage::Task { .. } => MessageType::Task,
        CohortMessage::Reply { .. } => MessageType::Reply,
    };
    let header = Header {
        payload_length: payload.len() as u32,
        version: PROTOCOL_VERSION,
        message_type,
    };

    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    buf.extend_from_slice(&header.encode());
    buf.extend_from_slice(&payload);
    Ok(buf)
}

/// Decode a framed byte buffer back into a `(Header, CohortMessage)`.
///
/// Rejects frames from a different protocol version and frames whose header
/// type disagrees with the decoded message.
pub fn decode_message(buf: &[u8]) -> Result<(Header, CohortMessage)> {
    if buf.len() < HEADER_SIZE {
        return Err(CohortError::DecodeFailed(format!(
            "buffer too short: {} < {HEADER_SIZE}",
            buf.len()
        )));
    }

    let header_bytes: &[u8; HEADER_SIZE] = buf[..HEADER_SIZE]
        .try_into()
        .map_err(|_| CohortError::DecodeFailed("header slice length mismatch".into()))?;

    let header = Header::decode(header_bytes)
        .ok_or_else(|| CohortError::DecodeFailed("invalid header: unknown message type".into()))?;

    if header.version != PROTOCOL_VERSION {
        return Err(CohortError::ProtocolMismatch {
            local: PROTOCOL_VERSION,
            remote: header.version,
        });
    }

    let payload_end = HEADER_SIZE + header.payload_length as usize;
    if buf.len() < payload_end {
        return Err(CohortError::DecodeFailed(format!(
            "buffer too short for payload: {} < {payload_end}",
            buf.len()
        )));
    }

    // Frames are sliced out of arbitrary byte buffers; rkyv wants aligned input.
    let mut payload = rkyv::util::AlignedVec::<16>::with_capacity(header.payload_length as usize);
    payload.extend_from_slice(&buf[HEADER_SIZE..payload_end]);
    let msg = rkyv::from_bytes::<CohortMessage, rkyv::rancor::Error>(&payload)
        .map_err(|e| CohortError::DecodeFailed(e.to_string()))?;

    let matches = matches!(
        (&msg, header.message_type),
        (CohortMessage::Task { .. }, MessageType::Task)
            | (CohortMessage::Reply { .. }, MessageType::Reply)
    );
    if !matches {
        return Err(CohortError::DecodeFailed(format!(
            "header says {:?} but payload is a different message",
            header.message_type
        )));
    }

    Ok((header, msg))
}
