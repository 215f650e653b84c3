//! Framing: fixed 66-byte layout. Topic ordinal, ack letter, 64-byte NUL-terminated payload.

use crate::protocol::{AckTopic, Packet, Payload, Topic, PAYLOAD_FIELD_LEN};

const HEADER_LEN: usize = 2;

/// Size of every packet on the wire.
pub const PACKET_LEN: usize = HEADER_LEN + PAYLOAD_FIELD_LEN;

/// Encode a packet into its fixed-size frame. Bytes after the terminator are zero.
pub fn encode_packet(packet: &Packet) -> [u8; PACKET_LEN] {
    let mut out = [0u8; PACKET_LEN];
    out[0] = packet.topic.to_byte();
    out[1] = packet.ack.to_byte();
    // Payload is at most 63 bytes, so out[2 + len] stays 0 as the terminator.
    let body = packet.payload.as_bytes();
    out[HEADER_LEN..HEADER_LEN + body.len()].copy_from_slice(body);
    out
}

/// Decode one frame. The frame must be exactly [`PACKET_LEN`] bytes.
pub fn decode_packet(bytes: &[u8]) -> Result<Packet, FrameDecodeError> {
    if bytes.len() != PACKET_LEN {
        return Err(FrameDecodeError::Length(bytes.len()));
    }
    let topic = Topic::from_byte(bytes[0]).ok_or(FrameDecodeError::UnknownTopic(bytes[0]))?;
    let ack = AckTopic::from_byte(bytes[1]).ok_or(FrameDecodeError::UnknownAck(bytes[1]))?;
    let field = &bytes[HEADER_LEN..];
    let end = field
        .iter()
        .position(|&b| b == 0)
        .ok_or(FrameDecodeError::Unterminated)?;
    let text = std::str::from_utf8(&field[..end]).map_err(|_| FrameDecodeError::InvalidUtf8)?;
    // `end` < 64, so the payload always fits.
    let payload = Payload::truncated(text);
    Ok(Packet::new(topic, ack, payload))
}

/// Error decoding a frame.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("frame is {0} bytes, expected {PACKET_LEN}")]
    Length(usize),
    #[error("unknown topic byte {0:#04x}")]
    UnknownTopic(u8),
    #[error("unknown ack byte {0:#04x}")]
    UnknownAck(u8),
    #[error("payload not terminated within the field")]
    Unterminated,
    #[error("payload is not valid UTF-8")]
    InvalidUtf8,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MAX_PAYLOAD_LEN;

    fn sample() -> Packet {
        Packet::new(
            Topic::WifiSsid,
            AckTopic::ReceivedHandshake,
            Payload::new("home-network").unwrap(),
        )
    }

    #[test]
    fn layout() {
        let frame = encode_packet(&sample());
        assert_eq!(frame.len(), 66);
        assert_eq!(frame[0], 2);
        assert_eq!(frame[1], b'H');
        assert_eq!(&frame[2..14], b"home-network");
        assert!(frame[14..].iter().all(|&b| b == 0));
    }

    #[test]
    fn roundtrip_canonical_frames() {
        let packets = [
            sample(),
            Packet::new(Topic::Wave, AckTopic::ReceivedWave, Payload::empty()),
            Packet::new(
                Topic::CameraAddress,
                AckTopic::ReceivedCameraAddress,
                Payload::new("x".repeat(MAX_PAYLOAD_LEN)).unwrap(),
            ),
        ];
        for p in packets {
            let frame = encode_packet(&p);
            let decoded = decode_packet(&frame).unwrap();
            assert_eq!(decoded, p);
            assert_eq!(encode_packet(&decoded), frame);
        }
    }

    #[test]
    fn rejects_unterminated_payload() {
        let mut frame = encode_packet(&sample());
        for b in frame[2..].iter_mut() {
            *b = b'a';
        }
        assert_eq!(decode_packet(&frame), Err(FrameDecodeError::Unterminated));
    }

    #[test]
    fn rejects_wrong_length() {
        let frame = encode_packet(&sample());
        assert_eq!(decode_packet(&frame[..10]), Err(FrameDecodeError::Length(10)));
        assert_eq!(decode_packet(&[]), Err(FrameDecodeError::Length(0)));
        let mut long = frame.to_vec();
        long.push(0);
        assert_eq!(decode_packet(&long), Err(FrameDecodeError::Length(67)));
    }

    #[test]
    fn rejects_unknown_header_bytes() {
        let mut frame = encode_packet(&sample());
        frame[0] = 0;
        assert_eq!(decode_packet(&frame), Err(FrameDecodeError::UnknownTopic(0)));
        let mut frame = encode_packet(&sample());
        frame[1] = b'Z';
        assert_eq!(decode_packet(&frame), Err(FrameDecodeError::UnknownAck(b'Z')));
    }

    #[test]
    fn ignores_bytes_after_terminator() {
        let mut frame = encode_packet(&sample());
        frame[40] = b'q';
        assert_eq!(decode_packet(&frame).unwrap(), sample());
    }

    #[test]
    fn rejects_invalid_utf8() {
        let mut frame = encode_packet(&sample());
        frame[2] = 0xff;
        assert_eq!(decode_packet(&frame), Err(FrameDecodeError::InvalidUtf8));
    }
}
