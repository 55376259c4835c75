//! # RTK correction packet encoding
//!
//! Differential GNSS corrections arrive from a base station as opaque RTCM
//! packets and leave the server as `GPS_RTCM_DATA` MAVLink messages. Packets
//! longer than a single message payload are fragmented according to the
//! MAVLink convention: bit 0 of `flags` marks a fragmented packet, bits 1-2
//! carry the fragment `ID` and bits 3-7 a per-packet sequence number that
//! lets receivers detect lost fragments.

use crate::protocol::dialect::messages::GpsRtcmData;

/// Maximum number of RTCM payload bytes in a single `GPS_RTCM_DATA` message.
const MAX_FRAGMENT_SIZE: usize = 180;
/// Fragment `ID` is two bits wide, so a packet may span at most four
/// fragments.
const MAX_FRAGMENTS: usize = 4;

/// Encodes raw RTK correction packets into `GPS_RTCM_DATA` message batches.
///
/// The encoder is stateful: the 5-bit sequence counter advances with every
/// encoded packet and wraps around.
#[derive(Debug, Default)]
pub struct RtkCorrectionPacketEncoder {
    sequence: u8,
}

impl RtkCorrectionPacketEncoder {
    /// Creates a new encoder with the sequence counter at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Encodes one RTCM packet into an ordered batch of `GPS_RTCM_DATA`
    /// messages.
    ///
    /// Packets that do not fit into four fragments are dropped with a
    /// warning; the result is empty in that case.
    pub fn encode(&mut self, packet: &[u8]) -> Vec<GpsRtcmData> {
        let sequence = self.sequence & 0x1f;
        self.sequence = self.sequence.wrapping_add(1);

        if packet.len() > MAX_FRAGMENT_SIZE * MAX_FRAGMENTS {
            log::warn!(
                "RTK correction packet too large to forward ({} bytes), dropping",
                packet.len()
            );
            return Vec::new();
        }

        if packet.len() <= MAX_FRAGMENT_SIZE {
            return vec![make_message(packet, sequence << 3)];
        }

        let mut messages: Vec<GpsRtcmData> = packet
            .chunks(MAX_FRAGMENT_SIZE)
            .enumerate()
            .map(|(index, chunk)| make_message(chunk, 1 | ((index as u8) << 1) | (sequence << 3)))
            .collect();

        // A final fragment of exactly 180 bytes is indistinguishable from a
        // truncated packet, so a zero-length terminator follows it while the
        // fragment ID space allows.
        if packet.len() % MAX_FRAGMENT_SIZE == 0 && messages.len() < MAX_FRAGMENTS {
            let index = messages.len() as u8;
            messages.push(make_message(&[], 1 | (index << 1) | (sequence << 3)));
        }

        messages
    }
}

fn make_message(chunk: &[u8], flags: u8) -> GpsRtcmData {
    let mut data = [0u8; MAX_FRAGMENT_SIZE];
    data[..chunk.len()].copy_from_slice(chunk);
    GpsRtcmData {
        flags,
        len: chunk.len() as u8,
        data,
    }
}

#[cfg(test)]
mod rtk_tests {
    use super::*;

    #[test]
    fn short_packet_is_not_fragmented() {
        let mut encoder = RtkCorrectionPacketEncoder::new();
        let messages = encoder.encode(&[1, 2, 3]);

        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].len, 3);
        assert_eq!(messages[0].flags & 1, 0);
        assert_eq!(messages[0].data[..3], [1, 2, 3]);
    }

    #[test]
    fn long_packet_is_fragmented_in_order() {
        let mut encoder = RtkCorrectionPacketEncoder::new();
        let packet: Vec<u8> = (0..400u16).map(|byte| byte as u8).collect();
        let messages = encoder.encode(&packet);

        assert_eq!(messages.len(), 3);
        for (index, message) in messages.iter().enumerate() {
            assert_eq!(message.flags & 1, 1);
            assert_eq!((message.flags >> 1) & 0x3, index as u8);
        }
        assert_eq!(messages[0].len, 180);
        assert_eq!(messages[1].len, 180);
        assert_eq!(messages[2].len, 40);
    }

    #[test]
    fn full_final_fragment_gets_a_terminator() {
        let mut encoder = RtkCorrectionPacketEncoder::new();
        let messages = encoder.encode(&[0u8; 360]);

        assert_eq!(messages.len(), 3);
        assert_eq!(messages[2].len, 0);
        assert_eq!((messages[2].flags >> 1) & 0x3, 2);
    }

    #[test]
    fn oversized_packet_is_dropped() {
        let mut encoder = RtkCorrectionPacketEncoder::new();
        assert!(encoder.encode(&[0u8; 721]).is_empty());
    }

    #[test]
    fn sequence_advances_and_wraps() {
        let mut encoder = RtkCorrectionPacketEncoder::new();
        let first = encoder.encode(&[0u8; 4]);
        let second = encoder.encode(&[0u8; 4]);
        assert_eq!(first[0].flags >> 3, 0);
        assert_eq!(second[0].flags >> 3, 1);

        for _ in 0..30 {
            encoder.encode(&[0u8; 4]);
        }
        let wrapped = encoder.encode(&[0u8; 4]);
        assert_eq!(wrapped[0].flags >> 3, 0);
    }
}
