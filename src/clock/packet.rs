//! SNTP packet encoding and decoding.
//!
//! Only the parts of the 48-byte header used by a unicast client are
//! modelled: the mode byte, stratum and the four timestamps.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |LI | VN  |Mode |    Stratum    |     Poll      |   Precision   |
//! |                   Root Delay / Dispersion / Reference ID      |
//! |                   Reference Timestamp (64)        @16         |
//! |                   Originate Timestamp (64)        @24         |
//! |                   Receive Timestamp (64)          @32         |
//! |                   Transmit Timestamp (64)         @40         |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::constants::{
    NTP_CLIENT_MODE_V3, NTP_ORIGINATE_OFFSET, NTP_PACKET_SIZE, NTP_RECEIVE_OFFSET,
    NTP_REFERENCE_OFFSET, NTP_TRANSMIT_OFFSET, NTP_UNIX_EPOCH_DELTA_SECS,
};
use crate::error::{Error, Result};

const MODE_MASK: u8 = 0x07;
const MODE_SERVER: u8 = 4;
const MODE_BROADCAST: u8 = 5;

/// Seconds covered by one 32-bit NTP era.
const NTP_ERA_SECS: i64 = 1 << 32;

/// 64-bit NTP timestamp: seconds since 1900-01-01 and a binary fraction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NtpTimestamp {
    pub seconds: u32,
    pub fraction: u32,
}

impl NtpTimestamp {
    pub fn new(seconds: u32, fraction: u32) -> Self {
        Self { seconds, fraction }
    }

    pub fn is_zero(&self) -> bool {
        self.seconds == 0 && self.fraction == 0
    }

    /// Convert milliseconds since the Unix epoch.
    ///
    /// Seconds wrap modulo 2^32, so times after 2036-02-07 land in era 1.
    pub fn from_unix_millis(millis: i64) -> Self {
        let secs = millis.div_euclid(1000);
        let ms = millis.rem_euclid(1000) as u64;
        let ntp_secs = (secs + NTP_UNIX_EPOCH_DELTA_SECS as i64).rem_euclid(NTP_ERA_SECS);
        let fraction = ((ms << 32) / 1000) as u32;
        Self::new(ntp_secs as u32, fraction)
    }

    /// Convert to milliseconds since the Unix epoch.
    ///
    /// A cleared most significant bit means era 1 (2036-2104), as RFC 4330
    /// recommends.
    pub fn to_unix_millis(&self) -> i64 {
        let mut secs = self.seconds as i64;
        if self.seconds & 0x8000_0000 == 0 {
            secs += NTP_ERA_SECS;
        }
        let unix_secs = secs - NTP_UNIX_EPOCH_DELTA_SECS as i64;
        let ms = ((self.fraction as u64 * 1000) + (1 << 31)) >> 32;
        unix_secs * 1000 + ms as i64
    }

    /// Replace the low-order byte of the fraction with random bits.
    ///
    /// Below clock resolution these bits carry no information, and random
    /// values let the client match replies to requests.
    pub fn with_random_low_bits(self, rng: &mut fastrand::Rng) -> Self {
        Self::new(self.seconds, (self.fraction & !0xFF) | rng.u8(..) as u32)
    }

    fn read(buf: &mut impl Buf) -> Self {
        Self::new(buf.get_u32(), buf.get_u32())
    }

    fn write(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.seconds);
        buf.put_u32(self.fraction);
    }
}

/// An SNTP packet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NtpPacket {
    /// Leap indicator, version and mode.
    pub mode_byte: u8,
    pub stratum: u8,
    pub reference: NtpTimestamp,
    pub originate: NtpTimestamp,
    pub receive: NtpTimestamp,
    pub transmit: NtpTimestamp,
}

impl NtpPacket {
    /// A client request carrying only the transmit timestamp.
    pub fn client_request(transmit: NtpTimestamp) -> Self {
        Self {
            mode_byte: NTP_CLIENT_MODE_V3,
            transmit,
            ..Default::default()
        }
    }

    /// Association mode (3 = client, 4 = server).
    pub fn mode(&self) -> u8 {
        self.mode_byte & MODE_MASK
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(NTP_PACKET_SIZE);
        buf.put_u8(self.mode_byte);
        buf.put_u8(self.stratum);
        buf.put_bytes(0, NTP_REFERENCE_OFFSET - 2);
        self.reference.write(&mut buf);
        self.originate.write(&mut buf);
        self.receive.write(&mut buf);
        self.transmit.write(&mut buf);
        debug_assert_eq!(buf.len(), NTP_PACKET_SIZE);
        buf.freeze()
    }

    /// Decode a packet received from a time server.
    ///
    /// Anything shorter than the fixed header is a protocol error. Trailing
    /// bytes (extension fields, authenticator) are ignored.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < NTP_PACKET_SIZE {
            return Err(Error::Protocol(format!(
                "short reply: {} bytes, need {}",
                data.len(),
                NTP_PACKET_SIZE
            )));
        }

        let mut buf = data;
        let mode_byte = buf.get_u8();
        let stratum = buf.get_u8();
        buf.advance(NTP_REFERENCE_OFFSET - 2);
        let reference = NtpTimestamp::read(&mut buf);
        let originate = NtpTimestamp::read(&mut buf);
        let receive = NtpTimestamp::read(&mut buf);
        let transmit = NtpTimestamp::read(&mut buf);

        Ok(Self {
            mode_byte,
            stratum,
            reference,
            originate,
            receive,
            transmit,
        })
    }

    /// Check that this packet is a usable server reply to `request`.
    pub fn validate_reply(&self, request: &NtpPacket) -> Result<()> {
        let mode = self.mode();
        if mode != MODE_SERVER && mode != MODE_BROADCAST {
            return Err(Error::Protocol(format!("unexpected mode {}", mode)));
        }
        if self.transmit.is_zero() {
            return Err(Error::Protocol("reply has no transmit timestamp".into()));
        }
        if self.originate != request.transmit {
            return Err(Error::Protocol(
                "reply does not echo request timestamp".into(),
            ));
        }
        Ok(())
    }
}

/// The four instants of one exchange, in Unix milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExchangeTimes {
    /// Client send time, as echoed by the server.
    pub originate: i64,
    /// Server receive time.
    pub receive: i64,
    /// Server send time.
    pub transmit: i64,
    /// Client receive time.
    pub destination: i64,
}

impl ExchangeTimes {
    pub fn from_reply(reply: &NtpPacket, destination: i64) -> Self {
        Self {
            originate: reply.originate.to_unix_millis(),
            receive: reply.receive.to_unix_millis(),
            transmit: reply.transmit.to_unix_millis(),
            destination,
        }
    }

    /// Local clock skew: `((receive - originate) + (transmit - destination)) / 2`.
    pub fn skew_millis(&self) -> i64 {
        ((self.receive - self.originate) + (self.transmit - self.destination)) / 2
    }

    /// Network round trip, excluding server processing time.
    pub fn round_trip_millis(&self) -> i64 {
        (self.destination - self.originate) - (self.transmit - self.receive)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_request_layout() {
        let ts = NtpTimestamp::new(0xE000_0001, 0x8000_0000);
        let bytes = NtpPacket::client_request(ts).encode();

        assert_eq!(bytes.len(), NTP_PACKET_SIZE);
        assert_eq!(bytes[0], 0x1B);
        assert!(bytes[1..NTP_TRANSMIT_OFFSET].iter().all(|b| *b == 0));
        assert_eq!(
            &bytes[NTP_TRANSMIT_OFFSET..],
            &[0xE0, 0x00, 0x00, 0x01, 0x80, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn test_decode_reads_timestamps_at_offsets() {
        let mut raw = [0u8; NTP_PACKET_SIZE];
        raw[0] = 0x1C;
        raw[NTP_ORIGINATE_OFFSET..NTP_ORIGINATE_OFFSET + 4].copy_from_slice(&1u32.to_be_bytes());
        raw[NTP_RECEIVE_OFFSET..NTP_RECEIVE_OFFSET + 4].copy_from_slice(&2u32.to_be_bytes());
        raw[NTP_TRANSMIT_OFFSET + 4..].copy_from_slice(&3u32.to_be_bytes());

        let packet = NtpPacket::decode(&raw).unwrap();
        assert_eq!(packet.mode(), 4);
        assert_eq!(packet.originate, NtpTimestamp::new(1, 0));
        assert_eq!(packet.receive, NtpTimestamp::new(2, 0));
        assert_eq!(packet.transmit, NtpTimestamp::new(0, 3));
    }

    #[test]
    fn test_decode_short_reply_is_protocol_error() {
        let err = NtpPacket::decode(&[0x1C; 47]).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn test_unix_epoch_maps_to_delta() {
        let ts = NtpTimestamp::from_unix_millis(0);
        assert_eq!(ts.seconds as u64, NTP_UNIX_EPOCH_DELTA_SECS);
        assert_eq!(ts.fraction, 0);
        assert_eq!(ts.to_unix_millis(), 0);
    }

    #[test]
    fn test_epoch_round_trip_within_one_millisecond() {
        let mut rng = fastrand::Rng::with_seed(7);
        for millis in [1_700_000_000_123i64, 1_234_567_890_999, 946_684_800_000] {
            let ts = NtpTimestamp::from_unix_millis(millis).with_random_low_bits(&mut rng);
            assert!((ts.to_unix_millis() - millis).abs() <= 1);
        }
    }

    #[test]
    fn test_era_one_round_trip() {
        // 2040-01-01T00:00:00Z, past the 2036 wrap.
        let millis = 2_208_988_800_000i64;
        let ts = NtpTimestamp::from_unix_millis(millis);
        assert_eq!(ts.seconds & 0x8000_0000, 0);
        assert_eq!(ts.to_unix_millis(), millis);
    }

    #[test]
    fn test_random_low_bits_only_touch_last_byte() {
        let mut rng = fastrand::Rng::with_seed(1);
        let ts = NtpTimestamp::new(10, 0xABCD_EF00);
        let randomized = ts.with_random_low_bits(&mut rng);
        assert_eq!(randomized.seconds, 10);
        assert_eq!(randomized.fraction & !0xFF, 0xABCD_EF00);
    }

    #[test]
    fn test_validate_reply() {
        let request = NtpPacket::client_request(NtpTimestamp::new(5, 5));
        let mut reply = NtpPacket {
            mode_byte: 0x1C,
            originate: request.transmit,
            transmit: NtpTimestamp::new(6, 0),
            ..Default::default()
        };
        assert!(reply.validate_reply(&request).is_ok());

        reply.mode_byte = 0x1B;
        assert!(reply.validate_reply(&request).is_err());

        reply.mode_byte = 0x1C;
        reply.originate = NtpTimestamp::new(9, 9);
        assert!(reply.validate_reply(&request).is_err());

        reply.originate = request.transmit;
        reply.transmit = NtpTimestamp::default();
        assert!(reply.validate_reply(&request).is_err());
    }

    #[test]
    fn test_skew_and_round_trip() {
        // Local clock 100ms behind the server, 20ms each way, 2ms in server.
        let times = ExchangeTimes {
            originate: 1_000,
            receive: 1_120,
            transmit: 1_122,
            destination: 1_042,
        };
        assert_eq!(times.skew_millis(), 100);
        assert_eq!(times.round_trip_millis(), 40);
    }

    #[test]
    fn test_skew_local_ahead() {
        let times = ExchangeTimes {
            originate: 5_000,
            receive: 4_755,
            transmit: 4_755,
            destination: 5_010,
        };
        assert_eq!(times.skew_millis(), -250);
    }
}
