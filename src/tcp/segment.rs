use crate::{Error, HEADER_LEN};

/// Single-bit control flags, packed into one octet on the wire.
///
/// Bit layout, most significant first: ACK, CWR, ECE, FIN, SYN. Only ACK and
/// FIN drive protocol behavior; CWR and ECE are carried but ignored, and SYN
/// is never set because both peers assume an established connection.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Flags(u8);

impl Flags {
    const ACK: u8 = 1 << 7;
    const CWR: u8 = 1 << 6;
    const ECE: u8 = 1 << 5;
    const FIN: u8 = 1 << 4;
    const SYN: u8 = 1 << 3;

    pub fn new(cwr: bool, ece: bool, ack: bool, syn: bool, fin: bool) -> Self {
        Flags(
            (ack as u8) << 7
                | (cwr as u8) << 6
                | (ece as u8) << 5
                | (fin as u8) << 4
                | (syn as u8) << 3,
        )
    }

    /// Acknowledgment field significant
    pub fn ack(&self) -> bool {
        self.0 & Self::ACK != 0
    }

    /// Congestion window reduced (carried, ignored)
    pub fn cwr(&self) -> bool {
        self.0 & Self::CWR != 0
    }

    /// ECN echo (carried, ignored)
    pub fn ece(&self) -> bool {
        self.0 & Self::ECE != 0
    }

    /// No more data from sender
    pub fn fin(&self) -> bool {
        self.0 & Self::FIN != 0
    }

    /// Synchronize sequence numbers (never set here)
    pub fn syn(&self) -> bool {
        self.0 & Self::SYN != 0
    }
}

impl From<u8> for Flags {
    fn from(bits: u8) -> Self {
        Flags(bits)
    }
}

impl From<Flags> for u8 {
    fn from(flags: Flags) -> Self {
        flags.0
    }
}

/// The fixed 20-byte segment header. Multi-byte fields are big-endian on the
/// wire; the header-length octet is always 20 and the trailing reserved word
/// is always zero, so neither is kept here.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub src_port: u16,
    pub dst_port: u16,
    /// Byte offset of the first payload byte in the sender's stream.
    pub seq_num: u32,
    /// Next in-order byte the emitter expects from its peer.
    pub ack_num: u32,
    pub flags: Flags,
    /// Receive-window advertisement (carried, not consulted).
    pub rcvwd: u16,
    pub checksum: u16,
}

impl Header {
    pub fn new(src_port: u16, dst_port: u16, seq_num: u32, ack_num: u32, flags: Flags, rcvwd: u16) -> Self {
        Header {
            src_port,
            dst_port,
            seq_num,
            ack_num,
            flags,
            rcvwd,
            checksum: 0,
        }
    }
}

/// One protocol data unit: a header and up to MSS payload bytes. A segment
/// with FIN set carries no payload.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Segment {
    pub header: Header,
    pub payload: Vec<u8>,
}

impl Segment {
    pub fn new(header: Header, payload: Vec<u8>) -> Self {
        Segment { header, payload }
    }

    /// Sequence-space footprint: the payload length, or 1 for bare control
    /// segments so that ACKs and FINs still consume a sequence number.
    pub fn seq_step(&self) -> u32 {
        self.payload.len().max(1) as u32
    }

    /// The cumulative ACK value that acknowledges this segment.
    pub fn expected_ack(&self) -> u32 {
        self.header.seq_num + self.seq_step()
    }

    pub fn encode(&self) -> Vec<u8> {
        self.encode_with(self.header.checksum)
    }

    fn encode_with(&self, checksum: u16) -> Vec<u8> {
        let h = &self.header;
        let mut buf = Vec::with_capacity(HEADER_LEN + self.payload.len());
        buf.extend_from_slice(&h.src_port.to_be_bytes());
        buf.extend_from_slice(&h.dst_port.to_be_bytes());
        buf.extend_from_slice(&h.seq_num.to_be_bytes());
        buf.extend_from_slice(&h.ack_num.to_be_bytes());
        buf.push(HEADER_LEN as u8);
        buf.push(h.flags.into());
        buf.extend_from_slice(&h.rcvwd.to_be_bytes());
        buf.extend_from_slice(&checksum.to_be_bytes());
        buf.extend_from_slice(&0u16.to_be_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < HEADER_LEN || buf[12] != HEADER_LEN as u8 {
            return Err(Error::Malformed(buf.len()));
        }

        let header = Header {
            src_port: u16::from_be_bytes([buf[0], buf[1]]),
            dst_port: u16::from_be_bytes([buf[2], buf[3]]),
            seq_num: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
            ack_num: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
            flags: Flags::from(buf[13]),
            rcvwd: u16::from_be_bytes([buf[14], buf[15]]),
            checksum: u16::from_be_bytes([buf[16], buf[17]]),
        };

        Ok(Segment {
            header,
            payload: buf[HEADER_LEN..].to_vec(),
        })
    }

    /// Computes the checksum over the packed segment (checksum field zeroed)
    /// and stores it in the header.
    pub fn fill_checksum(&mut self) {
        self.header.checksum = internet_checksum(&self.encode_with(0));
    }

    /// True when the stored checksum matches a recomputation, i.e. no octet
    /// was mutated in flight.
    pub fn verify(&self) -> bool {
        internet_checksum(&self.encode_with(0)) == self.header.checksum
    }
}

/// One's-complement sum over 16-bit words with end-around carry, inverted.
/// An odd trailing byte is padded with zero.
fn internet_checksum(bytes: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut words = bytes.chunks_exact(2);
    for word in &mut words {
        sum += u32::from(u16::from_be_bytes([word[0], word[1]]));
    }
    if let [last] = words.remainder() {
        sum += u32::from(u16::from_be_bytes([*last, 0]));
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(seq_num: u32, flags: Flags, payload: &[u8]) -> Segment {
        let mut seg = Segment::new(
            Header::new(0xcafe, 0xbabe, seq_num, 0, flags, 2048),
            payload.to_vec(),
        );
        seg.fill_checksum();
        seg
    }

    #[test]
    fn wire_layout_is_byte_exact() {
        let seg = segment(0x00010203, Flags::new(false, false, true, false, true), b"");
        let bytes = seg.encode();
        assert_eq!(bytes.len(), HEADER_LEN);
        assert_eq!(&bytes[0..2], &[0xca, 0xfe]);
        assert_eq!(&bytes[2..4], &[0xba, 0xbe]);
        assert_eq!(&bytes[4..8], &[0x00, 0x01, 0x02, 0x03]);
        assert_eq!(&bytes[8..12], &[0x00, 0x00, 0x00, 0x00]);
        assert_eq!(bytes[12], 20);
        // ACK is bit 7, FIN is bit 4.
        assert_eq!(bytes[13], 0b1001_0000);
        assert_eq!(&bytes[14..16], &[0x08, 0x00]);
        assert_eq!(&bytes[18..20], &[0x00, 0x00]);
    }

    #[test]
    fn flag_bits_round_trip() {
        for bits in 0u8..32 {
            let flags = Flags::new(
                bits & 1 != 0,
                bits & 2 != 0,
                bits & 4 != 0,
                bits & 8 != 0,
                bits & 16 != 0,
            );
            assert_eq!(Flags::from(u8::from(flags)), flags);
        }
        let fin_only = Flags::new(false, false, false, false, true);
        assert!(fin_only.fin() && !fin_only.ack() && !fin_only.syn());
    }

    #[test]
    fn encode_decode_round_trip() {
        let seg = segment(1536, Flags::default(), b"some payload bytes");
        let decoded = Segment::decode(&seg.encode()).unwrap();
        assert_eq!(decoded, seg);
        assert!(decoded.verify());
    }

    #[test]
    fn checksum_catches_a_flipped_bit() {
        let seg = segment(0, Flags::default(), b"hello, world");
        let mut bytes = seg.encode();
        bytes[HEADER_LEN + 3] ^= 0x20;
        let corrupted = Segment::decode(&bytes).unwrap();
        assert!(!corrupted.verify());
    }

    #[test]
    fn checksum_catches_a_flipped_header_bit() {
        let seg = segment(512, Flags::default(), b"payload");
        let mut bytes = seg.encode();
        bytes[5] ^= 0x01; // seq_num
        assert!(!Segment::decode(&bytes).unwrap().verify());
    }

    #[test]
    fn truncated_datagram_is_malformed() {
        assert!(matches!(
            Segment::decode(&[0u8; 19]),
            Err(Error::Malformed(19))
        ));
    }

    #[test]
    fn odd_payload_length_checksums() {
        let seg = segment(0, Flags::default(), b"odd");
        assert!(Segment::decode(&seg.encode()).unwrap().verify());
    }

    #[test]
    fn control_segments_consume_one_sequence_number() {
        let fin = segment(2000, Flags::new(false, false, false, false, true), b"");
        assert_eq!(fin.seq_step(), 1);
        assert_eq!(fin.expected_ack(), 2001);

        let data = segment(0, Flags::default(), &[0u8; 512]);
        assert_eq!(data.seq_step(), 512);
        assert_eq!(data.expected_ack(), 512);
    }
}
