use std::io::Read;
use byteorder::{ByteOrder,NativeEndian};

const MAGIC_NATIVE_ENDIAN: u32 = 0x65617400;
const MAGIC_REVERSE_ENDIAN: u32 = 0x00746165;
const SUPPORTED_VERSION: u8 = 0x07;

pub const HEADER_SIZE: usize = 64;
pub const MAX_PDU_SIZE: usize = 32768;

// Low 16 bits of the action word.
pub const TA_QUEUE: u32 = 1;
pub const TA_BACKMERGE: u32 = 2;
pub const TA_FRONTMERGE: u32 = 3;
pub const TA_REQUEUE: u32 = 6;
pub const TA_ISSUE: u32 = 7;
pub const TA_COMPLETE: u32 = 8;
pub const TA_LINK: u32 = 10;
pub const TA_INSERT: u32 = 12;
pub const TA_SPLIT: u32 = 13;
pub const TA_REMAP: u32 = 15;

// High 16 bits of the action word (category mask).
pub const TC_WRITE: u32 = 0x0002;

pub const N_KINDS: usize = 9;

#[derive(Copy,Clone,PartialEq,Eq,Debug)]
pub enum Kind {
    Q,
    X,
    A,
    L,
    M,
    I,
    D,
    C,
    R,
}

impl Kind {
    pub fn index(self) -> usize {
        match self {
            Kind::Q => 0,
            Kind::X => 1,
            Kind::A => 2,
            Kind::L => 3,
            Kind::M => 4,
            Kind::I => 5,
            Kind::D => 6,
            Kind::C => 7,
            Kind::R => 8,
        }
    }

    pub fn tag(self) -> char {
        match self {
            Kind::Q => 'Q',
            Kind::X => 'X',
            Kind::A => 'A',
            Kind::L => 'L',
            Kind::M => 'M',
            Kind::I => 'I',
            Kind::D => 'D',
            Kind::C => 'C',
            Kind::R => 'R',
        }
    }

    pub fn from_action(action: u32) -> Option<Kind> {
        match action & 0xffff {
            TA_QUEUE => Some(Kind::Q),
            TA_BACKMERGE | TA_FRONTMERGE => Some(Kind::M),
            TA_REQUEUE => Some(Kind::R),
            TA_ISSUE => Some(Kind::D),
            TA_COMPLETE => Some(Kind::C),
            TA_LINK => Some(Kind::L),
            TA_INSERT => Some(Kind::I),
            TA_SPLIT => Some(Kind::X),
            TA_REMAP => Some(Kind::A),
            _ => None,
        }
    }
}

// One wire record, already in host byte order.
#[derive(Clone,Debug)]
pub struct Record {
    pub sequence: u32,
    pub time:     u64, /* in nanoseconds */
    pub sector:   u64, /* disk offset */
    pub bytes:    u32, /* transfer length */
    pub action:   u32, /* a 16 high-bit field for category and a 16 low-bit enum for action */
    pub pid:      u32,
    pub device:   u32, /* major is 12 high-bits then minor is 20 low-bits */
    pub cpu:      u32,
    pub error:    u16,
    pub comm:     String,
    pub payload:  Vec<u8>,
    pub swapped:  bool, /* producer used the opposite byte order */
}

impl Record {
    pub fn kind(&self) -> Option<Kind> {
        Kind::from_action(self.action)
    }

    pub fn is_write(&self) -> bool {
        (self.action >> 16) & TC_WRITE != 0
    }

    pub fn blocks(&self) -> u64 {
        (self.bytes as u64) >> 9
    }

    pub fn end_sector(&self) -> u64 {
        self.sector + self.blocks()
    }

    // Remap payloads start with the target: u32 device then u64 sector.
    pub fn remap_target(&self) -> Option<(u32, u64)> {
        if self.payload.len() < 12 {
            return None;
        }
        let mut device = NativeEndian::read_u32(&self.payload[0..4]);
        let mut sector = NativeEndian::read_u64(&self.payload[4..12]);
        if self.swapped {
            device = device.swap_bytes();
            sector = sector.swap_bytes();
        }
        Some((device, sector))
    }
}

fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<usize, String> {
    let mut total = 0;
    while total < buf.len() {
        match reader.read(&mut buf[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => break,
            Err(e) => return Err(format!("Error reading trace stream: {}", e)),
        }
    }
    Ok(total)
}

/// Decode the next record from the stream. Returns Ok(None) on a clean end
/// of stream; a short read mid-record, a bad magic word, an unsupported
/// version or an oversized payload are fatal. The decoder holds no
/// correlation state.
pub fn next_event<R: Read>(reader: &mut R) -> Result<Option<Record>, String> {
    let mut head = [0u8; HEADER_SIZE];
    let got = read_full(reader, &mut head)?;
    if got == 0 {
        return Ok(None);
    }
    if got < HEADER_SIZE {
        return Err(format!("Short read: got {} bytes of a {} byte record header", got, HEADER_SIZE));
    }

    let mut magic = NativeEndian::read_u32(&head[0..4]);
    let swapped =
        if magic & 0xffffff00 == MAGIC_NATIVE_ENDIAN {
            false
        } else if magic & 0x00ffffff == MAGIC_REVERSE_ENDIAN {
            true
        } else {
            return Err(format!("Incorrect magic number for trace record. Got {:x}", magic));
        };
    if swapped {
        magic = magic.swap_bytes();
    }
    let version = (magic & 0xff) as u8;
    if version != SUPPORTED_VERSION {
        return Err(format!("Unsupported trace format version {:#x} - only version {:#x} is supported", version, SUPPORTED_VERSION));
    }

    let rd16 = |off: usize| -> u16 {
        let v = NativeEndian::read_u16(&head[off..off + 2]);
        if swapped { v.swap_bytes() } else { v }
    };
    let rd32 = |off: usize| -> u32 {
        let v = NativeEndian::read_u32(&head[off..off + 4]);
        if swapped { v.swap_bytes() } else { v }
    };
    let rd64 = |off: usize| -> u64 {
        let v = NativeEndian::read_u64(&head[off..off + 8]);
        if swapped { v.swap_bytes() } else { v }
    };

    let pdu_len = rd16(46) as usize;
    if pdu_len > MAX_PDU_SIZE {
        return Err(format!("Payload length {} exceeds the {} byte cap", pdu_len, MAX_PDU_SIZE));
    }
    let mut payload = vec![0u8; pdu_len];
    if pdu_len > 0 {
        let got = read_full(reader, &mut payload)?;
        if got < pdu_len {
            return Err(format!("Short read: got {} bytes of a {} byte payload", got, pdu_len));
        }
    }

    let comm_raw = &head[48..64];
    let comm_len = comm_raw.iter().position(|&b| b == 0).unwrap_or(comm_raw.len());
    let comm = String::from_utf8_lossy(&comm_raw[..comm_len]).into_owned();

    Ok(Some(Record {
        sequence: rd32(4),
        time:     rd64(8),
        sector:   rd64(16),
        bytes:    rd32(24),
        action:   rd32(28),
        pid:      rd32(32),
        device:   rd32(36),
        cpu:      rd32(40),
        error:    rd16(44),
        comm,
        payload,
        swapped,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn put_header(buf: &mut [u8], time: u64, sector: u64, bytes: u32, action: u32, device: u32, pdu_len: u16) {
        NativeEndian::write_u32(&mut buf[0..4], (0x656174 << 8) | SUPPORTED_VERSION as u32);
        NativeEndian::write_u32(&mut buf[4..8], 7);
        NativeEndian::write_u64(&mut buf[8..16], time);
        NativeEndian::write_u64(&mut buf[16..24], sector);
        NativeEndian::write_u32(&mut buf[24..28], bytes);
        NativeEndian::write_u32(&mut buf[28..32], action);
        NativeEndian::write_u32(&mut buf[32..36], 1234);
        NativeEndian::write_u32(&mut buf[36..40], device);
        NativeEndian::write_u32(&mut buf[40..44], 2);
        NativeEndian::write_u16(&mut buf[44..46], 0);
        NativeEndian::write_u16(&mut buf[46..48], pdu_len);
        buf[48..52].copy_from_slice(b"dd\0\0");
    }

    fn swap_header(buf: &mut [u8]) {
        for off in &[0usize, 4, 24, 28, 32, 36, 40] {
            let v = NativeEndian::read_u32(&buf[*off..*off + 4]);
            NativeEndian::write_u32(&mut buf[*off..*off + 4], v.swap_bytes());
        }
        for off in &[8usize, 16] {
            let v = NativeEndian::read_u64(&buf[*off..*off + 8]);
            NativeEndian::write_u64(&mut buf[*off..*off + 8], v.swap_bytes());
        }
        for off in &[44usize, 46] {
            let v = NativeEndian::read_u16(&buf[*off..*off + 2]);
            NativeEndian::write_u16(&mut buf[*off..*off + 2], v.swap_bytes());
        }
    }

    #[test]
    fn test_decode_native() {
        let mut buf = [0u8; HEADER_SIZE];
        put_header(&mut buf, 1000, 512, 4096, TA_QUEUE | (TC_WRITE << 16), (8 << 20) | 1, 0);
        let mut cursor = Cursor::new(buf.to_vec());
        let record = next_event(&mut cursor).unwrap().unwrap();
        assert_eq!(record.kind(), Some(Kind::Q));
        assert_eq!(record.time, 1000);
        assert_eq!(record.sector, 512);
        assert_eq!(record.bytes, 4096);
        assert_eq!(record.blocks(), 8);
        assert_eq!(record.end_sector(), 520);
        assert_eq!(record.pid, 1234);
        assert_eq!(record.device, (8 << 20) | 1);
        assert_eq!(record.comm, "dd");
        assert!(record.is_write());
        assert!(!record.swapped);
        assert!(next_event(&mut cursor).unwrap().is_none());
    }

    #[test]
    fn test_decode_reverse_endian() {
        let mut buf = [0u8; HEADER_SIZE];
        put_header(&mut buf, 2000, 8, 512, TA_COMPLETE, 8 << 20, 0);
        swap_header(&mut buf);
        let mut cursor = Cursor::new(buf.to_vec());
        let record = next_event(&mut cursor).unwrap().unwrap();
        assert!(record.swapped);
        assert_eq!(record.kind(), Some(Kind::C));
        assert_eq!(record.time, 2000);
        assert_eq!(record.sector, 8);
        assert!(!record.is_write());
    }

    #[test]
    fn test_decode_payload() {
        let mut buf = vec![0u8; HEADER_SIZE + 12];
        put_header(&mut buf[0..HEADER_SIZE], 10, 0, 4096, TA_REMAP, 252 << 20, 12);
        NativeEndian::write_u32(&mut buf[HEADER_SIZE..HEADER_SIZE + 4], 8 << 20);
        NativeEndian::write_u64(&mut buf[HEADER_SIZE + 4..HEADER_SIZE + 12], 2048);
        let mut cursor = Cursor::new(buf);
        let record = next_event(&mut cursor).unwrap().unwrap();
        assert_eq!(record.kind(), Some(Kind::A));
        assert_eq!(record.remap_target(), Some((8 << 20, 2048)));
    }

    #[test]
    fn test_decode_bad_magic() {
        let mut buf = [0u8; HEADER_SIZE];
        put_header(&mut buf, 0, 0, 0, TA_QUEUE, 0, 0);
        NativeEndian::write_u32(&mut buf[0..4], 0xdeadbeef);
        let mut cursor = Cursor::new(buf.to_vec());
        assert!(next_event(&mut cursor).is_err());
    }

    #[test]
    fn test_decode_bad_version() {
        let mut buf = [0u8; HEADER_SIZE];
        put_header(&mut buf, 0, 0, 0, TA_QUEUE, 0, 0);
        NativeEndian::write_u32(&mut buf[0..4], (0x656174 << 8) | 0x06);
        let mut cursor = Cursor::new(buf.to_vec());
        assert!(next_event(&mut cursor).is_err());
    }

    #[test]
    fn test_decode_short_header() {
        let mut buf = [0u8; HEADER_SIZE];
        put_header(&mut buf, 0, 0, 0, TA_QUEUE, 0, 0);
        let mut cursor = Cursor::new(buf[0..20].to_vec());
        assert!(next_event(&mut cursor).is_err());
    }

    #[test]
    fn test_decode_short_payload() {
        let mut buf = [0u8; HEADER_SIZE];
        put_header(&mut buf, 0, 0, 0, TA_QUEUE, 0, 100);
        let mut cursor = Cursor::new(buf.to_vec());
        assert!(next_event(&mut cursor).is_err());
    }

    #[test]
    fn test_unknown_action_is_not_a_kind() {
        assert_eq!(Kind::from_action(9), None);
        assert_eq!(Kind::from_action(TA_QUEUE | (TC_WRITE << 16)), Some(Kind::Q));
    }
}
