use std::io::{Cursor, Read};
use byteorder::{ReadBytesExt, BigEndian, LittleEndian};

use crate::dtype::{ConvError, Warnings};

pub const PSID_MAGIC: [u8; 4] = *b"PSID";
pub const RSID_MAGIC: [u8; 4] = *b"RSID";

/// Header size of a v1 container; v2 and later append the flags block.
const DATA_OFFSET_V1: u16 = 0x76;
const DATA_OFFSET_V2: u16 = 0x7C;

macro_rules! read_n_bytes {
    ($file:ident, $n:literal) => {{
        let mut buf: [u8; $n] = [0; $n];
        $file.read_exact(&mut buf).map(|_| buf)
    }};
}

/// The outer container header. All numeric fields are big-endian on the
/// wire; text fields are 32-byte NUL-padded ASCII.
#[derive(Debug, Clone)]
pub struct SidHeader {
    pub magic: [u8; 4],
    pub version: u16,
    pub data_offset: u16,
    /// Raw value; 0 is the "load address prefixed to the payload" sentinel.
    pub load_addr: u16,
    pub init_addr: u16,
    pub play_addr: u16,
    pub num_songs: u16,
    pub start_song: u16,
    pub speed: u32,
    pub name: String,
    pub author: String,
    pub released: String,
    pub flags: u16,
    pub start_page: u8,
    pub page_length: u8,
    pub second_sid: u8,
    pub third_sid: u8
}
impl SidHeader {
    pub fn is_rsid(&self) -> bool {
        self.magic == RSID_MAGIC
    }
    /// Clock field: 01 PAL, 10 NTSC, 11 both, 00 unknown. Unknown is
    /// treated as PAL, the platform the source player shipped on.
    pub fn is_pal(&self) -> bool {
        (self.flags >> 2) & 0x03 != 2
    }
    pub fn chip_model(&self) -> &'static str {
        if (self.flags >> 4) & 0x03 == 2 { "8580" } else { "6581" }
    }
}

/// Clamp a 32-byte metadata field at the first NUL and replace anything
/// outside printable ASCII with '?'. Irregular bytes warn, never fail.
fn decode_text_field(raw: &[u8; 32], which: &str, warnings: &mut Warnings) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    let mut out = String::with_capacity(end);
    let mut replaced = 0usize;
    for &b in &raw[..end] {
        if (0x20..=0x7E).contains(&b) {
            out.push(b as char);
        } else {
            out.push('?');
            replaced += 1;
        }
    }
    if replaced > 0 {
        warnings.push(format!("{} field contains {} non-printable byte(s), replaced with '?'", which, replaced));
    }
    out
}

/// A parsed source file: resolved load address plus the raw C64 payload.
#[derive(Debug, Clone)]
pub struct SidFile {
    pub header: SidHeader,
    pub load_address: u16,
    pub data: Vec<u8>
}
impl SidFile {
    pub fn parse(bytes: &[u8]) -> Result<(SidFile, Warnings), ConvError> {
        let mut warnings = Warnings::new();
        let mut reader = Cursor::new(bytes);

        let magic = read_n_bytes!(reader, 4)?;
        if magic != PSID_MAGIC && magic != RSID_MAGIC {
            return Err(ConvError::UnrecognisedContainer(magic));
        }
        let version = reader.read_u16::<BigEndian>()?;
        let data_offset = reader.read_u16::<BigEndian>()?;
        if data_offset != DATA_OFFSET_V1 && data_offset != DATA_OFFSET_V2 {
            return Err(ConvError::UnrecognisedContainer(magic));
        }
        let load_addr = reader.read_u16::<BigEndian>()?;
        let init_addr = reader.read_u16::<BigEndian>()?;
        let play_addr = reader.read_u16::<BigEndian>()?;
        let num_songs = reader.read_u16::<BigEndian>()?;
        let start_song = reader.read_u16::<BigEndian>()?;
        let speed = reader.read_u32::<BigEndian>()?;
        let name = decode_text_field(&read_n_bytes!(reader, 32)?, "name", &mut warnings);
        let author = decode_text_field(&read_n_bytes!(reader, 32)?, "author", &mut warnings);
        let released = decode_text_field(&read_n_bytes!(reader, 32)?, "copyright", &mut warnings);

        let (flags, start_page, page_length, second_sid, third_sid) = if data_offset >= DATA_OFFSET_V2 {
            (
                reader.read_u16::<BigEndian>()?,
                reader.read_u8()?,
                reader.read_u8()?,
                reader.read_u8()?,
                reader.read_u8()?
            )
        } else {
            (0, 0, 0, 0, 0)
        };

        let header = SidHeader {
            magic, version, data_offset, load_addr, init_addr, play_addr,
            num_songs, start_song, speed, name, author, released,
            flags, start_page, page_length, second_sid, third_sid
        };

        if bytes.len() < data_offset as usize + 2 {
            return Err(ConvError::Invalid(format!("file is {} bytes, too short for a payload after the {}-byte header", bytes.len(), data_offset)));
        }
        let mut payload = &bytes[data_offset as usize..];

        // load_addr == 0 means the true load address is prefixed to the
        // payload as a little-endian word.
        let load_address = if header.load_addr == 0 {
            let mut prefix = Cursor::new(payload);
            let addr = prefix.read_u16::<LittleEndian>()?;
            payload = &payload[2..];
            addr
        } else {
            header.load_addr
        };

        if load_address as usize + payload.len() > 0x10000 {
            return Err(ConvError::OverflowsMemoryImage { load_addr: load_address, len: payload.len() });
        }

        Ok((
            SidFile {
                header,
                load_address,
                data: payload.to_vec()
            },
            warnings
        ))
    }

    /// Init entry; 0 falls back to the load address per container convention.
    pub fn init_address(&self) -> u16 {
        if self.header.init_addr == 0 { self.load_address } else { self.header.init_addr }
    }

    pub fn play_address(&self) -> u16 {
        self.header.play_addr
    }

    pub fn to_image(&self) -> Result<MemoryImage, ConvError> {
        let mut image = MemoryImage::new();
        image.load(self.load_address, &self.data)?;
        Ok(image)
    }
}

/// Per-byte classification of the 64 KiB image. Bytes start out unused, are
/// marked code along paths traced from the init/play entries, and data for
/// bytes inside located tables. Code and data must stay disjoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteClass {
    Unused,
    Code,
    Data
}

pub struct MemoryImage {
    bytes: Box<[u8; 0x10000]>,
    class: Box<[ByteClass; 0x10000]>
}
impl MemoryImage {
    pub fn new() -> MemoryImage {
        MemoryImage {
            bytes: Box::new([0; 0x10000]),
            class: Box::new([ByteClass::Unused; 0x10000])
        }
    }

    pub fn load(&mut self, addr: u16, data: &[u8]) -> Result<(), ConvError> {
        if addr as usize + data.len() > 0x10000 {
            return Err(ConvError::OverflowsMemoryImage { load_addr: addr, len: data.len() });
        }
        self.bytes[addr as usize..addr as usize + data.len()].copy_from_slice(data);
        Ok(())
    }

    pub fn byte(&self, addr: u16) -> u8 {
        self.bytes[addr as usize]
    }

    pub fn set_byte(&mut self, addr: u16, value: u8) {
        self.bytes[addr as usize] = value;
    }

    /// Little-endian word read, the 6502 operand order.
    pub fn word_le(&self, addr: u16) -> u16 {
        self.bytes[addr as usize] as u16 | (self.bytes[addr.wrapping_add(1) as usize] as u16) << 8
    }

    pub fn class(&self, addr: u16) -> ByteClass {
        self.class[addr as usize]
    }

    pub fn is_code(&self, addr: u16) -> bool {
        self.class[addr as usize] == ByteClass::Code
    }

    pub fn is_data(&self, addr: u16) -> bool {
        self.class[addr as usize] == ByteClass::Data
    }

    /// Re-marking the same class is idempotent; crossing code and data is a
    /// conflict.
    pub fn mark_code(&mut self, addr: u16) -> Result<(), ConvError> {
        match self.class[addr as usize] {
            ByteClass::Data => Err(ConvError::RelocatorConflict { addr }),
            _ => {
                self.class[addr as usize] = ByteClass::Code;
                Ok(())
            }
        }
    }

    pub fn mark_data(&mut self, addr: u16) -> Result<(), ConvError> {
        match self.class[addr as usize] {
            ByteClass::Code => Err(ConvError::RelocatorConflict { addr }),
            _ => {
                self.class[addr as usize] = ByteClass::Data;
                Ok(())
            }
        }
    }

    pub fn mark_data_range(&mut self, start: u16, len: usize) -> Result<(), ConvError> {
        for i in 0..len {
            self.mark_data(start.wrapping_add(i as u16))?;
        }
        Ok(())
    }

    pub fn slice(&self, start: u16, len: usize) -> &[u8] {
        &self.bytes[start as usize..start as usize + len]
    }
}

#[cfg(test)]
pub mod testutil {
    /// Builds a minimal v2 PSID container around `payload`. `load_addr == 0`
    /// prefixes `real_load` to the payload as the sentinel demands.
    pub fn build_psid(load_addr: u16, real_load: u16, init: u16, play: u16, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(b"PSID");
        out.extend_from_slice(&2u16.to_be_bytes());
        out.extend_from_slice(&0x7Cu16.to_be_bytes());
        out.extend_from_slice(&load_addr.to_be_bytes());
        out.extend_from_slice(&init.to_be_bytes());
        out.extend_from_slice(&play.to_be_bytes());
        out.extend_from_slice(&1u16.to_be_bytes());
        out.extend_from_slice(&1u16.to_be_bytes());
        out.extend_from_slice(&0u32.to_be_bytes());
        out.extend_from_slice(&[0u8; 32]);
        out.extend_from_slice(&[0u8; 32]);
        out.extend_from_slice(&[0u8; 32]);
        out.extend_from_slice(&[0u8; 6]);
        if load_addr == 0 {
            out.extend_from_slice(&real_load.to_le_bytes());
        }
        out.extend_from_slice(payload);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::testutil::build_psid;

    #[test]
    fn rejects_unknown_magic() {
        let mut bytes = build_psid(0x1000, 0, 0x1000, 0x1003, &[0x60]);
        bytes[..4].copy_from_slice(b"MUS!");
        match SidFile::parse(&bytes) {
            Err(ConvError::UnrecognisedContainer(magic)) => assert_eq!(&magic, b"MUS!"),
            other => panic!("expected UnrecognisedContainer, got {:?}", other.map(|_| ()))
        }
    }

    #[test]
    fn direct_load_address() {
        let (sid, warnings) = SidFile::parse(&build_psid(0x1000, 0, 0x1000, 0x1003, &[0x60, 0x60])).unwrap();
        assert_eq!(sid.load_address, 0x1000);
        assert_eq!(sid.data, vec![0x60, 0x60]);
        assert!(warnings.is_empty());
    }

    #[test]
    fn sentinel_load_address_comes_from_payload_prefix() {
        let (sid, _) = SidFile::parse(&build_psid(0, 0x0FFE, 0x0FFE, 0x1001, &[0xEA, 0x60])).unwrap();
        assert_eq!(sid.load_address, 0x0FFE);
        assert_eq!(sid.data, vec![0xEA, 0x60]);
    }

    #[test]
    fn payload_past_end_of_memory_overflows() {
        let payload = vec![0u8; 0x20];
        let bytes = build_psid(0xFFF0, 0, 0xFFF0, 0, &payload);
        match SidFile::parse(&bytes) {
            Err(ConvError::OverflowsMemoryImage { load_addr, len }) => {
                assert_eq!(load_addr, 0xFFF0);
                assert_eq!(len, 0x20);
            },
            other => panic!("expected OverflowsMemoryImage, got {:?}", other.map(|_| ()))
        }
    }

    #[test]
    fn minimal_two_byte_payload_is_accepted() {
        let (sid, _) = SidFile::parse(&build_psid(0x1000, 0, 0x1000, 0, &[0x60, 0x60])).unwrap();
        assert_eq!(sid.data.len(), 2);
    }

    #[test]
    fn non_printable_metadata_is_replaced_not_fatal() {
        let mut bytes = build_psid(0x1000, 0, 0x1000, 0, &[0x60, 0x60]);
        // name field starts at 0x16
        bytes[0x16] = b'A';
        bytes[0x17] = 0x01;
        bytes[0x18] = b'B';
        let (sid, warnings) = SidFile::parse(&bytes).unwrap();
        assert_eq!(sid.header.name, "A?B");
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn classification_conflicts_are_detected() {
        let mut image = MemoryImage::new();
        image.mark_code(0x1000).unwrap();
        image.mark_code(0x1000).unwrap();
        assert!(matches!(image.mark_data(0x1000), Err(ConvError::RelocatorConflict { addr: 0x1000 })));
        image.mark_data(0x1001).unwrap();
        assert!(matches!(image.mark_code(0x1001), Err(ConvError::RelocatorConflict { addr: 0x1001 })));
    }
}
