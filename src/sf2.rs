use bevy_reflect::Reflect;
use byteorder::{WriteBytesExt, LittleEndian};

use crate::dtype::{AutoReadWrite, ConvError, ReadWrite};

pub mod np21;

/// Marker word the target driver searches for; the descriptor chain starts
/// right behind it.
pub const SF2_MAGIC: u16 = 0x1337;

pub const BLOCK_DRIVER: u8 = 0x01;
pub const BLOCK_DRIVER_COMMON: u8 = 0x02;
pub const BLOCK_DRIVER_TABLES: u8 = 0x03;
pub const BLOCK_INSTRUMENT_DESCRIPTOR: u8 = 0x04;
pub const BLOCK_MUSIC_DATA: u8 = 0x05;
pub const BLOCK_END: u8 = 0xFF;

pub const TABLE_TYPE_GENERIC: u8 = 0x00;
pub const TABLE_TYPE_INSTRUMENTS: u8 = 0x80;
pub const TABLE_TYPE_COMMANDS: u8 = 0x81;

/// Rows the instrument table always occupies in the editor.
pub const INSTRUMENT_ROWS: usize = 32;
pub const INSTRUMENT_COLS: usize = 6;

/// Quick structural check used by the player fingerprinter: does `bytes`
/// start a well-formed chain of `{id, size, payload}` records ending in the
/// 0xFF terminator?
pub fn descriptor_chain_parseable(bytes: &[u8]) -> bool {
    let mut pos = 0;
    for _ in 0..32 {
        let Some(&id) = bytes.get(pos) else { return false };
        if id == BLOCK_END {
            return true;
        }
        let Some(&size) = bytes.get(pos + 1) else { return false };
        pos += 2 + size as usize;
        if pos > bytes.len() {
            return false;
        }
    }
    false
}

/// One `{id, size, payload}` record of the header chain.
#[derive(Debug, Clone)]
pub struct DescriptorBlock {
    pub id: u8,
    pub payload: Vec<u8>
}
impl DescriptorBlock {
    pub fn byte_len(&self) -> usize {
        2 + self.payload.len()
    }
    pub fn write_to(&self, out: &mut Vec<u8>) -> Result<(), ConvError> {
        if self.payload.len() > 0xFF {
            return Err(ConvError::DescriptorBlockTooLarge { id: self.id, size: self.payload.len() });
        }
        out.push(self.id);
        out.push(self.payload.len() as u8);
        out.extend_from_slice(&self.payload);
        Ok(())
    }
}

/// Fixed-layout driver-common block: every address cell the editor pokes
/// or peeks while driving the player, all little-endian and already
/// relocated. Cells the converted driver does not expose stay zero.
#[derive(Debug, Default, Reflect)]
pub struct DriverCommonBlock {
    pub init: u16,
    pub stop: u16,
    pub play: u16,
    pub orderlist_v1: u16,
    pub orderlist_v2: u16,
    pub orderlist_v3: u16,
    pub current_seq_v1: u16,
    pub current_seq_v2: u16,
    pub current_seq_v3: u16,
    pub seq_ptr_lo: u16,
    pub seq_ptr_hi: u16,
    pub instruments_addr: u16,
    pub commands_addr: u16,
    pub wavetable_addr: u16,
    pub pulse_addr: u16,
    pub filter_addr: u16,
    pub command_count_addr: u16,
    pub tick_counter_addr: u16,
    pub play_state_addr: u16,
    pub trigger_sync: u8,
    pub reserved0: u8,
    pub reserved1: u8,
    pub reserved2: u8
}
impl AutoReadWrite for DriverCommonBlock {  }

/// Per-table record inside the 0x03 driver-tables block.
#[derive(Debug, Clone, Default)]
pub struct TableDescriptor {
    pub table_type: u8,
    pub id: u8,
    pub name: String,
    pub layout: u8,
    pub flags: u8,
    pub insert_rule: u8,
    pub enter_rule: u8,
    pub color_rule: u8,
    pub addr: u16,
    pub cols: u16,
    pub rows: u16
}
impl TableDescriptor {
    pub fn byte_len(&self) -> usize {
        3 + self.name.len() + 5 + 6
    }
    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.push(self.table_type);
        out.push(self.id);
        out.push(self.name.len() as u8);
        out.extend_from_slice(self.name.as_bytes());
        out.push(self.layout);
        out.push(self.flags);
        out.push(self.insert_rule);
        out.push(self.enter_rule);
        out.push(self.color_rule);
        out.extend_from_slice(&self.addr.to_le_bytes());
        out.extend_from_slice(&self.cols.to_le_bytes());
        out.extend_from_slice(&self.rows.to_le_bytes());
    }
}

/// Column metadata for the editor's instrument pane (0x04 block).
#[derive(Debug, Clone, Copy)]
pub struct InstrumentColumn {
    pub data_kind: u8,
    pub char_width: u8
}

const INSTRUMENT_COLUMNS: [InstrumentColumn; INSTRUMENT_COLS] = [
    InstrumentColumn { data_kind: 0x00, char_width: 2 }, // attack/decay
    InstrumentColumn { data_kind: 0x00, char_width: 2 }, // sustain/release
    InstrumentColumn { data_kind: 0x01, char_width: 2 }, // flags
    InstrumentColumn { data_kind: 0x02, char_width: 2 }, // filter pointer
    InstrumentColumn { data_kind: 0x02, char_width: 2 }, // pulse pointer
    InstrumentColumn { data_kind: 0x02, char_width: 2 }  // wave pointer
];

/// Resolved locations of every payload inside the emitted image.
#[derive(Debug, Clone, Default)]
struct LayoutAddrs {
    instruments: u16,
    commands: u16,
    wavetable: u16,
    pulse: u16,
    filter: u16,
    seq_lo: u16,
    seq_hi: u16,
    sequences: Vec<u16>,
    orderlists: Vec<u16>
}

/// All converted payloads plus the relocated driver, ready for packing at
/// the new load address.
#[derive(Debug, Default)]
pub struct Sf2Assembly {
    pub load_address: u16,
    pub driver: Vec<u8>,
    pub driver_type: u8,
    pub driver_name: String,
    /// Entry offsets relative to the start of the driver.
    pub init_offset: u16,
    pub play_offset: u16,
    pub instruments: Vec<u8>,
    pub commands: Vec<u8>,
    pub command_rows: u16,
    pub wavetable: Vec<u8>,
    pub wave_rows: u16,
    pub pulse: Vec<u8>,
    pub pulse_rows: u16,
    pub filter: Vec<u8>,
    pub filter_rows: u16,
    pub sequences: Vec<Vec<u8>>,
    pub orderlists: Vec<Vec<u8>>
}
impl Sf2Assembly {
    /// Sequence-pointer entries the head 0x05 block can carry next to the
    /// counts and the per-track order-list addresses.
    const MUSIC_HEAD_CAPACITY: usize = (0xFF - 9) / 2;
    const MUSIC_CONT_CAPACITY: usize = (0xFF - 1) / 2;

    fn layout(&self) -> Result<LayoutAddrs, ConvError> {
        // Block sizes do not depend on the address values, so sizing with a
        // zeroed layout is exact.
        let chain_len: usize = self.build_blocks(&LayoutAddrs::default())?
            .iter()
            .map(|b| b.byte_len())
            .sum();
        let mut at = self.load_address as u32 + self.driver.len() as u32 + 2 + chain_len as u32;
        let mut addrs = LayoutAddrs::default();
        let mut place = |len: usize| {
            let here = at as u16;
            at += len as u32;
            here
        };
        addrs.instruments = place(self.instruments.len());
        addrs.commands = place(self.commands.len());
        addrs.wavetable = place(self.wavetable.len());
        addrs.pulse = place(self.pulse.len());
        addrs.filter = place(self.filter.len());
        addrs.seq_lo = place(self.sequences.len());
        addrs.seq_hi = place(self.sequences.len());
        for seq in &self.sequences {
            addrs.sequences.push(place(seq.len()));
        }
        for list in &self.orderlists {
            addrs.orderlists.push(place(list.len()));
        }
        Ok(addrs)
    }

    fn build_blocks(&self, addrs: &LayoutAddrs) -> Result<Vec<DescriptorBlock>, ConvError> {
        let mut blocks = Vec::new();

        let mut payload = Vec::new();
        payload.push(self.driver_type);
        payload.extend_from_slice(&(self.driver.len() as u16).to_le_bytes());
        payload.extend_from_slice(self.driver_name.as_bytes());
        payload.push(0);
        blocks.push(DescriptorBlock { id: BLOCK_DRIVER, payload });

        let common = DriverCommonBlock {
            init: self.load_address.wrapping_add(self.init_offset),
            stop: self.load_address.wrapping_add(self.init_offset),
            play: self.load_address.wrapping_add(self.play_offset),
            orderlist_v1: addrs.orderlists.first().copied().unwrap_or(0),
            orderlist_v2: addrs.orderlists.get(1).copied().unwrap_or(0),
            orderlist_v3: addrs.orderlists.get(2).copied().unwrap_or(0),
            seq_ptr_lo: addrs.seq_lo,
            seq_ptr_hi: addrs.seq_hi,
            instruments_addr: addrs.instruments,
            commands_addr: addrs.commands,
            wavetable_addr: addrs.wavetable,
            pulse_addr: addrs.pulse,
            filter_addr: addrs.filter,
            ..DriverCommonBlock::default()
        };
        let mut payload = Vec::new();
        common.write_to(&mut payload)?;
        blocks.push(DescriptorBlock { id: BLOCK_DRIVER_COMMON, payload });

        let tables = [
            TableDescriptor {
                table_type: TABLE_TYPE_INSTRUMENTS,
                id: 0,
                name: "Instruments".to_string(),
                layout: 1,
                addr: addrs.instruments,
                cols: INSTRUMENT_COLS as u16,
                rows: INSTRUMENT_ROWS as u16,
                ..TableDescriptor::default()
            },
            TableDescriptor {
                table_type: TABLE_TYPE_COMMANDS,
                id: 1,
                name: "Commands".to_string(),
                layout: 1,
                addr: addrs.commands,
                cols: 2,
                rows: self.command_rows,
                ..TableDescriptor::default()
            },
            TableDescriptor {
                table_type: TABLE_TYPE_GENERIC,
                id: 2,
                name: "Wave".to_string(),
                layout: 0,
                addr: addrs.wavetable,
                cols: 2,
                rows: self.wave_rows,
                ..TableDescriptor::default()
            },
            TableDescriptor {
                table_type: TABLE_TYPE_GENERIC,
                id: 3,
                name: "Pulse".to_string(),
                layout: 0,
                addr: addrs.pulse,
                cols: 4,
                rows: self.pulse_rows,
                ..TableDescriptor::default()
            },
            TableDescriptor {
                table_type: TABLE_TYPE_GENERIC,
                id: 4,
                name: "Filter".to_string(),
                layout: 0,
                addr: addrs.filter,
                cols: 4,
                rows: self.filter_rows,
                ..TableDescriptor::default()
            }
        ];
        let mut payload = Vec::new();
        for table in &tables {
            table.write_to(&mut payload);
        }
        blocks.push(DescriptorBlock { id: BLOCK_DRIVER_TABLES, payload });

        let mut payload = Vec::new();
        payload.push(INSTRUMENT_COLS as u8);
        for column in &INSTRUMENT_COLUMNS {
            payload.push(column.data_kind);
            payload.push(column.char_width);
        }
        blocks.push(DescriptorBlock { id: BLOCK_INSTRUMENT_DESCRIPTOR, payload });

        // 0x05 music data, split into continuation blocks when the
        // sequence-pointer list outgrows the length byte.
        let mut payload = Vec::new();
        payload.push(self.orderlists.len() as u8);
        payload.push(self.sequences.len() as u8);
        for i in 0..3 {
            payload.extend_from_slice(&addrs.orderlists.get(i).copied().unwrap_or(0).to_le_bytes());
        }
        payload.push(0); // start index of the pointer run below
        let head_count = addrs.sequences.len().min(Self::MUSIC_HEAD_CAPACITY);
        for addr in &addrs.sequences[..head_count] {
            payload.extend_from_slice(&addr.to_le_bytes());
        }
        blocks.push(DescriptorBlock { id: BLOCK_MUSIC_DATA, payload });
        let mut next = head_count;
        while next < addrs.sequences.len() {
            let run = (addrs.sequences.len() - next).min(Self::MUSIC_CONT_CAPACITY);
            let mut payload = Vec::new();
            payload.push(next as u8);
            for addr in &addrs.sequences[next..next + run] {
                payload.extend_from_slice(&addr.to_le_bytes());
            }
            blocks.push(DescriptorBlock { id: BLOCK_MUSIC_DATA, payload });
            next += run;
        }

        blocks.push(DescriptorBlock { id: BLOCK_END, payload: Vec::new() });
        Ok(blocks)
    }

    /// Emits the complete target file: load-address prefix, relocated
    /// driver, magic word, descriptor chain, table payloads, the rebuilt
    /// sequence pointer arrays, sequence data and order lists.
    pub fn emit(&self) -> Result<Vec<u8>, ConvError> {
        let addrs = self.layout()?;
        let blocks = self.build_blocks(&addrs)?;

        let mut out = Vec::new();
        out.write_u16::<LittleEndian>(self.load_address)?;
        out.extend_from_slice(&self.driver);
        out.write_u16::<LittleEndian>(SF2_MAGIC)?;
        for block in &blocks {
            block.write_to(&mut out)?;
        }
        out.extend_from_slice(&self.instruments);
        out.extend_from_slice(&self.commands);
        out.extend_from_slice(&self.wavetable);
        out.extend_from_slice(&self.pulse);
        out.extend_from_slice(&self.filter);
        for addr in &addrs.sequences {
            out.push((addr & 0xFF) as u8);
        }
        for addr in &addrs.sequences {
            out.push((addr >> 8) as u8);
        }
        for seq in &self.sequences {
            out.extend_from_slice(seq);
        }
        for list in &self.orderlists {
            out.extend_from_slice(list);
        }

        let end = self.load_address as u32 + (out.len() - 2) as u32;
        if end > 0x10000 {
            return Err(ConvError::OverflowsMemoryImage { load_addr: self.load_address, len: out.len() - 2 });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_parse_accepts_terminated_chains() {
        assert!(descriptor_chain_parseable(&[0x01, 0x02, 0xAA, 0xBB, 0xFF, 0x00]));
        assert!(descriptor_chain_parseable(&[0xFF]));
    }

    #[test]
    fn chain_parse_rejects_truncated_chains() {
        assert!(!descriptor_chain_parseable(&[0x01, 0x10, 0xAA]));
        assert!(!descriptor_chain_parseable(&[0x01]));
        assert!(!descriptor_chain_parseable(&[]));
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let block = DescriptorBlock { id: 0x03, payload: vec![0; 0x100] };
        let mut out = Vec::new();
        assert!(matches!(
            block.write_to(&mut out),
            Err(ConvError::DescriptorBlockTooLarge { id: 0x03, size: 0x100 })
        ));
    }

    #[test]
    fn driver_common_block_is_42_bytes() {
        let mut buf = Vec::new();
        let written = DriverCommonBlock::default().write_to(&mut buf).unwrap();
        assert_eq!(written, 42);
        assert_eq!(buf.len(), 42);
    }

    fn small_assembly() -> Sf2Assembly {
        Sf2Assembly {
            load_address: 0x0900,
            driver: vec![0x60; 0x20],
            driver_type: 1,
            driver_name: "np21".to_string(),
            init_offset: 0,
            play_offset: 3,
            instruments: vec![0; INSTRUMENT_COLS * INSTRUMENT_ROWS],
            commands: vec![0; 4],
            command_rows: 2,
            wavetable: vec![0x21, 0x00, 0x00, 0x7F],
            wave_rows: 2,
            pulse: vec![0; 8],
            pulse_rows: 2,
            filter: vec![0; 4],
            filter_rows: 1,
            sequences: vec![vec![1, 0, 0x80, 0x80, 0x0C], vec![1, 0, 0x80, 0x80, 0x0D]],
            orderlists: vec![vec![0xA0, 0x00, 0xFF, 0x00]; 3]
        }
    }

    #[test]
    fn emitted_image_starts_with_load_address_and_driver() {
        let assembly = small_assembly();
        let bytes = assembly.emit().unwrap();
        assert_eq!(&bytes[..2], &[0x00, 0x09]);
        assert_eq!(&bytes[2..2 + 0x20], &vec![0x60; 0x20][..]);
        // magic right after the driver
        assert_eq!(bytes[2 + 0x20], 0x37);
        assert_eq!(bytes[2 + 0x20 + 1], 0x13);
        // first block is the driver descriptor
        assert_eq!(bytes[2 + 0x20 + 2], BLOCK_DRIVER);
    }

    #[test]
    fn chain_in_emitted_image_is_parseable_and_terminated() {
        let bytes = small_assembly().emit().unwrap();
        let chain_start = 2 + 0x20 + 2;
        assert!(descriptor_chain_parseable(&bytes[chain_start..]));
    }

    #[test]
    fn table_addresses_point_at_emitted_payloads() {
        let assembly = small_assembly();
        let addrs = assembly.layout().unwrap();
        let bytes = assembly.emit().unwrap();
        // file offset of an address: 2-byte prefix + (addr - load)
        let off = |addr: u16| 2 + (addr - assembly.load_address) as usize;
        assert_eq!(&bytes[off(addrs.wavetable)..off(addrs.wavetable) + 4], &[0x21, 0x00, 0x00, 0x7F]);
        assert_eq!(bytes[off(addrs.sequences[0])], 1);
        // lo/hi pointer arrays agree with the sequence addresses
        assert_eq!(bytes[off(addrs.seq_lo)], (addrs.sequences[0] & 0xFF) as u8);
        assert_eq!(bytes[off(addrs.seq_hi)], (addrs.sequences[0] >> 8) as u8);
    }

    #[test]
    fn long_sequence_lists_split_into_continuation_blocks() {
        let mut assembly = small_assembly();
        assembly.sequences = (0..200).map(|i| vec![1, 0, 0x80, 0x80, i as u8 & 0x3F]).collect();
        let addrs = assembly.layout().unwrap();
        let blocks = assembly.build_blocks(&addrs).unwrap();
        let music_blocks: Vec<_> = blocks.iter().filter(|b| b.id == BLOCK_MUSIC_DATA).collect();
        assert!(music_blocks.len() > 1);
        for block in &music_blocks {
            assert!(block.payload.len() <= 0xFF);
        }
        // continuation starts where the head stopped
        assert_eq!(music_blocks[1].payload[0] as usize, Sf2Assembly::MUSIC_HEAD_CAPACITY);
        assert_eq!(blocks.last().unwrap().id, BLOCK_END);
    }
}
