//! The whole conversion pipeline, composed over the subsystem modules:
//! container parse, code classification, player fingerprint, table
//! location, model decoding, table conversion, relocation and emission.

use crate::dtype::{ConvError, Warnings};
use crate::mos6502::{classify_code, relocate_code};
use crate::np21::{identify_player, locate::LocatedTables, locate::locate_tables, read_model, MusicModel, PlayerId};
use crate::sf2::np21::{convert_filter, convert_instruments, convert_orderlist, convert_pulse, convert_sequence, convert_wavetable, CommandTable};
use crate::sf2::Sf2Assembly;
use crate::sid::{MemoryImage, SidFile};

/// Load address the emitted project image is packed at.
pub const DEFAULT_LOAD_ADDRESS: u16 = 0x0900;

/// Driver handling override, surfaced on the CLI as `--driver`.
/// `Auto` trusts the fingerprint, `Legacy` forces the Laxity conversion
/// even when the fingerprint disagrees, and `Target` is the CLI-side
/// pass-through for files that already carry the target driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DriverChoice {
    #[default]
    Auto,
    Legacy,
    Target
}

#[derive(Debug, Clone)]
pub struct ConvertOptions {
    pub new_load_address: u16,
    pub driver: DriverChoice
}
impl Default for ConvertOptions {
    fn default() -> Self {
        ConvertOptions {
            new_load_address: DEFAULT_LOAD_ADDRESS,
            driver: DriverChoice::Auto
        }
    }
}

#[derive(Debug)]
pub struct ConvertOutput {
    pub bytes: Vec<u8>,
    pub model: MusicModel,
    pub player: PlayerId,
    pub warnings: Warnings
}

struct Analysis {
    image: MemoryImage,
    located: LocatedTables,
    model: MusicModel,
    player: PlayerId
}

/// Shared front half of the pipeline: load, classify, fingerprint, locate,
/// decode. Freezes the image once the tables are marked.
fn analyse(sid: &SidFile, driver: DriverChoice, warnings: &mut Warnings) -> Result<Analysis, ConvError> {
    let mut image = sid.to_image()?;
    let loaded = sid.load_address as u32..sid.load_address as u32 + sid.data.len() as u32;

    let mut entries = vec![sid.init_address()];
    if sid.play_address() != 0 {
        entries.push(sid.play_address());
    }
    classify_code(&mut image, &entries, loaded.clone())?;

    let player = identify_player(&image, sid.init_address(), loaded.clone());
    match (driver, player) {
        (DriverChoice::Legacy, _) => {},
        (_, PlayerId::LaxityV21) => {},
        (_, other) => return Err(ConvError::UnsupportedPlayer(other.to_string()))
    }

    let located = locate_tables(&mut image, loaded.clone(), warnings)?;
    let model = read_model(&image, &located, warnings)?;
    Ok(Analysis { image, located, model, player })
}

/// Decode-only entry point; what the `to-xml` CLI subcommand consumes.
pub fn decode_model(input: &[u8]) -> Result<(MusicModel, Warnings), ConvError> {
    let (sid, mut warnings) = SidFile::parse(input)?;
    let analysis = analyse(&sid, DriverChoice::Auto, &mut warnings)?;
    Ok((analysis.model, warnings))
}

pub trait FromNp21Once {
    /// Fills the assembly from a parsed source file. The "once" matters:
    /// the assembly must be freshly defaulted, previously filled payloads
    /// are overwritten wholesale.
    fn from_np21_once(&mut self, sid: &SidFile, options: &ConvertOptions) -> Result<(MusicModel, PlayerId, Warnings), ConvError>;
}

impl FromNp21Once for Sf2Assembly {
    fn from_np21_once(&mut self, sid: &SidFile, options: &ConvertOptions) -> Result<(MusicModel, PlayerId, Warnings), ConvError> {
        let mut warnings = Warnings::new();
        let Analysis { mut image, located, model, player } = analyse(sid, options.driver, &mut warnings)?;
        let loaded = sid.load_address as u32..sid.load_address as u32 + sid.data.len() as u32;

        // Driver extent: origin up to the first located data byte.
        let mut driver_end = loaded.end;
        for base in [
            located.instruments.base,
            located.wavetable.base,
            located.pulse.base,
            located.filter.base,
            located.sequences.base,
            located.sequence_hi_base
        ] {
            driver_end = driver_end.min(base as u32);
        }
        for &addr in located.sequence_addrs.iter().chain(located.orderlist_addrs.iter()) {
            driver_end = driver_end.min(addr as u32);
        }
        if driver_end <= loaded.start {
            return Err(ConvError::Invalid("located tables leave no room for driver code".to_string()));
        }

        let delta = options.new_load_address as i32 - sid.load_address as i32;
        relocate_code(&mut image, loaded.clone(), loaded.clone(), delta);

        self.load_address = options.new_load_address;
        self.driver = image.slice(sid.load_address, (driver_end - loaded.start) as usize).to_vec();
        self.driver_type = 1;
        self.driver_name = "Laxity NewPlayer v21 (converted)".to_string();
        self.init_offset = sid.init_address().wrapping_sub(sid.load_address);
        self.play_offset = if sid.play_address() != 0 {
            sid.play_address().wrapping_sub(sid.load_address)
        } else {
            self.init_offset
        };

        let mut commands = CommandTable::new();
        self.sequences = model
            .sequences
            .iter()
            .map(|sequence| convert_sequence(sequence, &mut commands, &mut warnings))
            .collect();
        self.commands = commands.to_blob();
        self.command_rows = commands.rows() as u16;

        self.instruments = convert_instruments(&model, &mut warnings);
        self.wavetable = convert_wavetable(&model.wavetable);
        self.wave_rows = model.wavetable.len() as u16;
        self.pulse = convert_pulse(&model.pulse, &mut warnings);
        self.pulse_rows = model.pulse.len() as u16;
        self.filter = convert_filter(&model.filter, &mut warnings);
        self.filter_rows = model.filter.len() as u16;

        self.orderlists = model.orderlists.iter().map(convert_orderlist).collect();
        while self.orderlists.len() < 3 {
            self.orderlists.push(vec![crate::np21::ORDERLIST_END, 0]);
        }

        Ok((model, player, warnings))
    }
}

/// One-shot conversion: source file bytes in, target file bytes plus the
/// decoded model and accumulated warnings out. Pure function of its input;
/// no global state, no I/O.
pub fn convert(input: &[u8], options: &ConvertOptions) -> Result<ConvertOutput, ConvError> {
    let (sid, mut warnings) = SidFile::parse(input)?;
    let mut assembly = Sf2Assembly::default();
    let (model, player, more) = assembly.from_np21_once(&sid, options)?;
    warnings.extend(more);
    let bytes = assembly.emit()?;
    Ok(ConvertOutput { bytes, model, player, warnings })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sid::testutil::build_psid;

    const LOAD: u16 = 0x1000;
    const PLAY_OFF: usize = 0x40;

    // data layout inside the fixture payload, offsets from the load address
    const INSTR_TAB: usize = 0x200;
    const WAVE_TAB: usize = 0x220;
    const PULSE_TAB: usize = 0x230;
    const FILTER_TAB: usize = 0x240;
    const SEQ_LO: usize = 0x250;
    const SEQ_HI: usize = 0x252;
    const ORD_LO: usize = 0x254;
    const ORD_HI: usize = 0x257;
    const SEQ0: usize = 0x260;
    const SEQ1: usize = 0x268;
    const ORD0: usize = 0x270;
    const ORD1: usize = 0x276;
    const ORD2: usize = 0x27C;
    const PAYLOAD_LEN: usize = 0x280;

    fn abs(off: usize) -> [u8; 2] {
        ((LOAD as usize + off) as u16).to_le_bytes()
    }

    fn splice(p: &mut [u8], at: &mut usize, bytes: &[u8]) {
        p[*at..*at + bytes.len()].copy_from_slice(bytes);
        *at += bytes.len();
    }

    /// Builds a miniature but complete NewPlayer-shaped image: init code
    /// carrying the fingerprint signature, a play routine exercising every
    /// table access signature, and the five data tables.
    fn build_fixture_payload() -> Vec<u8> {
        let mut p = vec![0xFF; PAYLOAD_LEN];
        let mut at = 0;

        // init: LDA #$00 / STA $D404, register clear loop, RTS
        splice(&mut p, &mut at, &[0xA9, 0x00, 0x8D, 0x04, 0xD4]);
        splice(&mut p, &mut at, &[0xA2, 0x18, 0xA0, 0x07]);
        splice(&mut p, &mut at, &[0x99, 0x00, 0xD4, 0x88, 0x10, 0xFA, 0x60]);

        // play routine
        at = PLAY_OFF;
        for k in 0..8u8 {
            let read = abs(INSTR_TAB + k as usize);
            splice(&mut p, &mut at, &[0xB9, read[0], read[1], 0x9D, k, 0x04]);
        }
        let wave0 = abs(WAVE_TAB);
        let wave1 = abs(WAVE_TAB + 1);
        splice(&mut p, &mut at, &[0xB9, wave0[0], wave0[1], 0xC9, 0x7E, 0xF0, 0x00]);
        splice(&mut p, &mut at, &[0xB9, wave1[0], wave1[1], 0xC9, 0x7F, 0xF0, 0x00]);
        let pulse0 = abs(PULSE_TAB);
        let pulse1 = abs(PULSE_TAB + 1);
        splice(&mut p, &mut at, &[0xB9, pulse0[0], pulse0[1], 0x79, pulse1[0], pulse1[1], 0xC8, 0xC8, 0xC8, 0xC8]);
        let filt = abs(FILTER_TAB);
        splice(&mut p, &mut at, &[0xB9, filt[0], filt[1], 0x8D, 0x16, 0xD4, 0x8D, 0x17, 0xD4, 0x8D, 0x18, 0xD4]);
        let seq_lo = abs(SEQ_LO);
        let seq_hi = abs(SEQ_HI);
        splice(&mut p, &mut at, &[0xB9, seq_lo[0], seq_lo[1], 0x85, 0xFB, 0xB9, seq_hi[0], seq_hi[1], 0x85, 0xFC, 0xB1, 0xFB]);
        let ord_lo = abs(ORD_LO);
        let ord_hi = abs(ORD_HI);
        splice(&mut p, &mut at, &[0xBD, ord_lo[0], ord_lo[1], 0x85, 0xFD, 0xBD, ord_hi[0], ord_hi[1], 0x85, 0xFE]);
        splice(&mut p, &mut at, &[0x60]);

        // instruments: two 8-byte records, 0xFF filler ends the scan
        p[INSTR_TAB..INSTR_TAB + 8].copy_from_slice(&[0x12, 0xF0, 0x80, 0x00, 0x01, 0x04, 0x00, 0x00]);
        p[INSTR_TAB + 8..INSTR_TAB + 16].copy_from_slice(&[0x34, 0x89, 0x10, 0x00, 0x00, 0x00, 0x00, 0x02]);

        // wavetable: two notes, a stop, a jump back to entry 0
        p[WAVE_TAB..WAVE_TAB + 8].copy_from_slice(&[0x00, 0x21, 0x0C, 0x41, 0x7E, 0x00, 0x7F, 0x00]);

        // pulse: two entries plus the all-zero end marker
        p[PULSE_TAB..PULSE_TAB + 12].copy_from_slice(&[0x80, 0x00, 0x10, 0x04, 0x20, 0x01, 0x08, 0x00, 0x00, 0x00, 0x00, 0x00]);

        // filter: two entries plus the all-zero end marker
        p[FILTER_TAB..FILTER_TAB + 12].copy_from_slice(&[0x5A, 0x02, 0x08, 0x04, 0x30, 0x00, 0x04, 0x00, 0x00, 0x00, 0x00, 0x00]);

        // sequence pointers (lo then hi), spacing gives the count
        let s0 = abs(SEQ0);
        let s1 = abs(SEQ1);
        p[SEQ_LO] = s0[0];
        p[SEQ_LO + 1] = s1[0];
        p[SEQ_HI] = s0[1];
        p[SEQ_HI + 1] = s1[1];

        // order list pointers per voice
        for (slot, off) in [ORD0, ORD1, ORD2].iter().enumerate() {
            let a = abs(*off);
            p[ORD_LO + slot] = a[0];
            p[ORD_HI + slot] = a[1];
        }

        p[SEQ0..SEQ0 + 4].copy_from_slice(&[0x82, 0xA0, 0x0C, 0x7F]);
        p[SEQ1..SEQ1 + 4].copy_from_slice(&[0xC1, 0x20, 0x0C, 0x7F]);
        p[ORD0..ORD0 + 4].copy_from_slice(&[0xA0, 0x00, 0xFF, 0x00]);
        p[ORD1..ORD1 + 4].copy_from_slice(&[0xA0, 0x01, 0xFF, 0x00]);
        p[ORD2..ORD2 + 4].copy_from_slice(&[0xA7, 0x00, 0xFF, 0x00]);

        p
    }

    fn build_fixture() -> Vec<u8> {
        build_psid(LOAD, 0, LOAD, LOAD + PLAY_OFF as u16, &build_fixture_payload())
    }

    #[test]
    fn full_pipeline_converts_the_fixture() {
        let input = build_fixture();
        let output = convert(&input, &ConvertOptions::default()).unwrap();

        assert_eq!(output.player, PlayerId::LaxityV21);
        assert_eq!(output.model.instruments.len(), 2);
        assert_eq!(output.model.wavetable.len(), 4);
        assert_eq!(output.model.pulse.len(), 2);
        assert_eq!(output.model.filter.len(), 2);
        assert_eq!(output.model.sequences.len(), 2);
        assert_eq!(output.model.orderlists.len(), 3);

        // duration 3 note plus two sustains in sequence 0
        assert_eq!(output.model.sequences[0].rows.len(), 3);
        assert_eq!(output.model.sequences[0].rows[0].instrument, Some(0));
        // command with captured parameter in sequence 1
        assert_eq!(output.model.sequences[1].rows[0].command, Some(1));
        assert_eq!(output.model.sequences[1].rows[0].command_param, 0x20);
    }

    #[test]
    fn emitted_file_is_repacked_at_the_new_load_address() {
        let input = build_fixture();
        let output = convert(&input, &ConvertOptions::default()).unwrap();
        let bytes = &output.bytes;

        assert_eq!(&bytes[..2], &DEFAULT_LOAD_ADDRESS.to_le_bytes());
        // driver code copied from the origin, unrelocatable bytes intact
        assert_eq!(&bytes[2..7], &[0xA9, 0x00, 0x8D, 0x04, 0xD4]);

        // the first instrument-table read had its absolute operand moved by
        // delta = 0x0900 - 0x1000
        let read_off = 2 + PLAY_OFF;
        assert_eq!(bytes[read_off], 0xB9);
        let patched = u16::from_le_bytes([bytes[read_off + 1], bytes[read_off + 2]]);
        assert_eq!(patched, (LOAD as usize + INSTR_TAB) as u16 - 0x700);

        // magic word and a terminated descriptor chain follow the driver
        let driver_len = INSTR_TAB; // tables start at the first data byte
        let magic_off = 2 + driver_len;
        assert_eq!(&bytes[magic_off..magic_off + 2], &[0x37, 0x13]);
        assert!(crate::sf2::descriptor_chain_parseable(&bytes[magic_off + 2..]));
    }

    #[test]
    fn non_laxity_input_is_rejected_as_unsupported() {
        let input = build_psid(LOAD, 0, LOAD, 0, &[0xA9, 0x01, 0x60, 0xFF, 0xFF, 0xFF]);
        match convert(&input, &ConvertOptions::default()) {
            Err(ConvError::UnsupportedPlayer(_)) => {},
            other => panic!("expected UnsupportedPlayer, got {:?}", other.map(|_| ()))
        }
    }

    #[test]
    fn decode_model_matches_convert_model() {
        let input = build_fixture();
        let (model, _) = decode_model(&input).unwrap();
        let output = convert(&input, &ConvertOptions::default()).unwrap();
        assert_eq!(model.instruments.len(), output.model.instruments.len());
        assert_eq!(model.sequences.len(), output.model.sequences.len());
    }
}
