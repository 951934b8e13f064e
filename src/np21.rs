use std::fmt::Display;
use std::io::Cursor;
use std::ops::Range;
use bevy_reflect::Reflect;
use bitflags::bitflags;
use serde::Serialize;

use crate::dtype::{AutoReadWrite, ConvError, ReadWrite, Warnings};
use crate::sid::MemoryImage;

pub mod locate;

/// Closed sum over the player formats the fingerprinter can tell apart.
/// Adding a player means extending this enum and `identify_player`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerId {
    LaxityV21,
    UnknownSf2Exported,
    UnknownOther
}
impl Display for PlayerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlayerId::LaxityV21 => write!(f, "Laxity NewPlayer v21"),
            PlayerId::UnknownSf2Exported => write!(f, "SF2-exported driver"),
            PlayerId::UnknownOther => write!(f, "unidentified player")
        }
    }
}

const LAXITY_BANNER: &[u8] = b"X-PLAYER BY LAXITY";

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn find_subsequence_nocase(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w.eq_ignore_ascii_case(needle))
}

/// Classifies the loaded image. Signature checks are evaluated in order and
/// the first match wins; code signatures outrank header metadata because
/// author names lie (one widely spread tune is *authored* by Laxity but was
/// compiled by a different player).
pub fn identify_player(image: &MemoryImage, init_addr: u16, loaded: Range<u32>) -> PlayerId {
    let len = (loaded.end - loaded.start) as usize;
    let data = image.slice(loaded.start as u16, len);

    // Rule 1: textual marker inside the loaded data.
    if find_subsequence(data, LAXITY_BANNER).is_some() || find_subsequence_nocase(data, b"LAXITY").is_some() {
        return PlayerId::LaxityV21;
    }

    // Rule 2: LDA #$00 / STA $D404 within 16 bytes of the init entry, plus
    // the per-voice register loop (LDY #$07 ... BPL) seeded with LDX #$18.
    let init_off = (init_addr as u32).saturating_sub(loaded.start) as usize;
    if init_off < len {
        let window_end = (init_off + 16 + 5).min(len);
        let init_window = &data[init_off..window_end];
        if find_subsequence(init_window, &[0xA9, 0x00, 0x8D, 0x04, 0xD4]).is_some()
            && has_register_clear_loop(data)
        {
            return PlayerId::LaxityV21;
        }
    }

    // Rule 3: an embedded SF2 export marker followed by a parseable
    // descriptor chain means the file came out of the target editor
    // already; that is a pass-through case, not a conversion.
    let probe = &data[..len.min(0x1000)];
    for off in (0..probe.len().saturating_sub(1)).step_by(2) {
        if probe[off] == 0x37 && probe[off + 1] == 0x13 {
            let chain_start = off + 4;
            if chain_start < len && crate::sf2::descriptor_chain_parseable(&data[chain_start..]) {
                return PlayerId::UnknownSf2Exported;
            }
        }
    }

    PlayerId::UnknownOther
}

/// `LDY #$07 ... BPL` within a short window, with an `LDX #$18` nearby.
fn has_register_clear_loop(data: &[u8]) -> bool {
    for off in 0..data.len().saturating_sub(2) {
        if data[off] == 0xA0 && data[off + 1] == 0x07 {
            let branch_window = &data[off..(off + 16).min(data.len())];
            let x_window = &data[off.saturating_sub(16)..(off + 32).min(data.len())];
            if branch_window.iter().any(|&b| b == 0x10)
                && find_subsequence(x_window, &[0xA2, 0x18]).is_some()
            {
                return true;
            }
        }
    }
    false
}

bitflags! {
    /// Restart behaviour packed into an instrument's third byte.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RestartFlags: u8 {
        const HARD_RESTART = 0x80;
        const OSC_RESET = 0x10;
    }
}

/// One packed 8-byte instrument record, in source byte order.
#[derive(Debug, Clone, Copy, Default, Reflect, Serialize)]
pub struct Instrument {
    #[serde(rename = "@ad")]
    pub attack_decay: u8,
    #[serde(rename = "@sr")]
    pub sustain_release: u8,
    #[serde(rename = "@restart")]
    pub restart_flags: u8,
    #[serde(rename = "@filter")]
    pub filter_byte: u8,
    #[serde(rename = "@filter_ptr")]
    pub filter_ptr: u8,
    /// Indexes the pulse table pre-multiplied by four.
    #[serde(rename = "@pulse_ptr")]
    pub pulse_ptr: u8,
    #[serde(rename = "@pulse_property")]
    pub pulse_property: u8,
    #[serde(rename = "@wave_ptr")]
    pub wave_ptr: u8
}
impl AutoReadWrite for Instrument {  }
impl Instrument {
    pub fn restart(&self) -> RestartFlags {
        RestartFlags::from_bits_retain(self.restart_flags)
    }
    pub fn uses_filter(&self) -> bool {
        self.filter_ptr != 0
    }
}

pub const WAVE_STOP: u8 = 0x7E;
pub const WAVE_JUMP: u8 = 0x7F;

/// Wavetable entry: note/control byte plus waveform. The table is a forest
/// of chains linked by jump entries (the waveform byte doubles as the jump
/// target); cycles are how loops are encoded, so they are legal.
#[derive(Debug, Clone, Copy, Default, Reflect, Serialize)]
pub struct WaveEntry {
    #[serde(rename = "@note")]
    pub note: u8,
    #[serde(rename = "@waveform")]
    pub waveform: u8
}
impl AutoReadWrite for WaveEntry {  }
impl WaveEntry {
    pub fn is_stop(&self) -> bool {
        self.note == WAVE_STOP
    }
    pub fn is_jump(&self) -> bool {
        self.note == WAVE_JUMP
    }
    /// Semitone offset relative to the playing note.
    pub fn is_relative_note(&self) -> bool {
        self.note <= 0x5F
    }
    /// Absolute note with oscillator-retrigger semantics.
    pub fn is_absolute_note(&self) -> bool {
        (0x80..=0xDF).contains(&self.note)
    }
    pub fn is_valid_control(&self) -> bool {
        self.is_relative_note() || self.is_stop() || self.is_jump() || self.is_absolute_note()
    }
}

/// Pulse program step. `next` indexes the table pre-multiplied by four.
#[derive(Debug, Clone, Copy, Default, Reflect, Serialize)]
pub struct PulseEntry {
    #[serde(rename = "@value")]
    pub value: u8,
    #[serde(rename = "@delta")]
    pub delta: u8,
    #[serde(rename = "@duration")]
    pub duration: u8,
    #[serde(rename = "@next")]
    pub next: u8
}
impl AutoReadWrite for PulseEntry {  }

/// Filter program step. The source animates the cutoff by `step` over
/// `duration` ticks; the target only stores static cutoffs.
#[derive(Debug, Clone, Copy, Default, Reflect, Serialize)]
pub struct FilterEntry {
    #[serde(rename = "@cutoff")]
    pub cutoff: u8,
    #[serde(rename = "@step")]
    pub step: u8,
    #[serde(rename = "@duration")]
    pub duration: u8,
    #[serde(rename = "@next")]
    pub next: u8
}
impl AutoReadWrite for FilterEntry {  }

pub const NOTE_REST: u8 = 0x00;
pub const NOTE_SUSTAIN: u8 = 0x7E;
pub const SEQ_END: u8 = 0x7F;

/// One decoded sequence row. `None` is the explicit "no change" encoding,
/// distinct from an instrument or command value of zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SeqRow {
    #[serde(rename = "@instrument")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instrument: Option<u8>,
    #[serde(rename = "@command")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<u8>,
    #[serde(rename = "@param")]
    pub command_param: u8,
    #[serde(rename = "@note")]
    pub note: u8
}
impl SeqRow {
    pub fn sustain() -> SeqRow {
        SeqRow { instrument: None, command: None, command_param: 0, note: NOTE_SUSTAIN }
    }
    pub fn is_sustain(&self) -> bool {
        self.note == NOTE_SUSTAIN && self.instrument.is_none() && self.command.is_none()
    }
}

/// Explicit cursor over one raw sequence stream. The source packs duration
/// prefixes and command parameters inline; decoding expands durations into
/// per-tick sustain rows so the target's one-row-per-tick layout keeps the
/// rhythm.
pub struct SeqCursor<'a> {
    bytes: &'a [u8],
    pos: usize,
    current_instr: Option<u8>,
    current_cmd: Option<u8>,
    current_cmd_param: u8,
    pending_duration: u8
}
impl<'a> SeqCursor<'a> {
    pub fn new(bytes: &'a [u8]) -> SeqCursor<'a> {
        SeqCursor {
            bytes,
            pos: 0,
            current_instr: None,
            current_cmd: None,
            current_cmd_param: 0,
            pending_duration: 1
        }
    }

    fn decode(mut self, instrument_count: usize, warnings: &mut Warnings) -> Result<Vec<SeqRow>, ConvError> {
        let mut rows = Vec::new();
        while self.pos < self.bytes.len() {
            let b = self.bytes[self.pos];
            self.pos += 1;
            match b {
                SEQ_END => return Ok(rows),
                0x80..=0x9F => {
                    self.pending_duration = (b & 0x1F) + 1;
                },
                0xA0..=0xBF => {
                    let index = b & 0x1F;
                    if index as usize >= instrument_count {
                        return Err(ConvError::BadInstrumentIndex { index, count: instrument_count });
                    }
                    self.current_instr = Some(index);
                },
                0xC0..=0xCF => {
                    if self.pos >= self.bytes.len() {
                        return Err(ConvError::TruncatedSequence { offset: self.pos - 1 });
                    }
                    self.current_cmd = Some(b & 0x0F);
                    self.current_cmd_param = self.bytes[self.pos];
                    self.pos += 1;
                },
                NOTE_SUSTAIN => rows.push(SeqRow::sustain()),
                0x00..=0x5F => {
                    rows.push(SeqRow {
                        instrument: self.current_instr,
                        command: self.current_cmd,
                        command_param: self.current_cmd_param,
                        note: b
                    });
                    for _ in 1..self.pending_duration {
                        rows.push(SeqRow::sustain());
                    }
                    self.current_instr = None;
                    self.current_cmd = None;
                    self.current_cmd_param = 0;
                    self.pending_duration = 1;
                },
                _ => warnings.push(format!("unknown sequence byte {:#04X} at offset {}, skipped", b, self.pos - 1))
            }
        }
        // No terminator; the slice ran out, which still yields a finite row
        // list.
        warnings.push(format!("sequence ended without a terminator after {} bytes", self.bytes.len()));
        Ok(rows)
    }
}

pub fn decode_sequence(bytes: &[u8], instrument_count: usize, warnings: &mut Warnings) -> Result<Vec<SeqRow>, ConvError> {
    SeqCursor::new(bytes).decode(instrument_count, warnings)
}

pub const ORDERLIST_END: u8 = 0xFF;
const MAX_ORDER_ENTRIES: usize = 128;

/// Per-voice order list entry. Transposes are stored biased by 0xA0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OrderEntry {
    #[serde(rename = "@transpose")]
    pub transpose: u8,
    #[serde(rename = "@sequence")]
    pub sequence: u8
}
impl OrderEntry {
    pub fn transpose_semitones(&self) -> i8 {
        (self.transpose as i16 - 0xA0) as i8
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct OrderList {
    /// Entry index the player loops back to after the terminator.
    #[serde(rename = "@restart")]
    pub restart: u8,
    pub entries: Vec<OrderEntry>
}

/// Walks `(transpose, sequence)` pairs up to the 0xFF terminator; the byte
/// after the terminator is the restart position.
pub fn decode_orderlist(bytes: &[u8], warnings: &mut Warnings) -> OrderList {
    let mut list = OrderList::default();
    let mut pos = 0;
    while pos < bytes.len() && list.entries.len() < MAX_ORDER_ENTRIES {
        let transpose = bytes[pos];
        if transpose == ORDERLIST_END {
            list.restart = bytes.get(pos + 1).copied().unwrap_or(0);
            return list;
        }
        let Some(&sequence) = bytes.get(pos + 1) else {
            warnings.push("order list ended in the middle of an entry".to_string());
            return list;
        };
        list.entries.push(OrderEntry { transpose, sequence });
        pos += 2;
    }
    warnings.push(format!("order list has no terminator within {} entries", list.entries.len()));
    list
}

/// Everything reconstructed from the source image, materialised into owned
/// storage so it outlives the memory image.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename = "music")]
pub struct MusicModel {
    pub instruments: Vec<Instrument>,
    pub wavetable: Vec<WaveEntry>,
    pub pulse: Vec<PulseEntry>,
    pub filter: Vec<FilterEntry>,
    pub sequences: Vec<DecodedSequence>,
    pub orderlists: Vec<OrderList>
}

#[derive(Debug, Clone, Serialize)]
pub struct DecodedSequence {
    #[serde(rename = "@index")]
    pub index: u8,
    pub rows: Vec<SeqRow>
}

/// Reads every located table out of the frozen image into the owned model,
/// cross-checking instrument pointers against the tables they index.
pub fn read_model(image: &MemoryImage, located: &locate::LocatedTables, warnings: &mut Warnings) -> Result<MusicModel, ConvError> {
    let mut model = MusicModel::default();

    let mut reader = Cursor::new(image.slice(located.instruments.base, located.instruments.count * 8));
    for _ in 0..located.instruments.count {
        let mut instrument = Instrument::default();
        instrument.read_from(&mut reader)?;
        model.instruments.push(instrument);
    }

    let mut reader = Cursor::new(image.slice(located.wavetable.base, located.wavetable.count * 2));
    for _ in 0..located.wavetable.count {
        let mut entry = WaveEntry::default();
        entry.read_from(&mut reader)?;
        model.wavetable.push(entry);
    }

    let mut reader = Cursor::new(image.slice(located.pulse.base, located.pulse.count * 4));
    for _ in 0..located.pulse.count {
        let mut entry = PulseEntry::default();
        entry.read_from(&mut reader)?;
        model.pulse.push(entry);
    }

    let mut reader = Cursor::new(image.slice(located.filter.base, located.filter.count * 4));
    for _ in 0..located.filter.count {
        let mut entry = FilterEntry::default();
        entry.read_from(&mut reader)?;
        model.filter.push(entry);
    }

    for (i, instrument) in model.instruments.iter().enumerate() {
        if instrument.wave_ptr as usize >= model.wavetable.len() {
            warnings.push(format!(
                "instrument {} wave pointer {:#04X} points past the wavetable ({} entries); will be clamped at emission",
                i, instrument.wave_ptr, model.wavetable.len()
            ));
        }
        if instrument.pulse_ptr != 0 {
            if instrument.pulse_ptr % 4 != 0 {
                warnings.push(format!("instrument {} pulse pointer {:#04X} is not divisible by 4", i, instrument.pulse_ptr));
            }
            if (instrument.pulse_ptr / 4) as usize >= model.pulse.len() {
                return Err(ConvError::BadPulseIndex { index: instrument.pulse_ptr, count: model.pulse.len() });
            }
        }
        if instrument.filter_ptr != 0 && instrument.filter_ptr as usize >= model.filter.len() {
            warnings.push(format!("instrument {} filter pointer {:#04X} points past the filter table ({} entries)", i, instrument.filter_ptr, model.filter.len()));
        }
    }

    // Wavetable jump targets must land inside the table.
    for (i, entry) in model.wavetable.iter().enumerate() {
        if entry.is_jump() && entry.waveform as usize >= model.wavetable.len() {
            return Err(ConvError::BadWavePointer { index: entry.waveform, count: model.wavetable.len() });
        }
        if !entry.is_valid_control() {
            warnings.push(format!("wavetable entry {} has out-of-range control byte {:#04X}", i, entry.note));
        }
    }

    for (index, &addr) in located.sequence_addrs.iter().enumerate() {
        let end = located.sequence_ends[index];
        let bytes = image.slice(addr, (end - addr as u32) as usize);
        let rows = decode_sequence(bytes, model.instruments.len(), warnings)?;
        model.sequences.push(DecodedSequence { index: index as u8, rows });
    }

    for &addr in &located.orderlist_addrs {
        let span = (0x10000 - addr as u32).min(MAX_ORDER_ENTRIES as u32 * 2 + 2) as usize;
        model.orderlists.push(decode_orderlist(image.slice(addr, span), warnings));
    }

    Ok(model)
}
