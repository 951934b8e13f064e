//! Heuristic recovery of the five data tables from a stripped player image.
//!
//! Nothing in the image says where the tables live; the only ground truth is
//! the machine code that reads them. For each table a set of access
//! signatures describes the instruction shapes the player uses, every match
//! yields a candidate base address, and candidates are scored on access
//! sites, entry consistency, bounds and cross-references. The best candidate
//! wins if it clears the acceptance threshold.

use std::ops::Range;
use indexmap::IndexMap;

use crate::dtype::{ConvError, TableKind, Warnings};
use crate::mos6502::{addr_mode, operand_len};
use crate::sid::MemoryImage;

/// Acceptance threshold and per-site weight, calibrated against a corpus of
/// roughly 286 Laxity-compiled files. Near misses are reported as warnings
/// rather than silently clamped.
pub const SCORE_ACCEPT_THRESHOLD: i32 = 6;
pub const SCORE_PER_ACCESS: i32 = 3;
pub const MAX_SCORED_ACCESS_SITES: usize = 5;

pub const MAX_INSTRUMENTS: usize = 32;
pub const MAX_WAVE_ENTRIES: usize = 128;
pub const MAX_PULSE_ENTRIES: usize = 64;
pub const MAX_FILTER_ENTRIES: usize = 32;
pub const MAX_SEQUENCES: usize = 255;

const OP_LDA_ABS_Y: u8 = 0xB9;
const OP_LDA_ABS_X: u8 = 0xBD;
const OP_STA_ABS_X: u8 = 0x9D;
const OP_ADC_ABS_Y: u8 = 0x79;
const OP_STA_ABS: u8 = 0x8D;
const OP_STA_ZP: u8 = 0x85;
const OP_CMP_IMM: u8 = 0xC9;
const OP_INY: u8 = 0xC8;
const OP_LDA_IND_Y: u8 = 0xB1;

/// One located table: a base address into the frozen image plus the entry
/// count the scan settled on.
#[derive(Debug, Clone, Copy, Default)]
pub struct TableRef {
    pub base: u16,
    pub count: usize
}
impl TableRef {
    fn span(&self, entry_size: usize) -> Range<u32> {
        self.base as u32..self.base as u32 + (self.count * entry_size) as u32
    }
}

#[derive(Debug, Clone, Default)]
pub struct LocatedTables {
    pub instruments: TableRef,
    pub wavetable: TableRef,
    pub pulse: TableRef,
    pub filter: TableRef,
    /// Base of the sequence pointer table (lo array); count of sequences.
    pub sequences: TableRef,
    /// Base of the matching high-byte pointer array.
    pub sequence_hi_base: u16,
    pub sequence_addrs: Vec<u16>,
    /// One past each sequence's terminator, parallel to `sequence_addrs`.
    pub sequence_ends: Vec<u32>,
    /// Per-voice order-list start addresses, at most three.
    pub orderlist_addrs: Vec<u16>
}

/// A decoded instruction inside the code-classified region. Only the
/// opcode and operand matter to the signature matchers.
#[derive(Debug, Clone, Copy)]
struct Instr {
    opcode: u8,
    operand: u16
}

/// Walks the code-classified bytes the same way the relocator does:
/// instruction-length strides through code, single-byte strides elsewhere.
fn decode_code_region(image: &MemoryImage, loaded: Range<u32>) -> Vec<Instr> {
    let mut out = Vec::new();
    let mut addr = loaded.start;
    while addr < loaded.end {
        if !image.is_code(addr as u16) {
            addr += 1;
            continue;
        }
        let opcode = image.byte(addr as u16);
        let mode = match addr_mode(opcode) {
            Some(mode) => mode,
            None => {
                addr += 1;
                continue;
            }
        };
        let len = 1 + operand_len(mode) as u32;
        if addr + len > loaded.end {
            addr += 1;
            continue;
        }
        let operand = match operand_len(mode) {
            2 => image.word_le((addr + 1) as u16),
            1 => image.byte((addr + 1) as u16) as u16,
            _ => 0
        };
        out.push(Instr { opcode, operand });
        addr += len;
    }
    out
}

fn overlaps(a: &Range<u32>, b: &Range<u32>) -> bool {
    a.start < b.end && b.start < a.end
}

#[derive(Debug, Default, Clone)]
struct Candidate {
    sites: usize,
    bonus: i32,
    count: usize
}
impl Candidate {
    fn score(&self) -> i32 {
        self.sites.min(MAX_SCORED_ACCESS_SITES) as i32 * SCORE_PER_ACCESS + self.bonus
    }
}

/// Picks the highest-scoring candidate or reports the near misses.
fn pick(
    kind: TableKind,
    candidates: IndexMap<u16, Candidate>,
    warnings: &mut Warnings
) -> Result<(u16, Candidate), ConvError> {
    let mut best: Option<(u16, Candidate)> = None;
    for (base, candidate) in candidates {
        match &best {
            Some((_, current)) if current.score() >= candidate.score() => {
                if candidate.score() >= SCORE_ACCEPT_THRESHOLD {
                    warnings.push(format!(
                        "{} table: runner-up candidate {:#06X} also scored {}",
                        kind, base, candidate.score()
                    ));
                }
            },
            _ => {
                if let Some((prev_base, prev)) = best.replace((base, candidate)) {
                    if prev.score() >= SCORE_ACCEPT_THRESHOLD {
                        warnings.push(format!(
                            "{} table: runner-up candidate {:#06X} also scored {}",
                            kind, prev_base, prev.score()
                        ));
                    }
                }
            }
        }
    }
    match best {
        Some((base, candidate)) if candidate.score() >= SCORE_ACCEPT_THRESHOLD => Ok((base, candidate)),
        Some((base, candidate)) => {
            warnings.push(format!(
                "{} table: best candidate {:#06X} scored {} of required {}",
                kind, base, candidate.score(), SCORE_ACCEPT_THRESHOLD
            ));
            Err(ConvError::TableNotLocated(kind))
        },
        None => Err(ConvError::TableNotLocated(kind))
    }
}

/// Entry scan for the wavetable: interleaved `(note, waveform)` pairs until
/// a jump with no conceivable target, an invalid control byte, the cap, or
/// the edge of the loaded data.
fn scan_wave_entries(image: &MemoryImage, base: u16, loaded: &Range<u32>) -> (usize, i32) {
    let mut count = 0;
    let mut bonus = 0;
    while count < MAX_WAVE_ENTRIES {
        let at = base as u32 + (count * 2) as u32;
        if at + 2 > loaded.end {
            break;
        }
        let note = image.byte(at as u16);
        let target = image.byte((at + 1) as u16);
        if note == 0x7F {
            // a jump whose target byte could never index the table marks
            // the end of it (0xFF filler past the last chain)
            if target as usize >= MAX_WAVE_ENTRIES {
                break;
            }
            count += 1;
            continue;
        }
        let valid = note <= 0x5F || note == 0x7E || (0x80..=0xDF).contains(&note);
        if !valid {
            break;
        }
        count += 1;
    }
    if count > 0 {
        bonus += 2; // every scanned control byte was legal
    }
    if base as u32 + (count * 2) as u32 <= loaded.end {
        bonus += 1;
    }
    (count, bonus)
}

/// Entry scan shared by the pulse and filter tables (4-byte entries, "next"
/// pre-multiplied by four). An all-zero entry past index 0 or a next index
/// outside the cap ends the table.
fn scan_step_entries(image: &MemoryImage, base: u16, loaded: &Range<u32>, cap: usize) -> (usize, i32) {
    let mut count = 0;
    let mut bonus = 0;
    while count < cap {
        let at = base as u32 + (count * 4) as u32;
        if at + 4 > loaded.end {
            break;
        }
        let entry = image.slice(at as u16, 4);
        if count > 0 && entry.iter().all(|&b| b == 0) {
            break;
        }
        if (entry[3] / 4) as usize >= cap {
            break;
        }
        count += 1;
    }
    if count > 0 {
        bonus += 2;
    }
    if base as u32 + (count * 4) as u32 <= loaded.end {
        bonus += 1;
    }
    (count, bonus)
}

/// Wavetable signature: two `LDA abs,Y` reads of adjacent bytes with a
/// `CMP #$7E` or `CMP #$7F` marker check nearby.
fn locate_wavetable(
    image: &MemoryImage,
    instrs: &[Instr],
    loaded: &Range<u32>,
    warnings: &mut Warnings
) -> Result<TableRef, ConvError> {
    let mut candidates: IndexMap<u16, Candidate> = IndexMap::new();
    for (i, instr) in instrs.iter().enumerate() {
        if instr.opcode != OP_LDA_ABS_Y || (instr.operand as u32) < loaded.start || (instr.operand as u32) >= loaded.end {
            continue;
        }
        // tight window: the marker checks sit right next to the entry reads
        let window = &instrs[i + 1..instrs.len().min(i + 5)];
        let partner = window.iter().any(|other| {
            other.opcode == OP_LDA_ABS_Y
                && (other.operand == instr.operand.wrapping_add(1)
                    || instr.operand == other.operand.wrapping_add(1))
        });
        let marker = window.iter().any(|other| {
            other.opcode == OP_CMP_IMM && (other.operand == 0x7E || other.operand == 0x7F)
        });
        if partner && marker {
            candidates.entry(instr.operand).or_default().sites += 1;
        }
    }
    // Pairs register the lower operand as the base; fold the +1 partner
    // sites into it.
    let bases: Vec<u16> = candidates.keys().copied().collect();
    for base in bases {
        let upper = base.wrapping_add(1);
        if let Some(partner) = candidates.get(&upper).map(|c| c.sites) {
            if candidates.contains_key(&base) {
                candidates.shift_remove(&upper);
                candidates.entry(base).or_default().sites += partner;
            }
        }
    }
    for (&base, candidate) in candidates.iter_mut() {
        let (count, bonus) = scan_wave_entries(image, base, loaded);
        candidate.count = count;
        candidate.bonus = if count == 0 { -3 } else { bonus };
    }
    let (base, candidate) = pick(TableKind::Wavetable, candidates, warnings)?;
    Ok(TableRef { base, count: candidate.count })
}

/// Pulse signature: `LDA abs,Y` followed by `ADC abs+1,Y` and the four-step
/// `INY` stride.
fn locate_pulse(
    image: &MemoryImage,
    instrs: &[Instr],
    loaded: &Range<u32>,
    taken: &[Range<u32>],
    warnings: &mut Warnings
) -> Result<TableRef, ConvError> {
    let mut candidates: IndexMap<u16, Candidate> = IndexMap::new();
    for (i, instr) in instrs.iter().enumerate() {
        if instr.opcode != OP_LDA_ABS_Y || (instr.operand as u32) < loaded.start || (instr.operand as u32) >= loaded.end {
            continue;
        }
        let window = &instrs[i + 1..instrs.len().min(i + 10)];
        let adc = window.iter().any(|other| other.opcode == OP_ADC_ABS_Y && other.operand == instr.operand.wrapping_add(1));
        let strides = window.windows(4).any(|w| w.iter().all(|other| other.opcode == OP_INY));
        if adc && strides {
            candidates.entry(instr.operand).or_default().sites += 1;
        }
    }
    for (&base, candidate) in candidates.iter_mut() {
        let (count, mut bonus) = scan_step_entries(image, base, loaded, MAX_PULSE_ENTRIES);
        let span = base as u32..base as u32 + (count * 4) as u32;
        if taken.iter().any(|other| overlaps(&span, other)) {
            bonus -= 4;
        }
        candidate.count = count;
        candidate.bonus = if count == 0 { -3 } else { bonus };
    }
    let (base, candidate) = pick(TableKind::Pulse, candidates, warnings)?;
    Ok(TableRef { base, count: candidate.count })
}

/// Filter signature: stores to the filter registers `$D416`/`$D417`/`$D418`
/// fed by an `LDA abs,Y` table read.
fn locate_filter(
    image: &MemoryImage,
    instrs: &[Instr],
    loaded: &Range<u32>,
    taken: &[Range<u32>],
    warnings: &mut Warnings
) -> Result<TableRef, ConvError> {
    let mut candidates: IndexMap<u16, Candidate> = IndexMap::new();
    for (i, instr) in instrs.iter().enumerate() {
        let filter_reg = instr.opcode == OP_STA_ABS && (0xD416..=0xD418).contains(&instr.operand);
        if !filter_reg {
            continue;
        }
        let window_start = i.saturating_sub(6);
        for other in &instrs[window_start..i] {
            if other.opcode == OP_LDA_ABS_Y
                && (other.operand as u32) >= loaded.start
                && (other.operand as u32) < loaded.end
            {
                candidates.entry(other.operand).or_default().sites += 1;
            }
        }
    }
    for (&base, candidate) in candidates.iter_mut() {
        let (count, mut bonus) = scan_step_entries(image, base, loaded, MAX_FILTER_ENTRIES);
        let span = base as u32..base as u32 + (count * 4) as u32;
        if taken.iter().any(|other| overlaps(&span, other)) {
            bonus -= 4;
        }
        candidate.count = count;
        candidate.bonus = if count == 0 { -3 } else { bonus };
    }
    let (base, candidate) = pick(TableKind::Filter, candidates, warnings)?;
    Ok(TableRef { base, count: candidate.count })
}

/// Instrument signature: `LDA abs,Y` into `STA abs,X` per-voice state
/// copies; the eight packed record bytes show up as reads of
/// `base+0..base+7`.
fn locate_instruments(
    image: &MemoryImage,
    instrs: &[Instr],
    loaded: &Range<u32>,
    wavetable: &TableRef,
    pulse: &TableRef,
    filter: &TableRef,
    taken: &[Range<u32>],
    warnings: &mut Warnings
) -> Result<TableRef, ConvError> {
    let mut reads: Vec<u16> = Vec::new();
    for (i, instr) in instrs.iter().enumerate() {
        if instr.opcode != OP_LDA_ABS_Y || (instr.operand as u32) < loaded.start || (instr.operand as u32) >= loaded.end {
            continue;
        }
        let followed_by_state_store = instrs[i + 1..instrs.len().min(i + 4)]
            .iter()
            .any(|other| other.opcode == OP_STA_ABS_X);
        if followed_by_state_store {
            reads.push(instr.operand);
        }
    }

    let mut candidates: IndexMap<u16, Candidate> = IndexMap::new();
    for &base in &reads {
        let sites = reads.iter().filter(|&&other| other.wrapping_sub(base) < 8).count();
        let entry = candidates.entry(base).or_default();
        entry.sites = entry.sites.max(sites);
    }

    for (&base, candidate) in candidates.iter_mut() {
        let mut count = 0;
        let mut bonus = 0;
        while count < MAX_INSTRUMENTS {
            let at = base as u32 + (count * 8) as u32;
            if at + 8 > loaded.end {
                break;
            }
            let record = image.slice(at as u16, 8);
            let wave_ok = (record[7] as usize) < wavetable.count;
            let pulse_ok = record[5] == 0 || ((record[5] / 4) as usize) < pulse.count;
            let filter_ok = record[4] == 0 || (record[4] as usize) < filter.count;
            if !wave_ok || !pulse_ok || !filter_ok {
                break;
            }
            count += 1;
        }
        if count > 0 {
            // cross-reference: every kept record indexes legal wavetable,
            // pulse and filter entries
            bonus += 2;
        }
        let span = base as u32..base as u32 + (count * 8) as u32;
        if taken.iter().any(|other| overlaps(&span, other)) {
            bonus -= 4;
        } else {
            bonus += 1;
        }
        candidate.count = count;
        candidate.bonus = if count == 0 { -3 } else { bonus };
    }

    let (base, candidate) = pick(TableKind::Instruments, candidates, warnings)?;
    Ok(TableRef { base, count: candidate.count })
}

/// Finds one past the sequence terminator, bounded by the loaded region.
/// The walk follows the stream grammar: a command byte's parameter may be
/// 0x7F without terminating the sequence.
fn find_sequence_end(image: &MemoryImage, start: u16, loaded: &Range<u32>) -> u32 {
    let mut at = start as u32;
    while at < loaded.end {
        let byte = image.byte(at as u16);
        if byte == crate::np21::SEQ_END {
            return at + 1;
        }
        at += if (0xC0..=0xCF).contains(&byte) { 2 } else { 1 };
    }
    loaded.end
}

/// Sequence signature: the play loop reads sequence bytes through a
/// zero-page pointer (`LDA (zp),Y`) that is loaded from parallel lo/hi
/// pointer arrays (`LDA abs,Y / STA zp` twice).
fn locate_sequences(
    image: &MemoryImage,
    instrs: &[Instr],
    loaded: &Range<u32>,
    warnings: &mut Warnings
) -> Result<(TableRef, u16, Vec<u16>, Vec<u32>), ConvError> {
    let indirect_read = instrs.iter().any(|instr| instr.opcode == OP_LDA_IND_Y);

    let mut candidates: IndexMap<u16, Candidate> = IndexMap::new();
    let mut spacing: IndexMap<u16, u16> = IndexMap::new();
    for (i, instr) in instrs.iter().enumerate() {
        if instr.opcode != OP_LDA_ABS_Y || (instr.operand as u32) < loaded.start || (instr.operand as u32) >= loaded.end {
            continue;
        }
        let stores_zp = instrs.get(i + 1).map_or(false, |other| other.opcode == OP_STA_ZP);
        if !stores_zp {
            continue;
        }
        // partner load for the pointer high byte
        let partner = instrs[i + 2..instrs.len().min(i + 6)].iter().find(|other| {
            other.opcode == OP_LDA_ABS_Y && other.operand > instr.operand
        });
        if let Some(high) = partner {
            let entry = candidates.entry(instr.operand).or_default();
            entry.sites += 1;
            if indirect_read {
                entry.sites += 1;
            }
            spacing.insert(instr.operand, high.operand - instr.operand);
        }
    }

    for (&base, candidate) in candidates.iter_mut() {
        let gap = spacing.get(&base).copied().unwrap_or(0) as usize;
        let cap = if gap > 0 && gap <= MAX_SEQUENCES { gap } else { MAX_SEQUENCES };
        let hi_base = base.wrapping_add(gap as u16);
        let mut count = 0;
        while count < cap {
            let lo_at = base as u32 + count as u32;
            let hi_at = hi_base as u32 + count as u32;
            if lo_at >= loaded.end || hi_at >= loaded.end {
                break;
            }
            let addr = image.byte(lo_at as u16) as u32 | (image.byte(hi_at as u16) as u32) << 8;
            if addr < loaded.start || addr >= loaded.end {
                break;
            }
            count += 1;
        }
        candidate.count = count;
        candidate.bonus = if count == 0 { -3 } else { 3 };
    }

    let (base, candidate) = pick(TableKind::Sequences, candidates, warnings)?;
    let gap = spacing.get(&base).copied().unwrap_or(0);
    let hi_base = base.wrapping_add(gap);
    let mut addrs = Vec::with_capacity(candidate.count);
    let mut ends = Vec::with_capacity(candidate.count);
    for i in 0..candidate.count {
        let addr = image.byte(base.wrapping_add(i as u16)) as u16
            | (image.byte(hi_base.wrapping_add(i as u16)) as u16) << 8;
        addrs.push(addr);
        ends.push(find_sequence_end(image, addr, loaded));
    }
    Ok((TableRef { base, count: candidate.count }, hi_base, addrs, ends))
}

/// Order-list pointers are loaded per voice through `LDA abs,X / STA zp`
/// pairs over three-entry lo/hi arrays. Failure here degrades to empty
/// order lists with a warning instead of refusing the conversion.
fn locate_orderlists(
    image: &MemoryImage,
    instrs: &[Instr],
    loaded: &Range<u32>,
    warnings: &mut Warnings
) -> Vec<u16> {
    for (i, instr) in instrs.iter().enumerate() {
        if instr.opcode != OP_LDA_ABS_X || (instr.operand as u32) < loaded.start || (instr.operand as u32) >= loaded.end {
            continue;
        }
        if !instrs.get(i + 1).map_or(false, |other| other.opcode == OP_STA_ZP) {
            continue;
        }
        let partner = instrs[i + 2..instrs.len().min(i + 6)].iter().find(|other| {
            other.opcode == OP_LDA_ABS_X
                && other.operand > instr.operand
                && instrs.get(i + 3).map_or(false, |store| store.opcode == OP_STA_ZP)
        });
        let Some(high) = partner else { continue };
        let lo_base = instr.operand;
        let hi_base = high.operand;
        let mut addrs = Vec::with_capacity(3);
        for voice in 0..3u16 {
            let lo_at = lo_base as u32 + voice as u32;
            let hi_at = hi_base as u32 + voice as u32;
            if lo_at >= loaded.end || hi_at >= loaded.end {
                break;
            }
            let addr = image.byte(lo_at as u16) as u32 | (image.byte(hi_at as u16) as u32) << 8;
            if addr < loaded.start || addr >= loaded.end {
                break;
            }
            addrs.push(addr as u16);
        }
        if addrs.len() == 3 {
            return addrs;
        }
    }
    warnings.push("order-list pointers not recovered; emitting empty order lists".to_string());
    Vec::new()
}

/// Locates all five tables plus the per-voice order lists and marks their
/// bytes as data, which is what protects them from the relocator.
pub fn locate_tables(
    image: &mut MemoryImage,
    loaded: Range<u32>,
    warnings: &mut Warnings
) -> Result<LocatedTables, ConvError> {
    let instrs = decode_code_region(image, loaded.clone());

    let wavetable = locate_wavetable(image, &instrs, &loaded, warnings)?;
    let mut taken = vec![wavetable.span(2)];
    let pulse = locate_pulse(image, &instrs, &loaded, &taken, warnings)?;
    taken.push(pulse.span(4));
    let filter = locate_filter(image, &instrs, &loaded, &taken, warnings)?;
    taken.push(filter.span(4));
    let instruments = locate_instruments(image, &instrs, &loaded, &wavetable, &pulse, &filter, &taken, warnings)?;
    taken.push(instruments.span(8));
    let (sequences, sequence_hi_base, sequence_addrs, sequence_ends) = locate_sequences(image, &instrs, &loaded, warnings)?;
    let orderlist_addrs = locate_orderlists(image, &instrs, &loaded, warnings);

    image.mark_data_range(instruments.base, instruments.count * 8)?;
    image.mark_data_range(wavetable.base, wavetable.count * 2)?;
    image.mark_data_range(pulse.base, pulse.count * 4)?;
    image.mark_data_range(filter.base, filter.count * 4)?;
    // lo and hi pointer arrays
    image.mark_data_range(sequences.base, sequences.count)?;
    image.mark_data_range(sequence_hi_base, sequences.count)?;
    for (&addr, &end) in sequence_addrs.iter().zip(sequence_ends.iter()) {
        image.mark_data_range(addr, (end - addr as u32) as usize)?;
    }
    for &addr in &orderlist_addrs {
        let mut at = addr as u32;
        while at < loaded.end {
            let byte = image.byte(at as u16);
            image.mark_data(at as u16)?;
            if byte == crate::np21::ORDERLIST_END {
                if at + 1 < loaded.end {
                    image.mark_data((at + 1) as u16)?;
                }
                break;
            }
            at += 1;
        }
    }

    Ok(LocatedTables {
        instruments,
        wavetable,
        pulse,
        filter,
        sequences,
        sequence_hi_base,
        sequence_addrs,
        sequence_ends,
        orderlist_addrs
    })
}
