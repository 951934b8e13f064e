//! Converters from located NewPlayer v21 tables into the target's table
//! encodings. All of these are pure functions of the materialised model;
//! irregular inputs degrade with warnings, never by guessing silently.

use indexmap::IndexMap;

use crate::dtype::Warnings;
use crate::math::{cutoff_to_11bit, split_cutoff};
use crate::np21::{DecodedSequence, FilterEntry, Instrument, MusicModel, OrderList, PulseEntry, RestartFlags, WaveEntry, ORDERLIST_END, WAVE_STOP};
use super::{INSTRUMENT_COLS, INSTRUMENT_ROWS};

/// Sentinel the target uses in sequence rows for "no change", distinct
/// from instrument or command value zero.
pub const NO_CHANGE: u8 = 0x80;

/// The editor's command table is a single page of 2-byte rows.
pub const MAX_COMMANDS: usize = 0x40;

/// Source pulse/filter "next" indices are pre-multiplied by four; the
/// target indexes rows directly.
pub fn scaled_to_direct(index: u8) -> u8 {
    index / 4
}
pub fn direct_to_scaled(index: u8) -> u8 {
    index * 4
}

/// Deduplicated `(command, parameter)` pairs in first-appearance order.
/// Sequence rows reference commands through this table.
#[derive(Debug, Default)]
pub struct CommandTable {
    entries: IndexMap<(u8, u8), u8>,
    overflow_reported: bool
}
impl CommandTable {
    pub fn new() -> CommandTable {
        CommandTable::default()
    }

    /// Row index for the pair, allocating one when unseen. Returns `None`
    /// past the table cap; the command is dropped from the row, which is
    /// the recoverable outcome.
    pub fn index_for(&mut self, command: u8, param: u8, warnings: &mut Warnings) -> Option<u8> {
        if let Some(&index) = self.entries.get(&(command, param)) {
            return Some(index);
        }
        if self.entries.len() >= MAX_COMMANDS {
            if !self.overflow_reported {
                warnings.push(format!(
                    "more than {} distinct command/parameter pairs; extra commands dropped from sequence rows",
                    MAX_COMMANDS
                ));
                self.overflow_reported = true;
            }
            return None;
        }
        let index = self.entries.len() as u8;
        self.entries.insert((command, param), index);
        Some(index)
    }

    pub fn rows(&self) -> usize {
        self.entries.len()
    }

    pub fn to_blob(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.entries.len() * 2);
        for &(command, param) in self.entries.keys() {
            out.push(command);
            out.push(param);
        }
        out
    }
}

/// Folds a source instrument's restart byte and filter usage into the
/// target flag byte: bit 7 hard restart, bit 6 filter on, bit 4
/// oscillator reset.
fn fold_flags(instrument: &Instrument) -> u8 {
    let restart = instrument.restart();
    let mut flags = 0;
    if restart.contains(RestartFlags::HARD_RESTART) {
        flags |= 0x80;
    }
    if restart.contains(RestartFlags::OSC_RESET) {
        flags |= 0x10;
    }
    if instrument.uses_filter() {
        flags |= 0x40;
    }
    flags
}

/// Row-major 8-byte records become the editor's column-major six-column
/// layout: attack/decay, sustain/release, flags, filter pointer, pulse
/// pointer (re-indexed), wave pointer. The source's filter byte and pulse
/// property have no target cell.
pub fn convert_instruments(model: &MusicModel, warnings: &mut Warnings) -> Vec<u8> {
    let mut out = vec![0u8; INSTRUMENT_COLS * INSTRUMENT_ROWS];
    for (r, instrument) in model.instruments.iter().take(INSTRUMENT_ROWS).enumerate() {
        let wave_ptr = if (instrument.wave_ptr as usize) < model.wavetable.len() {
            instrument.wave_ptr
        } else {
            // already reported while reading the model; clamp so the
            // emitted table stays loadable
            model.wavetable.len().saturating_sub(1) as u8
        };
        if instrument.pulse_ptr % 4 != 0 {
            warnings.push(format!("instrument {} pulse pointer {:#04X} re-indexed as {}", r, instrument.pulse_ptr, scaled_to_direct(instrument.pulse_ptr)));
        }
        let columns = [
            instrument.attack_decay,
            instrument.sustain_release,
            fold_flags(instrument),
            instrument.filter_ptr,
            scaled_to_direct(instrument.pulse_ptr),
            wave_ptr
        ];
        for (c, &value) in columns.iter().enumerate() {
            out[c * INSTRUMENT_ROWS + r] = value;
        }
    }
    out
}

fn swap_entry(pair: [u8; 2]) -> [u8; 2] {
    [pair[1], pair[0]]
}

/// Swaps each `(note, waveform)` pair into the target's `(waveform, note)`
/// order. Control markers keep their position in the note byte. The source
/// stop marker has no target counterpart and is rewritten as a jump to the
/// entry itself, which is how the target parks a finished chain.
pub fn convert_wavetable(entries: &[WaveEntry]) -> Vec<u8> {
    let mut out = Vec::with_capacity(entries.len() * 2);
    for (i, entry) in entries.iter().enumerate() {
        if entry.note == WAVE_STOP {
            out.push(i as u8);
            out.push(0x7F);
        } else {
            out.extend_from_slice(&swap_entry([entry.note, entry.waveform]));
        }
    }
    out
}

/// Copies pulse rows, re-indexing the "next" column from the source's ×4
/// convention to direct rows. Unaligned values pass through floored, with a
/// warning; whether those are corruption or an encoding variant is an open
/// question the corpus never answered.
pub fn convert_pulse(entries: &[PulseEntry], warnings: &mut Warnings) -> Vec<u8> {
    let mut out = Vec::with_capacity(entries.len() * 4);
    for (i, entry) in entries.iter().enumerate() {
        if entry.next % 4 != 0 {
            warnings.push(format!("pulse entry {} next index {:#04X} is not divisible by 4", i, entry.next));
        }
        out.push(entry.value);
        out.push(entry.delta);
        out.push(entry.duration);
        out.push(scaled_to_direct(entry.next));
    }
    out
}

/// Flattens the source's animated filter programs to static cutoffs: each
/// row keeps its own first effective cutoff, scaled into the 11-bit target
/// range and split into low/high fields. The sweep motion is lost; a static
/// cutoff still lands most of the audible filter character.
pub fn convert_filter(entries: &[FilterEntry], warnings: &mut Warnings) -> Vec<u8> {
    let mut out = Vec::with_capacity(entries.len() * 4);
    for (i, entry) in entries.iter().enumerate() {
        if entry.next % 4 != 0 {
            warnings.push(format!("filter entry {} next index {:#04X} is not divisible by 4", i, entry.next));
        }
        let (low, high) = split_cutoff(cutoff_to_11bit(entry.cutoff));
        out.push(low);
        out.push(high);
        out.push(entry.duration);
        out.push(scaled_to_direct(entry.next));
    }
    out
}

/// Packs one decoded sequence into the target row stream: a little-endian
/// row count, then 3-byte rows of `(instrument, command, note)` where
/// untouched fields carry the 0x80 sentinel and commands reference the
/// shared command table.
pub fn convert_sequence(sequence: &DecodedSequence, commands: &mut CommandTable, warnings: &mut Warnings) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + sequence.rows.len() * 3);
    out.extend_from_slice(&(sequence.rows.len() as u16).to_le_bytes());
    for row in &sequence.rows {
        let instrument = row.instrument.unwrap_or(NO_CHANGE);
        let command = row
            .command
            .and_then(|command| commands.index_for(command, row.command_param, warnings))
            .unwrap_or(NO_CHANGE);
        out.push(instrument);
        out.push(command);
        out.push(row.note);
    }
    out
}

/// Order lists copy through unchanged; both formats bias transposes by
/// 0xA0 and close the list with the terminator and a restart position.
pub fn convert_orderlist(list: &OrderList) -> Vec<u8> {
    let mut out = Vec::with_capacity(list.entries.len() * 2 + 2);
    for entry in &list.entries {
        out.push(entry.transpose);
        out.push(entry.sequence);
    }
    out.push(ORDERLIST_END);
    out.push(list.restart);
    out
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use super::*;
    use crate::np21::SeqRow;

    #[test]
    fn wavetable_entry_bytes_are_swapped() {
        let entries = [WaveEntry { note: 0x00, waveform: 0x21 }];
        assert_eq!(convert_wavetable(&entries), vec![0x21, 0x00]);
    }

    #[test]
    fn wavetable_stop_becomes_jump_to_self() {
        let entries = [
            WaveEntry { note: 0x00, waveform: 0x41 },
            WaveEntry { note: WAVE_STOP, waveform: 0x00 }
        ];
        assert_eq!(convert_wavetable(&entries), vec![0x41, 0x00, 0x01, 0x7F]);
    }

    #[test]
    fn pulse_next_index_is_divided_by_four() {
        let mut warnings = Warnings::new();
        let entries = [PulseEntry { value: 0x80, delta: 0x00, duration: 0x10, next: 0x18 }];
        assert_eq!(convert_pulse(&entries, &mut warnings), vec![0x80, 0x00, 0x10, 0x06]);
        assert!(warnings.is_empty());
    }

    #[test]
    fn unaligned_pulse_next_passes_through_with_warning() {
        let mut warnings = Warnings::new();
        let entries = [PulseEntry { value: 0, delta: 0, duration: 0, next: 0x0B }];
        assert_eq!(convert_pulse(&entries, &mut warnings)[3], 0x02);
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn filter_cutoff_scales_into_11_bits() {
        let mut warnings = Warnings::new();
        let entries = [FilterEntry { cutoff: 0x5A, step: 0x02, duration: 0x08, next: 0x04 }];
        let out = convert_filter(&entries, &mut warnings);
        // 0x5A * 8 = 0x2D0: low 3 bits zero, high byte the raw cutoff
        assert_eq!(out, vec![0x00, 0x5A, 0x08, 0x01]);
    }

    #[test]
    fn zero_restart_flags_fold_to_filter_bit_only() {
        let mut instrument = Instrument::default();
        instrument.filter_ptr = 0x03;
        assert_eq!(fold_flags(&instrument), 0x40);
        instrument.filter_ptr = 0;
        assert_eq!(fold_flags(&instrument), 0x00);
    }

    #[test]
    fn hard_restart_and_osc_reset_bits_carry_over() {
        let mut instrument = Instrument::default();
        instrument.restart_flags = 0x90;
        assert_eq!(fold_flags(&instrument), 0x90);
    }

    #[test]
    fn instruments_transpose_to_column_major() {
        let mut model = MusicModel::default();
        model.wavetable = vec![WaveEntry::default(); 8];
        model.instruments = vec![
            Instrument {
                attack_decay: 0x12,
                sustain_release: 0xF0,
                restart_flags: 0x80,
                filter_byte: 0xAA,
                filter_ptr: 0x02,
                pulse_ptr: 0x08,
                pulse_property: 0xBB,
                wave_ptr: 0x05
            }
        ];
        let mut warnings = Warnings::new();
        let out = convert_instruments(&model, &mut warnings);
        assert_eq!(out.len(), INSTRUMENT_COLS * INSTRUMENT_ROWS);
        assert_eq!(out[0], 0x12); // attack/decay column, row 0
        assert_eq!(out[INSTRUMENT_ROWS], 0xF0); // sustain/release
        assert_eq!(out[2 * INSTRUMENT_ROWS], 0x80 | 0x40); // flags with filter bit
        assert_eq!(out[3 * INSTRUMENT_ROWS], 0x02); // filter pointer
        assert_eq!(out[4 * INSTRUMENT_ROWS], 0x02); // pulse pointer 0x08 / 4
        assert_eq!(out[5 * INSTRUMENT_ROWS], 0x05); // wave pointer
        // the discarded source bytes appear nowhere
        assert!(!out.contains(&0xAA));
        assert!(!out.contains(&0xBB));
    }

    #[test]
    fn out_of_range_wave_pointer_is_clamped_at_emission() {
        let mut model = MusicModel::default();
        model.wavetable = vec![WaveEntry::default(); 4];
        let mut instrument = Instrument::default();
        instrument.wave_ptr = 0x20;
        model.instruments = vec![instrument];
        let mut warnings = Warnings::new();
        let out = convert_instruments(&model, &mut warnings);
        assert_eq!(out[5 * INSTRUMENT_ROWS], 0x03);
    }

    #[test]
    fn command_table_deduplicates_in_first_appearance_order() {
        let mut commands = CommandTable::new();
        let mut warnings = Warnings::new();
        assert_eq!(commands.index_for(0x01, 0x20, &mut warnings), Some(0));
        assert_eq!(commands.index_for(0x03, 0x40, &mut warnings), Some(1));
        assert_eq!(commands.index_for(0x01, 0x20, &mut warnings), Some(0));
        assert_eq!(commands.rows(), 2);
        assert_eq!(commands.to_blob(), vec![0x01, 0x20, 0x03, 0x40]);
    }

    #[test]
    fn command_table_overflow_drops_with_single_warning() {
        let mut commands = CommandTable::new();
        let mut warnings = Warnings::new();
        for i in 0..MAX_COMMANDS {
            assert!(commands.index_for(0x01, i as u8, &mut warnings).is_some());
        }
        assert_eq!(commands.index_for(0x02, 0xEE, &mut warnings), None);
        assert_eq!(commands.index_for(0x02, 0xEF, &mut warnings), None);
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn sequence_rows_use_no_change_sentinels() {
        let mut commands = CommandTable::new();
        let mut warnings = Warnings::new();
        let sequence = DecodedSequence {
            index: 0,
            rows: vec![
                SeqRow { instrument: Some(2), command: Some(1), command_param: 0x20, note: 0x0C },
                SeqRow::sustain()
            ]
        };
        let out = convert_sequence(&sequence, &mut commands, &mut warnings);
        assert_eq!(out, vec![
            0x02, 0x00, // row count
            0x02, 0x00, 0x0C,
            NO_CHANGE, NO_CHANGE, 0x7E
        ]);
    }

    #[test]
    fn orderlist_round_trips_bytes() {
        use crate::np21::OrderEntry;
        let list = OrderList {
            entries: vec![OrderEntry { transpose: 0xA0, sequence: 3 }],
            restart: 0
        };
        assert_eq!(convert_orderlist(&list), vec![0xA0, 0x03, 0xFF, 0x00]);
    }

    proptest! {
        #[test]
        fn entry_swap_is_an_involution(a in any::<u8>(), b in any::<u8>()) {
            prop_assert_eq!(swap_entry(swap_entry([a, b])), [a, b]);
        }

        #[test]
        fn pulse_index_convention_round_trips_when_aligned(index in 0u8..=0x3F) {
            let scaled = direct_to_scaled(index);
            prop_assert_eq!(scaled % 4, 0);
            prop_assert_eq!(scaled_to_direct(scaled), index);
        }
    }
}
