use std::io::{Read, Write};
use bevy_reflect::{Array, Reflect, ReflectMut, ReflectRef, Struct};
use byteorder::{ReadBytesExt, WriteBytesExt, LittleEndian};
use serde::Serialize;
use strum::{Display, EnumIter};
use thiserror::Error;

/// The five data tables a Laxity NewPlayer v21 image carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display, EnumIter)]
#[strum(serialize_all = "lowercase")]
pub enum TableKind {
    Instruments,
    Wavetable,
    Pulse,
    Filter,
    Sequences
}

/// Everything the public surface of the converter can fail with.
///
/// Recoverable irregularities (non-printable metadata bytes, unaligned pulse
/// indices, unknown sequence bytes) never end up here; they are pushed onto
/// the `Warnings` list returned next to the success value.
#[derive(Debug, Error)]
pub enum ConvError {
    #[error("unrecognised container magic {0:02X?}")]
    UnrecognisedContainer([u8; 4]),
    #[error("load address {load_addr:#06X} plus payload length {len} overflows the 64 KiB memory image")]
    OverflowsMemoryImage { load_addr: u16, len: usize },
    #[error("unsupported player '{0}', only Laxity NewPlayer v21 inputs can be converted")]
    UnsupportedPlayer(String),
    #[error("no candidate cleared the score threshold for the {0} table")]
    TableNotLocated(TableKind),
    #[error("instrument index {index} out of range, the instrument table holds {count} entries")]
    BadInstrumentIndex { index: u8, count: usize },
    #[error("pulse index {index} out of range, the pulse table holds {count} entries")]
    BadPulseIndex { index: u8, count: usize },
    #[error("wavetable pointer {index} out of range, the wavetable holds {count} entries")]
    BadWavePointer { index: u8, count: usize },
    #[error("sequence stream ended in the middle of a command at offset {offset}")]
    TruncatedSequence { offset: usize },
    #[error("descriptor block {id:#04X} payload is {size} bytes, the length byte caps payloads at 255")]
    DescriptorBlockTooLarge { id: u8, size: usize },
    #[error("byte at {addr:#06X} classified as both code and data")]
    RelocatorConflict { addr: u16 },
    #[error("{0}")]
    Invalid(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Glob(#[from] glob::PatternError)
}

/// Recoverable irregularities collected during a conversion. Returned by
/// value so that batch-parallel callers never share mutable state.
pub type Warnings = Vec<String>;

/// Marker for the packed wire records this crate moves through memory:
/// instrument/wavetable/pulse/filter rows on the source side and the
/// driver-common block on the target side. All of them are flat structs of
/// single bytes, little-endian words and raw byte arrays, in field order.
pub trait AutoReadWrite: Reflect + Struct + Default {  }

pub trait ReadWrite {
    fn write_to<W: Write>(&self, writer: &mut W) -> Result<usize, ConvError>;
    fn read_from<R: Read>(&mut self, reader: &mut R) -> Result<(), ConvError>;
}

fn unsupported_field<T>(index: usize) -> ConvError {
    ConvError::Invalid(format!(
        "packed record {} field {} is not a u8, u16 or byte array",
        std::any::type_name::<T>(),
        index
    ))
}

impl<T: AutoReadWrite> ReadWrite for T {
    fn write_to<W: Write>(&self, writer: &mut W) -> Result<usize, ConvError> {
        let mut bytes_written = 0;
        for field_i in 0..self.field_len() {
            let field = self.field_at(field_i).ok_or_else(|| unsupported_field::<T>(field_i))?;
            match field.reflect_ref() {
                ReflectRef::Value(value) => {
                    if let Some(&byte) = value.downcast_ref::<u8>() {
                        writer.write_u8(byte)?;
                        bytes_written += 1;
                    } else if let Some(&word) = value.downcast_ref::<u16>() {
                        writer.write_u16::<LittleEndian>(word)?;
                        bytes_written += 2;
                    } else {
                        return Err(unsupported_field::<T>(field_i));
                    }
                },
                ReflectRef::Array(array) => {
                    for item in array.iter() {
                        let &byte = item.downcast_ref::<u8>().ok_or_else(|| unsupported_field::<T>(field_i))?;
                        writer.write_u8(byte)?;
                        bytes_written += 1;
                    }
                },
                _ => return Err(unsupported_field::<T>(field_i))
            }
        }
        Ok(bytes_written)
    }

    fn read_from<R: Read>(&mut self, reader: &mut R) -> Result<(), ConvError> {
        for field_i in 0..self.field_len() {
            let field = self.field_at_mut(field_i).ok_or_else(|| unsupported_field::<T>(field_i))?;
            match field.reflect_mut() {
                ReflectMut::Value(value) => {
                    if let Some(byte) = value.downcast_mut::<u8>() {
                        *byte = reader.read_u8()?;
                    } else if let Some(word) = value.downcast_mut::<u16>() {
                        *word = reader.read_u16::<LittleEndian>()?;
                    } else {
                        return Err(unsupported_field::<T>(field_i));
                    }
                },
                ReflectMut::Array(array) => {
                    for item_i in 0..array.len() {
                        let item = array.get_mut(item_i).ok_or_else(|| unsupported_field::<T>(field_i))?;
                        let byte = item.downcast_mut::<u8>().ok_or_else(|| unsupported_field::<T>(field_i))?;
                        *byte = reader.read_u8()?;
                    }
                },
                _ => return Err(unsupported_field::<T>(field_i))
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use bevy_reflect::Reflect;
    use super::*;

    #[derive(Debug, Default, Reflect)]
    struct Probe {
        a: u8,
        b: u16,
        c: [u8; 4]
    }
    impl AutoReadWrite for Probe {  }

    #[test]
    fn packed_records_round_trip_little_endian() {
        let probe = Probe { a: 0x11, b: 0x3322, c: [4, 5, 6, 7] };
        let mut buf = Vec::new();
        let written = probe.write_to(&mut buf).unwrap();
        assert_eq!(written, 7);
        assert_eq!(buf, vec![0x11, 0x22, 0x33, 4, 5, 6, 7]);

        let mut back = Probe::default();
        back.read_from(&mut Cursor::new(&buf)).unwrap();
        assert_eq!(back.a, 0x11);
        assert_eq!(back.b, 0x3322);
        assert_eq!(back.c, [4, 5, 6, 7]);
    }

    #[derive(Debug, Default, Reflect)]
    struct BadProbe {
        a: u64
    }
    impl AutoReadWrite for BadProbe {  }

    #[test]
    fn unsupported_field_shapes_are_an_error_not_a_panic() {
        let mut buf = Vec::new();
        assert!(matches!(BadProbe::default().write_to(&mut buf), Err(ConvError::Invalid(_))));
    }

    #[test]
    fn table_kind_names_are_lowercase() {
        assert_eq!(TableKind::Wavetable.to_string(), "wavetable");
        assert_eq!(TableKind::Instruments.to_string(), "instruments");
    }

    #[test]
    fn table_kind_iterates_all_five_tables() {
        use strum::IntoEnumIterator;
        assert_eq!(TableKind::iter().count(), 5);
    }
}
