//! Reverse-engineering core for converting Laxity NewPlayer v21 SID
//! binaries into SID Factory II projects.
//!
//! The pipeline runs container parse → player fingerprint → table location
//! → sequence decode / table conversion → pointer relocation → emission.
//! Every conversion is a pure function of its input bytes: warnings are
//! returned by value and nothing touches process-global state, so batch
//! drivers can run conversions in parallel without coordination.

pub mod dtype;
pub mod math;
pub mod mos6502;
pub mod np21;
pub mod opinionated_translators;
pub mod sf2;
pub mod sid;
pub mod trace;
