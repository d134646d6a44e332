//! Mach-O file format handling.
//!
//! This module provides the raw layouts and constants of the Mach-O format and
//! the node payloads built from them: fat binaries, images, load commands,
//! segments, sections, and symbol and string tables.

mod constants;
mod structs;

pub mod fat;
pub mod image;
pub mod load_command;
pub mod segment;
pub mod strings;
pub mod symbols;

pub use constants::*;
pub use structs::*;

pub use fat::{FatArch, FatBinary};
pub use image::{ImageLayout, MachImage};
pub use load_command::{LoadCommand, LoadCommandKind, RawLoadCommand};
pub use segment::{Section, Segment};
pub use strings::{CStringNode, StringTable, MAX_CSTRING_LENGTH};
pub use symbols::{RawSymbol, StabValue, Symbol, SymbolKind, SymbolTable};
