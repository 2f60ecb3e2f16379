//! Supported emulated platforms and their default read ranges.
//!
//! A mapper that declares no `<read>` ranges is polled using the ranges
//! listed here for its platform.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::memory::{MemoryAddress, MemoryAddressBlock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Platform {
    #[serde(rename = "NES")]
    Nes,
    #[serde(rename = "SNES")]
    Snes,
    #[serde(rename = "GB")]
    Gb,
    #[serde(rename = "GBC")]
    Gbc,
    #[serde(rename = "GBA")]
    Gba,
    #[serde(rename = "PSX")]
    Psx,
    #[serde(rename = "NDS")]
    Nds,
}

/// A named default range: `(label, start, end)` with an inclusive end.
pub struct DefaultRange {
    pub label: &'static str,
    pub start: MemoryAddress,
    pub end: MemoryAddress,
}

const fn range(label: &'static str, start: MemoryAddress, end: MemoryAddress) -> DefaultRange {
    DefaultRange { label, start, end }
}

pub const NES_RANGES: &[DefaultRange] = &[
    range("Internal RAM", 0x0000, 0x07FF),
    range("Cartridge SRAM", 0x6000, 0x7FFF),
];

pub const SNES_RANGES: &[DefaultRange] = &[
    range("WRAM 1", 0x7E0000, 0x7EFFFF),
    range("WRAM 2", 0x7F0000, 0x7FFFFF),
];

pub const GB_RANGES: &[DefaultRange] = &[
    range("Cartridge RAM", 0xA000, 0xBFFF),
    range("WRAM", 0xC000, 0xDFFF),
    range("HRAM", 0xFF80, 0xFFFE),
];

pub const GBC_RANGES: &[DefaultRange] = &[
    range("Cartridge RAM", 0xA000, 0xBFFF),
    range("WRAM Bank 0", 0xC000, 0xCFFF),
    range("WRAM Bank N", 0xD000, 0xDFFF),
    range("HRAM", 0xFF80, 0xFFFE),
];

pub const GBA_RANGES: &[DefaultRange] = &[
    range("EWRAM 1", 0x0200_0000, 0x0201_FFFF),
    range("EWRAM 2", 0x0202_0000, 0x0203_FFFF),
    range("IWRAM", 0x0300_0000, 0x0300_7FFF),
];

pub const PSX_RANGES: &[DefaultRange] = &[
    range("Main RAM 1", 0x8000_0000, 0x800F_FFFF),
    range("Main RAM 2", 0x8010_0000, 0x801F_FFFF),
];

pub const NDS_RANGES: &[DefaultRange] = &[
    range("Main RAM 1", 0x0200_0000, 0x020F_FFFF),
    range("Main RAM 2", 0x0210_0000, 0x021F_FFFF),
    range("Main RAM 3", 0x0220_0000, 0x022F_FFFF),
    range("Main RAM 4", 0x0230_0000, 0x023F_FFFF),
];

impl Platform {
    pub const ALL: [Platform; 7] = [
        Platform::Nes,
        Platform::Snes,
        Platform::Gb,
        Platform::Gbc,
        Platform::Gba,
        Platform::Psx,
        Platform::Nds,
    ];

    /// The identifier mappers use for this platform.
    pub fn code(&self) -> &'static str {
        match self {
            Platform::Nes => "NES",
            Platform::Snes => "SNES",
            Platform::Gb => "GB",
            Platform::Gbc => "GBC",
            Platform::Gba => "GBA",
            Platform::Psx => "PSX",
            Platform::Nds => "NDS",
        }
    }

    pub fn default_ranges(&self) -> &'static [DefaultRange] {
        match self {
            Platform::Nes => NES_RANGES,
            Platform::Snes => SNES_RANGES,
            Platform::Gb => GB_RANGES,
            Platform::Gbc => GBC_RANGES,
            Platform::Gba => GBA_RANGES,
            Platform::Psx => PSX_RANGES,
            Platform::Nds => NDS_RANGES,
        }
    }

    /// Default ranges as fetchable blocks, in table order.
    pub fn default_blocks(&self) -> Vec<MemoryAddressBlock> {
        self.default_ranges()
            .iter()
            .map(|r| MemoryAddressBlock::new(r.label, r.start, r.end))
            .collect()
    }
}

impl FromStr for Platform {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Platform::ALL
            .into_iter()
            .find(|p| p.code() == s)
            .ok_or_else(|| Error::UnknownPlatform(s.to_string()))
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}
