//! ECU variant identification.
//!
//! Each known variant is recognised by a short byte signature at a fixed
//! memory offset. Catalog order encodes priority: the first profile whose
//! signature matches wins, so more specific variants are listed before the
//! broader ones sharing an offset.

use crate::error::ProtocolError;
use crate::executor::CommandHandle;
use tracing::{debug, info};

/// Memory-layout geometry of an ECU variant. Only used for operator-facing
/// description on the logging path; polling never touches these offsets.
#[derive(Debug, Clone)]
pub struct EcuProfile {
    pub name: &'static str,
    pub eeprom_size_bytes: u32,
    pub memory_offset: i64,
    pub bin_offset: i64,
    pub memory_write_offset: i64,
    pub calibration_size_bytes: u32,
    pub calibration_size_bytes_flash: u32,
    pub program_section_offset: u32,
    pub program_section_size: u32,
    pub program_section_flash_size: u32,
    pub program_section_flash_bin_offset: u32,
    pub program_section_flash_memory_offset: i64,
}

/// One identification catalog entry: where to read, what byte signatures to
/// accept, and the profile they identify.
pub struct IdentificationEntry {
    pub offset: u32,
    pub signatures: &'static [&'static [u8]],
    pub profile: EcuProfile,
}

pub static IDENTIFICATION_TABLE: &[IdentificationEntry] = &[
    IdentificationEntry {
        offset: 0x82014,
        signatures: &[b"6621"],
        profile: EcuProfile {
            name: "SIMK43 8mbit",
            eeprom_size_bytes: 1_048_576,
            memory_offset: 0,
            bin_offset: 0,
            memory_write_offset: -0x7000,
            calibration_size_bytes: 0x10000,
            calibration_size_bytes_flash: 0xFEFE,
            program_section_offset: 0xA0000,
            program_section_size: 0x60000,
            program_section_flash_size: 0x5FFE8,
            program_section_flash_bin_offset: 0xA0010,
            program_section_flash_memory_offset: 0x10,
        },
    },
    IdentificationEntry {
        offset: 0x90040,
        signatures: &[b"ca66"],
        profile: EcuProfile {
            name: "SIMK43 2.0 4mbit",
            eeprom_size_bytes: 524_288,
            memory_offset: 0,
            bin_offset: -0x80000,
            memory_write_offset: -0x7000,
            calibration_size_bytes: 0x10000,
            calibration_size_bytes_flash: 0xFEFE,
            program_section_offset: 0xA0000,
            program_section_size: 0x60000,
            program_section_flash_size: 0x5FFE8,
            program_section_flash_bin_offset: 0x20010,
            program_section_flash_memory_offset: 0x10,
        },
    },
    IdentificationEntry {
        offset: 0x88040,
        signatures: &[b"ca65401"],
        profile: EcuProfile {
            name: "SIMK43 V6 4mbit (5WY17)",
            eeprom_size_bytes: 524_288,
            memory_offset: -0x8000,
            bin_offset: -0x88000,
            memory_write_offset: -0x7800,
            calibration_size_bytes: 0x8000,
            calibration_size_bytes_flash: 0x5F40,
            program_section_offset: 0x98000,
            program_section_size: 0x70000,
            program_section_flash_size: 0x6FFE4,
            program_section_flash_bin_offset: 0x10010,
            program_section_flash_memory_offset: -0x7FF0,
        },
    },
    IdentificationEntry {
        offset: 0x88040,
        signatures: &[b"ca654", b"ca655"],
        profile: EcuProfile {
            name: "SIMK43 V6 4mbit (5WY18+)",
            eeprom_size_bytes: 524_288,
            memory_offset: -0x8000,
            bin_offset: -0x88000,
            memory_write_offset: -0x7800,
            calibration_size_bytes: 0x8000,
            calibration_size_bytes_flash: 0x6F20,
            program_section_offset: 0x98000,
            program_section_size: 0x70000,
            program_section_flash_size: 0x6FFE4,
            program_section_flash_bin_offset: 0x10010,
            program_section_flash_memory_offset: -0x7FF0,
        },
    },
    IdentificationEntry {
        offset: 0x48040,
        signatures: &[b"ca660", b"ca652", b"ca650"],
        profile: EcuProfile {
            name: "SIMK41 / V6 2mbit",
            eeprom_size_bytes: 262_144,
            memory_offset: -0x48000,
            bin_offset: -0x88000,
            memory_write_offset: -0xB800,
            calibration_size_bytes: 0x8000,
            calibration_size_bytes_flash: 0x7F00,
            program_section_offset: 0x98000,
            program_section_size: 0x30000,
            program_section_flash_size: 0x2FFF0,
            program_section_flash_bin_offset: 0x10010,
            program_section_flash_memory_offset: -0x47FF0,
        },
    },
    IdentificationEntry {
        offset: 0x88040,
        signatures: &[b"ca661"],
        profile: EcuProfile {
            name: "SIMK43 2.0 4mbit (Sonata)",
            eeprom_size_bytes: 524_288,
            memory_offset: -0x8000,
            bin_offset: -0x88000,
            memory_write_offset: -0x7800,
            calibration_size_bytes: 0x8000,
            calibration_size_bytes_flash: 0x5F40,
            program_section_offset: 0x98000,
            program_section_size: 0x70000,
            program_section_flash_size: 0x6FFE4,
            program_section_flash_bin_offset: 0x10010,
            program_section_flash_memory_offset: -0x7FF0,
        },
    },
];

/// Match `data` against a catalog entry's accepted signature alternatives.
fn matches_entry(entry: &IdentificationEntry, data: &[u8]) -> bool {
    entry
        .signatures
        .iter()
        .any(|signature| *signature == data)
}

/// Walk the catalog in order, reading each entry's identification region and
/// returning the first profile with a byte-exact signature match. Individual
/// read failures skip to the next entry; no match at all aborts the session.
pub async fn identify(handle: &CommandHandle) -> Result<&'static EcuProfile, ProtocolError> {
    for entry in IDENTIFICATION_TABLE {
        let Some(first) = entry.signatures.first() else {
            continue;
        };

        match handle.read_memory(entry.offset, first.len() as u8).await {
            Ok(data) => {
                if matches_entry(entry, &data) {
                    info!("identified ECU: {}", entry.profile.name);
                    return Ok(&entry.profile);
                }
            }
            Err(e) => {
                debug!(
                    "identification read at 0x{:05X} failed: {} (trying next profile)",
                    entry.offset, e
                );
            }
        }
    }

    Err(ProtocolError::IdentificationFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_alternatives_all_accepted() {
        let entry = &IDENTIFICATION_TABLE[4];
        assert!(matches_entry(entry, b"ca660"));
        assert!(matches_entry(entry, b"ca652"));
        assert!(matches_entry(entry, b"ca650"));
        assert!(!matches_entry(entry, b"ca651"));
    }

    #[test]
    fn length_mismatch_never_matches() {
        let entry = &IDENTIFICATION_TABLE[0];
        assert!(matches_entry(entry, b"6621"));
        assert!(!matches_entry(entry, b"662"));
        assert!(!matches_entry(entry, b"66211"));
    }

    #[test]
    fn catalog_order_is_priority_order() {
        // Three entries probe the same offset; the 5WY17 variant must come
        // before the broader 5WY18+ alternatives.
        let shared: Vec<usize> = IDENTIFICATION_TABLE
            .iter()
            .enumerate()
            .filter(|(_, e)| e.offset == 0x88040)
            .map(|(i, _)| i)
            .collect();
        assert_eq!(shared, vec![2, 3, 5]);
        assert_eq!(IDENTIFICATION_TABLE[2].profile.name, "SIMK43 V6 4mbit (5WY17)");
    }

    #[test]
    fn every_entry_has_a_signature() {
        for entry in IDENTIFICATION_TABLE {
            assert!(!entry.signatures.is_empty());
            for signature in entry.signatures {
                assert_eq!(signature.len(), entry.signatures[0].len());
            }
        }
    }
}
