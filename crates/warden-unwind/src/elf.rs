//! Minimal ELF64 reader: just enough to pull symbol tables out of the
//! file-backed mappings of a supervised task.
//!
//! Only little-endian ELF64 is handled, which covers every architecture
//! the monitor runs on. Sections other than `.symtab`/`.dynsym` and their
//! string tables are ignored.

use std::fs;
use std::path::Path;

use warden_core::{Result, WardenError};

const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;
const ET_DYN: u16 = 3;

const SHT_SYMTAB: u32 = 2;
const SHT_DYNSYM: u32 = 11;

const EHDR_SIZE: usize = 64;
const SHDR_SIZE: usize = 64;
const SYM_SIZE: usize = 24;

/// A named symbol with its file-relative address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    pub address: u64,
    pub name: String,
}

/// Symbols of one ELF object.
#[derive(Debug, Clone)]
pub struct ElfObject {
    /// ET_DYN objects are mapped at an arbitrary base; symbol addresses
    /// are file-relative and must be biased by the mapping.
    pub position_independent: bool,
    pub symbols: Vec<Symbol>,
}

impl ElfObject {
    /// Parse the symbol tables of the file at `path`.
    pub fn parse_file(path: &Path) -> Result<ElfObject> {
        let data = fs::read(path)
            .map_err(|e| WardenError::Unwind(format!("read {}: {}", path.display(), e)))?;
        Self::parse(&data)
            .map_err(|e| WardenError::Unwind(format!("parse {}: {}", path.display(), e)))
    }

    /// Parse an in-memory ELF image.
    pub fn parse(data: &[u8]) -> Result<ElfObject> {
        let bad = |what: &str| WardenError::Unwind(format!("malformed ELF: {}", what));

        if data.len() < EHDR_SIZE {
            return Err(bad("truncated header"));
        }
        if data[0..4] != ELF_MAGIC {
            return Err(bad("bad magic"));
        }
        if data[4] != ELFCLASS64 || data[5] != ELFDATA2LSB {
            return Err(bad("not little-endian ELF64"));
        }

        let e_type = read_u16(data, 16).ok_or_else(|| bad("e_type"))?;
        let shoff = read_u64(data, 40).ok_or_else(|| bad("e_shoff"))? as usize;
        let shentsize = read_u16(data, 58).ok_or_else(|| bad("e_shentsize"))? as usize;
        let shnum = read_u16(data, 60).ok_or_else(|| bad("e_shnum"))? as usize;
        if shentsize < SHDR_SIZE {
            return Err(bad("e_shentsize"));
        }

        let mut symbols = Vec::new();
        for i in 0..shnum {
            let sh = shoff + i * shentsize;
            let sh_type = read_u32(data, sh + 4).ok_or_else(|| bad("sh_type"))?;
            if sh_type != SHT_SYMTAB && sh_type != SHT_DYNSYM {
                continue;
            }
            let sh_offset = read_u64(data, sh + 24).ok_or_else(|| bad("sh_offset"))? as usize;
            let sh_size = read_u64(data, sh + 32).ok_or_else(|| bad("sh_size"))? as usize;
            let sh_link = read_u32(data, sh + 40).ok_or_else(|| bad("sh_link"))? as usize;
            let sh_entsize = read_u64(data, sh + 56).ok_or_else(|| bad("sh_entsize"))? as usize;
            if sh_entsize < SYM_SIZE || sh_link >= shnum {
                continue;
            }

            // String table the symbol names point into.
            let str_sh = shoff + sh_link * shentsize;
            let str_offset = read_u64(data, str_sh + 24).ok_or_else(|| bad("strtab offset"))? as usize;
            let str_size = read_u64(data, str_sh + 32).ok_or_else(|| bad("strtab size"))? as usize;
            let str_end = str_offset
                .checked_add(str_size)
                .ok_or_else(|| bad("strtab bounds"))?;
            let strtab = data
                .get(str_offset..str_end)
                .ok_or_else(|| bad("strtab bounds"))?;

            let count = sh_size / sh_entsize;
            for n in 0..count {
                let sym = sh_offset + n * sh_entsize;
                let name_off = read_u32(data, sym).ok_or_else(|| bad("st_name"))? as usize;
                let value = read_u64(data, sym + 8).ok_or_else(|| bad("st_value"))?;
                if name_off == 0 || value == 0 {
                    continue;
                }
                if let Some(name) = read_cstr(strtab, name_off) {
                    if !name.is_empty() {
                        symbols.push(Symbol {
                            address: value,
                            name: name.to_string(),
                        });
                    }
                }
            }
        }

        Ok(ElfObject {
            position_independent: e_type == ET_DYN,
            symbols,
        })
    }
}

fn read_u16(data: &[u8], at: usize) -> Option<u16> {
    data.get(at..at + 2)
        .map(|b| u16::from_le_bytes(b.try_into().unwrap()))
}

fn read_u32(data: &[u8], at: usize) -> Option<u32> {
    data.get(at..at + 4)
        .map(|b| u32::from_le_bytes(b.try_into().unwrap()))
}

fn read_u64(data: &[u8], at: usize) -> Option<u64> {
    data.get(at..at + 8)
        .map(|b| u64::from_le_bytes(b.try_into().unwrap()))
}

fn read_cstr(strtab: &[u8], at: usize) -> Option<&str> {
    let tail = strtab.get(at..)?;
    let end = tail.iter().position(|&b| b == 0)?;
    std::str::from_utf8(&tail[..end]).ok()
}
