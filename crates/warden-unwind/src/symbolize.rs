//! Address-to-symbol resolution for a supervised task.
//!
//! The symbol map is built from the task's memory map: every executable,
//! file-backed, still-present mapping contributes its ELF symbols, biased
//! for position-independent objects by where the mapping actually landed.

use std::collections::BTreeMap;
use std::path::Path;

use log::warn;
use nix::unistd::Pid;

use warden_core::{Result, proc};

use crate::elf::ElfObject;
use crate::maps::{MapsEntry, parse_maps};

/// Sorted address → symbol-name map. Empty names mark the end of a
/// mapping so that addresses past the last symbol resolve to nothing.
pub type SymbolMap = BTreeMap<u64, String>;

/// Build the symbol map of a live task from `/proc/<pid>/maps`.
pub fn load_symbol_map(pid: Pid) -> Result<SymbolMap> {
    let maps = proc::read_maps(pid)?;
    let entries = parse_maps(&maps)?;
    Ok(build_symbol_map(&entries))
}

/// Build a symbol map from parsed maps entries.
pub fn build_symbol_map(entries: &[MapsEntry]) -> SymbolMap {
    let mut map = SymbolMap::new();
    for entry in entries {
        if !entry.is_symbol_candidate() {
            continue;
        }

        // Mapping boundary markers. Entries are address-ordered, so a
        // marker at `end` is overwritten if the next mapping abuts it.
        let mut marker = format!("map:{}", entry.path);
        if entry.pgoff != 0 {
            marker.push_str(&format!("+0x{:x}", entry.pgoff));
        }
        map.insert(entry.start, marker);
        map.insert(entry.end, String::new());

        let obj = match ElfObject::parse_file(Path::new(&entry.path)) {
            Ok(obj) => obj,
            Err(e) => {
                warn!("could not load symbols for {}: {}", entry.path, e);
                continue;
            }
        };

        for symbol in &obj.symbols {
            if is_arm_mapping_symbol(&symbol.name) {
                continue;
            }
            if obj.position_independent {
                if symbol.address >= entry.pgoff
                    && symbol.address - entry.pgoff < entry.end - entry.start
                {
                    map.insert(
                        symbol.address + entry.start - entry.pgoff,
                        symbol.name.clone(),
                    );
                }
            } else if symbol.address >= entry.start && symbol.address < entry.end {
                map.insert(symbol.address, symbol.name.clone());
            }
        }
    }
    map
}

/// Resolve one address against the map.
///
/// An exact hit returns the demangled name; an address between two
/// symbols returns `name+0xoffset`; anything outside the mapped symbol
/// ranges returns an empty string.
pub fn symbol_at(map: &SymbolMap, addr: u64) -> String {
    if let Some(name) = map.get(&addr) {
        return demangle(name);
    }
    match map.range(..addr).next_back() {
        Some((prev_addr, name)) if !name.is_empty() => {
            format!("{}+0x{:x}", demangle(name), addr - prev_addr)
        }
        _ => String::new(),
    }
}

/// Format a walked frame list against the map, one string per frame.
pub fn symbolize(map: &SymbolMap, ips: &[u64]) -> Vec<String> {
    ips.iter()
        .map(|&ip| format!("{}(0x{:x})", symbol_at(map, ip), ip))
        .collect()
}

/// Collapse runs of identical frames, for log output.
pub fn compact_frames(frames: &[String]) -> Vec<String> {
    let mut compact = Vec::with_capacity(frames.len());
    let mut seen = 0usize;
    let mut prev: Option<&String> = None;
    let add_repeats = |compact: &mut Vec<String>, seen: usize| {
        if seen != 0 {
            compact.push(format!("(previous frame repeated {} times)", seen));
        }
    };
    for frame in frames {
        if prev == Some(frame) {
            seen += 1;
        } else {
            add_repeats(&mut compact, seen);
            seen = 0;
            prev = Some(frame);
            compact.push(frame.clone());
        }
    }
    add_repeats(&mut compact, seen);
    compact
}

fn demangle(name: &str) -> String {
    match cpp_demangle::Symbol::new(name) {
        Ok(symbol) => symbol.to_string(),
        Err(_) => name.to_string(),
    }
}

/// ARM toolchains emit `$x`/`$d`/`$t`/`$a`/`$v` markers that describe the
/// instruction set of a region, not code locations.
fn is_arm_mapping_symbol(name: &str) -> bool {
    if !cfg!(any(target_arch = "aarch64", target_arch = "arm")) {
        return false;
    }
    ["$x", "$d", "$t", "$a", "$v"]
        .iter()
        .any(|prefix| name.starts_with(prefix))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_map() -> SymbolMap {
        let mut map = SymbolMap::new();
        map.insert(0x1000, "map:/usr/bin/demo".to_string());
        map.insert(0x1100, "alpha".to_string());
        map.insert(0x1200, "_ZN4demo5bravoEv".to_string());
        map.insert(0x2000, String::new());
        map
    }

    #[test]
    fn exact_hit() {
        assert_eq!(symbol_at(&sample_map(), 0x1100), "alpha");
    }

    #[test]
    fn offset_within_function() {
        assert_eq!(symbol_at(&sample_map(), 0x1140), "alpha+0x40");
    }

    #[test]
    fn demangles_cpp_names() {
        assert_eq!(symbol_at(&sample_map(), 0x1200), "demo::bravo()");
    }

    #[test]
    fn address_past_end_marker() {
        assert_eq!(symbol_at(&sample_map(), 0x3000), "");
    }

    #[test]
    fn address_before_first_symbol() {
        assert_eq!(symbol_at(&sample_map(), 0x10), "");
    }

    #[test]
    fn symbolize_formats_frames() {
        let frames = symbolize(&sample_map(), &[0x1100, 0x1140]);
        assert_eq!(frames, vec!["alpha(0x1100)", "alpha+0x40(0x1140)"]);
    }

    #[test]
    fn compact_collapses_repeats() {
        let frames: Vec<String> = ["a", "b", "b", "b", "c"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let compact = compact_frames(&frames);
        assert_eq!(
            compact,
            vec!["a", "b", "(previous frame repeated 2 times)", "c"]
        );
    }

    #[test]
    fn compact_handles_trailing_repeats() {
        let frames: Vec<String> = ["x", "x"].iter().map(|s| s.to_string()).collect();
        let compact = compact_frames(&frames);
        assert_eq!(compact, vec!["x", "(previous frame repeated 1 times)"]);
    }

    #[test]
    fn builds_map_from_own_process() {
        let content = std::fs::read_to_string("/proc/self/maps").unwrap();
        let entries = parse_maps(&content).unwrap();
        let map = build_symbol_map(&entries);
        assert!(map.values().any(|name| name.starts_with("map:")));
    }
}
