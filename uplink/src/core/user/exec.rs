//! # Executable
//!
//! Module providing symbol resolution in ELF executables and shared libraries,
//! so probes can target a function by its name.

use std::{
    collections::{hash_map::Entry, HashMap},
    env, fmt, fs,
    path::{Path, PathBuf},
};

use anyhow::{anyhow, bail, Result};
use elf::{abi, endian::AnyEndian, segment::ProgramHeader, ElfBytes};
use log::debug;
use once_cell::sync::OnceCell;

use crate::core::probe::ProbeError;

/// Options controlling where and for which process a user probe is
/// installed.
#[derive(Clone, Debug, Default)]
pub struct UprobeOptions {
    /// Absolute file offset of the probe. When set, the symbol table is not
    /// used and the caller is responsible for the offset being valid.
    pub offset: u64,
    /// Offset added to the resolved address.
    pub relative_offset: u64,
    /// Only trigger the probe for this process. `None` means all processes.
    pub pid: Option<i32>,
    /// File offset of a reference counter (semaphore) the kernel increments
    /// while the probe is installed, used by USDT probes.
    pub ref_ctr_offset: u64,
}

/// A function symbol of an executable.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct ElfSymbol {
    /// Symbol value, its virtual address.
    pub(crate) value: u64,
    /// Size of the function, in bytes.
    pub(crate) size: u64,
    /// Index of the section the symbol is defined in.
    pub(crate) section: u16,
    /// File offset the value translates to.
    pub(crate) offset: u64,
}

impl ElfSymbol {
    /// Symbols without an address in the file can't be probed. Those are
    /// imported from other objects and only get an address at runtime.
    fn resolvable(&self) -> bool {
        self.section != abi::SHN_UNDEF && self.value != 0
    }
}

/// An executable or shared library on disk, in which user probes can be
/// installed.
pub struct Executable {
    /// Path of the file.
    path: PathBuf,
    /// Function symbols, by name. Parsed on first use.
    symbols: OnceCell<HashMap<String, ElfSymbol>>,
}

impl Executable {
    /// Open an executable. The file has to exist and be readable; its
    /// symbols are only parsed when first needed.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Executable> {
        let path = path.as_ref();
        if path.as_os_str().is_empty() {
            bail!(ProbeError::InvalidPath("empty path".to_string()));
        }

        let invalid =
            |reason: String| ProbeError::InvalidPath(format!("{}: {reason}", path.display()));
        let file = fs::File::open(path).map_err(|e| invalid(e.to_string()))?;
        if !file.metadata().map_err(|e| invalid(e.to_string()))?.is_file() {
            bail!(invalid("not a regular file".to_string()));
        }

        // The kernel resolves paths itself, make sure it does not depend on
        // our working directory.
        let path = match path.is_absolute() {
            true => path.to_path_buf(),
            false => env::current_dir()?.join(path),
        };

        Ok(Executable {
            path,
            symbols: OnceCell::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Compute the file offset to probe for a given symbol.
    ///
    /// If `opts.offset` is set it is used without looking at the symbol table.
    /// Otherwise the symbol file offset is used. In both cases
    /// `opts.relative_offset` is added to the result.
    pub fn offset(&self, symbol: &str, opts: &UprobeOptions) -> Result<u64> {
        let base = match opts.offset {
            0 => self.symbol_offset(symbol)?,
            offset => offset,
        };

        base.checked_add(opts.relative_offset)
            .ok_or_else(|| anyhow!("Offset overflow for {symbol} in {}", self))
    }

    /// Returns all probe-able function symbols as `(name, file offset, size)`,
    /// sorted by offset.
    pub fn symbols(&self) -> Result<Vec<(&str, u64, u64)>> {
        let mut symbols: Vec<(&str, u64, u64)> = self
            .table()?
            .iter()
            .filter(|(_, sym)| sym.resolvable())
            .map(|(name, sym)| (name.as_str(), sym.offset, sym.size))
            .collect();
        symbols.sort_by(|a, b| a.1.cmp(&b.1).then(a.0.cmp(b.0)));
        Ok(symbols)
    }

    fn symbol_offset(&self, symbol: &str) -> Result<u64> {
        match self.table()?.get(symbol) {
            Some(sym) if sym.resolvable() => Ok(sym.offset),
            _ => bail!(ProbeError::NoSymbol(format!("{symbol} in {self}"))),
        }
    }

    #[cfg(test)]
    pub(crate) fn symbol(&self, symbol: &str) -> Result<Option<ElfSymbol>> {
        Ok(self.table()?.get(symbol).copied())
    }

    fn table(&self) -> Result<&HashMap<String, ElfSymbol>> {
        self.symbols.get_or_try_init(|| {
            let symbols = parse_symbols(&self.path)?;
            debug!("Parsed {} function symbols from {}", symbols.len(), self);
            Ok(symbols)
        })
    }
}

impl fmt::Display for Executable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path.display())
    }
}

/// Parse the function symbols of an ELF file, from both its static and
/// dynamic symbol tables.
fn parse_symbols(path: &Path) -> Result<HashMap<String, ElfSymbol>> {
    let file_data = fs::read(path)?;
    let file = ElfBytes::<AnyEndian>::minimal_parse(file_data.as_slice())?;

    // Executable loadable segments, used to convert virtual addresses into
    // file offsets.
    let segments: Vec<ProgramHeader> = match file.segments() {
        Some(segments) => segments
            .iter()
            .filter(|p| p.p_type == abi::PT_LOAD && p.p_flags & abi::PF_X != 0)
            .collect(),
        None => Vec::new(),
    };

    let mut symbols = HashMap::new();
    for (table, strtab) in [file.symbol_table()?, file.dynamic_symbol_table()?]
        .into_iter()
        .flatten()
    {
        for sym in table.iter() {
            if sym.st_symtype() != abi::STT_FUNC {
                continue;
            }

            let name = strtab.get(sym.st_name as usize)?;
            if name.is_empty() {
                continue;
            }

            let symbol = ElfSymbol {
                value: sym.st_value,
                size: sym.st_size,
                section: sym.st_shndx,
                offset: file_offset(&segments, sym.st_value),
            };

            // A symbol can be in both tables, or be undefined in one of them.
            // Keep the first definition found.
            match symbols.entry(name.to_string()) {
                Entry::Vacant(e) => {
                    e.insert(symbol);
                }
                Entry::Occupied(mut e) if !e.get().resolvable() && symbol.resolvable() => {
                    e.insert(symbol);
                }
                _ => (),
            }
        }
    }

    Ok(symbols)
}

/// Translate a virtual address to a file offset, using the segment holding it.
/// Addresses outside of any executable segment are returned unchanged.
fn file_offset(segments: &[ProgramHeader], addr: u64) -> u64 {
    segments
        .iter()
        .filter(|p| p.p_vaddr <= addr && addr - p.p_vaddr < p.p_memsz)
        .find_map(|p| (addr - p.p_vaddr).checked_add(p.p_offset))
        .unwrap_or(addr)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Function used as a probe target in tests. Not mangled so its name is
    /// known, and referenced so it is kept by the linker.
    #[no_mangle]
    #[inline(never)]
    pub extern "C" fn uplink_test_target(x: u64) -> u64 {
        std::hint::black_box(x).wrapping_add(1)
    }

    pub(crate) const TEST_SYMBOL: &str = "uplink_test_target";

    pub(crate) fn test_executable() -> Executable {
        assert_eq!(uplink_test_target(std::hint::black_box(1)), 2);
        Executable::open(env::current_exe().unwrap()).unwrap()
    }

    #[test]
    fn open() {
        let err = Executable::open("").err().unwrap();
        assert!(matches!(
            err.downcast_ref::<ProbeError>(),
            Some(ProbeError::InvalidPath(_))
        ));

        let err = Executable::open("_no_way_this_path/_exists").err().unwrap();
        assert!(matches!(
            err.downcast_ref::<ProbeError>(),
            Some(ProbeError::InvalidPath(_))
        ));

        assert!(Executable::open("/").is_err());

        let ex = Executable::open("/bin/sh").unwrap();
        assert_eq!(ex.path(), Path::new("/bin/sh"));
        assert_eq!(format!("{ex}"), "/bin/sh");
    }

    #[test]
    fn symbol_lookup() {
        let ex = test_executable();

        let sym = ex.symbol(TEST_SYMBOL).unwrap().unwrap();
        assert!(sym.resolvable());
        assert!(sym.size > 0);
        assert!(ex.offset(TEST_SYMBOL, &UprobeOptions::default()).unwrap() > 0);

        assert!(ex
            .symbols()
            .unwrap()
            .iter()
            .any(|(name, offset, size)| *name == TEST_SYMBOL
                && *offset == sym.offset
                && *size == sym.size));

        let err = ex.offset("bogus", &UprobeOptions::default()).err().unwrap();
        assert!(matches!(
            err.downcast_ref::<ProbeError>(),
            Some(ProbeError::NoSymbol(_))
        ));
    }

    #[test]
    fn undefined_symbol() {
        let ex = test_executable();

        // Imported from libc, present in the tables but undefined.
        if let Some(sym) = ex.symbol("malloc").unwrap() {
            if sym.resolvable() {
                // Statically linked, nothing to check.
                return;
            }
        }

        let err = ex.offset("malloc", &UprobeOptions::default()).err().unwrap();
        assert!(matches!(
            err.downcast_ref::<ProbeError>(),
            Some(ProbeError::NoSymbol(_))
        ));

        // An explicit offset bypasses the symbol table.
        let opts = UprobeOptions {
            offset: 0x1,
            ..Default::default()
        };
        assert_eq!(ex.offset("malloc", &opts).unwrap(), 0x1);
    }

    #[test]
    fn offset_options() {
        let ex = test_executable();
        let symbol_offset = ex.offset(TEST_SYMBOL, &UprobeOptions::default()).unwrap();

        let opts = UprobeOptions {
            offset: 0x1,
            ..Default::default()
        };
        assert_eq!(ex.offset(TEST_SYMBOL, &opts).unwrap(), 0x1);

        let opts = UprobeOptions {
            relative_offset: 0x2,
            ..Default::default()
        };
        assert_eq!(ex.offset(TEST_SYMBOL, &opts).unwrap(), symbol_offset + 0x2);

        let opts = UprobeOptions {
            offset: 0x1,
            relative_offset: 0x2,
            ..Default::default()
        };
        assert_eq!(ex.offset(TEST_SYMBOL, &opts).unwrap(), 0x1 + 0x2);

        let opts = UprobeOptions {
            offset: u64::MAX,
            relative_offset: 0x1,
            ..Default::default()
        };
        assert!(ex.offset(TEST_SYMBOL, &opts).is_err());
    }

    #[test]
    fn segment_offsets() {
        let text = ProgramHeader {
            p_type: abi::PT_LOAD,
            p_offset: 0x1000,
            p_vaddr: 0x401000,
            p_paddr: 0x401000,
            p_filesz: 0x2000,
            p_memsz: 0x2000,
            p_flags: abi::PF_R | abi::PF_X,
            p_align: 0x1000,
        };

        let segments = [text];

        assert_eq!(file_offset(&segments, 0x401234), 0x1234);
        assert_eq!(file_offset(&segments, 0x403000), 0x403000);
        assert_eq!(file_offset(&[], 0x1234), 0x1234);

        // Segments at the very end of the address space.
        let end = [ProgramHeader {
            p_type: abi::PT_LOAD,
            p_offset: 0x1000,
            p_vaddr: u64::MAX - 1,
            p_paddr: u64::MAX - 1,
            p_filesz: 0x10,
            p_memsz: 0x10,
            p_flags: abi::PF_R | abi::PF_X,
            p_align: 0x1000,
        }];
        assert_eq!(file_offset(&end, u64::MAX), 0x1001);
        assert_eq!(file_offset(&end, 0x1234), 0x1234);

        let bad_offset = ProgramHeader {
            p_type: abi::PT_LOAD,
            p_offset: u64::MAX,
            p_vaddr: 0x401000,
            p_paddr: 0x401000,
            p_filesz: 0x2000,
            p_memsz: 0x2000,
            p_flags: abi::PF_R | abi::PF_X,
            p_align: 0x1000,
        };
        assert_eq!(file_offset(&[bad_offset], 0x401234), 0x401234);
    }
}
