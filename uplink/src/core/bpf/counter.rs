//! # Counter
//!
//! A minimal eBPF program counting probe hits. Each program instance
//! increments one slot of a shared array map, so a single map can count hits
//! of several probes.

use std::{
    ffi::{c_char, CString},
    mem,
    os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd},
};

use anyhow::{anyhow, bail, Result};
use libbpf_rs::{MapCore, MapFlags, MapHandle, MapType};
use log::debug;
use nix::errno::Errno;

use crate::core::{inspect::KernelVersion, probe::ProbeError};

/// Size of the verifier log buffer used when a load fails.
const LOG_BUF_SIZE: usize = 64 * 1024;

/// Array map holding one hit counter per slot.
pub struct CounterMap {
    map: MapHandle,
    size: u32,
}

impl CounterMap {
    /// Create a map with `size` counters, all set to 0.
    pub fn new(size: u32) -> Result<Self> {
        if size == 0 {
            bail!("Counter maps need at least one slot");
        }

        let opts = libbpf_sys::bpf_map_create_opts {
            sz: mem::size_of::<libbpf_sys::bpf_map_create_opts>() as libbpf_sys::size_t,
            ..Default::default()
        };

        let map = MapHandle::create(
            MapType::Array,
            Some("uplink_counter"),
            mem::size_of::<u32>() as u32,
            mem::size_of::<u64>() as u32,
            size,
            &opts,
        )
        .or_else(|e| bail!("Could not create the counter map: {}", e))?;

        Ok(CounterMap { map, size })
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    fn check_slot(&self, slot: u32) -> Result<()> {
        if slot >= self.size {
            bail!("Counter slot {slot} out of range (size {})", self.size);
        }
        Ok(())
    }

    /// Load a program incrementing the counter at `slot` each time it runs.
    pub fn program(&self, slot: u32) -> Result<CounterProgram> {
        self.check_slot(slot)?;
        CounterProgram::load(&counter_insns(self.map.as_fd().as_raw_fd(), slot))
    }

    /// Current value of the counter at `slot`.
    pub fn get(&self, slot: u32) -> Result<u64> {
        self.check_slot(slot)?;

        let val = self
            .map
            .lookup(&slot.to_ne_bytes(), MapFlags::ANY)?
            .ok_or_else(|| anyhow!("No counter at slot {slot}"))?;
        let val: [u8; 8] = val
            .as_slice()
            .try_into()
            .map_err(|_| anyhow!("Invalid counter value size ({})", val.len()))?;

        Ok(u64::from_ne_bytes(val))
    }

    /// Set the counter at `slot` back to 0.
    pub fn reset(&self, slot: u32) -> Result<()> {
        self.check_slot(slot)?;
        self.map
            .update(&slot.to_ne_bytes(), &0u64.to_ne_bytes(), MapFlags::ANY)?;
        Ok(())
    }
}

/// A loaded counter program. Can be attached to a probe using
/// `UprobeLink::attach`; it is unloaded once dropped and no probe uses it.
#[derive(Debug)]
pub struct CounterProgram {
    fd: OwnedFd,
}

impl CounterProgram {
    fn load(insns: &[u64]) -> Result<Self> {
        let name = CString::new("uplink_counter")?;
        let license = CString::new("GPL")?;

        // Kprobe programs must match the running kernel version on old
        // releases.
        let mut opts = libbpf_sys::bpf_prog_load_opts {
            sz: mem::size_of::<libbpf_sys::bpf_prog_load_opts>() as libbpf_sys::size_t,
            kern_version: KernelVersion::current()?.code(),
            ..Default::default()
        };

        let load = |opts: &mut libbpf_sys::bpf_prog_load_opts| {
            // SAFETY: insns is a valid array of eBPF instructions, which are
            // 8 bytes each. All pointers outlive the call.
            unsafe {
                libbpf_sys::bpf_prog_load(
                    libbpf_sys::BPF_PROG_TYPE_KPROBE,
                    name.as_ptr(),
                    license.as_ptr(),
                    insns.as_ptr() as *const libbpf_sys::bpf_insn,
                    insns.len() as libbpf_sys::size_t,
                    opts,
                )
            }
        };

        let fd = load(&mut opts);
        if fd < 0 {
            let errno = Errno::from_raw(-fd);

            // Load again to retrieve the verifier log.
            let mut log = vec![0u8; LOG_BUF_SIZE];
            opts.log_buf = log.as_mut_ptr() as *mut c_char;
            opts.log_size = LOG_BUF_SIZE as u32;
            opts.log_level = 1;
            if load(&mut opts) >= 0 {
                debug!("Counter program loaded only with the verifier log enabled");
            }
            let log = String::from_utf8_lossy(&log);
            debug!("Verifier log: {}", log.trim_end_matches('\0'));

            bail!(ProbeError::kernel("bpf_prog_load", errno));
        }

        // SAFETY: on success bpf_prog_load returns a new file descriptor we
        // own.
        Ok(CounterProgram {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }
}

impl AsFd for CounterProgram {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

/// Encode one eBPF instruction in its in-memory representation.
fn insn(code: u8, dst: u8, src: u8, off: i16, imm: i32) -> u64 {
    #[cfg(target_endian = "little")]
    let regs = (src << 4) | (dst & 0xf);
    #[cfg(target_endian = "big")]
    let regs = (dst << 4) | (src & 0xf);

    let mut bytes = [0u8; 8];
    bytes[0] = code;
    bytes[1] = regs;
    bytes[2..4].copy_from_slice(&off.to_ne_bytes());
    bytes[4..8].copy_from_slice(&imm.to_ne_bytes());
    u64::from_ne_bytes(bytes)
}

const R0: u8 = 0;
const R1: u8 = 1;
const R2: u8 = 2;
const R10: u8 = 10;

const BPF_PSEUDO_MAP_FD: u8 = 1;
const BPF_FUNC_MAP_LOOKUP_ELEM: i32 = 1;

/// Instructions of a program doing:
///
/// ```text
/// u64 *val = bpf_map_lookup_elem(map, &slot);
/// if (val)
///     __sync_fetch_and_add(val, 1);
/// return 0;
/// ```
fn counter_insns(map_fd: i32, slot: u32) -> Vec<u64> {
    vec![
        // r1 = map (ld_imm64, two slots)
        insn(0x18, R1, BPF_PSEUDO_MAP_FD, 0, map_fd),
        insn(0, 0, 0, 0, 0),
        // *(u32 *)(r10 - 4) = slot
        insn(0x62, R10, 0, -4, slot as i32),
        // r2 = r10 - 4
        insn(0xbf, R2, R10, 0, 0),
        insn(0x07, R2, 0, 0, -4),
        // r0 = bpf_map_lookup_elem(r1, r2)
        insn(0x85, 0, 0, 0, BPF_FUNC_MAP_LOOKUP_ELEM),
        // if r0 == 0 goto out
        insn(0x15, R0, 0, 2, 0),
        // lock *(u64 *)(r0 + 0) += 1
        insn(0xb7, R1, 0, 0, 1),
        insn(0xdb, R0, R1, 0, 0),
        // out: return 0
        insn(0xb7, R0, 0, 0, 0),
        insn(0x95, 0, 0, 0, 0),
    ]
}

#[cfg(test)]
mod tests {
    use serial_test::serial;

    use super::*;

    #[test]
    fn encoding() {
        let bytes = insn(0x62, R10, 0, -4, 7).to_ne_bytes();
        assert_eq!(bytes[0], 0x62);
        assert_eq!(i16::from_ne_bytes([bytes[2], bytes[3]]), -4);
        assert_eq!(i32::from_ne_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]), 7);
        #[cfg(target_endian = "little")]
        assert_eq!(bytes[1], 0x0a);

        let bytes = insn(0xdb, R0, R1, 0, 0).to_ne_bytes();
        #[cfg(target_endian = "little")]
        assert_eq!(bytes[1], 0x10);

        let prog = counter_insns(42, 3);
        assert_eq!(prog.len(), 11);
        assert_eq!(prog[0].to_ne_bytes()[0], 0x18);
        assert_eq!(i32::from_ne_bytes(prog[0].to_ne_bytes()[4..8].try_into().unwrap()), 42);
        assert_eq!(prog[1], 0);
        assert_eq!(prog[10].to_ne_bytes()[0], 0x95);
    }

    #[test]
    #[cfg_attr(not(feature = "test_cap_bpf"), ignore)]
    #[serial(uprobe)]
    fn counter() {
        assert!(CounterMap::new(0).is_err());

        let map = CounterMap::new(2).unwrap();
        assert_eq!(map.size(), 2);
        assert_eq!(map.get(0).unwrap(), 0);
        assert_eq!(map.get(1).unwrap(), 0);
        assert!(map.get(2).is_err());
        assert!(map.reset(1).is_ok());

        assert!(map.program(0).is_ok());
        assert!(map.program(2).is_err());
    }
}
