//! # USDT Probe Discovery
//!
//! Statically-defined tracepoints are described by `.note.stapsdt` ELF notes.
//! Each note carries:
//!
//! ```text
//! pc, base, semaphore     (three addresses, 8 bytes each on 64-bit targets)
//! provider\0 name\0 args\0
//! ```
//!
//! `args` lists one assembler operand per probe argument (`8@%rdi`,
//! `-4@-20(%rbp)`, `8@[sp, 16]`), which is turned into a [`UsdtArg`] the probe
//! can resolve against the saved registers.
//!
//! Probes guarded by a semaphore only fire while the counter is non-zero;
//! [`Semaphore`] bumps it through `/proc/pid/mem` for as long as it is held.

use log::{debug, info, warn};
use object::elf::FileHeader64;
use object::endian::U64Bytes;
use object::read::elf::NoteIterator;
use object::read::Bytes;
use object::{Architecture, Endianness, Object, ObjectSection};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;

use super::symbols::file_offset;
use crate::domain::{Pid, TracerError};
use crate::memory_maps::runtime_address;
use qscope_common::UsdtArg;

const NOTE_SECTION: &str = ".note.stapsdt";
const BASE_SECTION: &str = ".stapsdt.base";
const NOTE_TYPE: u32 = 3;
/// `sh_addralign` of `.note.stapsdt`
const NOTE_ALIGN: u64 = 4;
const NOTE_OWNER: &[u8] = b"stapsdt";

/// One `provider:name` probe from the notes of a binary
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsdtProbe {
    pub provider: String,
    pub name: String,
    /// Probe address, prelink adjustment applied
    pub address: u64,
    /// Address recorded for `.stapsdt.base` at build time
    pub base: u64,
    /// Address of the enable counter, 0 when unguarded
    pub semaphore: u64,
    pub args: String,
}

impl UsdtProbe {
    /// Operand of the 1-based argument `index`
    #[must_use]
    pub fn arg(&self, index: usize) -> Option<&str> {
        self.args.split_whitespace().nth(index.checked_sub(1)?)
    }
}

/// Parse the raw contents of a 64-bit `.note.stapsdt` section
///
/// Notes of other owners or types are skipped. Parsing stops at the first
/// malformed note.
#[must_use]
pub fn parse_notes(data: &[u8], endian: Endianness) -> Vec<UsdtProbe> {
    let mut probes = Vec::new();
    let mut notes = match NoteIterator::<FileHeader64<Endianness>>::new(endian, NOTE_ALIGN, data) {
        Ok(notes) => notes,
        Err(e) => {
            warn!("unreadable USDT notes: {e}");
            return probes;
        }
    };

    loop {
        let note = match notes.next() {
            Ok(Some(note)) => note,
            Ok(None) => break,
            Err(e) => {
                warn!("truncated USDT note: {e}");
                break;
            }
        };
        if note.n_type(endian) != NOTE_TYPE || note.name() != NOTE_OWNER {
            continue;
        }
        match parse_desc(note.desc(), endian) {
            Some(probe) => probes.push(probe),
            None => warn!("malformed USDT note"),
        }
    }

    probes
}

fn parse_desc(desc: &[u8], endian: Endianness) -> Option<UsdtProbe> {
    let mut desc = Bytes(desc);
    let mut address = || desc.read::<U64Bytes<Endianness>>().ok().map(|v| v.get(endian));
    let (address, base, semaphore) = (address()?, address()?, address()?);

    let mut text = || desc.read_string().ok().map(|s| String::from_utf8_lossy(s).into_owned());
    let provider = text()?;
    let name = text()?;
    let args = text().unwrap_or_default();
    Some(UsdtProbe { provider, name, address, base, semaphore, args })
}

/// All USDT probes of a parsed binary, prelink adjustment applied
///
/// # Errors
/// Returns `TracerError::Attachment` for 32-bit binaries
pub fn probes_in(obj: &object::File<'_>, target: &str) -> Result<Vec<UsdtProbe>, TracerError> {
    let Some(section) = obj.section_by_name(NOTE_SECTION) else {
        return Ok(Vec::new());
    };
    if !obj.is_64() {
        return Err(TracerError::attachment(target, "USDT notes of 32-bit binaries are not supported"));
    }
    let data = section
        .data()
        .map_err(|e| TracerError::attachment(target, format!("unreadable {NOTE_SECTION}: {e}")))?;

    let mut probes = parse_notes(data, obj.endianness());

    // Prelinking moves the binary; the note remembers where .stapsdt.base was
    if let Some(base) = obj.section_by_name(BASE_SECTION) {
        for probe in &mut probes {
            if probe.base != 0 {
                probe.address = probe.address.wrapping_add(base.address()).wrapping_sub(probe.base);
            }
        }
    }
    debug!("{} USDT probes in {target}", probes.len());
    Ok(probes)
}

/// A probe resolved for attachment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsdtSite {
    pub probe: UsdtProbe,
    pub file_offset: u64,
    /// File offset of the semaphore, if the probe has one
    pub semaphore_offset: Option<u64>,
}

/// Find `provider:name` in the notes and translate its addresses
///
/// # Errors
/// Returns `TracerError::Attachment` when the probe is absent or unmapped
pub fn find_site(
    obj: &object::File<'_>,
    probes: &[UsdtProbe],
    provider: &str,
    name: &str,
    target: &str,
) -> Result<UsdtSite, TracerError> {
    let probe = probes
        .iter()
        .find(|p| p.provider == provider && p.name == name)
        .ok_or_else(|| {
            TracerError::attachment(
                target,
                format!("USDT probe {provider}:{name} not found (server built without DTrace probes?)"),
            )
        })?;

    let offset = file_offset(obj, probe.address).ok_or_else(|| {
        TracerError::attachment(
            target,
            format!("{provider}:{name} at 0x{:x} is outside any segment", probe.address),
        )
    })?;

    let semaphore_offset = if probe.semaphore == 0 {
        None
    } else {
        Some(file_offset(obj, probe.semaphore).ok_or_else(|| {
            TracerError::attachment(target, format!("semaphore of {provider}:{name} is unmapped"))
        })?)
    };

    Ok(UsdtSite { probe: probe.clone(), file_offset: offset, semaphore_offset })
}

// ============================================================================
// Argument specs
// ============================================================================

/// Register file layout the argument operands refer to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    X86_64,
    Aarch64,
}

impl Arch {
    #[must_use]
    pub fn of(obj: &object::File<'_>) -> Option<Self> {
        match obj.architecture() {
            Architecture::X86_64 => Some(Self::X86_64),
            Architecture::Aarch64 => Some(Self::Aarch64),
            _ => None,
        }
    }

    /// Offset of a register inside `struct pt_regs`
    fn reg_offset(self, reg: &str) -> Option<u32> {
        match self {
            Self::X86_64 => x86_64_reg_offset(reg),
            Self::Aarch64 => aarch64_reg_offset(reg),
        }
    }
}

fn x86_64_reg_offset(reg: &str) -> Option<u32> {
    // Sub-registers map to their 64-bit parent; the value is narrowed later
    let offset = match reg {
        "r15" | "r15d" | "r15w" | "r15b" => 0,
        "r14" | "r14d" | "r14w" | "r14b" => 8,
        "r13" | "r13d" | "r13w" | "r13b" => 16,
        "r12" | "r12d" | "r12w" | "r12b" => 24,
        "rbp" | "ebp" | "bp" | "bpl" => 32,
        "rbx" | "ebx" | "bx" | "bl" | "bh" => 40,
        "r11" | "r11d" | "r11w" | "r11b" => 48,
        "r10" | "r10d" | "r10w" | "r10b" => 56,
        "r9" | "r9d" | "r9w" | "r9b" => 64,
        "r8" | "r8d" | "r8w" | "r8b" => 72,
        "rax" | "eax" | "ax" | "al" | "ah" => 80,
        "rcx" | "ecx" | "cx" | "cl" | "ch" => 88,
        "rdx" | "edx" | "dx" | "dl" | "dh" => 96,
        "rsi" | "esi" | "si" | "sil" => 104,
        "rdi" | "edi" | "di" | "dil" => 112,
        "rip" => 128,
        "rsp" | "esp" | "sp" | "spl" => 152,
        _ => return None,
    };
    Some(offset)
}

fn aarch64_reg_offset(reg: &str) -> Option<u32> {
    match reg {
        "sp" => Some(248),
        "pc" => Some(256),
        _ => {
            let n: u32 = reg.strip_prefix('x').or_else(|| reg.strip_prefix('w'))?.parse().ok()?;
            (n <= 30).then_some(n * 8)
        }
    }
}

/// Parse one argument operand such as `8@%rdi` into a [`UsdtArg`]
///
/// # Errors
/// Returns `TracerError::Attachment` for operands this tracer cannot resolve
pub fn parse_arg_spec(spec: &str, arch: Arch) -> Result<UsdtArg, TracerError> {
    let bad = |why: &str| TracerError::attachment("USDT argument", format!("{why}: {spec:?}"));

    let (size, operand) = spec.split_once('@').ok_or_else(|| bad("missing size"))?;
    let size: i8 = size.parse().map_err(|_| bad("bad size"))?;
    if !matches!(size.unsigned_abs(), 1 | 2 | 4 | 8) {
        return Err(bad("unsupported size"));
    }

    match arch {
        Arch::X86_64 => parse_x86_64_operand(operand, size, arch),
        Arch::Aarch64 => parse_aarch64_operand(operand, size, arch),
    }
    .ok_or_else(|| bad("unsupported operand"))
}

fn parse_x86_64_operand(operand: &str, size: i8, arch: Arch) -> Option<UsdtArg> {
    if let Some(imm) = operand.strip_prefix('$') {
        return Some(UsdtArg::constant(parse_int(imm)?, size));
    }
    if let Some(reg) = operand.strip_prefix('%') {
        return Some(UsdtArg::register(arch.reg_offset(reg)?, size));
    }

    // disp(%reg)
    let (disp, rest) = operand.split_once('(')?;
    let reg = rest.strip_suffix(')')?.strip_prefix('%')?;
    let disp = if disp.is_empty() { 0 } else { parse_int(disp)? };
    Some(UsdtArg::deref(arch.reg_offset(reg)?, disp, size))
}

fn parse_aarch64_operand(operand: &str, size: i8, arch: Arch) -> Option<UsdtArg> {
    if let Some(inner) = operand.strip_prefix('[') {
        // [reg] or [reg, disp]
        let inner = inner.strip_suffix(']')?;
        let (reg, disp) = match inner.split_once(',') {
            Some((reg, disp)) => (reg.trim(), parse_int(disp.trim())?),
            None => (inner.trim(), 0),
        };
        return Some(UsdtArg::deref(arch.reg_offset(reg)?, disp, size));
    }
    if let Some(offset) = arch.reg_offset(operand) {
        return Some(UsdtArg::register(offset, size));
    }
    Some(UsdtArg::constant(parse_int(operand)?, size))
}

fn parse_int(text: &str) -> Option<i64> {
    let (negative, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text),
    };
    let value = match digits.strip_prefix("0x") {
        Some(hex) => i64::from_str_radix(hex, 16).ok()?,
        None => digits.parse().ok()?,
    };
    Some(if negative { -value } else { value })
}

// ============================================================================
// Semaphores
// ============================================================================

/// An incremented USDT semaphore in the target, decremented on drop
pub struct Semaphore {
    mem: File,
    address: u64,
}

impl Semaphore {
    /// Increment the semaphore at `file_offset` of `binary` in process `pid`
    ///
    /// # Errors
    /// Returns an error if the address is unmapped or the target memory is not writable
    pub fn enable(pid: Pid, binary: &Path, file_offset: u64) -> Result<Self, TracerError> {
        let address = runtime_address(pid, binary, file_offset)?;
        let mem = OpenOptions::new().read(true).write(true).open(format!("/proc/{}/mem", pid.0))?;

        let count = read_counter(&mem, address)?;
        mem.write_all_at(&count.wrapping_add(1).to_ne_bytes(), address)?;
        info!("✓ Enabled USDT semaphore at 0x{address:x} (now {})", count.wrapping_add(1));
        Ok(Self { mem, address })
    }
}

fn read_counter(mem: &File, address: u64) -> std::io::Result<u16> {
    let mut bytes = [0u8; 2];
    mem.read_exact_at(&mut bytes, address)?;
    Ok(u16::from_ne_bytes(bytes))
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        // The target may have exited already
        let restored = read_counter(&self.mem, self.address).and_then(|count| {
            self.mem.write_all_at(&count.saturating_sub(1).to_ne_bytes(), self.address)
        });
        if let Err(e) = restored {
            debug!("could not restore USDT semaphore at 0x{:x}: {e}", self.address);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qscope_common::usdt::{USDT_ARG_CONST, USDT_ARG_REG, USDT_ARG_REG_DEREF};

    fn note(provider: &str, name: &str, args: &str, addrs: [u64; 3]) -> Vec<u8> {
        let mut desc = Vec::new();
        for addr in addrs {
            desc.extend_from_slice(&addr.to_le_bytes());
        }
        for s in [provider, name, args] {
            desc.extend_from_slice(s.as_bytes());
            desc.push(0);
        }

        let mut out = Vec::new();
        out.extend_from_slice(&8u32.to_le_bytes());
        out.extend_from_slice(&u32::try_from(desc.len()).unwrap().to_le_bytes());
        out.extend_from_slice(&NOTE_TYPE.to_le_bytes());
        out.extend_from_slice(b"stapsdt\0");
        out.extend_from_slice(&desc);
        out.resize(out.len().next_multiple_of(4), 0);
        out
    }

    #[test]
    fn test_parse_notes() {
        let mut data = note("mysql", "query__exec__start", "8@%rdi 8@-8(%rbp)", [0x1000, 0x2000, 0]);
        data.extend(note("mysql", "query__exec__done", "-4@%eax", [0x1100, 0x2000, 0x3000]));

        let probes = parse_notes(&data, Endianness::Little);
        assert_eq!(probes.len(), 2);
        assert_eq!(probes[0].name, "query__exec__start");
        assert_eq!(probes[0].address, 0x1000);
        assert_eq!(probes[0].arg(1), Some("8@%rdi"));
        assert_eq!(probes[0].arg(2), Some("8@-8(%rbp)"));
        assert_eq!(probes[0].arg(3), None);
        assert_eq!(probes[1].semaphore, 0x3000);
    }

    #[test]
    fn test_foreign_notes_skipped() {
        let mut data = Vec::new();
        data.extend_from_slice(&4u32.to_le_bytes());
        data.extend_from_slice(&4u32.to_le_bytes());
        data.extend_from_slice(&1u32.to_le_bytes());
        data.extend_from_slice(b"GNU\0");
        data.extend_from_slice(&[0xde, 0xad, 0xbe, 0xef]);
        data.extend(note("mysql", "query__exec__done", "", [0x10, 0, 0]));

        let probes = parse_notes(&data, Endianness::Little);
        assert_eq!(probes.len(), 1);
        assert_eq!(probes[0].provider, "mysql");
    }

    #[test]
    fn test_truncated_section() {
        let data = note("mysql", "query__exec__start", "8@%rdi", [0x1000, 0, 0]);
        assert!(parse_notes(&data[..data.len() - 12], Endianness::Little).is_empty());
    }

    fn own_binary() -> Vec<u8> {
        std::fs::read(std::env::current_exe().unwrap()).unwrap()
    }

    #[test]
    fn test_find_site_without_done_note() {
        let data = note("mysql", "query__exec__start", "8@%rdi", [0x1000, 0, 0]);
        let probes = parse_notes(&data, Endianness::Little);
        assert_eq!(probes.len(), 1);

        let bytes = own_binary();
        let obj = object::File::parse(&*bytes).unwrap();
        let err = find_site(&obj, &probes, "mysql", "query__exec__done", "mysqld").unwrap_err();
        assert!(matches!(err, TracerError::Attachment { .. }), "{err}");
        assert!(err.to_string().contains("query__exec__done"), "{err}");
    }

    #[test]
    fn test_find_site_translates_addresses() {
        use object::ObjectSegment;

        let bytes = own_binary();
        let obj = object::File::parse(&*bytes).unwrap();
        let segment = obj.segments().find(|s| s.file_range().1 > 0x20).unwrap();
        let (offset, _) = segment.file_range();
        let address = segment.address() + 0x10;

        let data = note("mysql", "query__exec__start", "8@%rdi", [address, 0, 0]);
        let probes = parse_notes(&data, Endianness::Little);
        let site = find_site(&obj, &probes, "mysql", "query__exec__start", "self").unwrap();
        assert_eq!(site.file_offset, offset + 0x10);
        assert_eq!(site.semaphore_offset, None);

        let data = note("mysql", "query__exec__start", "", [u64::MAX - 1, 0, 0]);
        let probes = parse_notes(&data, Endianness::Little);
        assert!(find_site(&obj, &probes, "mysql", "query__exec__start", "self").is_err());
    }

    static COUNTER: std::sync::atomic::AtomicU16 = std::sync::atomic::AtomicU16::new(7);

    #[test]
    fn test_semaphore_counts_up_and_restores() {
        use crate::memory_maps::mappings_of;
        use std::sync::atomic::Ordering;

        let exe = std::env::current_exe().unwrap();
        let pid = Pid(std::process::id() as i32);
        let address = std::ptr::from_ref(&COUNTER) as u64;
        let mapping = mappings_of(pid, &exe)
            .unwrap()
            .into_iter()
            .find(|m| (m.start..m.end).contains(&address))
            .unwrap();
        let file_offset = address - mapping.start + mapping.file_offset;

        let semaphore = Semaphore::enable(pid, &exe, file_offset).unwrap();
        assert_eq!(COUNTER.load(Ordering::SeqCst), 8);
        drop(semaphore);
        assert_eq!(COUNTER.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn test_semaphore_of_unmapped_offset() {
        let exe = std::env::current_exe().unwrap();
        let pid = Pid(std::process::id() as i32);
        assert!(Semaphore::enable(pid, &exe, u64::MAX / 2).is_err());
    }

    #[test]
    fn test_x86_64_register_arg() {
        let arg = parse_arg_spec("8@%rdi", Arch::X86_64).unwrap();
        assert_eq!(arg.kind, USDT_ARG_REG);
        assert_eq!(arg.reg_offset, 112);
        assert_eq!(arg.size, 8);

        let arg = parse_arg_spec("-4@%eax", Arch::X86_64).unwrap();
        assert_eq!((arg.reg_offset, arg.size), (80, -4));
    }

    #[test]
    fn test_x86_64_memory_arg() {
        let arg = parse_arg_spec("8@-1144(%rbp)", Arch::X86_64).unwrap();
        assert_eq!(arg.kind, USDT_ARG_REG_DEREF);
        assert_eq!(arg.reg_offset, 32);
        assert_eq!(arg.val_offset, -1144);

        let arg = parse_arg_spec("8@(%rbx)", Arch::X86_64).unwrap();
        assert_eq!((arg.kind, arg.reg_offset, arg.val_offset), (USDT_ARG_REG_DEREF, 40, 0));
    }

    #[test]
    fn test_x86_64_constant_arg() {
        let arg = parse_arg_spec("4@$-1", Arch::X86_64).unwrap();
        assert_eq!((arg.kind, arg.val_offset), (USDT_ARG_CONST, -1));
        let arg = parse_arg_spec("8@$0x10", Arch::X86_64).unwrap();
        assert_eq!(arg.val_offset, 16);
    }

    #[test]
    fn test_aarch64_args() {
        let arg = parse_arg_spec("8@x1", Arch::Aarch64).unwrap();
        assert_eq!((arg.kind, arg.reg_offset), (USDT_ARG_REG, 8));

        let arg = parse_arg_spec("8@[sp, 16]", Arch::Aarch64).unwrap();
        assert_eq!((arg.kind, arg.reg_offset, arg.val_offset), (USDT_ARG_REG_DEREF, 248, 16));

        let arg = parse_arg_spec("-4@[x29, -12]", Arch::Aarch64).unwrap();
        assert_eq!((arg.reg_offset, arg.val_offset, arg.size), (232, -12, -4));
    }

    #[test]
    fn test_rejected_specs() {
        assert!(parse_arg_spec("%rdi", Arch::X86_64).is_err());
        assert!(parse_arg_spec("3@%rdi", Arch::X86_64).is_err());
        assert!(parse_arg_spec("8@%xmm0", Arch::X86_64).is_err());
        assert!(parse_arg_spec("8@%rdi,%rsi", Arch::X86_64).is_err());
    }
}
