//! USDT argument locations
//!
//! A USDT note describes each probe argument with an assembler operand such as
//! `8@%rdi` or `-4@-20(%rbp)`. Userspace parses the operand once at attachment
//! and hands the probe a [`UsdtArg`]; the probe only reads registers and memory.

use crate::probe::ProbeEnv;

/// Argument is an immediate value (`$42`)
pub const USDT_ARG_CONST: u32 = 0;

/// Argument lives in a register (`%rdi`)
pub const USDT_ARG_REG: u32 = 1;

/// Argument lives in memory at register + offset (`-20(%rbp)`)
pub const USDT_ARG_REG_DEREF: u32 = 2;

/// errno returned for a corrupt argument descriptor
const EINVAL: i64 = 22;

/// Location and width of one USDT argument
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsdtArg {
    /// One of `USDT_ARG_CONST`, `USDT_ARG_REG`, `USDT_ARG_REG_DEREF`
    pub kind: u32,

    /// Byte offset of the register inside `struct pt_regs`
    pub reg_offset: u32,

    /// Immediate value (`USDT_ARG_CONST`) or memory displacement (`USDT_ARG_REG_DEREF`)
    pub val_offset: i64,

    /// Argument width in bytes, negative when the value is signed
    pub size: i8,

    /// Padding for 8-byte alignment
    #[allow(clippy::pub_underscore_fields)]
    pub _padding: [u8; 7],
}

impl UsdtArg {
    #[must_use]
    pub const fn zeroed() -> Self {
        Self { kind: USDT_ARG_CONST, reg_offset: 0, val_offset: 0, size: 8, _padding: [0u8; 7] }
    }

    #[must_use]
    pub const fn constant(value: i64, size: i8) -> Self {
        Self { kind: USDT_ARG_CONST, reg_offset: 0, val_offset: value, size, _padding: [0u8; 7] }
    }

    #[must_use]
    pub const fn register(reg_offset: u32, size: i8) -> Self {
        Self { kind: USDT_ARG_REG, reg_offset, val_offset: 0, size, _padding: [0u8; 7] }
    }

    #[must_use]
    pub const fn deref(reg_offset: u32, displacement: i64, size: i8) -> Self {
        Self {
            kind: USDT_ARG_REG_DEREF,
            reg_offset,
            val_offset: displacement,
            size,
            _padding: [0u8; 7],
        }
    }

    /// Read the argument value at the probe site
    ///
    /// # Errors
    /// Returns the negative errno of a failed register or memory read, or
    /// `-EINVAL` for an unknown argument kind.
    #[inline(always)]
    #[allow(clippy::cast_sign_loss)]
    pub fn resolve<E: ProbeEnv>(&self, env: &E) -> Result<u64, i64> {
        let raw = match self.kind {
            USDT_ARG_CONST => self.val_offset as u64,
            USDT_ARG_REG => env.read_register(self.reg_offset)?,
            USDT_ARG_REG_DEREF => {
                let base = env.read_register(self.reg_offset)?;
                env.read_user_u64(base.wrapping_add(self.val_offset as u64))?
            }
            _ => return Err(-EINVAL),
        };
        Ok(self.narrow(raw))
    }

    /// Truncate (and sign-extend) a raw 64-bit read to the argument width
    #[inline(always)]
    #[allow(clippy::cast_sign_loss, clippy::cast_possible_wrap)]
    fn narrow(&self, raw: u64) -> u64 {
        let bytes = u32::from(self.size.unsigned_abs());
        if bytes == 0 || bytes >= 8 {
            return raw;
        }
        let shift = 64 - bytes * 8;
        if self.size < 0 {
            (((raw << shift) as i64) >> shift) as u64
        } else {
            (raw << shift) >> shift
        }
    }
}
