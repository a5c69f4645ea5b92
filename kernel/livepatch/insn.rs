//! AArch64 instruction encodings used at patch sites.
//!
//! Only two shapes are ever written:
//!
//! ```text
//! direct:      b      target                       (±128 MiB from pc)
//!
//! trampoline:  movn   x16, #(~target & 0xffff)
//!              movk   x16, #(target >> 16) & 0xffff, lsl #16
//!              movk   x16, #(target >> 32) & 0xffff, lsl #32
//!              br     x16
//! ```
//!
//! `movn` leaves bits 48..63 of x16 set, so the trampoline only reaches
//! kernel upper-half addresses. x16 (IP0) is free to clobber at a function
//! entry under AAPCS64.

/// Size of one A64 instruction.
pub const AARCH64_INSN_SIZE: usize = 4;

/// Words captured from, and written to, a patch site that may need a trampoline.
pub const KLP_MAX_INSNS: usize = 4;

/// Reach of `B`/`BL`: a signed 26-bit word offset.
pub const SZ_128M: usize = 128 << 20;

const B_OPCODE: u32 = 0x1400_0000;
const B_OPCODE_MASK: u32 = 0xfc00_0000;
const B_IMM26_MASK: u32 = 0x03ff_ffff;

const MOVN_X16: u32 = 0x9280_0010;
const MOVK_X16_LSL16: u32 = 0xf2a0_0010;
const MOVK_X16_LSL32: u32 = 0xf2c0_0010;
const BR_X16: u32 = 0xd61f_0200;
const IMM16_SHIFT: u32 = 5;
const IMM16_MASK: u32 = 0xffff;

/// Upper 16 bits of every address the trampoline can materialize.
pub const TRAMPOLINE_HIGH_BITS: usize = 0xffff << 48;

/// Returns `true` if `addr` is within `[-range, range)` of `pc`.
#[inline]
pub fn offset_in_range(pc: usize, addr: usize, range: usize) -> bool {
    let offset = addr.wrapping_sub(pc) as isize;
    let range = range as isize;
    offset >= -range && offset < range
}

/// Encode an unconditional `B target` at `pc`.
///
/// Returns `None` for a misaligned displacement or one outside ±128 MiB.
pub fn gen_branch_imm(pc: usize, target: usize) -> Option<u32> {
    let offset = target.wrapping_sub(pc) as isize;
    if offset & 0x3 != 0 || !offset_in_range(pc, target, SZ_128M) {
        return None;
    }
    let imm26 = ((offset >> 2) as u32) & B_IMM26_MASK;
    Some(B_OPCODE | imm26)
}

/// Decode the destination of a `B` at `pc`, or `None` for any other opcode.
pub fn decode_branch_imm(pc: usize, insn: u32) -> Option<usize> {
    if insn & B_OPCODE_MASK != B_OPCODE {
        return None;
    }
    // Sign-extend imm26 by parking it in the top bits of an i32.
    let imm26 = ((insn & B_IMM26_MASK) << 6) as i32 >> 6;
    let offset = (imm26 as isize) << 2;
    Some(pc.wrapping_add(offset as usize))
}

/// Build the absolute-jump trampoline for `target`.
pub fn gen_trampoline(target: usize) -> [u32; KLP_MAX_INSNS] {
    let imm = |v: usize| ((v as u32) & IMM16_MASK) << IMM16_SHIFT;
    [
        MOVN_X16 | imm(!target),
        MOVK_X16_LSL16 | imm(target >> 16),
        MOVK_X16_LSL32 | imm(target >> 32),
        BR_X16,
    ]
}

/// Returns `true` if [`gen_trampoline`] can reach `target`.
#[inline]
pub fn trampoline_reaches(target: usize) -> bool {
    target & TRAMPOLINE_HIGH_BITS == TRAMPOLINE_HIGH_BITS
}

/// Recover the destination of a sequence produced by [`gen_trampoline`].
pub fn decode_trampoline(insns: &[u32]) -> Option<usize> {
    let [movn, movk16, movk32, br] = <[u32; KLP_MAX_INSNS]>::try_from(insns).ok()?;
    let imm = |insn: u32| ((insn >> IMM16_SHIFT) & IMM16_MASK) as usize;
    let clear = !(IMM16_MASK << IMM16_SHIFT);
    if movn & clear != MOVN_X16
        || movk16 & clear != MOVK_X16_LSL16
        || movk32 & clear != MOVK_X16_LSL32
        || br != BR_X16
    {
        return None;
    }
    let low = !imm(movn) & 0xffff;
    Some(TRAMPOLINE_HIGH_BITS | (imm(movk32) << 32) | (imm(movk16) << 16) | low)
}
