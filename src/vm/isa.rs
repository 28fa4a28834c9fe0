//! Instruction Set Architecture (ISA) definitions.
//!
//! Every instruction is a single 16-bit word. The top three bits select
//! the opcode; the rest is format-dependent:
//!
//! ```text
//! rrr  (rd, ra, rb)   ooo AAA BBB 0000 CCC    add, nand
//! rri  (rd, ra, i7)   ooo AAA BBB IIIIIII     addi, sw, lw, beq
//! ri   (rd, i10)      ooo AAA IIIIIIIIII      lui
//! jump                111 AAA BBB 0000000     jalr
//! trap                111 000 KKK 0000001     irq
//! ```
//!
//! `i7` is signed (bit 6 is the sign), `i10` is unsigned. `irq` shares
//! opcode 7 with `jalr` and is recognized only when the low seven bits
//! are exactly `0000001` *and* the destination field is zero; any other
//! opcode-7 word is a `jalr`, whatever its low bits. Decoding is total:
//! there is no invalid word, by design of the verification protocol.

use std::fmt;

/// A general-purpose register, `r0` through `r7`.
///
/// `r0` reads as zero and discards writes; that behavior lives in the
/// register file, not here.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Reg {
    R0,
    R1,
    R2,
    R3,
    R4,
    R5,
    R6,
    R7,
}

impl Reg {
    /// All registers in index order.
    pub const ALL: [Reg; 8] = [
        Reg::R0,
        Reg::R1,
        Reg::R2,
        Reg::R3,
        Reg::R4,
        Reg::R5,
        Reg::R6,
        Reg::R7,
    ];

    /// Returns the register's 3-bit field value.
    pub const fn index(self) -> u16 {
        self as u16
    }

    /// Extracts a register from the low three bits of a field.
    pub const fn from_field(bits: u16) -> Reg {
        Reg::ALL[(bits & 0b111) as usize]
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.index())
    }
}

/// Interrupt kind carried by an `irq` instruction.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IrqKind {
    /// The thread halts having validated its script.
    Success,
    /// The thread gives up its remaining ticks without a verdict.
    Yield,
    /// The thread halts having failed.
    Failure,
}

impl IrqKind {
    /// Returns the kind's 3-bit field value.
    pub const fn code(self) -> u16 {
        match self {
            IrqKind::Success => 0,
            IrqKind::Yield => 1,
            IrqKind::Failure => 2,
        }
    }

    /// Maps a raw kind field to a kind.
    ///
    /// Only kinds 0..=2 are defined; the assembler never emits others,
    /// but raw words can carry any field value, so the undefined ones
    /// halt the thread with a failure.
    pub const fn from_field(bits: u16) -> IrqKind {
        match bits & 0b111 {
            0 => IrqKind::Success,
            1 => IrqKind::Yield,
            _ => IrqKind::Failure,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            IrqKind::Success => "success",
            IrqKind::Yield => "yield",
            IrqKind::Failure => "failure",
        }
    }
}

impl fmt::Display for IrqKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded instruction.
///
/// Immediates are stored sign-extended (`i7`) or zero-extended (`i10`);
/// [`Instruction::encode`] masks them back down to their fields.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Instruction {
    /// `R[a] = R[b] + R[c]` (wrapping).
    Add { a: Reg, b: Reg, c: Reg },
    /// `R[a] = R[b] + imm` (wrapping), `imm` in `-64..=63`.
    Addi { a: Reg, b: Reg, imm: i16 },
    /// `R[a] = !(R[b] & R[c])`.
    Nand { a: Reg, b: Reg, c: Reg },
    /// `R[a] = imm << 6`, `imm` in `0..=1023`.
    Lui { a: Reg, imm: u16 },
    /// `mem[R[b] + imm] = R[a]`.
    Sw { a: Reg, b: Reg, imm: i16 },
    /// `R[a] = mem[R[b] + imm]`.
    Lw { a: Reg, b: Reg, imm: i16 },
    /// If `R[a] == R[b]`, `PC = PC + 1 + imm`.
    Beq { a: Reg, b: Reg, imm: i16 },
    /// `R[a] = PC + 1; PC = R[b]`.
    Jalr { a: Reg, b: Reg },
    /// Suspends the thread with the given interrupt kind.
    Irq { kind: IrqKind },
}

/// Sign-extends the low seven bits of a word (bit 6 is the sign).
const fn sext7(word: u16) -> i16 {
    ((word as i16) << 9) >> 9
}

impl Instruction {
    /// Decodes one instruction word. Total: every word is legal.
    pub const fn decode(word: u16) -> Instruction {
        let a = Reg::from_field(word >> 10);
        let b = Reg::from_field(word >> 7);
        let c = Reg::from_field(word);
        match word >> 13 {
            0b000 => Instruction::Add { a, b, c },
            0b001 => Instruction::Addi { a, b, imm: sext7(word) },
            0b010 => Instruction::Nand { a, b, c },
            0b011 => Instruction::Lui { a, imm: word & 0x03FF },
            0b100 => Instruction::Sw { a, b, imm: sext7(word) },
            0b101 => Instruction::Lw { a, b, imm: sext7(word) },
            0b110 => Instruction::Beq { a, b, imm: sext7(word) },
            _ => {
                // irq needs the full low-7-bit pattern and a zero
                // destination field; the low bit alone is not enough.
                if word & 0x7F == 0b0000001 && (word >> 10) & 0b111 == 0 {
                    Instruction::Irq {
                        kind: IrqKind::from_field(word >> 7),
                    }
                } else {
                    Instruction::Jalr { a, b }
                }
            }
        }
    }

    /// Encodes the instruction back into its word.
    pub const fn encode(self) -> u16 {
        match self {
            Instruction::Add { a, b, c } => (a.index() << 10) | (b.index() << 7) | c.index(),
            Instruction::Addi { a, b, imm } => {
                (0b001 << 13) | (a.index() << 10) | (b.index() << 7) | (imm as u16 & 0x7F)
            }
            Instruction::Nand { a, b, c } => {
                (0b010 << 13) | (a.index() << 10) | (b.index() << 7) | c.index()
            }
            Instruction::Lui { a, imm } => (0b011 << 13) | (a.index() << 10) | (imm & 0x03FF),
            Instruction::Sw { a, b, imm } => {
                (0b100 << 13) | (a.index() << 10) | (b.index() << 7) | (imm as u16 & 0x7F)
            }
            Instruction::Lw { a, b, imm } => {
                (0b101 << 13) | (a.index() << 10) | (b.index() << 7) | (imm as u16 & 0x7F)
            }
            Instruction::Beq { a, b, imm } => {
                (0b110 << 13) | (a.index() << 10) | (b.index() << 7) | (imm as u16 & 0x7F)
            }
            Instruction::Jalr { a, b } => (0b111 << 13) | (a.index() << 10) | (b.index() << 7),
            Instruction::Irq { kind } => (0b111 << 13) | (kind.code() << 7) | 0b0000001,
        }
    }

    /// Returns the assembly mnemonic for this instruction.
    pub const fn mnemonic(&self) -> &'static str {
        match self {
            Instruction::Add { .. } => "add",
            Instruction::Addi { .. } => "addi",
            Instruction::Nand { .. } => "nand",
            Instruction::Lui { .. } => "lui",
            Instruction::Sw { .. } => "sw",
            Instruction::Lw { .. } => "lw",
            Instruction::Beq { .. } => "beq",
            Instruction::Jalr { .. } => "jalr",
            Instruction::Irq { .. } => "irq",
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Instruction::Add { a, b, c } | Instruction::Nand { a, b, c } => {
                write!(f, "{} {a}, {b}, {c}", self.mnemonic())
            }
            Instruction::Addi { a, b, imm }
            | Instruction::Sw { a, b, imm }
            | Instruction::Lw { a, b, imm }
            | Instruction::Beq { a, b, imm } => {
                write!(f, "{} {a}, {b}, {imm}", self.mnemonic())
            }
            Instruction::Lui { a, imm } => write!(f, "lui {a}, {imm}"),
            Instruction::Jalr { a, b } => write!(f, "jalr {a}, {b}"),
            Instruction::Irq { kind } => write!(f, "irq {kind}"),
        }
    }
}
