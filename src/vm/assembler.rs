//! Streaming assembler and assembly-source compiler.
//!
//! The [`Assembler`] appends one encoded word per operation, in call
//! order, into an arena of emitted words. Labels are handles into a side
//! table; a jump to an unbound label reserves its words and records a
//! patch site, and binding the label walks the pending sites and
//! overwrites the reserved words in place. No ownership cycles, no
//! second pass.
//!
//! On top of that sits a line-oriented text front-end:
//!
//! ```text
//! # spend requires the first hash word to equal the magic value
//!         lw   r1, r0, 0
//!         movi r2, 0x1234
//!         beq  r1, r2, 1
//!         irq  failure
//! win:    irq  success
//! ```
//!
//! - mnemonics are lowercase; commas between operands are optional
//! - `#` starts a comment
//! - `name:` binds a label, alone or prefixing an instruction
//! - `jmp name` / `farjmp rX, name` take label operands; `beq` takes a
//!   numeric word offset
//! - immediates are decimal or `0x` hex, negative where the field is
//!   signed
//!
//! Source errors carry the line and column they were detected at, and
//! [`render_diagnostic`] formats them compiler-style: the message, a
//! `file:line:column` pointer, and the offending line with a caret under
//! the bad token.

use crate::vm::isa::{Instruction, IrqKind, Reg};
use crate::vm::machine::OUTPUT_BASE;
use duelchain_derive::Error;
use std::collections::HashMap;
use std::fmt::Write;
use std::fs;
use std::path::Path;

const COMMENT_CHAR: char = '#';
const LABEL_SUFFIX: char = ':';

/// Errors raised during assembly. All of them are fatal: nothing that
/// fails assembly can reach the VM.
#[derive(Debug, Error)]
pub enum AsmError {
    /// An immediate does not fit its instruction field.
    #[error("immediate {value} out of range for {what} ({min}..={max})")]
    ImmediateOutOfRange {
        what: &'static str,
        value: i32,
        min: i32,
        max: i32,
    },
    /// A short jump resolved to a delta outside the `beq` range.
    #[error("short jump of {delta} words exceeds the beq range (-64..=63)")]
    ShortJumpOutOfRange { delta: i32 },
    /// A label was bound twice.
    #[error("label is already bound")]
    LabelRebound,
    /// Rendering was attempted while jumps still reference unbound labels.
    #[error("{pending} jump site(s) reference unbound labels")]
    UnboundLabel { pending: usize },
    /// A named label in assembly source was referenced but never defined.
    #[error("undefined label {0}")]
    UndefinedLabel(String),
    /// A far jump through `r0` would read the hardwired zero, not the
    /// loaded address.
    #[error("far jump cannot use r0 as its address register")]
    FarJumpThroughZero,
    /// A register token did not name one of `r0`..`r7`.
    #[error("unknown register {0}")]
    UnknownRegister(String),
    /// An `irq` operand did not name a defined interrupt kind.
    #[error("unknown interrupt kind {0}")]
    UnknownIrqKind(String),
    /// An unrecognized instruction mnemonic.
    #[error("unknown instruction {0}")]
    UnknownInstruction(String),
    /// Wrong number of operands for an instruction.
    #[error("{instruction} expects {expected} operand(s), got {actual}")]
    OperandCount {
        instruction: &'static str,
        expected: usize,
        actual: usize,
    },
    /// A token that should have been a numeric immediate.
    #[error("invalid immediate {0}")]
    InvalidImmediate(String),
    /// A source-level error with its line number and 1-based column.
    #[error("line {line}, column {column}: {message}")]
    SourceError {
        line: usize,
        column: usize,
        message: String,
    },
    /// File I/O error while assembling from a path.
    #[error("failed to read {path}: {reason}")]
    Io { path: String, reason: String },
}

/// Handle to a label in an [`Assembler`]'s side table.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Label(usize);

/// A reserved jump site waiting for its label to bind.
enum Patch {
    /// One reserved word for a `beq r0, r0, Δ`.
    Short { index: usize },
    /// Three reserved words for a `lui; addi; jalr` sequence.
    Far { index: usize, reg: Reg },
}

/// Per-label state: its bound PC (if any) and pending patch sites.
struct LabelSlot {
    pc: Option<u16>,
    pending: Vec<Patch>,
}

/// Streaming instruction encoder with label resolution.
///
/// Words accumulate at `origin`, `origin + 1`, ... ; `origin` defaults to
/// the output-script load address so absolute far-jump targets come out
/// right without ceremony.
pub struct Assembler {
    origin: u16,
    words: Vec<u16>,
    labels: Vec<LabelSlot>,
}

impl Assembler {
    /// Creates an assembler targeting the output-script region.
    pub fn new() -> Self {
        Self::with_origin(OUTPUT_BASE)
    }

    /// Creates an assembler whose first word will sit at `origin`.
    pub fn with_origin(origin: u16) -> Self {
        Self {
            origin,
            words: Vec::new(),
            labels: Vec::new(),
        }
    }

    /// The PC of the next word to be emitted.
    pub fn pc(&self) -> u16 {
        self.origin.wrapping_add(self.words.len() as u16)
    }

    /// Creates a fresh unbound label.
    pub fn label(&mut self) -> Label {
        self.labels.push(LabelSlot {
            pc: None,
            pending: Vec::new(),
        });
        Label(self.labels.len() - 1)
    }

    /// Returns true once the label has a PC.
    pub fn is_bound(&self, label: Label) -> bool {
        self.labels[label.0].pc.is_some()
    }

    /// Binds a label to the current PC, resolving every pending site
    /// registered against it.
    pub fn bind(&mut self, label: Label) -> Result<(), AsmError> {
        let target = self.pc();
        let slot = &mut self.labels[label.0];
        if slot.pc.is_some() {
            return Err(AsmError::LabelRebound);
        }
        slot.pc = Some(target);

        for patch in std::mem::take(&mut slot.pending) {
            match patch {
                Patch::Short { index } => {
                    let site = self.origin.wrapping_add(index as u16);
                    self.words[index] = short_jump(site, target)?;
                }
                Patch::Far { index, reg } => {
                    let [lui, addi, jalr] = far_jump(reg, target);
                    self.words[index] = lui;
                    self.words[index + 1] = addi;
                    self.words[index + 2] = jalr;
                }
            }
        }
        Ok(())
    }

    fn emit(&mut self, instr: Instruction) {
        self.words.push(instr.encode());
    }

    /// `R[a] = R[b] + R[c]`.
    pub fn add(&mut self, a: Reg, b: Reg, c: Reg) {
        self.emit(Instruction::Add { a, b, c });
    }

    /// `R[a] = R[b] + imm`, `imm` in `-64..=63`.
    pub fn addi(&mut self, a: Reg, b: Reg, imm: i16) -> Result<(), AsmError> {
        let imm = check_imm7("addi", imm as i32)?;
        self.emit(Instruction::Addi { a, b, imm });
        Ok(())
    }

    /// `R[a] = !(R[b] & R[c])`.
    pub fn nand(&mut self, a: Reg, b: Reg, c: Reg) {
        self.emit(Instruction::Nand { a, b, c });
    }

    /// `R[a] = imm << 6`, `imm` in `0..=1023`.
    pub fn lui(&mut self, a: Reg, imm: u16) -> Result<(), AsmError> {
        if imm > 0x03FF {
            return Err(AsmError::ImmediateOutOfRange {
                what: "lui",
                value: imm as i32,
                min: 0,
                max: 0x03FF,
            });
        }
        self.emit(Instruction::Lui { a, imm });
        Ok(())
    }

    /// `mem[R[b] + imm] = R[a]`.
    pub fn sw(&mut self, a: Reg, b: Reg, imm: i16) -> Result<(), AsmError> {
        let imm = check_imm7("sw", imm as i32)?;
        self.emit(Instruction::Sw { a, b, imm });
        Ok(())
    }

    /// `R[a] = mem[R[b] + imm]`.
    pub fn lw(&mut self, a: Reg, b: Reg, imm: i16) -> Result<(), AsmError> {
        let imm = check_imm7("lw", imm as i32)?;
        self.emit(Instruction::Lw { a, b, imm });
        Ok(())
    }

    /// Branch by `imm` words (relative to PC + 1) when `R[a] == R[b]`.
    pub fn beq(&mut self, a: Reg, b: Reg, imm: i16) -> Result<(), AsmError> {
        let imm = check_imm7("beq", imm as i32)?;
        self.emit(Instruction::Beq { a, b, imm });
        Ok(())
    }

    /// `R[a] = PC + 1; PC = R[b]`.
    pub fn jalr(&mut self, a: Reg, b: Reg) {
        self.emit(Instruction::Jalr { a, b });
    }

    /// Suspends the executing thread with the given interrupt.
    pub fn irq(&mut self, kind: IrqKind) {
        self.emit(Instruction::Irq { kind });
    }

    /// Loads a full 16-bit constant: `lui` for the high ten bits, `addi`
    /// for the low six. Always two words.
    pub fn movi(&mut self, a: Reg, imm: u16) {
        self.emit(Instruction::Lui { a, imm: imm >> 6 });
        self.emit(Instruction::Addi {
            a,
            b: a,
            imm: (imm & 0x3F) as i16,
        });
    }

    /// Emits `add r0, r0, r0`.
    pub fn nop(&mut self) {
        self.add(Reg::R0, Reg::R0, Reg::R0);
    }

    /// Short jump to a label: one `beq r0, r0, Δ` word.
    ///
    /// An unbound target reserves the word and patches on bind; a bound
    /// target out of the ±64-word range fails immediately.
    pub fn jmp(&mut self, label: Label) -> Result<(), AsmError> {
        match self.labels[label.0].pc {
            Some(target) => {
                let word = short_jump(self.pc(), target)?;
                self.words.push(word);
            }
            None => {
                let index = self.words.len();
                self.words.push(NOP_WORD);
                self.labels[label.0].pending.push(Patch::Short { index });
            }
        }
        Ok(())
    }

    /// Far jump: loads the label's absolute PC into `reg` and jumps
    /// through it. Always three words.
    pub fn farjmp(&mut self, reg: Reg, label: Label) -> Result<(), AsmError> {
        if let Reg::R0 = reg {
            return Err(AsmError::FarJumpThroughZero);
        }
        match self.labels[label.0].pc {
            Some(target) => {
                self.words.extend(far_jump(reg, target));
            }
            None => {
                let index = self.words.len();
                self.words.extend([NOP_WORD; 3]);
                self.labels[label.0].pending.push(Patch::Far { index, reg });
            }
        }
        Ok(())
    }

    /// Number of pending (unresolved) jump sites across all labels.
    fn pending_sites(&self) -> usize {
        self.labels.iter().map(|slot| slot.pending.len()).sum()
    }

    /// Renders the assembled words, diagnosing unresolved jumps.
    pub fn finish(self) -> Result<Vec<u16>, AsmError> {
        let pending = self.pending_sites();
        if pending > 0 {
            return Err(AsmError::UnboundLabel { pending });
        }
        Ok(self.words)
    }

    /// Renders the assembled program as a big-endian byte image.
    pub fn to_bytes(self) -> Result<Vec<u8>, AsmError> {
        Ok(encode_image(&self.finish()?))
    }
}

impl Default for Assembler {
    fn default() -> Self {
        Self::new()
    }
}

/// `add r0, r0, r0`, used to reserve words at pending jump sites.
const NOP_WORD: u16 = 0x0000;

fn check_imm7(what: &'static str, value: i32) -> Result<i16, AsmError> {
    if !(-64..=63).contains(&value) {
        return Err(AsmError::ImmediateOutOfRange {
            what,
            value,
            min: -64,
            max: 63,
        });
    }
    Ok(value as i16)
}

/// Encodes `beq r0, r0, Δ` from a jump site to its target.
fn short_jump(site: u16, target: u16) -> Result<u16, AsmError> {
    let delta = target as i32 - (site as i32 + 1);
    if !(-64..=63).contains(&delta) {
        return Err(AsmError::ShortJumpOutOfRange { delta });
    }
    Ok(Instruction::Beq {
        a: Reg::R0,
        b: Reg::R0,
        imm: delta as i16,
    }
    .encode())
}

/// Encodes the three-word absolute jump through `reg`.
fn far_jump(reg: Reg, target: u16) -> [u16; 3] {
    [
        Instruction::Lui { a: reg, imm: target >> 6 }.encode(),
        Instruction::Addi {
            a: reg,
            b: reg,
            imm: (target & 0x3F) as i16,
        }
        .encode(),
        Instruction::Jalr { a: Reg::R0, b: reg }.encode(),
    ]
}

// ---------------------------------------------------------------------
// Text front-end
// ---------------------------------------------------------------------

/// Parse a register token like `r0`, `r7`.
pub(crate) fn parse_reg(tok: &str) -> Result<Reg, AsmError> {
    let index = tok
        .strip_prefix('r')
        .and_then(|digits| digits.parse::<u16>().ok())
        .ok_or_else(|| AsmError::UnknownRegister(tok.to_string()))?;
    if index > 7 {
        return Err(AsmError::UnknownRegister(tok.to_string()));
    }
    Ok(Reg::from_field(index))
}

/// Parse a numeric immediate: decimal or `0x` hex, optionally negative.
fn parse_imm(tok: &str) -> Result<i32, AsmError> {
    let bad = || AsmError::InvalidImmediate(tok.to_string());
    let (negative, digits) = match tok.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, tok),
    };
    let magnitude = match digits.strip_prefix("0x") {
        Some(hex) => i64::from_str_radix(hex, 16).map_err(|_| bad())?,
        None => digits.parse::<i64>().map_err(|_| bad())?,
    };
    let value = if negative { -magnitude } else { magnitude };
    i32::try_from(value).map_err(|_| bad())
}

/// Immediate constrained to an unsigned 16-bit value (`movi`).
fn parse_imm16(tok: &str) -> Result<u16, AsmError> {
    let value = parse_imm(tok)?;
    u16::try_from(value).map_err(|_| AsmError::ImmediateOutOfRange {
        what: "movi",
        value,
        min: 0,
        max: u16::MAX as i32,
    })
}

fn parse_irq_kind(tok: &str) -> Result<IrqKind, AsmError> {
    match tok {
        "success" => Ok(IrqKind::Success),
        "yield" => Ok(IrqKind::Yield),
        "failure" => Ok(IrqKind::Failure),
        _ => Err(AsmError::UnknownIrqKind(tok.to_string())),
    }
}

/// A source token and the 1-based column where it starts.
#[derive(Clone, Copy, Debug)]
struct Token<'a> {
    text: &'a str,
    column: usize,
}

/// Splits one source line into tokens; `#` starts a comment, commas and
/// whitespace separate tokens. Columns are byte offsets plus one.
fn tokenize(line: &str) -> Vec<Token<'_>> {
    let code = line.split(COMMENT_CHAR).next().unwrap_or("");
    let mut out = Vec::new();
    let mut start: Option<usize> = None;

    for (i, c) in code.char_indices() {
        if c == ',' || c.is_whitespace() {
            if let Some(s) = start.take() {
                out.push(Token {
                    text: &code[s..i],
                    column: s + 1,
                });
            }
        } else if start.is_none() {
            start = Some(i);
        }
    }
    if let Some(s) = start {
        out.push(Token {
            text: &code[s..],
            column: s + 1,
        });
    }
    out
}

fn is_label_def(tok: &str) -> bool {
    tok.ends_with(LABEL_SUFFIX) && tok.len() > 1
}

/// An assembly error pinned to the column it was detected at.
struct SpannedError {
    column: usize,
    error: AsmError,
}

fn spanned(column: usize) -> impl Fn(AsmError) -> SpannedError {
    move |error| SpannedError { column, error }
}

/// Source-level assembler state: the streaming encoder plus a name table
/// for labels, created on first mention and bound at their definition.
struct SourceAssembler {
    asm: Assembler,
    names: HashMap<String, Label>,
}

impl SourceAssembler {
    fn new(origin: u16) -> Self {
        Self {
            asm: Assembler::with_origin(origin),
            names: HashMap::new(),
        }
    }

    fn named_label(&mut self, name: &str) -> Label {
        match self.names.get(name) {
            Some(label) => *label,
            None => {
                let label = self.asm.label();
                self.names.insert(name.to_string(), label);
                label
            }
        }
    }

    fn expect_operands(
        instruction: &'static str,
        tokens: &[Token],
        expected: usize,
    ) -> Result<(), SpannedError> {
        if tokens.len() != expected + 1 {
            return Err(SpannedError {
                column: tokens[0].column,
                error: AsmError::OperandCount {
                    instruction,
                    expected,
                    actual: tokens.len() - 1,
                },
            });
        }
        Ok(())
    }

    fn instruction(&mut self, tokens: &[Token]) -> Result<(), SpannedError> {
        let expect = Self::expect_operands;
        let reg = |tok: &Token| parse_reg(tok.text).map_err(spanned(tok.column));
        let imm7 = |what, tok: &Token| {
            parse_imm(tok.text)
                .and_then(|value| check_imm7(what, value))
                .map_err(spanned(tok.column))
        };
        let at_mnemonic = spanned(tokens[0].column);

        match tokens[0].text {
            "add" => {
                expect("add", tokens, 3)?;
                self.asm
                    .add(reg(&tokens[1])?, reg(&tokens[2])?, reg(&tokens[3])?);
            }
            "nand" => {
                expect("nand", tokens, 3)?;
                self.asm
                    .nand(reg(&tokens[1])?, reg(&tokens[2])?, reg(&tokens[3])?);
            }
            "addi" => {
                expect("addi", tokens, 3)?;
                let imm = imm7("addi", &tokens[3])?;
                self.asm
                    .addi(reg(&tokens[1])?, reg(&tokens[2])?, imm)
                    .map_err(at_mnemonic)?;
            }
            "sw" => {
                expect("sw", tokens, 3)?;
                let imm = imm7("sw", &tokens[3])?;
                self.asm
                    .sw(reg(&tokens[1])?, reg(&tokens[2])?, imm)
                    .map_err(at_mnemonic)?;
            }
            "lw" => {
                expect("lw", tokens, 3)?;
                let imm = imm7("lw", &tokens[3])?;
                self.asm
                    .lw(reg(&tokens[1])?, reg(&tokens[2])?, imm)
                    .map_err(at_mnemonic)?;
            }
            "beq" => {
                expect("beq", tokens, 3)?;
                let imm = imm7("beq", &tokens[3])?;
                self.asm
                    .beq(reg(&tokens[1])?, reg(&tokens[2])?, imm)
                    .map_err(at_mnemonic)?;
            }
            "lui" => {
                expect("lui", tokens, 2)?;
                let value = parse_imm(tokens[2].text).map_err(spanned(tokens[2].column))?;
                let imm = u16::try_from(value)
                    .map_err(|_| AsmError::ImmediateOutOfRange {
                        what: "lui",
                        value,
                        min: 0,
                        max: 0x03FF,
                    })
                    .map_err(spanned(tokens[2].column))?;
                self.asm
                    .lui(reg(&tokens[1])?, imm)
                    .map_err(spanned(tokens[2].column))?;
            }
            "jalr" => {
                expect("jalr", tokens, 2)?;
                self.asm.jalr(reg(&tokens[1])?, reg(&tokens[2])?);
            }
            "irq" => {
                expect("irq", tokens, 1)?;
                let kind = parse_irq_kind(tokens[1].text).map_err(spanned(tokens[1].column))?;
                self.asm.irq(kind);
            }
            "movi" => {
                expect("movi", tokens, 2)?;
                let imm = parse_imm16(tokens[2].text).map_err(spanned(tokens[2].column))?;
                self.asm.movi(reg(&tokens[1])?, imm);
            }
            "nop" => {
                expect("nop", tokens, 0)?;
                self.asm.nop();
            }
            "jmp" => {
                expect("jmp", tokens, 1)?;
                let label = self.named_label(tokens[1].text);
                self.asm.jmp(label).map_err(spanned(tokens[1].column))?;
            }
            "farjmp" => {
                expect("farjmp", tokens, 2)?;
                let scratch = reg(&tokens[1])?;
                let label = self.named_label(tokens[2].text);
                self.asm
                    .farjmp(scratch, label)
                    .map_err(spanned(tokens[1].column))?;
            }
            other => {
                return Err(at_mnemonic(AsmError::UnknownInstruction(other.to_string())));
            }
        }
        Ok(())
    }

    fn line(&mut self, line: &str) -> Result<(), SpannedError> {
        let mut tokens = tokenize(line);
        if let Some(first) = tokens.first().copied()
            && is_label_def(first.text)
        {
            let name = &first.text[..first.text.len() - 1];
            let label = self.named_label(name);
            self.asm.bind(label).map_err(spanned(first.column))?;
            tokens.remove(0);
        }
        if tokens.is_empty() {
            return Ok(());
        }
        self.instruction(&tokens)
    }

    fn finish(self) -> Result<Vec<u16>, AsmError> {
        // Name the offending label instead of just counting sites.
        for (name, label) in &self.names {
            if !self.asm.is_bound(*label) && !self.asm.labels[label.0].pending.is_empty() {
                return Err(AsmError::UndefinedLabel(name.clone()));
            }
        }
        self.asm.finish()
    }
}

/// Assembles source text into instruction words, origin at the
/// output-script load address.
pub fn assemble_source(source: &str) -> Result<Vec<u16>, AsmError> {
    assemble_source_with_origin(source, OUTPUT_BASE)
}

/// Assembles source text with an explicit load address.
pub fn assemble_source_with_origin(source: &str, origin: u16) -> Result<Vec<u16>, AsmError> {
    let mut sa = SourceAssembler::new(origin);
    for (line_no, line) in source.lines().enumerate() {
        sa.line(line).map_err(|e| AsmError::SourceError {
            line: line_no + 1,
            column: e.column,
            message: e.error.to_string(),
        })?;
    }
    sa.finish()
}

/// Packs instruction words into the big-endian wire image.
pub fn encode_image(words: &[u16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(words.len() * 2);
    for word in words {
        out.extend_from_slice(&word.to_be_bytes());
    }
    out
}

/// Assembles a source file into a big-endian byte image.
pub fn assemble_file<P: AsRef<Path>>(path: P) -> Result<Vec<u8>, AsmError> {
    let path = path.as_ref();
    let source = fs::read_to_string(path).map_err(|e| AsmError::Io {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    Ok(encode_image(&assemble_source(&source)?))
}

/// Return the line/column/message triple carried by source-located
/// assembly errors.
fn source_error_location(err: &AsmError) -> Option<(usize, usize, String)> {
    match err {
        AsmError::SourceError {
            line,
            column,
            message,
        } => Some((*line, *column, message.clone())),
        _ => None,
    }
}

/// Formats a compiler-style diagnostic for an assembly failure.
///
/// Errors carrying a source location render the offending line with a
/// caret under the offending column; everything else falls back to a
/// plain `error:` line.
pub fn render_diagnostic(file: &str, source: &str, err: &AsmError) -> String {
    let mut diag = String::new();
    let Some((line, column, message)) = source_error_location(err) else {
        let _ = writeln!(diag, "error: {err}");
        return diag;
    };

    let _ = writeln!(diag, "error: {message}");
    let _ = writeln!(diag, " --> {file}:{line}:{column}");
    if let Some(raw_line) = source.lines().nth(line.saturating_sub(1)) {
        let line_text = raw_line.trim_end_matches('\r');
        let underline = " ".repeat(column.saturating_sub(1));
        let _ = writeln!(diag, "  |");
        let _ = writeln!(diag, "{:>4} | {}", line, line_text);
        let _ = writeln!(diag, "  | {}^", underline);
    }
    diag
}
