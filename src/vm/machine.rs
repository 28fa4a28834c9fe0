//! The two-thread execution schedule and verification verdict.
//!
//! A [`Machine`] is built per job and discarded afterwards. The output
//! script ("defender") runs alone for a head-start budget, so it can set
//! up memory traps before the input script ("attacker") is even loaded;
//! if it is still running after the pre-run, the input image is loaded
//! and both threads proceed in lockstep. The verdict is true exactly when
//! the output thread halts with a success interrupt in budget.

use crate::types::bytes::Bytes;
use crate::types::hash::TxHash;
use crate::vm::isa::{Instruction, IrqKind};
use crate::vm::memory::Memory;
use crate::vm::thread::{ThreadContext, ThreadStatus};
use duelchain_derive::Error;

/// Pre-run budget: ticks the output thread runs alone.
pub const MAX_INIT_TICKS: u64 = 100 * 1024;

/// Co-run budget: global ticks once both threads are loaded.
pub const MAX_TICKS: u64 = 1024 * 1024;

/// Word address where the transaction hash is loaded.
pub const HASH_BASE: u16 = 0x0000;

/// Word address (and entry PC) of the output script image.
pub const OUTPUT_BASE: u16 = 0x2000;

/// Word address (and entry PC) of the input script image.
pub const INPUT_BASE: u16 = 0x4000;

/// Maximum byte length of one script image (4096 words).
pub const MAX_SCRIPT_BYTES: usize = 8192;

/// Index of the output (defender) thread.
pub const OUTPUT_THREAD: usize = 0;

/// Index of the input (attacker) thread.
pub const INPUT_THREAD: usize = 1;

/// Errors raised while constructing a job.
///
/// The VM itself has no error path: a hostile script can fail
/// verification but cannot fault the verifier.
#[derive(Debug, Error)]
pub enum JobError {
    /// A script image exceeds [`MAX_SCRIPT_BYTES`].
    #[error("{which} script is {len} bytes, the maximum is {max}")]
    ScriptTooLarge {
        which: &'static str,
        len: usize,
        max: usize,
    },
}

/// One verification job: the immutable triple handed to a worker.
#[derive(Clone, Debug)]
pub struct Job {
    /// Hash of the spending transaction, loaded at [`HASH_BASE`].
    pub hash: TxHash,
    /// The spent output's lock script.
    pub output: Bytes,
    /// The spender's input script.
    pub input: Bytes,
}

impl Job {
    /// Builds a job, rejecting oversized script images.
    pub fn new(
        hash: TxHash,
        output: impl Into<Bytes>,
        input: impl Into<Bytes>,
    ) -> Result<Job, JobError> {
        let output = output.into();
        let input = input.into();
        for (which, script) in [("output", &output), ("input", &input)] {
            if script.len() > MAX_SCRIPT_BYTES {
                return Err(JobError::ScriptTooLarge {
                    which,
                    len: script.len(),
                    max: MAX_SCRIPT_BYTES,
                });
            }
        }
        Ok(Job { hash, output, input })
    }
}

/// A single VM instance: one memory, two threads.
pub struct Machine {
    memory: Memory,
    threads: [ThreadContext; 2],
}

impl Machine {
    /// Creates a machine for the given job.
    ///
    /// The hash and output images are loaded immediately; the input image
    /// is withheld until the co-run phase begins, so a defender that
    /// finishes inside the pre-run budget never shares memory with it.
    pub fn new(job: &Job) -> Machine {
        let mut memory = Memory::new();
        memory.load_image(HASH_BASE, job.hash.as_slice());
        memory.load_image(OUTPUT_BASE, &job.output);
        Machine {
            memory,
            threads: [
                ThreadContext::new(OUTPUT_BASE),
                ThreadContext::new(INPUT_BASE),
            ],
        }
    }

    /// Returns one of the two thread contexts.
    pub fn thread(&self, index: usize) -> &ThreadContext {
        &self.threads[index]
    }

    /// Runs the full schedule for a job and returns its verdict.
    pub fn verify(job: &Job) -> bool {
        let mut machine = Machine::new(job);
        if let Some(verdict) = machine.pre_run() {
            return verdict;
        }
        machine.co_run(&job.input)
    }

    /// Pre-run phase: the output thread alone, up to [`MAX_INIT_TICKS`].
    ///
    /// Returns the verdict if the output thread finished inside the
    /// budget, `None` if the job must continue into the co-run.
    pub fn pre_run(&mut self) -> Option<bool> {
        for _ in 0..MAX_INIT_TICKS {
            self.step(OUTPUT_THREAD);
            let status = self.threads[OUTPUT_THREAD].status;
            if status.is_done() {
                return Some(status.is_success());
            }
        }
        None
    }

    /// Co-run phase: loads the input image, then runs both threads in
    /// lockstep for up to [`MAX_TICKS`] global ticks.
    ///
    /// Within one global tick the output thread steps first and its
    /// memory writes are visible to the input thread's step; the job ends
    /// the moment the output thread is done. Budget exhaustion is a loss.
    pub fn co_run(&mut self, input: &[u8]) -> bool {
        self.memory.load_image(INPUT_BASE, input);
        for _ in 0..MAX_TICKS {
            self.step(OUTPUT_THREAD);
            let status = self.threads[OUTPUT_THREAD].status;
            if status.is_done() {
                return status.is_success();
            }
            if !self.threads[INPUT_THREAD].status.is_done() {
                self.step(INPUT_THREAD);
            }
        }
        false
    }

    /// Executes one tick on the given thread: fetch, decode, execute.
    ///
    /// Done threads are left untouched.
    pub fn step(&mut self, index: usize) {
        let Machine { memory, threads } = self;
        let thread = &mut threads[index];
        if thread.status.is_done() {
            return;
        }

        let instr = Instruction::decode(memory.word(thread.pc));
        let next = thread.pc.wrapping_add(1);
        match instr {
            Instruction::Add { a, b, c } => {
                let v = thread.regs.get(b).wrapping_add(thread.regs.get(c));
                thread.regs.set(a, v);
                thread.pc = next;
            }
            Instruction::Addi { a, b, imm } => {
                let v = thread.regs.get(b).wrapping_add(imm as u16);
                thread.regs.set(a, v);
                thread.pc = next;
            }
            Instruction::Nand { a, b, c } => {
                let v = !(thread.regs.get(b) & thread.regs.get(c));
                thread.regs.set(a, v);
                thread.pc = next;
            }
            Instruction::Lui { a, imm } => {
                thread.regs.set(a, imm << 6);
                thread.pc = next;
            }
            Instruction::Sw { a, b, imm } => {
                let addr = thread.regs.get(b).wrapping_add(imm as u16);
                memory.set_word(addr, thread.regs.get(a));
                thread.pc = next;
            }
            Instruction::Lw { a, b, imm } => {
                let addr = thread.regs.get(b).wrapping_add(imm as u16);
                thread.regs.set(a, memory.word(addr));
                thread.pc = next;
            }
            Instruction::Beq { a, b, imm } => {
                thread.pc = if thread.regs.get(a) == thread.regs.get(b) {
                    next.wrapping_add(imm as u16)
                } else {
                    next
                };
            }
            Instruction::Jalr { a, b } => {
                // The link write lands before the target read, so
                // jalr rX, rX falls through to PC + 1.
                thread.regs.set(a, next);
                thread.pc = thread.regs.get(b);
            }
            Instruction::Irq { kind } => {
                thread.status = match kind {
                    IrqKind::Success => ThreadStatus::Halted { success: true },
                    IrqKind::Yield => ThreadStatus::Yielded,
                    IrqKind::Failure => ThreadStatus::Halted { success: false },
                };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::assembler::Assembler;
    use crate::vm::isa::{IrqKind, Reg};

    fn job(output: Vec<u8>, input: Vec<u8>) -> Job {
        Job::new(TxHash::zero(), output, input).expect("scripts in bounds")
    }

    fn output_only(asm: Assembler) -> Job {
        job(asm.to_bytes().expect("assembly failed"), vec![])
    }

    #[test]
    fn immediate_success() {
        let mut asm = Assembler::new();
        asm.irq(IrqKind::Success);
        assert!(Machine::verify(&output_only(asm)));
    }

    #[test]
    fn immediate_failure() {
        let mut asm = Assembler::new();
        asm.irq(IrqKind::Failure);
        assert!(!Machine::verify(&output_only(asm)));
    }

    #[test]
    fn yield_terminates_without_success() {
        // The success interrupt after the yield must never run.
        let mut asm = Assembler::new();
        asm.irq(IrqKind::Yield);
        asm.irq(IrqKind::Success);
        assert!(!Machine::verify(&output_only(asm)));
    }

    #[test]
    fn success_in_pre_run_never_loads_input() {
        let mut out = Assembler::new();
        out.irq(IrqKind::Success);
        // A hostile input that would fail anything it touches.
        let mut inp = Assembler::with_origin(INPUT_BASE);
        inp.irq(IrqKind::Failure);
        let job = job(
            out.to_bytes().unwrap(),
            inp.to_bytes().unwrap(),
        );

        let mut machine = Machine::new(&job);
        assert_eq!(machine.pre_run(), Some(true));
        // The input region was never written.
        assert_eq!(machine.memory.word(INPUT_BASE), 0);
        assert_eq!(machine.thread(INPUT_THREAD).pc, INPUT_BASE);
    }

    #[test]
    fn infinite_loop_exhausts_both_budgets() {
        let mut asm = Assembler::new();
        asm.beq(Reg::R0, Reg::R0, -1).unwrap();
        assert!(!Machine::verify(&output_only(asm)));
    }

    #[test]
    fn empty_output_runs_through_zeroed_memory() {
        // All-zero memory is an endless stream of `add r0, r0, r0`; the
        // defender never halts and the verdict is false.
        assert!(!Machine::verify(&job(vec![], vec![])));
    }

    #[test]
    fn verdict_is_deterministic() {
        let mut asm = Assembler::new();
        asm.movi(Reg::R1, 0xBEEF);
        asm.movi(Reg::R2, 0xBEEF);
        asm.beq(Reg::R1, Reg::R2, 1).unwrap();
        asm.irq(IrqKind::Failure);
        asm.irq(IrqKind::Success);
        let job = output_only(asm);
        let first = Machine::verify(&job);
        for _ in 0..3 {
            assert_eq!(Machine::verify(&job), first);
        }
        assert!(first);
    }

    #[test]
    fn hash_is_readable_by_the_output_script() {
        // lw r1, r0, 0 reads the first hash word; compare against movi.
        let mut hash_bytes = [0u8; 32];
        hash_bytes[0] = 0x12;
        hash_bytes[1] = 0x34;
        let mut asm = Assembler::new();
        asm.lw(Reg::R1, Reg::R0, 0).unwrap();
        asm.movi(Reg::R2, 0x1234);
        asm.beq(Reg::R1, Reg::R2, 1).unwrap();
        asm.irq(IrqKind::Failure);
        asm.irq(IrqKind::Success);

        let job = Job::new(
            TxHash(hash_bytes),
            asm.to_bytes().unwrap(),
            vec![],
        )
        .unwrap();
        assert!(Machine::verify(&job));
    }

    #[test]
    fn defender_memory_writes_are_visible_to_attacker() {
        // Defender: spin writing a sentinel to 0x1000 forever.
        //   movi r1, 0x1000 ; movi r2, 7
        //   loop: sw r2, r1, 0 ; jmp loop
        let mut out = Assembler::new();
        out.movi(Reg::R1, 0x1000);
        out.movi(Reg::R2, 7);
        let spin = out.label();
        out.bind(spin).unwrap();
        out.sw(Reg::R2, Reg::R1, 0).unwrap();
        out.jmp(spin).unwrap();

        // Attacker: read 0x1000 once; the defender stored there on an
        // earlier (or this) global tick, so the read must observe 7.
        // Then loop forever.
        let mut inp = Assembler::with_origin(INPUT_BASE);
        inp.movi(Reg::R1, 0x1000);
        inp.lw(Reg::R3, Reg::R1, 0).unwrap();
        let spin = inp.label();
        inp.bind(spin).unwrap();
        inp.jmp(spin).unwrap();

        let job = job(out.to_bytes().unwrap(), inp.to_bytes().unwrap());
        let mut machine = Machine::new(&job);
        assert_eq!(machine.pre_run(), None);
        machine.co_run(&job.input);
        assert_eq!(machine.thread(INPUT_THREAD).regs.get(Reg::R3), 7);
    }

    #[test]
    fn attacker_corrupting_defender_code_flips_verdict() {
        // Defender wastes the whole pre-run in a counting loop, then
        // executes what sits at a known code address. The attacker's
        // first act in the co-run overwrites that address with
        // `irq failure` before the defender arrives.
        let mut out = Assembler::new();
        // Count r1 down from 0xFFFF three times to burn > MAX_INIT_TICKS.
        for _ in 0..3 {
            out.movi(Reg::R1, 0xFFFF);
            let spin = out.label();
            out.bind(spin).unwrap();
            out.addi(Reg::R1, Reg::R1, -1).unwrap();
            out.beq(Reg::R1, Reg::R0, 2).unwrap();
            out.jmp(spin).unwrap();
            out.nop();
        }
        let landing = out.pc();
        out.irq(IrqKind::Success);

        let mut inp = Assembler::with_origin(INPUT_BASE);
        inp.movi(Reg::R1, landing);
        inp.movi(
            Reg::R2,
            Instruction::Irq { kind: IrqKind::Failure }.encode(),
        );
        inp.sw(Reg::R2, Reg::R1, 0).unwrap();
        let spin = inp.label();
        inp.bind(spin).unwrap();
        inp.jmp(spin).unwrap();

        let sabotaged = job(out.to_bytes().unwrap(), inp.to_bytes().unwrap());
        assert!(!Machine::verify(&sabotaged));

        // Without the attacker the same defender wins.
        let unchallenged = job(sabotaged.output.to_vec(), vec![]);
        assert!(Machine::verify(&unchallenged));
    }

    #[test]
    fn far_jump_skips_the_failure_path() {
        let mut asm = Assembler::new();
        let target = asm.label();
        asm.farjmp(Reg::R1, target).unwrap();
        asm.irq(IrqKind::Failure);
        asm.bind(target).unwrap();
        asm.irq(IrqKind::Success);
        assert!(Machine::verify(&output_only(asm)));
    }

    #[test]
    fn jalr_stores_the_return_address() {
        // movi r1, <irq success addr> ; jalr r2, r1 lands on success with
        // r2 holding the word after the jalr.
        let mut asm = Assembler::new();
        asm.movi(Reg::R1, OUTPUT_BASE + 4);
        asm.jalr(Reg::R2, Reg::R1);
        asm.irq(IrqKind::Failure);
        asm.irq(IrqKind::Success);

        let job = output_only(asm);
        let mut machine = Machine::new(&job);
        assert_eq!(machine.pre_run(), Some(true));
        assert_eq!(
            machine.thread(OUTPUT_THREAD).regs.get(Reg::R2),
            OUTPUT_BASE + 3
        );
    }

    #[test]
    fn job_rejects_oversized_scripts() {
        let oversized = vec![0u8; MAX_SCRIPT_BYTES + 1];
        assert!(matches!(
            Job::new(TxHash::zero(), oversized.clone(), vec![]),
            Err(JobError::ScriptTooLarge { which: "output", .. })
        ));
        assert!(matches!(
            Job::new(TxHash::zero(), vec![], oversized),
            Err(JobError::ScriptTooLarge { which: "input", .. })
        ));
        assert!(Job::new(TxHash::zero(), vec![0u8; MAX_SCRIPT_BYTES], vec![]).is_ok());
    }

    #[test]
    fn r0_stays_zero_under_fire() {
        // Write to r0 through every writing instruction, then prove it
        // still reads zero by branching on it.
        let mut asm = Assembler::new();
        asm.movi(Reg::R1, 0x00FF);
        asm.add(Reg::R0, Reg::R1, Reg::R1);
        asm.addi(Reg::R0, Reg::R1, 5).unwrap();
        asm.nand(Reg::R0, Reg::R1, Reg::R1);
        asm.lui(Reg::R0, 0x3FF).unwrap();
        asm.lw(Reg::R0, Reg::R1, 0).unwrap();
        asm.beq(Reg::R0, Reg::R0, 1).unwrap();
        asm.irq(IrqKind::Failure);
        asm.irq(IrqKind::Success);
        assert!(Machine::verify(&output_only(asm)));
    }
}
