//! LS-8 virtual machine
//!
//! The LS-8 is a tiny 8-bit computer with 256 bytes of memory, eight
//! registers and a downward-growing stack.  Programs are loaded at address 0
//! and executed until they reach `HLT` or trigger a fatal error.
#![warn(missing_docs)]
#![forbid(unsafe_code)]

use log::{debug, trace};

mod alu;
mod opcode;
pub mod program;

pub use alu::AluOp;
pub use opcode::{Opcode, advance, disassemble, operand_count, sets_pc};
pub use program::LoadError;

/// Number of bytes of memory
pub const MEMORY_SIZE: usize = 256;

/// Number of general-purpose registers
pub const REGISTER_COUNT: usize = 8;

/// Register used as the stack pointer
pub const SP: u8 = 7;

/// Register which holds the address one past the end of the loaded program
///
/// The stack may not grow down to this address.
pub const PROGRAM_END: u8 = 4;

/// Initial value of the stack pointer, i.e. the address of an empty stack
pub const STACK_HEAD: u8 = 0xF4;

/// Process exit codes, one per failure class
pub mod exit {
    /// The program reached `HLT`
    pub const HALT: u8 = 0;
    /// An opcode was not in the instruction set
    pub const UNKNOWN_INSTRUCTION: u8 = 1;
    /// The program image could not be read or parsed
    pub const LOAD: u8 = 2;
    /// `PUSH` would have grown the stack into the program
    pub const STACK_OVERFLOW: u8 = 3;
    /// An operand named a register that doesn't exist
    pub const INVALID_REGISTER: u8 = 4;
    /// `POP` from an empty stack (strict mode only)
    pub const STACK_UNDERFLOW: u8 = 5;
    /// The ALU was asked for an operation that it doesn't support
    pub const UNSUPPORTED_ALU_OP: u8 = 6;
}

/// Fatal error raised while executing a program
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The opcode at `pc` is not in the instruction set
    #[error("unknown instruction {opcode:#010b} at {pc:#04x}")]
    UnhandledInstruction {
        /// Opcode byte
        opcode: u8,
        /// Address of the opcode
        pc: u8,
    },

    /// `PUSH` would move the stack pointer below the program-end boundary
    #[error("stack overflow (SP = {sp:#04x}, program ends at {end:#04x})")]
    StackOverflow {
        /// Stack pointer before the push
        sp: u8,
        /// Program-end boundary
        end: u8,
    },

    /// `POP` with an empty stack
    #[error("stack underflow (SP = {sp:#04x})")]
    StackUnderflow {
        /// Stack pointer at the time of the pop
        sp: u8,
    },

    /// Register index outside of `0..8`
    #[error("invalid register R{0}")]
    InvalidRegister(u8),

    /// Unknown ALU operation name
    #[error("unsupported ALU operation {0:?}")]
    UnsupportedAluOp(String),
}

impl Error {
    /// Process exit code for this error
    pub fn exit_code(&self) -> u8 {
        match self {
            Error::UnhandledInstruction { .. } => exit::UNKNOWN_INSTRUCTION,
            Error::StackOverflow { .. } => exit::STACK_OVERFLOW,
            Error::StackUnderflow { .. } => exit::STACK_UNDERFLOW,
            Error::InvalidRegister(..) => exit::INVALID_REGISTER,
            Error::UnsupportedAluOp(..) => exit::UNSUPPORTED_ALU_OP,
        }
    }
}

/// Flat byte-addressed memory
#[derive(Clone, PartialEq, Eq)]
pub struct Memory([u8; MEMORY_SIZE]);

impl Default for Memory {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Memory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Memory").finish_non_exhaustive()
    }
}

impl Memory {
    /// Builds a new zero-initialized memory
    pub fn new() -> Self {
        Self([0u8; MEMORY_SIZE])
    }

    /// Reads a byte
    #[inline]
    pub fn read(&self, addr: u8) -> u8 {
        self.0[usize::from(addr)]
    }

    /// Writes a byte
    #[inline]
    pub fn write(&mut self, addr: u8, v: u8) {
        self.0[usize::from(addr)] = v;
    }

    /// Shared borrow of the entire memory array
    pub fn as_slice(&self) -> &[u8; MEMORY_SIZE] {
        &self.0
    }
}

/// General-purpose register file
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Registers([u8; REGISTER_COUNT]);

impl Registers {
    /// Reads a register, checking that the index is valid
    #[inline]
    pub fn get(&self, i: u8) -> Result<u8, Error> {
        self.0
            .get(usize::from(i))
            .copied()
            .ok_or(Error::InvalidRegister(i))
    }

    /// Writes a register, checking that the index is valid
    #[inline]
    pub fn set(&mut self, i: u8, v: u8) -> Result<(), Error> {
        let r = self
            .0
            .get_mut(usize::from(i))
            .ok_or(Error::InvalidRegister(i))?;
        *r = v;
        Ok(())
    }

    /// Returns all registers, `R0` first
    pub fn as_array(&self) -> &[u8; REGISTER_COUNT] {
        &self.0
    }
}

/// Condition flags
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Flags(u8);

impl Flags {
    /// Set by `CMP` when both registers are equal
    pub const EQUAL: u8 = 1 << 0;

    /// Checks the `Equal` bit
    #[inline]
    pub fn equal(&self) -> bool {
        self.0 & Self::EQUAL != 0
    }

    #[inline]
    fn set_equal(&mut self, eq: bool) {
        if eq {
            self.0 |= Self::EQUAL;
        } else {
            self.0 &= !Self::EQUAL;
        }
    }

    /// Returns the raw flags byte
    #[inline]
    pub fn bits(&self) -> u8 {
        self.0
    }
}

/// Execution state of the CPU
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum State {
    /// Instructions are being executed
    Running,
    /// `HLT` has been executed
    Halted,
}

/// Selects how faithfully the CPU reproduces quirks of the reference machine
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
pub enum Mode {
    /// Both operand bytes are always fetched, and `POP` from an empty stack
    /// silently returns whatever is stored at the stack head
    #[default]
    Reference,
    /// Operand bytes beyond the instruction's operand count read as zero, and
    /// `POP` from an empty stack is an error
    Strict,
}

/// CPU configuration
#[derive(Copy, Clone, Debug, Default)]
pub struct Config {
    /// Execution mode
    pub mode: Mode,
    /// Sends a [`Trace`] to the sink before every instruction
    pub trace: bool,
}

/// Snapshot of CPU state, for debugging
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Trace {
    /// Program counter
    pub pc: u8,
    /// Flags register
    pub flags: u8,
    /// Three bytes of memory starting at the program counter
    pub next: [u8; 3],
    /// Register values
    pub reg: [u8; REGISTER_COUNT],
}

impl std::fmt::Display for Trace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let [a, b, c] = self.next;
        write!(
            f,
            "TRACE: {:02X} {:02X} | {a:02X} {b:02X} {c:02X} |",
            self.pc, self.flags
        )?;
        for r in self.reg {
            write!(f, " {r:02X}")?;
        }
        Ok(())
    }
}

/// Trait for a diagnostic sink, which receives output from the CPU
pub trait Sink {
    /// Receives the value printed by `PRN`
    fn print(&mut self, value: u8);

    /// Receives a state dump
    ///
    /// This is called before each instruction if [`Config::trace`] is set,
    /// and before returning [`Error::StackOverflow`].
    fn trace(&mut self, _trace: &Trace) {
        // ignored by default
    }
}

/// Sink which discards everything
pub struct EmptySink;
impl Sink for EmptySink {
    fn print(&mut self, _value: u8) {
        // nothing to do here
    }
}

/// Sink which records everything that it receives
#[derive(Clone, Debug, Default)]
pub struct Capture {
    /// Values printed by `PRN`, in order
    pub printed: Vec<u8>,
    /// State dumps, in order
    pub traces: Vec<Trace>,
}

impl Sink for Capture {
    fn print(&mut self, value: u8) {
        self.printed.push(value);
    }
    fn trace(&mut self, trace: &Trace) {
        self.traces.push(*trace);
    }
}

/// The virtual machine itself
#[derive(Clone, Debug)]
pub struct Cpu {
    /// 256 bytes of memory
    ram: Memory,
    /// Register file, including the stack pointer
    reg: Registers,
    pc: u8,
    fl: Flags,
    state: State,
    config: Config,
}

impl Cpu {
    /// Builds a new CPU with empty memory
    pub fn new(config: Config) -> Self {
        let mut out = Self {
            ram: Memory::new(),
            reg: Registers::default(),
            pc: 0,
            fl: Flags::default(),
            state: State::Running,
            config,
        };
        out.reg.0[usize::from(SP)] = STACK_HEAD;
        out
    }

    /// Returns the CPU to its initial state, clearing memory
    pub fn reset(&mut self) {
        *self = Self::new(self.config);
    }

    /// Copies a program image to address 0 and records its end in
    /// [`PROGRAM_END`]
    pub fn load(&mut self, image: &[u8]) -> Result<(), LoadError> {
        let n = u8::try_from(image.len())
            .map_err(|_| LoadError::TooLarge(image.len()))?;
        self.ram.0[..image.len()].copy_from_slice(image);
        self.reg.0[usize::from(PROGRAM_END)] = n;
        debug!("loaded {n} bytes");
        Ok(())
    }

    /// Returns the current program counter
    #[inline]
    pub fn pc(&self) -> u8 {
        self.pc
    }

    /// Returns the condition flags
    #[inline]
    pub fn flags(&self) -> Flags {
        self.fl
    }

    /// Returns the execution state
    #[inline]
    pub fn state(&self) -> State {
        self.state
    }

    /// Shared borrow of the register file
    #[inline]
    pub fn reg(&self) -> &Registers {
        &self.reg
    }

    /// Mutable borrow of the register file
    #[inline]
    pub fn reg_mut(&mut self) -> &mut Registers {
        &mut self.reg
    }

    /// Shared borrow of memory
    #[inline]
    pub fn ram(&self) -> &Memory {
        &self.ram
    }

    /// Mutable borrow of memory
    #[inline]
    pub fn ram_mut(&mut self) -> &mut Memory {
        &mut self.ram
    }

    #[inline]
    fn sp(&self) -> u8 {
        self.reg.0[usize::from(SP)]
    }

    #[inline]
    fn set_sp(&mut self, sp: u8) {
        self.reg.0[usize::from(SP)] = sp;
    }

    /// Captures the current state for debugging
    pub fn trace(&self) -> Trace {
        let pc = self.pc;
        Trace {
            pc,
            flags: self.fl.bits(),
            next: [0, 1, 2].map(|i| self.ram.read(pc.wrapping_add(i))),
            reg: self.reg.0,
        }
    }

    /// Fetches the two bytes following the opcode at the program counter
    #[inline]
    fn operands(&self, ir: u8) -> (u8, u8) {
        let a = self.ram.read(self.pc.wrapping_add(1));
        let b = self.ram.read(self.pc.wrapping_add(2));
        match (self.config.mode, operand_count(ir)) {
            (Mode::Reference, _) => (a, b),
            (Mode::Strict, 0) => (0, 0),
            (Mode::Strict, 1) => (a, 0),
            (Mode::Strict, _) => (a, b),
        }
    }

    /// Executes a single instruction
    ///
    /// Returns the state after execution.  On error, the CPU is left as it
    /// was when the error occurred; there is no way to resume.
    ///
    /// A halted CPU stays halted until [`Cpu::reset`]; stepping it does
    /// nothing.
    pub fn step<S: Sink>(&mut self, sink: &mut S) -> Result<State, Error> {
        if self.state == State::Halted {
            return Ok(State::Halted);
        }
        if self.config.trace {
            sink.trace(&self.trace());
        }
        let pc = self.pc;
        let ir = self.ram.read(pc);
        let (a, b) = self.operands(ir);
        let op = Opcode::try_from(ir)
            .map_err(|opcode| Error::UnhandledInstruction { opcode, pc })?;
        trace!("{pc:02x}: {op} {a:02x} {b:02x}");

        self.op(op, sink, a, b)?;
        if !sets_pc(ir) {
            self.pc = pc.wrapping_add(advance(ir));
        }
        Ok(self.state)
    }

    /// Runs the VM from the current program counter until it halts
    pub fn run<S: Sink>(&mut self, sink: &mut S) -> Result<(), Error> {
        self.run_until(sink, |_cpu, _i| false).map(|_| ())
    }

    /// Runs the VM until it halts or the callback returns `true`
    ///
    /// The callback is invoked before each instruction, with the number of
    /// instructions executed so far.  Returns `Some(n)` with the total
    /// instruction count if the VM halted, or `None` if it was stopped early.
    /// An already-halted VM returns `Some(0)` without calling `f`.
    pub fn run_until<S: Sink, F: FnMut(&Cpu, usize) -> bool>(
        &mut self,
        sink: &mut S,
        mut f: F,
    ) -> Result<Option<usize>, Error> {
        let mut i = 0;
        while self.state == State::Running {
            if f(self, i) {
                return Ok(None);
            }
            self.step(sink)?;
            i += 1;
        }
        Ok(Some(i))
    }

    /// Executes a single decoded operation
    #[inline]
    fn op(
        &mut self,
        op: Opcode,
        sink: &mut dyn Sink,
        a: u8,
        b: u8,
    ) -> Result<(), Error> {
        match op {
            Opcode::Hlt => op::hlt(self, sink, a, b),
            Opcode::Ldi => op::ldi(self, sink, a, b),
            Opcode::Prn => op::prn(self, sink, a, b),
            Opcode::Mul => op::mul(self, sink, a, b),
            Opcode::Push => op::push(self, sink, a, b),
            Opcode::Pop => op::pop(self, sink, a, b),
            Opcode::Cmp => op::cmp(self, sink, a, b),
            Opcode::Jmp => op::jmp(self, sink, a, b),
            Opcode::Jeq => op::jeq(self, sink, a, b),
            Opcode::Jne => op::jne(self, sink, a, b),
        }
    }
}

mod op {
    use super::*;
    use log::{error, warn};

    /// Halt
    ///
    /// ```text
    /// HLT
    /// ```
    #[inline]
    pub fn hlt(
        vm: &mut Cpu,
        _: &mut dyn Sink,
        _: u8,
        _: u8,
    ) -> Result<(), Error> {
        vm.state = State::Halted;
        Ok(())
    }

    /// Load Immediate
    ///
    /// ```text
    /// LDI reg imm
    /// ```
    ///
    /// Sets the register to the immediate value.
    #[inline]
    pub fn ldi(
        vm: &mut Cpu,
        _: &mut dyn Sink,
        r: u8,
        v: u8,
    ) -> Result<(), Error> {
        vm.reg.set(r, v)
    }

    /// Print
    ///
    /// ```text
    /// PRN reg
    /// ```
    #[inline]
    pub fn prn(
        vm: &mut Cpu,
        sink: &mut dyn Sink,
        r: u8,
        _: u8,
    ) -> Result<(), Error> {
        sink.print(vm.reg.get(r)?);
        Ok(())
    }

    /// Multiply
    ///
    /// ```text
    /// MUL a b
    /// ```
    ///
    /// Stores `a * b` (truncated to 8 bits) in `a`.
    #[inline]
    pub fn mul(
        vm: &mut Cpu,
        _: &mut dyn Sink,
        a: u8,
        b: u8,
    ) -> Result<(), Error> {
        vm.alu(AluOp::Mul, a, b)
    }

    /// Push
    ///
    /// ```text
    /// PUSH reg
    /// ```
    ///
    /// Decrements `SP`, then stores the register at `SP`.  The stack may not
    /// grow below the address in [`PROGRAM_END`]; trying to do so dumps state
    /// to the sink and returns [`Error::StackOverflow`] without touching
    /// memory.
    #[inline]
    pub fn push(
        vm: &mut Cpu,
        sink: &mut dyn Sink,
        r: u8,
        _: u8,
    ) -> Result<(), Error> {
        let sp = vm.sp();
        let end = vm.reg.get(PROGRAM_END)?;
        let Some(next) = sp.checked_sub(1).filter(|next| *next >= end) else {
            error!("stack overflow at {:#04x}", vm.pc);
            sink.trace(&vm.trace());
            return Err(Error::StackOverflow { sp, end });
        };
        vm.reg.get(r)?;
        vm.set_sp(next);
        // Reads after the decrement, so `PUSH R7` stores the new SP
        let v = vm.reg.get(r)?;
        vm.ram.write(next, v);
        Ok(())
    }

    /// Pop
    ///
    /// ```text
    /// POP reg
    /// ```
    ///
    /// Loads the byte at `SP` into the register, then increments `SP` unless
    /// it's already at the stack head.
    ///
    /// In [`Mode::Reference`], popping an empty stack leaves `SP` in place and
    /// returns whatever byte is stored at the stack head.  In
    /// [`Mode::Strict`], it's an error.
    #[inline]
    pub fn pop(
        vm: &mut Cpu,
        _: &mut dyn Sink,
        r: u8,
        _: u8,
    ) -> Result<(), Error> {
        let sp = vm.sp();
        if sp >= STACK_HEAD {
            match vm.config.mode {
                Mode::Strict => return Err(Error::StackUnderflow { sp }),
                Mode::Reference => {
                    warn!("POP with empty stack at {:#04x}", vm.pc)
                }
            }
        }
        vm.reg.set(r, vm.ram.read(sp))?;
        // `POP R7` may have just moved the stack pointer
        let sp = vm.sp();
        if sp < STACK_HEAD {
            vm.set_sp(sp + 1);
        }
        Ok(())
    }

    /// Compare
    ///
    /// ```text
    /// CMP a b
    /// ```
    ///
    /// Sets the `Equal` flag if `a == b`, clearing it otherwise.
    #[inline]
    pub fn cmp(
        vm: &mut Cpu,
        _: &mut dyn Sink,
        a: u8,
        b: u8,
    ) -> Result<(), Error> {
        vm.alu(AluOp::Cmp, a, b)
    }

    /// Jump
    ///
    /// ```text
    /// JMP reg
    /// ```
    #[inline]
    pub fn jmp(
        vm: &mut Cpu,
        _: &mut dyn Sink,
        r: u8,
        _: u8,
    ) -> Result<(), Error> {
        vm.pc = vm.reg.get(r)?;
        Ok(())
    }

    /// Moves to the address in `r` if `taken`, otherwise past the current
    /// two-byte instruction
    #[inline]
    fn branch(vm: &mut Cpu, r: u8, taken: bool) -> Result<(), Error> {
        vm.pc = if taken {
            vm.reg.get(r)?
        } else {
            vm.pc.wrapping_add(2)
        };
        Ok(())
    }

    /// Jump if Equal
    ///
    /// ```text
    /// JEQ reg
    /// ```
    #[inline]
    pub fn jeq(
        vm: &mut Cpu,
        _: &mut dyn Sink,
        r: u8,
        _: u8,
    ) -> Result<(), Error> {
        let eq = vm.fl.equal();
        branch(vm, r, eq)
    }

    /// Jump if Not Equal
    ///
    /// ```text
    /// JNE reg
    /// ```
    #[inline]
    pub fn jne(
        vm: &mut Cpu,
        _: &mut dyn Sink,
        r: u8,
        _: u8,
    ) -> Result<(), Error> {
        let eq = vm.fl.equal();
        branch(vm, r, !eq)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const LDI: u8 = 0b1000_0010;
    const PRN: u8 = 0b0100_0111;
    const HLT: u8 = 0b0000_0001;
    const MUL: u8 = 0b1010_0010;
    const PUSH: u8 = 0b0100_0101;
    const POP: u8 = 0b0100_0110;
    const CMP: u8 = 0b1010_0111;
    const JMP: u8 = 0b0101_0100;
    const JEQ: u8 = 0b0101_0101;
    const JNE: u8 = 0b0101_0110;

    fn cpu(image: &[u8]) -> Cpu {
        let mut cpu = Cpu::new(Config::default());
        cpu.load(image).unwrap();
        cpu
    }

    fn strict(image: &[u8]) -> Cpu {
        let mut cpu = Cpu::new(Config {
            mode: Mode::Strict,
            trace: false,
        });
        cpu.load(image).unwrap();
        cpu
    }

    #[test]
    fn initial_state() {
        let cpu = Cpu::new(Config::default());
        assert_eq!(cpu.pc(), 0);
        assert_eq!(cpu.flags().bits(), 0);
        assert_eq!(cpu.state(), State::Running);
        assert_eq!(cpu.reg().get(SP), Ok(STACK_HEAD));
        assert!(cpu.ram().as_slice().iter().all(|b| *b == 0));
    }

    #[test]
    fn load_records_end() {
        let cpu = cpu(&[LDI, 0, 8, PRN, 0, HLT]);
        assert_eq!(cpu.reg().get(PROGRAM_END), Ok(6));
        assert_eq!(&cpu.ram().as_slice()[..6], &[LDI, 0, 8, PRN, 0, HLT]);

        let mut c = Cpu::new(Config::default());
        let big = [0u8; MEMORY_SIZE];
        assert!(matches!(c.load(&big), Err(LoadError::TooLarge(256))));
    }

    #[test]
    fn print8() {
        let mut cpu = cpu(&[0x82, 0x00, 0x08, 0x47, 0x00, 0x01]);
        let mut out = Capture::default();
        cpu.run(&mut out).unwrap();
        assert_eq!(out.printed, [8]);
        assert_eq!(cpu.state(), State::Halted);
        assert!(out.traces.is_empty());
    }

    #[test]
    fn ldi_advances_by_three() {
        for (r, v) in [(0, 0), (3, 0x7f), (6, 0xff)] {
            let mut cpu = cpu(&[LDI, r, v]);
            assert_eq!(cpu.step(&mut EmptySink), Ok(State::Running));
            assert_eq!(cpu.reg().get(r), Ok(v));
            assert_eq!(cpu.pc(), 3);
        }
    }

    #[test]
    fn mul_truncates() {
        let mut cpu =
            cpu(&[LDI, 0, 20, LDI, 1, 30, MUL, 0, 1, PRN, 0, PRN, 1, HLT]);
        let mut out = Capture::default();
        cpu.run(&mut out).unwrap();
        assert_eq!(out.printed, [(20u16 * 30 % 256) as u8, 30]);
    }

    #[test]
    fn push_pop_round_trip() {
        let mut cpu = cpu(&[LDI, 1, 42, PUSH, 1, POP, 2, HLT]);
        cpu.step(&mut EmptySink).unwrap();
        cpu.step(&mut EmptySink).unwrap();
        assert_eq!(cpu.reg().get(SP), Ok(STACK_HEAD - 1));
        assert_eq!(cpu.ram().read(STACK_HEAD - 1), 42);
        cpu.step(&mut EmptySink).unwrap();
        assert_eq!(cpu.reg().get(2), Ok(42));
        assert_eq!(cpu.reg().get(SP), Ok(STACK_HEAD));
        assert_eq!(cpu.step(&mut EmptySink), Ok(State::Halted));
    }

    #[test]
    fn pop_empty_stack() {
        // Reference mode reads the stack head and leaves SP in place
        let mut cpu = cpu(&[POP, 0, POP, 1, HLT]);
        cpu.ram_mut().write(STACK_HEAD, 0x99);
        cpu.run(&mut EmptySink).unwrap();
        assert_eq!(cpu.reg().get(0), Ok(0x99));
        assert_eq!(cpu.reg().get(1), Ok(0x99));
        assert_eq!(cpu.reg().get(SP), Ok(STACK_HEAD));

        let mut cpu = strict(&[POP, 0, HLT]);
        let err = cpu.run(&mut EmptySink).unwrap_err();
        assert_eq!(err, Error::StackUnderflow { sp: STACK_HEAD });
        assert_eq!(err.exit_code(), exit::STACK_UNDERFLOW);
        assert_eq!(cpu.reg().get(0), Ok(0));
    }

    #[test]
    fn stack_overflow() {
        // LDI R0,0xAA; LDI R1,6; loop: PUSH R0; JMP R1
        let image = [LDI, 0, 0xAA, LDI, 1, 6, PUSH, 0, JMP, 1];
        let mut cpu = cpu(&image);
        let mut out = Capture::default();
        let err = cpu.run(&mut out).unwrap_err();
        assert_eq!(err, Error::StackOverflow { sp: 10, end: 10 });
        assert_eq!(err.exit_code(), exit::STACK_OVERFLOW);

        // The stack filled exactly up to the end of the program
        let ram = cpu.ram().as_slice();
        assert_eq!(&ram[..image.len()], &image);
        assert!(ram[10..usize::from(STACK_HEAD)].iter().all(|b| *b == 0xAA));
        assert_eq!(ram[usize::from(STACK_HEAD)], 0);

        // A single state dump was emitted, pointing at the PUSH
        assert_eq!(out.traces.len(), 1);
        assert_eq!(out.traces[0].pc, 6);
        assert_eq!(out.traces[0].reg[usize::from(SP)], 10);
    }

    #[test]
    fn push_bad_register() {
        let mut cpu = cpu(&[PUSH, 9]);
        assert_eq!(cpu.step(&mut EmptySink), Err(Error::InvalidRegister(9)));
        assert_eq!(cpu.reg().get(SP), Ok(STACK_HEAD));
        assert_eq!(cpu.ram().read(STACK_HEAD - 1), 0);
    }

    #[test]
    fn push_sp() {
        let mut cpu = cpu(&[PUSH, SP, HLT]);
        cpu.step(&mut EmptySink).unwrap();
        assert_eq!(cpu.reg().get(SP), Ok(STACK_HEAD - 1));
        assert_eq!(cpu.ram().read(STACK_HEAD - 1), STACK_HEAD - 1);
    }

    #[test]
    fn push_at_address_zero() {
        let mut cpu = cpu(&[PUSH, 0]);
        cpu.reg_mut().set(PROGRAM_END, 0).unwrap();
        cpu.reg_mut().set(SP, 0).unwrap();
        assert_eq!(
            cpu.step(&mut EmptySink),
            Err(Error::StackOverflow { sp: 0, end: 0 })
        );
    }

    #[test]
    fn compare_and_branch() {
        // LDI R1,5; LDI R2,x; LDI R3,17; CMP R1,R2; JEQ R3; PRN R2; HLT;
        // PRN R3 (at 17); HLT
        let program = |x| {
            [
                LDI, 1, 5, LDI, 2, x, LDI, 3, 17, CMP, 1, 2, JEQ, 3, PRN, 2,
                HLT, PRN, 3, HLT,
            ]
        };

        let mut cpu = cpu(&program(5));
        let mut out = Capture::default();
        cpu.run(&mut out).unwrap();
        assert_eq!(out.printed, [17]);
        assert!(cpu.flags().equal());
        assert_eq!(cpu.pc(), 20);

        let mut cpu = self::cpu(&program(6));
        let mut out = Capture::default();
        cpu.run(&mut out).unwrap();
        assert_eq!(out.printed, [6]);
        assert!(!cpu.flags().equal());
        assert_eq!(cpu.pc(), 17);
    }

    #[test]
    fn branch_targets() {
        for (flag, op, taken) in [
            (true, JEQ, true),
            (false, JEQ, false),
            (true, JNE, false),
            (false, JNE, true),
        ] {
            // LDI R0,a; LDI R1,b; LDI R2,0x40; CMP R0,R1; Jxx R2
            let b = if flag { 1 } else { 2 };
            let mut cpu =
                cpu(&[LDI, 0, 1, LDI, 1, b, LDI, 2, 0x40, CMP, 0, 1, op, 2]);
            for _ in 0..5 {
                cpu.step(&mut EmptySink).unwrap();
            }
            assert_eq!(cpu.flags().equal(), flag);
            let expected = if taken { 0x40 } else { 14 };
            assert_eq!(cpu.pc(), expected, "op {op:#010b}, flag {flag}");
        }
    }

    #[test]
    fn jmp_sets_pc() {
        let mut cpu = cpu(&[LDI, 5, 0x30, JMP, 5]);
        cpu.step(&mut EmptySink).unwrap();
        cpu.step(&mut EmptySink).unwrap();
        assert_eq!(cpu.pc(), 0x30);
    }

    #[test]
    fn unknown_opcode() {
        let mut cpu = cpu(&[0xFF]);
        let before = *cpu.reg();
        let err = cpu.run(&mut EmptySink).unwrap_err();
        assert_eq!(err, Error::UnhandledInstruction { opcode: 0xFF, pc: 0 });
        assert_eq!(err.exit_code(), exit::UNKNOWN_INSTRUCTION);
        assert_eq!(*cpu.reg(), before);
        assert_eq!(cpu.pc(), 0);
    }

    #[test]
    fn call_and_ret_are_unimplemented() {
        for opcode in [0b0101_0000, 0b0001_0001] {
            let mut cpu = cpu(&[opcode, 0]);
            assert_eq!(
                cpu.run(&mut EmptySink),
                Err(Error::UnhandledInstruction { opcode, pc: 0 })
            );
        }
    }

    #[test]
    fn invalid_register() {
        let mut cpu = cpu(&[LDI, 8, 1]);
        let err = cpu.step(&mut EmptySink).unwrap_err();
        assert_eq!(err, Error::InvalidRegister(8));
        assert_eq!(err.exit_code(), exit::INVALID_REGISTER);
    }

    #[test]
    fn strict_operands() {
        // Trailing bytes after a one-operand instruction are not fetched
        let mut cpu = strict(&[PRN, 0, 0xFF]);
        assert_eq!(cpu.operands(HLT), (0, 0));
        assert_eq!(cpu.operands(PRN), (0, 0));
        assert_eq!(cpu.operands(LDI), (0, 0xFF));
        let mut out = Capture::default();
        cpu.step(&mut out).unwrap();
        assert_eq!(out.printed, [0]);
        assert_eq!(cpu.pc(), 2);

        let cpu = self::cpu(&[PRN, 0, 0xFF]);
        assert_eq!(cpu.operands(HLT), (0, 0xFF));
    }

    #[test]
    fn run_until_counts_steps() {
        // R0 = 3^n mod 256 returns to 1 after 64 multiplications
        let image = [
            LDI, 0, 1, LDI, 1, 3, LDI, 2, 1, LDI, 3, 12, MUL, 0, 1, CMP, 0, 2,
            JNE, 3, HLT,
        ];
        let mut cpu = cpu(&image);
        let n = cpu.run_until(&mut EmptySink, |_cpu, _i| false).unwrap();
        assert_eq!(n, Some(4 + 64 * 3 + 1));
        assert_eq!(cpu.reg().get(0), Ok(1));

        // An infinite loop can be cut short
        let mut cpu = self::cpu(&[LDI, 0, 0, JMP, 0]);
        let n = cpu.run_until(&mut EmptySink, |_cpu, i| i >= 100).unwrap();
        assert_eq!(n, None);
        assert_eq!(cpu.state(), State::Running);
    }

    #[test]
    fn trace_format() {
        let mut cpu = cpu(&[LDI, 0, 8, PRN, 0, HLT]);
        cpu.config.trace = true;
        let mut out = Capture::default();
        cpu.run(&mut out).unwrap();
        assert_eq!(out.traces.len(), 3);
        assert_eq!(
            out.traces[1].to_string(),
            "TRACE: 03 00 | 47 00 01 | 08 00 00 00 06 00 00 F4"
        );
    }

    #[test]
    fn halted_is_terminal() {
        // HLT; LDI R0,7; PRN R0; HLT
        let mut cpu = cpu(&[HLT, LDI, 0, 7, PRN, 0, HLT]);
        let mut out = Capture::default();
        assert_eq!(cpu.run_until(&mut out, |_cpu, _i| false), Ok(Some(1)));
        assert_eq!(cpu.pc(), 1);

        assert_eq!(cpu.run_until(&mut out, |_cpu, _i| false), Ok(Some(0)));
        cpu.run(&mut out).unwrap();
        assert_eq!(cpu.step(&mut out), Ok(State::Halted));
        assert!(out.printed.is_empty());
        assert_eq!(cpu.pc(), 1);
        assert_eq!(cpu.reg().get(0), Ok(0));
        assert_eq!(cpu.state(), State::Halted);
    }

    #[test]
    fn reset() {
        let mut cpu = cpu(&[LDI, 0, 8, HLT]);
        cpu.run(&mut EmptySink).unwrap();
        cpu.reset();
        assert_eq!(cpu.pc(), 0);
        assert_eq!(cpu.state(), State::Running);
        assert_eq!(cpu.reg().get(0), Ok(0));
        assert_eq!(cpu.reg().get(SP), Ok(STACK_HEAD));
        assert_eq!(cpu.ram().read(0), 0);
    }
}
