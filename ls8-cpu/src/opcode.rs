//! Instruction set and opcode decoding
//!
//! Each opcode byte has the shape `AABCDDDD`:
//!
//! - `AA` is the number of operands (0-2)
//! - `B` is reserved
//! - `C` is set if the instruction moves the PC itself
//! - `DDDD` identifies the instruction
//!
//! The decoder functions ([`sets_pc`], [`advance`], [`operand_count`]) only
//! look at the opcode's shape, so they give the same answer for bytes that
//! aren't in the instruction set.
//!
//! `CALL` (`0b0101_0000`) and `RET` (`0b0001_0001`) are part of the wider LS-8
//! family but are not implemented here; they decode as unknown instructions.

/// An instruction understood by the CPU
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    /// Halt the CPU
    Hlt = 0b0000_0001,
    /// Load an immediate into a register
    Ldi = 0b1000_0010,
    /// Print a register as a decimal number
    Prn = 0b0100_0111,
    /// Multiply two registers, storing the product in the first
    Mul = 0b1010_0010,
    /// Push a register onto the stack
    Push = 0b0100_0101,
    /// Pop the top of the stack into a register
    Pop = 0b0100_0110,
    /// Compare two registers, setting the `Equal` flag
    Cmp = 0b1010_0111,
    /// Jump to the address in a register
    Jmp = 0b0101_0100,
    /// Jump to the address in a register if `Equal` is set
    Jeq = 0b0101_0101,
    /// Jump to the address in a register if `Equal` is clear
    Jne = 0b0101_0110,
}

/// How an instruction interprets its operand bytes
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Operands {
    None,
    Reg,
    RegReg,
    RegImm,
}

impl Opcode {
    /// Every implemented instruction
    pub const ALL: [Opcode; 10] = [
        Opcode::Hlt,
        Opcode::Ldi,
        Opcode::Prn,
        Opcode::Mul,
        Opcode::Push,
        Opcode::Pop,
        Opcode::Cmp,
        Opcode::Jmp,
        Opcode::Jeq,
        Opcode::Jne,
    ];

    /// Returns the assembly mnemonic
    pub fn name(self) -> &'static str {
        match self {
            Opcode::Hlt => "HLT",
            Opcode::Ldi => "LDI",
            Opcode::Prn => "PRN",
            Opcode::Mul => "MUL",
            Opcode::Push => "PUSH",
            Opcode::Pop => "POP",
            Opcode::Cmp => "CMP",
            Opcode::Jmp => "JMP",
            Opcode::Jeq => "JEQ",
            Opcode::Jne => "JNE",
        }
    }

    fn operands(self) -> Operands {
        match self {
            Opcode::Hlt => Operands::None,
            Opcode::Ldi => Operands::RegImm,
            Opcode::Mul | Opcode::Cmp => Operands::RegReg,
            Opcode::Prn
            | Opcode::Push
            | Opcode::Pop
            | Opcode::Jmp
            | Opcode::Jeq
            | Opcode::Jne => Operands::Reg,
        }
    }
}

impl TryFrom<u8> for Opcode {
    type Error = u8;

    /// Looks up an opcode byte, returning it unchanged if it's unknown
    fn try_from(b: u8) -> Result<Self, u8> {
        Opcode::ALL.into_iter().find(|op| u8::from(*op) == b).ok_or(b)
    }
}

impl From<Opcode> for u8 {
    fn from(op: Opcode) -> u8 {
        op as u8
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Checks whether the instruction sets the PC itself
#[inline]
pub const fn sets_pc(op: u8) -> bool {
    (op >> 4) & 0x1 != 0
}

/// Number of operand bytes following the opcode
#[inline]
pub const fn operand_count(op: u8) -> u8 {
    op >> 6
}

/// Number of bytes occupied by the instruction, including the opcode
///
/// The CPU only uses this when [`sets_pc`] is false.
#[inline]
pub const fn advance(op: u8) -> u8 {
    operand_count(op) + 1
}

/// Disassembles a program image
///
/// Returns `(address, text)` pairs, one per instruction.  Unknown or
/// truncated instructions are rendered as a single `.db` byte.
pub fn disassemble(image: &[u8]) -> Vec<(usize, String)> {
    let mut out = vec![];
    let mut addr = 0;
    while let Some(&b) = image.get(addr) {
        let n = usize::from(advance(b));
        let decoded =
            Opcode::try_from(b).ok().zip(image.get(addr + 1..addr + n));
        let Some((op, args)) = decoded else {
            out.push((addr, format!(".db {b:#010b}")));
            addr += 1;
            continue;
        };
        let text = match (op.operands(), args) {
            (Operands::None, _) => op.to_string(),
            (Operands::Reg, [r]) => format!("{op} R{r}"),
            (Operands::RegReg, [a, c]) => format!("{op} R{a},R{c}"),
            (Operands::RegImm, [r, v]) => format!("{op} R{r},{v}"),
            _ => unreachable!("operand count is encoded in the opcode"),
        };
        out.push((addr, text));
        addr += n;
    }
    out
}
