use crate::{Cpu, Error};

/// Operation performed by the ALU on a pair of registers
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AluOp {
    /// `a = a + b`, wrapping
    ///
    /// Not reachable from any opcode, but available to embedders.
    Add,
    /// `a = a * b`, wrapping
    Mul,
    /// Sets the `Equal` flag if `a == b`
    Cmp,
}

impl std::str::FromStr for AluOp {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "ADD" => Ok(AluOp::Add),
            "MUL" => Ok(AluOp::Mul),
            "CMP" => Ok(AluOp::Cmp),
            _ => Err(Error::UnsupportedAluOp(s.to_owned())),
        }
    }
}

impl Cpu {
    /// Applies an ALU operation to registers `a` and `b`
    ///
    /// The result (if any) is written back to `a`; `b` is never modified.
    pub fn alu(&mut self, op: AluOp, a: u8, b: u8) -> Result<(), Error> {
        let x = self.reg.get(a)?;
        let y = self.reg.get(b)?;
        match op {
            AluOp::Add => self.reg.set(a, x.wrapping_add(y)),
            AluOp::Mul => self.reg.set(a, x.wrapping_mul(y)),
            AluOp::Cmp => {
                self.fl.set_equal(x == y);
                Ok(())
            }
        }
    }
}
