#![no_main]

use libfuzzer_sys::fuzz_target;
use ls8::{Capture, Config, Cpu, Error, Mode};

fn run(data: &[u8], mode: Mode) -> Option<(Cpu, Capture, Result<(), Error>)> {
    let mut cpu = Cpu::new(Config { mode, trace: false });
    cpu.load(data).ok()?;
    let mut out = Capture::default();

    // Halt if we take more than 64K cycles
    let r = match cpu.run_until(&mut out, |_cpu, i| i > 65536) {
        Ok(None) => return None,
        Ok(Some(_)) => Ok(()),
        Err(e) => Err(e),
    };
    Some((cpu, out, r))
}

fuzz_target!(|data: &[u8]| {
    let Some((cpu_r, out_r, r_r)) = run(data, Mode::Reference) else {
        return;
    };
    let Some((cpu_s, out_s, r_s)) = run(data, Mode::Strict) else {
        panic!("strict mode ran longer than reference mode");
    };

    // Popping an empty stack is the only divergence that strict mode allows
    if matches!(r_s, Err(Error::StackUnderflow { .. })) {
        return;
    }

    let mut failed = false;
    if r_r != r_s {
        println!("result mismatch: {r_r:?} != {r_s:?}");
        failed = true;
    }
    if cpu_r.pc() != cpu_s.pc() {
        println!("PC mismatch: {:#04x} != {:#04x}", cpu_r.pc(), cpu_s.pc());
        failed = true;
    }
    if cpu_r.reg() != cpu_s.reg() {
        println!("register mismatch: {:?} != {:?}", cpu_r.reg(), cpu_s.reg());
        failed = true;
    }
    if cpu_r.flags() != cpu_s.flags() {
        println!("flags mismatch");
        failed = true;
    }
    for i in 0..=255 {
        let a = cpu_r.ram().read(i);
        let b = cpu_s.ram().read(i);
        if a != b {
            println!("RAM mismatch at {i:#04x}: {a:#02x} != {b:#02x}");
            failed = true;
        }
    }
    if out_r.printed != out_s.printed {
        println!(
            "output mismatch:\n  reference: {:?}\n     strict: {:?}",
            out_r.printed, out_s.printed
        );
        failed = true;
    }
    if failed {
        print!("Instructions:\n  ");
        for (i, (addr, text)) in ls8::disassemble(data).iter().enumerate() {
            print!("{}{addr:02x}: {text}", if i == 0 { "" } else { "; " });
        }
        println!();
        panic!("mismatch found");
    }
});
