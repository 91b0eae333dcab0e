//! The S/370 CPU engine: registers, PSW, DAT/TLB, PER, interrupts, the
//! instruction-cycle loop and its opcode handlers (§3.2, §4.5).

pub mod cpu;
pub mod dat;
pub mod decode;
pub mod flags;
pub mod interrupt;
pub mod ops;
pub mod per;
pub mod psw;
pub mod registers;

pub use cpu::{Cpu, CycleResult};
pub use dat::Dat;
pub use per::PerState;
pub use psw::Psw;
pub use registers::Registers;
