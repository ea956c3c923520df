use iced_x86::Register;

use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Bitness {
    X86,
    X64,
}

impl Bitness {
    pub fn bits(self) -> u32 {
        match self {
            Bitness::X86 => 32,
            Bitness::X64 => 64,
        }
    }

    pub fn pointer_width(self) -> usize {
        match self {
            Bitness::X86 => 4,
            Bitness::X64 => 8,
        }
    }

    /// Mask applied to addresses and full width register values.
    pub fn address_mask(self) -> u64 {
        match self {
            Bitness::X86 => 0xffff_ffff,
            Bitness::X64 => u64::MAX,
        }
    }

    pub fn stack_pointer(self) -> Register {
        GenericRegister::Sp.for_arch(self)
    }

    /// Registers a callee may destroy under the kernel's calling convention.
    pub fn volatile_registers(self) -> &'static [Register] {
        match self {
            Bitness::X86 => &[Register::EAX, Register::ECX, Register::EDX],
            Bitness::X64 => &[
                Register::RAX,
                Register::RCX,
                Register::RDX,
                Register::R8,
                Register::R9,
                Register::R10,
                Register::R11,
            ],
        }
    }
}

impl fmt::Display for Bitness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Bitness::X86 => write!(f, "x86"),
            Bitness::X64 => write!(f, "x64"),
        }
    }
}

/// Architecture neutral name of a general purpose register.
///
/// `Cx` is `ECX` in 32-bit code and `RCX` in 64-bit code.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum GenericRegister {
    Ax,
    Cx,
    Dx,
    Bx,
    Sp,
    Bp,
    Si,
    Di,
}

impl GenericRegister {
    pub fn for_arch(self, bitness: Bitness) -> Register {
        use GenericRegister::*;

        match (bitness, self) {
            (Bitness::X86, Ax) => Register::EAX,
            (Bitness::X86, Cx) => Register::ECX,
            (Bitness::X86, Dx) => Register::EDX,
            (Bitness::X86, Bx) => Register::EBX,
            (Bitness::X86, Sp) => Register::ESP,
            (Bitness::X86, Bp) => Register::EBP,
            (Bitness::X86, Si) => Register::ESI,
            (Bitness::X86, Di) => Register::EDI,
            (Bitness::X64, Ax) => Register::RAX,
            (Bitness::X64, Cx) => Register::RCX,
            (Bitness::X64, Dx) => Register::RDX,
            (Bitness::X64, Bx) => Register::RBX,
            (Bitness::X64, Sp) => Register::RSP,
            (Bitness::X64, Bp) => Register::RBP,
            (Bitness::X64, Si) => Register::RSI,
            (Bitness::X64, Di) => Register::RDI,
        }
    }
}

/// One entry per architecture, picked by the bitness of the loaded image.
#[derive(Clone, Copy, Debug)]
pub struct ArchTable<T> {
    pub x86: T,
    pub x64: T,
}

impl<T> ArchTable<T> {
    pub fn get(&self, bitness: Bitness) -> &T {
        match bitness {
            Bitness::X86 => &self.x86,
            Bitness::X64 => &self.x64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cx_follows_bitness() {
        assert_eq!(GenericRegister::Cx.for_arch(Bitness::X86), Register::ECX);
        assert_eq!(GenericRegister::Cx.for_arch(Bitness::X64), Register::RCX);
    }

    #[test]
    fn table_selects_by_bitness() {
        let table = ArchTable {
            x86: "ecx",
            x64: "rcx",
        };
        assert_eq!(*table.get(Bitness::X86), "ecx");
        assert_eq!(*table.get(Bitness::X64), "rcx");
    }

    #[test]
    fn volatile_registers_are_full_width() {
        for bitness in [Bitness::X86, Bitness::X64] {
            for reg in bitness.volatile_registers() {
                assert_eq!(reg.size(), bitness.pointer_width());
            }
        }
    }
}
