/*!
A small x86/x64 emulator that replays a fixed instruction path.

Only general purpose registers and a sparse memory overlay on top of the
image are modelled. Every value carries a `based` flag telling whether it
was derived from the value injected before the run by pointer arithmetic.
That is what lets the resolver tell a structure offset apart from an
unrelated constant that happens to land near the sentinel.
*/

use crate::arch::Bitness;
use crate::error::{Divergence, Error, Result};
use crate::image::KernelImage;

use memflow::prelude::v1::Address;

use iced_x86::*;

use log::*;

use std::collections::{HashMap, HashSet};

const GPRS: [Register; 16] = [
    Register::RAX,
    Register::RCX,
    Register::RDX,
    Register::RBX,
    Register::RSP,
    Register::RBP,
    Register::RSI,
    Register::RDI,
    Register::R8,
    Register::R9,
    Register::R10,
    Register::R11,
    Register::R12,
    Register::R13,
    Register::R14,
    Register::R15,
];

fn slot(reg: Register) -> Option<usize> {
    let full = reg.full_register();
    GPRS.iter().position(|&r| r == full)
}

fn is_high_byte(reg: Register) -> bool {
    matches!(
        reg,
        Register::AH | Register::CH | Register::DH | Register::BH
    )
}

fn size_mask(size: usize) -> u64 {
    if size >= 8 {
        u64::MAX
    } else {
        (1u64 << (size * 8)) - 1
    }
}

fn sign_extend(bits: u64, size: usize) -> u64 {
    match size {
        1 => bits as u8 as i8 as i64 as u64,
        2 => bits as u16 as i16 as i64 as u64,
        4 => bits as u32 as i32 as i64 as u64,
        _ => bits,
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Value {
    pub bits: u64,
    /// Derived from the injected base by pointer arithmetic.
    pub based: bool,
}

impl Value {
    pub const fn plain(bits: u64) -> Self {
        Self { bits, based: false }
    }

    pub const fn based(bits: u64) -> Self {
        Self { bits, based: true }
    }
}

fn is_write(access: OpAccess) -> bool {
    matches!(
        access,
        OpAccess::Write | OpAccess::CondWrite | OpAccess::ReadWrite | OpAccess::ReadCondWrite
    )
}

/// Address of a memory operand reported by the instruction info, if every
/// register it depends on is modelled.
fn used_address(regs: &Registers, mem: &UsedMemory) -> Option<u64> {
    if matches!(mem.segment(), Register::FS | Register::GS) {
        return None;
    }

    let mut address = mem.displacement();

    match mem.base() {
        // RIP relative displacements are already absolute.
        Register::None | Register::RIP | Register::EIP => {}
        base => {
            slot(base)?;
            address = address.wrapping_add(regs.read(base).bits);
        }
    }

    match mem.index() {
        Register::None => {}
        // vector indices are not modelled
        index => {
            slot(index)?;
            let value = regs.read(index).bits;
            address = address.wrapping_add(value.wrapping_mul(mem.scale() as u64));
        }
    }

    Some(address & regs.bitness().address_mask())
}

fn add(a: Value, b: Value) -> Value {
    Value {
        bits: a.bits.wrapping_add(b.bits),
        // base + base is as meaningless as a constant
        based: a.based != b.based,
    }
}

/// General purpose register file.
#[derive(Clone, Debug)]
pub struct Registers {
    bitness: Bitness,
    gprs: [Value; 16],
    written: u16,
}

impl Registers {
    pub fn new(bitness: Bitness, stack_top: u64) -> Self {
        let mut regs = Self {
            bitness,
            gprs: [Value::default(); 16],
            written: 0,
        };
        regs.set(bitness.stack_pointer(), stack_top);
        regs.reset_written();
        regs
    }

    pub fn bitness(&self) -> Bitness {
        self.bitness
    }

    pub fn read(&self, reg: Register) -> Value {
        let idx = match slot(reg) {
            Some(idx) => idx,
            None => return Value::default(),
        };

        let full = self.gprs[idx];

        if is_high_byte(reg) {
            return Value::plain((full.bits >> 8) & 0xff);
        }

        let size = reg.size();

        Value {
            bits: full.bits & size_mask(size),
            based: full.based && size >= self.bitness.pointer_width(),
        }
    }

    /// Writes `reg` with x86 semantics: 32-bit writes clear the upper half,
    /// 8 and 16-bit writes merge into the old value.
    pub fn write(&mut self, reg: Register, value: Value) {
        let idx = match slot(reg) {
            Some(idx) => idx,
            None => return,
        };

        let pointer_width = self.bitness.pointer_width();
        let old = self.gprs[idx];
        let size = reg.size();

        self.gprs[idx] = if is_high_byte(reg) {
            Value::plain((old.bits & !0xff00) | ((value.bits & 0xff) << 8))
        } else if size >= 4 {
            Value {
                bits: value.bits & size_mask(size),
                based: value.based && size >= pointer_width,
            }
        } else {
            let mask = size_mask(size);
            Value::plain((old.bits & !mask) | (value.bits & mask))
        };

        self.written |= 1 << idx;
    }

    pub fn set(&mut self, reg: Register, bits: u64) {
        self.write(reg, Value::plain(bits));
    }

    /// Loads `reg` with a base value that later arithmetic is tracked against.
    pub fn inject(&mut self, reg: Register, bits: u64) {
        self.write(reg, Value::based(bits));
    }

    pub fn clobber(&mut self, reg: Register) {
        self.write(reg, Value::plain(0));
    }

    pub fn was_written(&self, reg: Register) -> bool {
        slot(reg).map_or(false, |idx| self.written & (1 << idx) != 0)
    }

    pub fn reset_written(&mut self) {
        self.written = 0;
    }
}

#[derive(Clone, Debug, Default)]
struct Memory {
    bytes: HashMap<u64, u8>,
    // Start addresses of pointer sized based values, masked like `bytes`.
    based: HashSet<u64>,
}

pub struct Emulator<'a> {
    image: &'a KernelImage,
    regs: Registers,
    memory: Memory,
    budget: usize,
    info: InstructionInfoFactory,
}

impl<'a> Emulator<'a> {
    pub fn new(image: &'a KernelImage, stack_top: u64, budget: usize) -> Self {
        Self {
            image,
            regs: Registers::new(image.bitness(), stack_top),
            memory: Memory::default(),
            budget,
            info: InstructionInfoFactory::new(),
        }
    }

    pub fn registers(&self) -> &Registers {
        &self.regs
    }

    /// Runs `path` in order.
    ///
    /// `pre` sees the register file before the first instruction, writes it
    /// makes do not count as writes by the emulated code. `trace` is called
    /// before every instruction.
    pub fn run<P, T>(&mut self, path: &[Instruction], pre: P, mut trace: T) -> Result<()>
    where
        P: FnOnce(&mut Registers),
        T: FnMut(&Instruction, &Registers),
    {
        pre(&mut self.regs);
        self.regs.reset_written();

        for (executed, instr) in path.iter().enumerate() {
            if executed >= self.budget {
                return Err(Error::divergence(instr.ip(), Divergence::BudgetExhausted));
            }

            if instr.is_invalid() {
                return Err(Error::divergence(instr.ip(), Divergence::InvalidInstruction));
            }

            trace(instr, &self.regs);

            self.step(instr);
        }

        Ok(())
    }

    fn step(&mut self, instr: &Instruction) {
        match instr.mnemonic() {
            Mnemonic::Mov => {
                let value = self.read_operand(instr, 1);
                self.write_operand(instr, 0, value);
            }
            Mnemonic::Movzx => {
                let value = self.read_operand(instr, 1);
                self.write_operand(instr, 0, Value::plain(value.bits));
            }
            Mnemonic::Movsx | Mnemonic::Movsxd => {
                let size = self.operand_size(instr, 1);
                let value = self.read_operand(instr, 1);
                self.write_operand(instr, 0, Value::plain(sign_extend(value.bits, size)));
            }
            Mnemonic::Lea => {
                let address = self.effective_address(instr);
                self.write_operand(instr, 0, address);
            }
            Mnemonic::Xor | Mnemonic::Sub if self.same_registers(instr) => {
                self.write_operand(instr, 0, Value::plain(0));
            }
            Mnemonic::Add => self.binary(instr, |dst, src, _| add(dst, src)),
            Mnemonic::Sub => self.binary(instr, |dst, src, _| Value {
                bits: dst.bits.wrapping_sub(src.bits),
                based: dst.based && !src.based,
            }),
            Mnemonic::And => self.binary(instr, |dst, src, _| Value::plain(dst.bits & src.bits)),
            Mnemonic::Or => self.binary(instr, |dst, src, _| Value::plain(dst.bits | src.bits)),
            Mnemonic::Xor => self.binary(instr, |dst, src, _| Value::plain(dst.bits ^ src.bits)),
            Mnemonic::Shl | Mnemonic::Shr | Mnemonic::Sar => {
                let mnemonic = instr.mnemonic();
                self.binary(instr, |dst, src, size| {
                    let count = src.bits & if size == 8 { 0x3f } else { 0x1f };
                    Value::plain(match mnemonic {
                        Mnemonic::Shl => dst.bits << count,
                        Mnemonic::Shr => (dst.bits & size_mask(size)) >> count,
                        _ => ((sign_extend(dst.bits, size) as i64) >> count) as u64,
                    })
                })
            }
            Mnemonic::Inc | Mnemonic::Dec => {
                let value = self.read_operand(instr, 0);
                let bits = if instr.mnemonic() == Mnemonic::Inc {
                    value.bits.wrapping_add(1)
                } else {
                    value.bits.wrapping_sub(1)
                };
                self.write_operand(
                    instr,
                    0,
                    Value {
                        bits,
                        based: value.based,
                    },
                );
            }
            Mnemonic::Neg => {
                let value = self.read_operand(instr, 0);
                self.write_operand(instr, 0, Value::plain(0u64.wrapping_sub(value.bits)));
            }
            Mnemonic::Not => {
                let value = self.read_operand(instr, 0);
                self.write_operand(instr, 0, Value::plain(!value.bits));
            }
            Mnemonic::Push => {
                let value = self.read_operand(instr, 0);
                let width = instr.stack_pointer_increment().unsigned_abs() as usize;
                let sp = self.adjust_stack(instr.stack_pointer_increment());
                self.store(sp, width, value);
            }
            Mnemonic::Pop => {
                let width = instr.stack_pointer_increment().unsigned_abs() as usize;
                let sp = self.regs.read(self.regs.bitness().stack_pointer()).bits;
                let value = self.load(sp, width);
                self.adjust_stack(instr.stack_pointer_increment());
                self.write_operand(instr, 0, value);
            }
            Mnemonic::Xchg => {
                let a = self.read_operand(instr, 0);
                let b = self.read_operand(instr, 1);
                self.write_operand(instr, 0, b);
                self.write_operand(instr, 1, a);
            }
            Mnemonic::Nop | Mnemonic::Cmp | Mnemonic::Test | Mnemonic::Bt => {}
            _ => match instr.flow_control() {
                FlowControl::Call | FlowControl::IndirectCall => self.skip_call(instr),
                // The path already decided every branch.
                FlowControl::ConditionalBranch
                | FlowControl::UnconditionalBranch
                | FlowControl::IndirectBranch => {}
                _ => self.clobber_written(instr),
            },
        }
    }

    fn binary<F>(&mut self, instr: &Instruction, f: F)
    where
        F: FnOnce(Value, Value, usize) -> Value,
    {
        let dst = self.read_operand(instr, 0);
        let src = self.read_operand(instr, 1);
        let size = self.operand_size(instr, 0);
        self.write_operand(instr, 0, f(dst, src, size));
    }

    fn same_registers(&self, instr: &Instruction) -> bool {
        instr.op_count() == 2
            && instr.op0_kind() == OpKind::Register
            && instr.op1_kind() == OpKind::Register
            && instr.op0_register() == instr.op1_register()
    }

    fn skip_call(&mut self, instr: &Instruction) {
        debug!("skipping call at {:x}", instr.ip());

        for &reg in self.regs.bitness().volatile_registers() {
            self.regs.clobber(reg);
        }
    }

    fn clobber_written(&mut self, instr: &Instruction) {
        trace!("unmodelled {:?} at {:x}", instr.mnemonic(), instr.ip());

        let info = self.info.info(instr);
        let regs = &self.regs;

        // Addresses use the register values from before the instruction.
        let stores = info
            .used_memory()
            .iter()
            .filter(|mem| is_write(mem.access()))
            .map(|mem| (used_address(regs, mem), mem.memory_size().size()))
            .collect::<Vec<_>>();

        let written = info
            .used_registers()
            .iter()
            .filter(|used| is_write(used.access()))
            .map(|used| used.register())
            .collect::<Vec<_>>();

        // String instructions with a repeat prefix write an unknown range.
        let repeated = instr.has_rep_prefix() || instr.has_repe_prefix() || instr.has_repne_prefix();

        if repeated && !self.memory.based.is_empty() {
            debug!("repeated store at {:x}, forgetting spilled bases", instr.ip());
            self.memory.based.clear();
        }

        for (address, size) in stores {
            match address {
                Some(address) if size > 0 => self.store(address, size, Value::plain(0)),
                _ => {
                    debug!("untracked store at {:x}, forgetting spilled bases", instr.ip());
                    self.memory.based.clear();
                }
            }
        }

        for reg in written {
            self.regs.clobber(reg);
        }
    }

    fn adjust_stack(&mut self, increment: i32) -> u64 {
        let sp_reg = self.regs.bitness().stack_pointer();
        let sp = self.regs.read(sp_reg).bits.wrapping_add(increment as i64 as u64)
            & self.regs.bitness().address_mask();
        self.regs.set(sp_reg, sp);
        sp
    }

    fn operand_size(&self, instr: &Instruction, operand: u32) -> usize {
        match instr.op_kind(operand) {
            OpKind::Register => instr.op_register(operand).size(),
            OpKind::Memory => instr.memory_size().size(),
            _ => self.regs.bitness().pointer_width(),
        }
    }

    fn effective_address(&self, instr: &Instruction) -> Value {
        let mask = self.regs.bitness().address_mask();
        let base = instr.memory_base();

        // The decoder already resolved the absolute target.
        if base == Register::RIP || base == Register::EIP {
            return Value::plain(instr.memory_displacement64() & mask);
        }

        let mut address = Value::plain(instr.memory_displacement64());

        if base != Register::None {
            address = add(address, self.regs.read(base));
        }

        let index = instr.memory_index();

        if index != Register::None {
            let scale = instr.memory_index_scale() as u64;
            let value = self.regs.read(index);
            address = add(
                address,
                Value {
                    bits: value.bits.wrapping_mul(scale),
                    based: value.based && scale == 1,
                },
            );
        }

        Value {
            bits: address.bits & mask,
            based: address.based,
        }
    }

    fn read_operand(&self, instr: &Instruction, operand: u32) -> Value {
        match instr.op_kind(operand) {
            OpKind::Register => self.regs.read(instr.op_register(operand)),
            OpKind::Memory => {
                let address = self.effective_address(instr).bits;
                self.load(address, instr.memory_size().size())
            }
            OpKind::Immediate8
            | OpKind::Immediate8_2nd
            | OpKind::Immediate16
            | OpKind::Immediate32
            | OpKind::Immediate64
            | OpKind::Immediate8to16
            | OpKind::Immediate8to32
            | OpKind::Immediate8to64
            | OpKind::Immediate32to64 => Value::plain(instr.immediate(operand)),
            _ => Value::default(),
        }
    }

    fn write_operand(&mut self, instr: &Instruction, operand: u32, value: Value) {
        match instr.op_kind(operand) {
            OpKind::Register => self.regs.write(instr.op_register(operand), value),
            OpKind::Memory => {
                let address = self.effective_address(instr).bits;
                self.store(address, instr.memory_size().size(), value);
            }
            _ => {}
        }
    }

    fn load(&self, address: u64, size: usize) -> Value {
        let mask = self.regs.bitness().address_mask();
        let mut bits = 0;

        for i in 0..size.min(8) {
            let byte_addr = address.wrapping_add(i as u64) & mask;
            let byte = match self.memory.bytes.get(&byte_addr) {
                Some(byte) => *byte,
                // Untouched memory reads as the image, or zero outside of it.
                None => self
                    .image
                    .read(Address::from(byte_addr), 1)
                    .map_or(0, |b| b[0]),
            };
            bits |= (byte as u64) << (i * 8);
        }

        Value {
            bits,
            based: size == self.regs.bitness().pointer_width()
                && self.memory.based.contains(&(address & mask)),
        }
    }

    fn store(&mut self, address: u64, size: usize, value: Value) {
        let mask = self.regs.bitness().address_mask();
        let pointer_width = self.regs.bitness().pointer_width() as u64;

        for i in 0..size {
            let byte_addr = address.wrapping_add(i as u64) & mask;
            let byte = if i < 8 { (value.bits >> (i * 8)) as u8 } else { 0 };
            self.memory.bytes.insert(byte_addr, byte);
        }

        // Any based slot overlapping the store is gone now.
        let first = address.wrapping_sub(pointer_width - 1);
        for i in 0..(pointer_width - 1 + size as u64) {
            self.memory.based.remove(&(first.wrapping_add(i) & mask));
        }

        if value.based && size as u64 == pointer_width {
            self.memory.based.insert(address & mask);
        }
    }
}
