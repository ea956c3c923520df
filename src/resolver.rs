use crate::arch::{Bitness, GenericRegister};
use crate::descriptor::{Discovery, FieldDescriptor, StructDescriptor};
use crate::emu::{Emulator, Registers};
use crate::error::{Divergence, Error, Result};
use crate::flow::locate_call_in_fn;
use crate::image::KernelImage;
use crate::symbols::SymbolSource;

use memflow::prelude::v1::size;

use iced_x86::{Formatter, Instruction, NasmFormatter};

use log::*;

/// Base value injected into the inspected register.
///
/// Low enough to never collide with kernel pointers or the emulated stack.
pub const DEFAULT_SENTINEL: u64 = 0x1000;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolverConfig {
    /// Value standing in for the structure base during emulation.
    pub sentinel: u64,
    /// Bytes decoded for functions without unwind information.
    pub scan_window: usize,
    /// Upper bound on emulated instructions per resolution.
    pub max_instructions: usize,
    /// Initial stack pointer of the emulator.
    pub stack_top: u64,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            sentinel: DEFAULT_SENTINEL,
            scan_window: size::kb(4),
            max_instructions: 10_000,
            stack_top: 0x80_0000,
        }
    }
}

/// Recovers structure field offsets from the code of a kernel image.
pub struct OffsetResolver<'a> {
    image: &'a KernelImage,
    symbols: &'a dyn SymbolSource,
    config: ResolverConfig,
}

impl<'a> OffsetResolver<'a> {
    pub fn new(image: &'a KernelImage, symbols: &'a dyn SymbolSource) -> Self {
        Self {
            image,
            symbols,
            config: ResolverConfig::default(),
        }
    }

    pub fn with_config(mut self, config: ResolverConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    pub fn image(&self) -> &'a KernelImage {
        self.image
    }

    pub fn bitness(&self) -> Bitness {
        self.image.bitness()
    }

    pub fn resolve_field(&self, field: &FieldDescriptor) -> Result<usize> {
        match field.discovery {
            Discovery::Constant(offset) => Ok(offset),
            Discovery::Emulated {
                anchor,
                target,
                register,
            } => self.resolve_emulated_offset(anchor, target, register),
        }
    }

    /// Resolves every field of `desc`, failing on the first field that cannot be resolved.
    pub fn resolve_struct(&self, desc: &StructDescriptor) -> Result<Vec<(&'static str, usize)>> {
        desc.fields
            .iter()
            .map(|field| {
                let offset = self.resolve_field(field)?;
                info!("{}.{}: {:#x}", desc.name, field.name, offset);
                Ok((field.name, offset))
            })
            .collect()
    }

    /// Emulates `anchor` up to its call to `target` and returns how far `register`
    /// points past the base it held on entry.
    ///
    /// Every emulated instruction is logged at trace level.
    pub fn resolve_emulated_offset(
        &self,
        anchor: &str,
        target: &str,
        register: GenericRegister,
    ) -> Result<usize> {
        let mut formatter = NasmFormatter::new();

        formatter.options_mut().set_first_operand_char_index(10);
        formatter.options_mut().set_uppercase_all(false);
        formatter.options_mut().set_uppercase_hex(false);

        let mut output = String::new();

        self.resolve_emulated_offset_with(anchor, target, register, |instr, _| {
            if log_enabled!(Level::Trace) {
                output.clear();
                formatter.format(instr, &mut output);
                trace!("{:x}: {}", instr.ip(), output);
            }
        })
    }

    /// Same as [`resolve_emulated_offset`](Self::resolve_emulated_offset), with
    /// `trace` called before each emulated instruction.
    pub fn resolve_emulated_offset_with<T>(
        &self,
        anchor: &str,
        target: &str,
        register: GenericRegister,
        trace: T,
    ) -> Result<usize>
    where
        T: FnMut(&Instruction, &Registers),
    {
        let (site, flow) = locate_call_in_fn(
            self.image,
            self.symbols,
            anchor,
            target,
            self.config.scan_window,
        )?;

        let reg = register.for_arch(self.bitness());

        let path = flow
            .path_to(site.call.to_umem() as u64)
            .ok_or_else(|| Error::divergence(site.call, Divergence::Unreachable))?;

        debug!(
            "emulating {} instructions ({} blocks) up to {:x}",
            path.len(),
            flow.num_blocks(),
            site.call
        );

        let sentinel = self.config.sentinel;

        let mut emu = Emulator::new(
            self.image,
            self.config.stack_top,
            self.config.max_instructions,
        );

        emu.run(
            &path,
            |regs| {
                debug!("pre emulation hook loading {:?}", reg);
                regs.inject(reg, sentinel);
            },
            trace,
        )?;

        let regs = emu.registers();
        let value = regs.read(reg);

        if !regs.was_written(reg) {
            return Err(Error::divergence(
                site.call,
                Divergence::RegisterNotWritten(reg),
            ));
        }

        if !value.based {
            return Err(Error::divergence(site.call, Divergence::NotBaseRelative(reg)));
        }

        let offset = value
            .bits
            .checked_sub(sentinel)
            .ok_or_else(|| Error::divergence(site.call, Divergence::NegativeOffset(reg)))?;

        debug!(
            "{:?} at {:x} is {:#x}, offset {:#x}",
            reg, site.call, value.bits, offset
        );

        Ok(offset as usize)
    }
}
