use crate::arch::Bitness;
use crate::error::{Error, Result};

use memflow::prelude::v1::*;

use dataview::Pod;
use goblin::pe::header::{Header, COFF_MACHINE_X86, COFF_MACHINE_X86_64};
use goblin::pe::PE;

use log::*;

use std::ops::Range;

/// x64 exception directory entry.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
struct RuntimeFunction {
    begin: u32,
    end: u32,
    unwind_info: u32,
}

unsafe impl Pod for RuntimeFunction {}

/// A kernel image laid out the way the loader maps it, starting at `base`.
#[derive(Clone, Debug)]
pub struct KernelImage {
    base: Address,
    bitness: Bitness,
    data: Vec<u8>,
    // Sorted, non-overlapping RVA ranges.
    functions: Vec<Range<u32>>,
}

impl KernelImage {
    /// Wraps bytes that are already mapped at `base`.
    pub fn from_raw(base: Address, bitness: Bitness, data: Vec<u8>) -> Self {
        Self {
            base,
            bitness,
            data,
            functions: vec![],
        }
    }

    /// Attaches function extents, given as RVA ranges.
    pub fn with_functions(mut self, functions: impl IntoIterator<Item = Range<u32>>) -> Self {
        self.functions = functions.into_iter().filter(|f| f.start < f.end).collect();
        self.functions.sort_by_key(|f| f.start);
        self
    }

    /// Maps a PE file (for example `ntoskrnl.exe` from disk) at its preferred base.
    pub fn from_pe(buf: &[u8]) -> Result<Self> {
        let pe = PE::parse(buf)?;

        let bitness = if pe.is_64 { Bitness::X64 } else { Bitness::X86 };

        let opt = pe
            .header
            .optional_header
            .as_ref()
            .ok_or_else(|| Error::InvalidImage("missing optional header".into()))?;

        let size_of_image = opt.windows_fields.size_of_image as usize;
        let size_of_headers = opt.windows_fields.size_of_headers as usize;

        let mut data = vec![0; size_of_image];

        let headers = size_of_headers.min(buf.len()).min(size_of_image);
        data[..headers].copy_from_slice(&buf[..headers]);

        for section in &pe.sections {
            let raw = section.pointer_to_raw_data as usize;
            let va = section.virtual_address as usize;

            let mut len = section.size_of_raw_data as usize;
            if section.virtual_size != 0 {
                len = len.min(section.virtual_size as usize);
            }

            if raw >= buf.len() || va >= size_of_image {
                continue;
            }

            let len = len.min(buf.len() - raw).min(size_of_image - va);
            data[va..(va + len)].copy_from_slice(&buf[raw..(raw + len)]);
        }

        let exceptions = opt
            .data_directories
            .get_exception_table()
            .as_ref()
            .map(|dir| (dir.virtual_address, dir.size));

        let base = Address::from(pe.image_base as u64);

        debug!(
            "mapped {} image at {:x} ({:x} bytes, {} sections)",
            bitness,
            base,
            size_of_image,
            pe.sections.len()
        );

        Ok(Self::from_mapped(base, bitness, data, exceptions))
    }

    /// Reads an image that is already mapped at `base` out of a memory view,
    /// for example a kernel module inside a captured memory dump.
    pub fn from_view(mem: &mut impl MemoryView, base: Address) -> Result<Self> {
        let mut headers = vec![0; size::kb(4)];

        mem.read_raw_into(base, &mut headers).data_part()?;

        let header = Header::parse(&headers)?;

        let bitness = match header.coff_header.machine {
            COFF_MACHINE_X86_64 => Bitness::X64,
            COFF_MACHINE_X86 => Bitness::X86,
            machine => {
                return Err(Error::InvalidImage(format!(
                    "unsupported machine {:#x}",
                    machine
                )))
            }
        };

        let opt = header
            .optional_header
            .as_ref()
            .ok_or_else(|| Error::InvalidImage("missing optional header".into()))?;

        let mut data = vec![0; opt.windows_fields.size_of_image as usize];

        mem.read_raw_into(base, &mut data).data_part()?;

        let exceptions = opt
            .data_directories
            .get_exception_table()
            .as_ref()
            .map(|dir| (dir.virtual_address, dir.size));

        debug!("read {} image at {:x} ({:x} bytes)", bitness, base, data.len());

        Ok(Self::from_mapped(base, bitness, data, exceptions))
    }

    fn from_mapped(
        base: Address,
        bitness: Bitness,
        data: Vec<u8>,
        exceptions: Option<(u32, u32)>,
    ) -> Self {
        // 32-bit images have no unwind tables, their functions stay unbounded
        let functions = match (bitness, exceptions) {
            (Bitness::X64, Some((rva, size))) => parse_runtime_functions(&data, rva, size),
            _ => vec![],
        };

        trace!("{} function extents", functions.len());

        Self::from_raw(base, bitness, data).with_functions(functions)
    }

    pub fn base(&self) -> Address {
        self.base
    }

    pub fn bitness(&self) -> Bitness {
        self.bitness
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn end(&self) -> Address {
        self.base + self.data.len()
    }

    pub fn rva(&self, address: Address) -> Option<usize> {
        let address = address.to_umem() as u64;
        let base = self.base.to_umem() as u64;

        address
            .checked_sub(base)
            .map(|rva| rva as usize)
            .filter(|&rva| rva < self.data.len())
    }

    pub fn contains(&self, address: Address) -> bool {
        self.rva(address).is_some()
    }

    /// Bytes from `address` up to the end of the image.
    pub fn bytes_from(&self, address: Address) -> Option<&[u8]> {
        self.rva(address).map(|rva| &self.data[rva..])
    }

    /// Returns exactly `len` bytes at `address`, or `None` if they leave the image.
    pub fn read(&self, address: Address, len: usize) -> Option<&[u8]> {
        self.bytes_from(address).and_then(|b| b.get(..len))
    }

    /// The function whose unwind entry covers `address`.
    pub fn function_extent(&self, address: Address) -> Option<Range<Address>> {
        let rva = self.rva(address)? as u32;

        let idx = match self.functions.binary_search_by_key(&rva, |f| f.start) {
            Ok(idx) => idx,
            Err(0) => return None,
            Err(idx) => idx - 1,
        };

        let function = &self.functions[idx];

        if function.contains(&rva) {
            Some((self.base + function.start as usize)..(self.base + function.end as usize))
        } else {
            None
        }
    }
}

fn parse_runtime_functions(data: &[u8], rva: u32, size: u32) -> Vec<Range<u32>> {
    let entry = std::mem::size_of::<RuntimeFunction>();

    let table = match data.get(rva as usize..(rva as usize).saturating_add(size as usize)) {
        Some(table) => table,
        None => {
            warn!("exception directory {:x}+{:x} is outside of the image", rva, size);
            return vec![];
        }
    };

    let view = dataview::Pod::as_data_view(table);

    // The directory is not guaranteed to be aligned inside the buffer.
    (0..table.len() / entry)
        .filter_map(|i| view.try_copy::<RuntimeFunction>(i * entry))
        .map(|f| f.begin..f.end)
        .collect()
}
