/*!
Offsets of `SMKM_STORE_MGR` fields in Windows 10 kernel images.

The memory compression store manager is undocumented and its layout moves
between builds. Fields that never moved are hard coded; the rest are found by
emulating a kernel function up to a known call and checking how far the
argument register points past a base value injected before the run.

```no_run
use memflow_smkm::*;

# fn main() -> Result<()> {
let buf = std::fs::read("ntoskrnl.exe").unwrap();
let map = std::fs::read_to_string("ntoskrnl.map").unwrap();

let image = KernelImage::from_pe(&buf)?;
let symbols = SymbolTable::parse_map(&map)?;

let resolver = OffsetResolver::new(&image, &symbols);
let offsets = SmkmStoreMgr::dump(&resolver)?;

println!("sGlobalTree: {:#x}", offsets.global_tree);
# Ok(())
# }
```
*/

pub mod arch;
pub mod descriptor;
pub mod emu;
pub mod error;
pub mod flow;
pub mod image;
pub mod resolver;
pub mod smkm;
pub mod symbols;

#[cfg(test)]
mod testing;

pub use arch::{ArchTable, Bitness, GenericRegister};
pub use descriptor::{Discovery, FieldDescriptor, StructDescriptor};
pub use error::{Divergence, Error, Result};
pub use image::KernelImage;
pub use resolver::{OffsetResolver, ResolverConfig, DEFAULT_SENTINEL};
pub use smkm::{SmkmStoreMgr, StoreMgrOffsets, SMKM_STORE_MGR};
pub use symbols::{SymbolSource, SymbolTable};
