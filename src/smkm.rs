/*!
`SMKM_STORE_MGR`, the store manager of the Windows 10 memory compression
subsystem.

The structure holds a B+tree of every `SM_PAGE_KEY` in use and, nested at its
start, the `SMKM` structure that is the last global on the way to a
compressed page.
*/

use crate::arch::{ArchTable, GenericRegister};
use crate::descriptor::{Discovery, FieldDescriptor, StructDescriptor};
use crate::error::Result;
use crate::resolver::OffsetResolver;

use log::*;

/// `SMKM`, nested at offset zero in every Windows 10 build seen so far.
pub const SM_KM: FieldDescriptor = FieldDescriptor {
    name: "sSmKm",
    discovery: Discovery::Constant(0),
};

/// B+tree with `SMKM_FRONTEND_ENTRY` leaves carrying the store index and
/// creation flags of each `SM_PAGE_KEY`.
///
/// `SmFeCheckPresent` passes the tree as the first argument to
/// `BTreeSearchKey`. From Windows 10 1809 x64:
///
/// ```text
/// lea     rcx, [rdi+1C0h]
/// mov     eax, [r12]
/// lea     r8, [rsp+148h+var_108]
/// mov     r15d, 400h
/// mov     [rsp+148h+var_128], eax
/// mov     edx, ebx
/// mov     [rsp+148h+var_E8], 1
/// mov     [rsp+148h+var_EC], 8
/// xor     esi, esi
/// mov     r14d, r15d
/// xor     ebp, ebp
/// call    ?BTreeSearchKey@?$B_TREE@T_SM_PAGE_KEY@@USMKM_FRONTEND_ENTRY...
/// ```
pub const GLOBAL_TREE: FieldDescriptor = FieldDescriptor {
    name: "sGlobalTree",
    discovery: Discovery::Emulated {
        anchor: "?SmFeCheckPresent",
        target: "?BTreeSearchKey@?$B_TREE@T_SM_PAGE_KEY@@USMKM_FRONTEND_ENTRY",
        register: GenericRegister::Cx,
    },
};

pub const SMKM_STORE_MGR: StructDescriptor = StructDescriptor {
    name: "SMKM_STORE_MGR",
    fields: &[SM_KM, GLOBAL_TREE],
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StoreMgrOffsets {
    pub sm_km: usize,
    pub global_tree: usize,
}

type FieldFn = fn(&OffsetResolver<'_>) -> Result<usize>;

#[derive(Clone, Copy)]
struct StoreMgrFns {
    sm_km: FieldFn,
    global_tree: FieldFn,
}

// Both layouts currently share one implementation.
static ARCH_FNS: ArchTable<StoreMgrFns> = ArchTable {
    x86: StoreMgrFns {
        sm_km: resolve_sm_km,
        global_tree: resolve_global_tree,
    },
    x64: StoreMgrFns {
        sm_km: resolve_sm_km,
        global_tree: resolve_global_tree,
    },
};

fn resolve_sm_km(resolver: &OffsetResolver<'_>) -> Result<usize> {
    resolver.resolve_field(&SM_KM)
}

fn resolve_global_tree(resolver: &OffsetResolver<'_>) -> Result<usize> {
    resolver.resolve_field(&GLOBAL_TREE)
}

/// Field accessors of `SMKM_STORE_MGR`, dispatched on the bitness of the image.
pub struct SmkmStoreMgr;

impl SmkmStoreMgr {
    fn fns(resolver: &OffsetResolver<'_>) -> &'static StoreMgrFns {
        ARCH_FNS.get(resolver.bitness())
    }

    pub fn sm_km(resolver: &OffsetResolver<'_>) -> Result<usize> {
        (Self::fns(resolver).sm_km)(resolver)
    }

    pub fn global_tree(resolver: &OffsetResolver<'_>) -> Result<usize> {
        (Self::fns(resolver).global_tree)(resolver)
    }

    pub fn offsets(resolver: &OffsetResolver<'_>) -> Result<StoreMgrOffsets> {
        Ok(StoreMgrOffsets {
            sm_km: Self::sm_km(resolver)?,
            global_tree: Self::global_tree(resolver)?,
        })
    }

    /// Resolves and logs all fields.
    pub fn dump(resolver: &OffsetResolver<'_>) -> Result<StoreMgrOffsets> {
        let offsets = Self::offsets(resolver)?;

        info!("{} ({})", SMKM_STORE_MGR.name, resolver.bitness());
        info!("{}: {:#x}", SM_KM.name, offsets.sm_km);
        info!("{}: {:#x}", GLOBAL_TREE.name, offsets.global_tree);

        Ok(offsets)
    }
}
