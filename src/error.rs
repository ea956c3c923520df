use iced_x86::Register;
use memflow::prelude::v1::Address;

use std::fmt;

/// Why an emulation run could not produce a trustworthy offset.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Divergence {
    /// No control flow path leads from the function entry to the call site.
    Unreachable,
    /// An instruction on the path could not be decoded.
    InvalidInstruction,
    /// The instruction budget ran out before the call site was reached.
    BudgetExhausted,
    /// The register still holds the injected sentinel.
    RegisterNotWritten(Register),
    /// The register was overwritten with a value not derived from the sentinel.
    NotBaseRelative(Register),
    /// The register points below the injected base.
    NegativeOffset(Register),
}

impl fmt::Display for Divergence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Divergence::Unreachable => write!(f, "call site is unreachable from the function entry"),
            Divergence::InvalidInstruction => write!(f, "undecodable instruction on path"),
            Divergence::BudgetExhausted => write!(f, "instruction budget exhausted"),
            Divergence::RegisterNotWritten(reg) => write!(f, "{:?} was never written", reg),
            Divergence::NotBaseRelative(reg) => {
                write!(f, "{:?} does not hold a base-relative value", reg)
            }
            Divergence::NegativeOffset(reg) => write!(f, "{:?} points below the base", reg),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("symbol not found: {0}")]
    SymbolNotFound(String),
    #[error("{anchor} does not call {target}")]
    CallSiteNotFound { anchor: String, target: String },
    #[error("emulation diverged at {address:x}: {reason}")]
    EmulationDivergence { address: Address, reason: Divergence },
    #[error("invalid image: {0}")]
    InvalidImage(String),
    #[error("malformed PE: {0}")]
    Pe(#[from] goblin::error::Error),
    #[error("memory read failed: {0}")]
    Memory(#[from] memflow::error::Error),
    #[error("symbol map line {line}: {reason}")]
    SymbolMap { line: usize, reason: String },
}

impl Error {
    pub(crate) fn divergence(address: impl Into<Address>, reason: Divergence) -> Self {
        Error::EmulationDivergence {
            address: address.into(),
            reason,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
