use crate::arch::GenericRegister;

/// How the offset of a field is obtained.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Discovery {
    /// The field sits at the same offset in every build.
    Constant(usize),
    /// Emulate `anchor` up to its call to `target`, then diff `register`
    /// against the base injected into it before the run.
    Emulated {
        anchor: &'static str,
        target: &'static str,
        register: GenericRegister,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FieldDescriptor {
    pub name: &'static str,
    pub discovery: Discovery,
}

/// A kernel structure and the fields recovered from it.
#[derive(Clone, Copy, Debug)]
pub struct StructDescriptor {
    pub name: &'static str,
    pub fields: &'static [FieldDescriptor],
}

impl StructDescriptor {
    pub fn field(&self, name: &str) -> Option<&'static FieldDescriptor> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Offset of a field known to be fixed across builds. No emulation involved.
    pub fn resolve_constant_offset(&self, name: &str) -> Option<usize> {
        match self.field(name)?.discovery {
            Discovery::Constant(offset) => Some(offset),
            Discovery::Emulated { .. } => None,
        }
    }
}
