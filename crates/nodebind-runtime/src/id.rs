use std::fmt;

/// Globally unique binder identity.
///
/// The high 32 bits name the owning node, the low 32 bits a per-node object
/// counter. The node component never changes once assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BinderId(u64);

impl BinderId {
    pub const fn new(node_id: u32, local_id: u32) -> Self {
        Self(((node_id as u64) << 32) | local_id as u64)
    }

    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    pub const fn node_id(self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub const fn local_id(self) -> u32 {
        self.0 as u32
    }
}

impl fmt::Display for BinderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.node_id(), self.local_id())
    }
}
