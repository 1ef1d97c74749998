use std::fmt;
use std::hash::{Hash, Hasher};

/// Identity of a packet type and its place in the packet type tree.
///
/// Kinds are declared as constants with an explicit parent, which gives the
/// router a static hierarchy to walk without any runtime reflection:
///
/// ```
/// use chatfront_pipeline::{AnyPacket, PacketKind, PacketType};
///
/// struct ChatPacket;
/// impl PacketType for ChatPacket {
///     const KIND: PacketKind = PacketKind::child("chat", &AnyPacket::KIND);
/// }
///
/// assert!(ChatPacket::KIND.is_descendant_of(AnyPacket::KIND));
/// ```
///
/// Two kinds are equal when their names are equal, so names must be unique
/// within a process.
#[derive(Clone, Copy)]
pub struct PacketKind {
    name: &'static str,
    parent: Option<&'static PacketKind>,
}

impl PacketKind {
    /// A kind with no parent.
    pub const fn root(name: &'static str) -> Self {
        Self { name, parent: None }
    }

    pub const fn child(name: &'static str, parent: &'static PacketKind) -> Self {
        Self {
            name,
            parent: Some(parent),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn parent(&self) -> Option<PacketKind> {
        self.parent.copied()
    }

    /// This kind followed by each of its ancestors, nearest first.
    pub fn lineage(self) -> Lineage {
        Lineage { next: Some(self) }
    }

    /// Strict ancestors of this kind, nearest first.
    pub fn ancestors(self) -> Lineage {
        Lineage {
            next: self.parent(),
        }
    }

    /// Returns `true` if `ancestor` appears strictly above this kind.
    pub fn is_descendant_of(&self, ancestor: PacketKind) -> bool {
        self.ancestors().any(|kind| kind == ancestor)
    }
}

impl PartialEq for PacketKind {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for PacketKind {}

impl Hash for PacketKind {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

impl fmt::Debug for PacketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

impl fmt::Display for PacketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// Iterator over a kind and its ancestors.
pub struct Lineage {
    next: Option<PacketKind>,
}

impl Iterator for Lineage {
    type Item = PacketKind;

    fn next(&mut self) -> Option<PacketKind> {
        let current = self.next?;
        self.next = current.parent();
        Some(current)
    }
}

/// Associates a Rust type with a [`PacketKind`].
///
/// Implemented by concrete packets and by marker types standing for
/// abstract tiers of the hierarchy, so both can be used as registration
/// targets on the router.
pub trait PacketType {
    const KIND: PacketKind;
}

/// Root of the packet hierarchy.
pub struct AnyPacket;

impl PacketType for AnyPacket {
    const KIND: PacketKind = PacketKind::root("any");
}
