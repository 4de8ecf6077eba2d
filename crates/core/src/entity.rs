//! Entity trait: identity + placement in the plant hierarchy.

/// Entity marker + minimal interface.
///
/// Implemented by catalog entities so that lookups and validation can be
/// written once for every level of the hierarchy.
pub trait Entity {
    /// Strongly-typed entity identifier.
    type Id: Clone + Eq + core::hash::Hash + core::fmt::Debug + core::fmt::Display;

    /// Human-readable entity kind used in errors and logs (`"machine"`, ...).
    const KIND: &'static str;

    /// Returns the entity identifier.
    fn id(&self) -> &Self::Id;
}
