//! Content addresses and unordered address sets.
//!
//! An address is the blake3 digest of a chunk's raw bytes. Equality and
//! hashing are byte-wise. `AddressSet` carries the set algebra the pull
//! driver needs; it has no internal locking, callers serialize access.

use std::collections::{hash_set, HashSet};
use std::fmt;

/// Width of a content address in bytes.
pub const ADDRESS_LEN: usize = 32;

/// A fixed-width content address: the blake3 digest of a chunk's bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address([u8; ADDRESS_LEN]);

impl Address {
    /// Computes the address of the given bytes.
    pub fn of(data: &[u8]) -> Self {
        Address(*blake3::hash(data).as_bytes())
    }

    /// Constructs an address from raw digest bytes.
    pub fn from_bytes(bytes: [u8; ADDRESS_LEN]) -> Self {
        Address(bytes)
    }

    /// Returns the raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; ADDRESS_LEN] {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Eight hex chars identify an address in logs and test failures.
        write!(
            f,
            "Address({:02x}{:02x}{:02x}{:02x})",
            self.0[0], self.0[1], self.0[2], self.0[3]
        )
    }
}

/// An unordered set of unique addresses.
///
/// Iteration order is unspecified and may differ between iterations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddressSet(HashSet<Address>);

impl AddressSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        AddressSet(HashSet::new())
    }

    /// Creates an empty set with room for `capacity` addresses.
    pub fn with_capacity(capacity: usize) -> Self {
        AddressSet(HashSet::with_capacity(capacity))
    }

    /// Inserts one address. Returns true if it was not already present.
    pub fn insert(&mut self, addr: Address) -> bool {
        self.0.insert(addr)
    }

    /// Inserts every address of `other`.
    pub fn insert_all(&mut self, other: &AddressSet) {
        for addr in other.iter() {
            self.0.insert(*addr);
        }
    }

    /// Removes one address. Returns true if it was present.
    pub fn remove(&mut self, addr: &Address) -> bool {
        self.0.remove(addr)
    }

    /// Removes every address of `other` from this set.
    pub fn remove_all(&mut self, other: &AddressSet) {
        // Iterate whichever side is smaller.
        if self.0.len() <= other.len() {
            self.0.retain(|a| !other.has(a));
        } else {
            for addr in other.iter() {
                self.0.remove(addr);
            }
        }
    }

    /// Returns true if `addr` is in the set.
    pub fn has(&self, addr: &Address) -> bool {
        self.0.contains(addr)
    }

    /// Number of addresses in the set.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if the set is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates the addresses in unspecified order.
    pub fn iter(&self) -> hash_set::Iter<'_, Address> {
        self.0.iter()
    }

    /// Narrows `addrs` to the subset not present in this set.
    ///
    /// This is the `has_many` set difference: the returned set holds every
    /// element of `addrs` that `self` is missing.
    pub fn missing(&self, addrs: &AddressSet) -> AddressSet {
        let mut absent = AddressSet::new();
        for addr in addrs.iter() {
            if !self.has(addr) {
                absent.insert(*addr);
            }
        }
        absent
    }
}

impl FromIterator<Address> for AddressSet {
    fn from_iter<I: IntoIterator<Item = Address>>(iter: I) -> Self {
        AddressSet(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a AddressSet {
    type Item = &'a Address;
    type IntoIter = hash_set::Iter<'a, Address>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(n: u8) -> Address {
        Address::of(&[n])
    }

    #[test]
    fn address_of_is_deterministic() {
        assert_eq!(Address::of(b"hello"), Address::of(b"hello"));
        assert_ne!(Address::of(b"hello"), Address::of(b"world"));
    }

    #[test]
    fn address_display_is_full_hex() {
        let a = Address::from_bytes([0xab; ADDRESS_LEN]);
        let s = a.to_string();
        assert_eq!(s.len(), ADDRESS_LEN * 2);
        assert!(s.chars().all(|c| c == 'a' || c == 'b'));
    }

    #[test]
    fn insert_and_has() {
        let mut set = AddressSet::new();
        assert!(set.insert(addr(1)));
        assert!(!set.insert(addr(1)));
        assert!(set.has(&addr(1)));
        assert!(!set.has(&addr(2)));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn remove_returns_presence() {
        let mut set = AddressSet::new();
        set.insert(addr(1));
        assert!(set.remove(&addr(1)));
        assert!(!set.remove(&addr(1)));
        assert!(set.is_empty());
    }

    #[test]
    fn insert_all_unions() {
        let mut a: AddressSet = [addr(1), addr(2)].into_iter().collect();
        let b: AddressSet = [addr(2), addr(3)].into_iter().collect();
        a.insert_all(&b);
        assert_eq!(a.len(), 3);
        assert!(a.has(&addr(3)));
    }

    #[test]
    fn remove_all_subtracts() {
        let mut a: AddressSet = (0..10).map(addr).collect();
        let b: AddressSet = (5..15).map(addr).collect();
        a.remove_all(&b);
        assert_eq!(a.len(), 5);
        for n in 0..5 {
            assert!(a.has(&addr(n)));
        }
    }

    #[test]
    fn remove_all_with_larger_self() {
        let mut a: AddressSet = (0..100).map(addr).collect();
        let b: AddressSet = [addr(3), addr(7)].into_iter().collect();
        a.remove_all(&b);
        assert_eq!(a.len(), 98);
        assert!(!a.has(&addr(3)));
        assert!(!a.has(&addr(7)));
    }

    #[test]
    fn missing_narrows_to_absent() {
        let reference: AddressSet = [addr(1), addr(2)].into_iter().collect();
        let incoming: AddressSet = [addr(1), addr(2), addr(3), addr(4)].into_iter().collect();
        let absent = reference.missing(&incoming);
        assert_eq!(absent.len(), 2);
        assert!(absent.has(&addr(3)));
        assert!(absent.has(&addr(4)));
    }

    #[test]
    fn missing_of_empty_is_empty() {
        let reference = AddressSet::new();
        let absent = reference.missing(&AddressSet::new());
        assert!(absent.is_empty());
    }
}
