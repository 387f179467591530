use std::sync::Arc;

/// Immutable point-in-time view of registered addresses.
///
/// Entries carry no ordering guarantee. A refresh builds a new snapshot and
/// swaps it in whole; holders of an older snapshot keep seeing that one.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AddressSnapshot {
    addresses: Arc<Vec<String>>,
    generation: u64,
}

impl AddressSnapshot {
    pub(crate) fn new(addresses: Vec<String>, generation: u64) -> Self {
        Self {
            addresses: Arc::new(addresses),
            generation,
        }
    }

    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.addresses.iter().map(String::as_str)
    }

    pub fn contains(&self, address: &str) -> bool {
        self.iter().any(|candidate| candidate == address)
    }

    pub fn as_slice(&self) -> &[String] {
        &self.addresses
    }

    /// Sorted copy, for comparisons that should ignore entry order.
    pub fn sorted(&self) -> Vec<String> {
        let mut addresses = self.addresses.as_ref().clone();
        addresses.sort();
        addresses
    }

    /// Refresh count that produced this snapshot, starting at 1.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}
