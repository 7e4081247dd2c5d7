use std::fmt::Display;
use vstate_hashes::{Hash, HASH_SIZE};

/// Big-endian `u64` key so that rocksdb key order matches numeric order
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TxOrderKey([u8; 8]);

impl TxOrderKey {
    pub fn order(&self) -> u64 {
        u64::from_be_bytes(self.0)
    }

    pub fn try_from_slice(bytes: &[u8]) -> Option<Self> {
        Some(Self(bytes.try_into().ok()?))
    }
}

impl From<u64> for TxOrderKey {
    fn from(value: u64) -> Self {
        Self(value.to_be_bytes())
    }
}

impl AsRef<[u8]> for TxOrderKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Display for TxOrderKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.order())
    }
}

pub const STALE_KEY_SIZE: usize = 8 + HASH_SIZE;

/// `tx_order (BE) || node id`, ordering stale entries by the commit which superseded them
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StaleIndexKey([u8; STALE_KEY_SIZE]);

impl StaleIndexKey {
    pub fn new(tx_order: u64, node: Hash) -> Self {
        let mut bytes = [0u8; STALE_KEY_SIZE];
        bytes[..8].copy_from_slice(&tx_order.to_be_bytes());
        bytes[8..].copy_from_slice(node.as_bytes().as_slice());
        Self(bytes)
    }

    pub fn tx_order(&self) -> u64 {
        let mut order = [0u8; 8];
        order.copy_from_slice(&self.0[..8]);
        u64::from_be_bytes(order)
    }

    pub fn node(&self) -> Hash {
        let mut node = [0u8; HASH_SIZE];
        node.copy_from_slice(&self.0[8..]);
        Hash::from_bytes(node)
    }

    pub fn try_from_slice(bytes: &[u8]) -> Option<Self> {
        Some(Self(bytes.try_into().ok()?))
    }
}

impl AsRef<[u8]> for StaleIndexKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stale_key_ordering() {
        let low = StaleIndexKey::new(1, Hash::from_u64_word(u64::MAX));
        let high = StaleIndexKey::new(256, Hash::from_u64_word(0));
        assert!(low.as_ref() < high.as_ref());
        assert_eq!(high.tx_order(), 256);
        assert_eq!(low.node(), Hash::from_u64_word(u64::MAX));
        assert_eq!(StaleIndexKey::try_from_slice(low.as_ref()), Some(low));
        assert_eq!(TxOrderKey::from(300).order(), 300);
        assert!(TxOrderKey::from(2).as_ref() < TxOrderKey::from(256).as_ref());
    }
}
