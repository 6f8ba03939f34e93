//! Peer identity.
//!
//! A peer is identified by a small non-negative integer, assigned out of
//! band when the cluster is configured. Ordering is total and rank-reversed:
//! the lowest id is the highest-ranked peer (see `consensus` and `election`).

use std::fmt::Display;

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Deserialize, serde::Serialize)]
pub struct PeerId(pub u64);

impl PeerId {
    pub fn new(process_number: u64) -> Self {
        PeerId(process_number)
    }

    pub fn number(&self) -> u64 {
        self.0
    }
}

impl Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for PeerId {
    fn from(value: u64) -> Self {
        PeerId(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lower_id_outranks_higher_id() {
        assert!(PeerId(0) < PeerId(1));
        assert!(PeerId(1) < PeerId(2));
    }
}
