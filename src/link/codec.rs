//! Wire framing for the link layer: `(callback_id, payload)`, bincode-encoded.
//!
//! spec.md §6 leaves the encoding choice open provided it round-trips and is
//! self-delimited within the datagram; `bincode` is the natural fit given
//! the existing `serde` stack, and is already the choice several
//! consensus-adjacent crates in the retrieval pack make for compact wire
//! framing.

use serde::{Deserialize, Serialize};

use crate::errors::LinkError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkFrame {
    pub callback_id: u32,
    pub payload: Vec<u8>,
}

pub fn encode(frame: &LinkFrame) -> Result<Vec<u8>, LinkError> {
    bincode::serialize(frame).map_err(LinkError::Encode)
}

pub fn decode(bytes: &[u8]) -> Result<LinkFrame, LinkError> {
    bincode::deserialize(bytes).map_err(LinkError::Decode)
}
