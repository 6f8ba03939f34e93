//! Crate-wide error types.
//!
//! Each abstraction keeps its handling local where spec.md mandates
//! log-and-drop; these types cover the cases that must fail loudly.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("message of {len} bytes exceeds the {max} byte link limit")]
    MessageTooLarge { len: usize, max: usize },

    #[error("failed to bind link socket: {0}")]
    BindFailed(#[source] std::io::Error),

    #[error("failed to encode message: {0}")]
    Encode(#[source] bincode::Error),

    #[error("failed to decode message: {0}")]
    Decode(#[source] bincode::Error),
}

// spec.md §7's "unknown handler name" error kind has no site here: the
// tagged-enum event dispatch (spec.md §9's redesign of the source's
// string-keyed handler lookup) makes an unknown handler a compile error,
// not a runtime one.
