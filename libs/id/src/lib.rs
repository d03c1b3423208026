//! # kubelab-id
//!
//! Typed ID types for kubelab resources.
//!
//! IDs are provider- or system-generated and never user-controlled. Machine
//! names (`master`, `node1`, …) are the human-facing labels; IDs are the
//! stable handles a provider hands back.
//!
//! ## ID Format
//!
//! All IDs use a prefixed format: `{prefix}_{ulid}`
//!
//! Examples:
//! - `vm_01HV4Z2WQXKJNM8GPQY6VBKC3D`
//! - `run_01HV4Z3MXNKPQR9HSTZ7WCLD4E`

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Characters kept by `short()`.
pub const SHORT_ID_LEN: usize = 8;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
