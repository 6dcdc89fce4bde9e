// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Command implementations for the lvblob CLI

pub mod activation;
pub mod attach;
pub mod blob;
pub mod config;
pub mod pool;
pub mod relay;
pub mod serve;

pub use self::activation::ActivationCommand;
pub use self::attach::{AttachArgs, DetachArgs, OptimizeArgs};
pub use self::blob::BlobCommand;
pub use self::config::ConfigCommand;
pub use self::pool::PoolCommand;
pub use self::relay::RelayCommand;

use lvblob_core::application::{AttachmentError, ErrorCategory};
use lvblob_core::domain::blob::BlobName;
use lvblob_core::domain::pool::NodeId;

/// Process exit code for a failed command, derived from the engine's error
/// category anywhere in the error chain.
pub fn exit_code(error: &anyhow::Error) -> i32 {
    let category = error
        .chain()
        .find_map(|cause| cause.downcast_ref::<AttachmentError>())
        .map(AttachmentError::category);
    match category {
        Some(ErrorCategory::InvalidArgument) => 2,
        Some(ErrorCategory::NotFound) => 3,
        Some(ErrorCategory::FailedPrecondition) => 4,
        Some(ErrorCategory::Internal) | None => 1,
    }
}

pub(crate) fn blob_name(name: &str) -> Result<BlobName, AttachmentError> {
    Ok(BlobName::parse(name)?)
}

pub(crate) fn node_or(node: Option<String>, local: &NodeId) -> NodeId {
    node.map(NodeId::new).unwrap_or_else(|| local.clone())
}

/// Parse a byte size: plain bytes or a binary suffix (`K`, `M`, `G`, `T`).
pub fn parse_size(value: &str) -> Result<u64, String> {
    let value = value.trim();
    let (digits, shift) = match value.char_indices().last() {
        Some((i, c)) if c.is_ascii_alphabetic() => {
            let shift = match c.to_ascii_uppercase() {
                'K' => 10,
                'M' => 20,
                'G' => 30,
                'T' => 40,
                _ => return Err(format!("unknown size suffix '{}'", c)),
            };
            (&value[..i], shift)
        }
        _ => (value, 0),
    };
    let number: u64 = digits
        .trim()
        .parse()
        .map_err(|_| format!("invalid size '{}'", value))?;
    number
        .checked_mul(1u64 << shift)
        .ok_or_else(|| format!("size '{}' overflows", value))
}
