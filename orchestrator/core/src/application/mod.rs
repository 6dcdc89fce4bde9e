// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod attachment;
pub mod blob_manager;
pub mod host;
pub mod locks;
pub mod migration;
pub mod node_services;
pub mod reconcile_driver;
pub mod reconciler;
pub mod repository_factory;
pub mod workers;

// Re-export services for convenience
pub use attachment::{AttachmentError, AttachmentService, ErrorCategory, StandardAttachmentService};
pub use blob_manager::{BlobService, StandardBlobService};
pub use host::HostAdapters;
pub use node_services::NodeServices;
pub use reconciler::{NodeActivationReconciler, PoolActivationReconciler, ReconcileError, ReconcileOutcome};
