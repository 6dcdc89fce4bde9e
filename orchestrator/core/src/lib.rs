// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! lvblob core
//!
//! Attachment and activation core for thin-provisioned blobs on a shared
//! volume group.
//!
//! # Architecture
//!
//! - **domain:** aggregates, policies and boundary contracts
//! - **application:** attachment engine, pool migration, blob lifecycle, reconcilers
//! - **infrastructure:** host commands, LVM, device-mapper, NBD relay, repositories

pub mod domain;
pub mod application;
pub mod infrastructure;

pub use domain::*;
