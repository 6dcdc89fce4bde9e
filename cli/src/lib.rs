// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! lvblob CLI library - exposes testable components
//!
//! # Architecture
//!
//! - **Layer:** Interface / Presentation Layer
//! - **Purpose:** Command parsing, node bootstrap and telemetry setup for the
//!   `lvblob` binary

pub mod commands;
pub mod node;
pub mod telemetry;
