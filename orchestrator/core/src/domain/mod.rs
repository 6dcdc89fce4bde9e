// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Domain Layer
//!
//! Pool and blob aggregates, the activation policy, and the contracts the
//! infrastructure layer implements (state store, host commands, volume
//! manager, relay, dual device-mapper wrapper).

pub mod activation;
pub mod blob;
pub mod command;
pub mod device_mapper;
pub mod events;
pub mod node_config;
pub mod pool;
pub mod relay;
pub mod repository;
pub mod volume;
