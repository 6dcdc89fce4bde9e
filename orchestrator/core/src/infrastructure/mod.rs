// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod command;
pub mod db;
pub mod device_mapper;
pub mod event_bus;
pub mod lvm;
pub mod nbd;
pub mod repositories;
pub mod simulated;
