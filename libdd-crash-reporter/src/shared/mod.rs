// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

pub mod configuration;
pub mod constants;
pub mod context;
pub mod errors;
pub mod log;
pub mod memory_map;
pub mod message;
pub mod signal_names;
