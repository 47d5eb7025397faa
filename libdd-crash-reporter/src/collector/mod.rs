// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Signal handlers of the crashing process.

pub mod in_process;
pub mod out_of_process;
mod signal_handler_manager;
