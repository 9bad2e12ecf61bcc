// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Tool contract, registry, argument validation, and the pending-action
//! store.  Concrete tool implementations (shell, file edit, kernels, …) are
//! supplied by the embedding application.
pub mod pending;
pub mod registry;
pub mod tool;
pub mod truncate;
pub mod validate;

pub use pending::{PendingAction, PendingActionStore};
pub use registry::{ArgValidation, RegistryError, ToolRegistry};
pub use tool::{OutputCategory, Tool, ToolContext, ToolDescriptor, ToolProgress, ToolResult};
pub use truncate::clip_output;
pub use validate::parse_arguments;
