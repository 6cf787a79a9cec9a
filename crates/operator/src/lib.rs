/*
 * Ambient Code Platform - Kubernetes Operator for Agentic Sessions
 * Copyright (C) 2025 Ambient Code
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc, clippy::doc_markdown)]

//! Ambient operator core library
//!
//! This crate provides the reconciliation engine that turns `AgenticSession`
//! declarations into running agent/workspace pods, the namespace provisioner,
//! and the remote-exec tool server used by the agent container.

pub mod crds;
pub mod exec;
pub mod reconcile;

// Re-export commonly used types
pub use crds::{
    AgenticSession, AgenticSessionSpec, AgenticSessionStatus, ProjectSettings,
    ProjectSettingsSpec,
};
pub use reconcile::config::OperatorConfig;
pub use reconcile::types::{Error, Result};
