// SPDX-FileCopyrightText: © 2025 AOSL Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! AOSL Core - lifetime primitives and completion types shared by the runtime.
//!
//! ## Core Modules
//!
//! - [`refobj`]: generation-checked reference objects with hold/destroy-wait semantics
//! - [`outcome`]: execution modes and the tri-state completion contract
//! - [`data`]: shared buffers, buffer regions and result slots
//! - [`error`]: error taxonomy and the per-thread last-error slot
//! - [`helpers`]: poison-tolerant lock helpers
//!
//! ## Quick Start
//!
//! ```
//! use aosl_core::refobj::{self, Access};
//!
//! let id = refobj::create(String::from("session"), |_| {}, true).unwrap();
//! let len = refobj::hold(id, |access: Access<'_, String>| access.live().map(String::len));
//! assert_eq!(len, Some(7));
//! refobj::destroy(id, true).unwrap();
//! assert!(refobj::hold(id, |access: Access<'_, String>| access.live().is_none()));
//! ```

pub mod data;
pub mod error;
pub mod helpers;
pub mod outcome;
pub mod refobj;

// Convenience re-exports for commonly used types

pub use data::{BufRegion, Data, RetSlot, Slot};
pub use error::{AoslError, Result};
pub use outcome::{tri_code, ExecMode, Outcome, Resume, Resumed};
pub use refobj::{Access, RefId, RefObject};
