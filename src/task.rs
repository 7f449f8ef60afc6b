// Copyright © 2024 The Johns Hopkins Applied Physics Laboratory LLC.
//
// This program is free software: you can redistribute it and/or
// modify it under the terms of the GNU Affero General Public License,
// version 3, as published by the Free Software Foundation.  If you
// would like to purchase a commercial license for this software, please
// contact APL’s Tech Transfer at 240-592-0817 or
// techtransfer@jhuapl.edu.
//
// This program is distributed in the hope that it will be useful, but
// WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public
// License along with this program.  If not, see
// <https://www.gnu.org/licenses/>.

//! Deferred task execution interface.
//!
//! The task manager is an external collaborator running its own
//! worker thread; the stream machinery registers one-shot tasks with
//! it to reconnect at a scheduled time.
use std::sync::Arc;
use std::time::Instant;

/// A deferred callback.
pub trait Task: Send + Sync {
    /// Run the task.
    ///
    /// Returns the next time the task should fire, or `None` for a
    /// one-shot task that is now done.
    fn run(
        &self,
        now: Instant
    ) -> Option<Instant>;
}

/// Trait for task schedulers.
pub trait TaskManager: Send + Sync {
    /// Register `task` to run at `at`.
    fn register_task(
        &self,
        task: Arc<dyn Task>,
        at: Instant
    );
}
