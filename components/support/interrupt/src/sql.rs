/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use crate::{Interrupted, Interruptee};
use rusqlite::{Connection, InterruptHandle};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Interrupt operations that use SQL
///
/// Typical usage of this type:
///   - Components create a wrapper class around an rusqlite `Connection`
///     and store an `SqlInterruptHandle` instance alongside it.
///   - The wrapper class calls `begin_interrupt_scope()` at the start of any
///     long-running operation and checks `err_if_interrupted()` at various
///     points of the operation.
///   - Finally, the wrapper class creates an `interrupt()` method that calls
///     `SqlInterruptHandle::interrupt()`. This interrupts any in-progress
///     SQL queries and also any interrupt scopes created before the call.
pub struct SqlInterruptHandle {
    db_handle: InterruptHandle,
    // Counter incremented on each interrupt() call.  Interrupt scopes capture
    // the value at creation and consider themselves interrupted once it moves.
    interrupt_counter: Arc<AtomicUsize>,
}

impl std::fmt::Debug for SqlInterruptHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlInterruptHandle")
            .field("interrupt_counter", &self.interrupt_counter)
            .finish()
    }
}

impl SqlInterruptHandle {
    #[inline]
    pub fn new(conn: &Connection) -> Self {
        Self {
            db_handle: conn.get_interrupt_handle(),
            interrupt_counter: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Begin an interrupt scope that will be interrupted by this handle
    #[inline]
    pub fn begin_interrupt_scope(&self) -> SqlInterruptScope {
        SqlInterruptScope::new(Arc::clone(&self.interrupt_counter))
    }

    /// Interrupt all interrupt scopes created by this handle
    #[inline]
    pub fn interrupt(&self) {
        self.interrupt_counter.fetch_add(1, Ordering::SeqCst);
        self.db_handle.interrupt();
    }
}

/// Check if an operation has been interrupted
///
/// This is used by the rust code to check if an operation should fail because
/// it was interrupted.  It handles the case where we get interrupted outside
/// of an actual SQL query.
#[derive(Debug)]
pub struct SqlInterruptScope {
    start_value: usize,
    interrupt_counter: Arc<AtomicUsize>,
}

impl SqlInterruptScope {
    fn new(interrupt_counter: Arc<AtomicUsize>) -> Self {
        let start_value = interrupt_counter.load(Ordering::SeqCst);
        Self {
            start_value,
            interrupt_counter,
        }
    }

    /// Check if scope has been interrupted
    #[inline]
    pub fn was_interrupted(&self) -> bool {
        self.interrupt_counter.load(Ordering::SeqCst) != self.start_value
    }

    /// Return Err(Interrupted) if we were interrupted
    #[inline]
    pub fn err_if_interrupted(&self) -> Result<(), Interrupted> {
        if self.was_interrupted() {
            return Err(Interrupted);
        }
        Ok(())
    }
}

impl Interruptee for SqlInterruptScope {
    fn was_interrupted(&self) -> bool {
        SqlInterruptScope::was_interrupted(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_sees_interrupt() {
        let conn = Connection::open_in_memory().unwrap();
        let handle = SqlInterruptHandle::new(&conn);
        let scope = handle.begin_interrupt_scope();
        assert!(!scope.was_interrupted());
        handle.interrupt();
        assert!(scope.was_interrupted());
        assert_eq!(scope.err_if_interrupted(), Err(Interrupted));
        // Scopes started after the interrupt don't see it.
        let scope2 = handle.begin_interrupt_scope();
        assert!(scope2.err_if_interrupted().is_ok());
    }
}
