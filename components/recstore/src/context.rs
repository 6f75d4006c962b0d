/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

/// Request-scoped context carried through every operation: who is acting,
/// and how mutations should be instrumented. There is deliberately no
/// ambient/global equivalent - callers thread this through.
#[derive(Debug, Clone)]
pub struct Context {
    /// The actor recorded as `version_user` on mutations, tombstones and
    /// history rows.
    pub actor: Option<String>,
    pub(crate) tracking: TrackingMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TrackingMode {
    /// Normal operation: version columns are maintained, history and
    /// tombstones are written.
    Tracked,
    /// Records are written exactly as supplied - version columns included -
    /// and no history or tombstones are produced. Used when applying rows
    /// that were already stamped by the authoritative side.
    Passthrough,
}

impl Context {
    pub fn new(actor: impl Into<String>) -> Self {
        Self {
            actor: Some(actor.into()),
            tracking: TrackingMode::Tracked,
        }
    }

    /// A context with no actor. Mutations through this context fail on
    /// stores built with `require_actor`.
    pub fn anonymous() -> Self {
        Self {
            actor: None,
            tracking: TrackingMode::Tracked,
        }
    }

    /// A context for applying rows stamped elsewhere (the sync download
    /// path): version columns are taken verbatim from the records and the
    /// trackers stay silent.
    pub fn passthrough() -> Self {
        Self {
            actor: None,
            tracking: TrackingMode::Passthrough,
        }
    }

    #[inline]
    pub(crate) fn is_passthrough(&self) -> bool {
        self.tracking == TrackingMode::Passthrough
    }
}
