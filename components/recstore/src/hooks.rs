/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The interception framework: a closed set of operation kinds plus an
//! optional table filter, validated when a hook is registered rather than on
//! every call. Before hooks see (and may rewrite) the operation input; after
//! hooks see the result and may rewrite it in place. A hook returning an
//! error aborts the operation.

use crate::context::Context;
use crate::error::*;
use crate::predicate::Predicate;
use crate::records::Record;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    GetByPk,
    Search,
    SearchFirst,
    Insert,
    Update,
    Remove,
    RemoveWhere,
}

/// The operation inputs handed to before hooks. Mutations expose the record
/// mutably so hooks can stamp columns before the write happens.
pub struct OpInput<'a> {
    pub table: &'a str,
    pub record: Option<&'a mut Record>,
    pub predicate: Option<&'a Predicate>,
}

/// The operation's result, handed mutably to after hooks.
pub enum OpResult {
    Unit,
    Count(u64),
    MaybeRecord(Option<Record>),
    Record(Record),
    Records(Vec<Record>),
}

pub(crate) type BeforeFn = Box<dyn Fn(&Context, &mut OpInput<'_>) -> Result<()> + Send + Sync>;
pub(crate) type AfterFn = Box<dyn Fn(&Context, &str, &mut OpResult) -> Result<()> + Send + Sync>;

struct Registered<F> {
    kind: OpKind,
    table: Option<String>,
    hook: F,
}

impl<F> Registered<F> {
    fn applies(&self, kind: OpKind, table: &str) -> bool {
        self.kind == kind && self.table.as_deref().map_or(true, |t| t == table)
    }
}

#[derive(Default)]
pub(crate) struct HookRegistry {
    before: Vec<Registered<BeforeFn>>,
    after: Vec<Registered<AfterFn>>,
}

impl HookRegistry {
    pub fn register_before(
        &mut self,
        kind: OpKind,
        table: Option<&str>,
        hook: BeforeFn,
    ) -> Result<()> {
        self.before.push(Registered {
            kind,
            table: validated_table(table)?,
            hook,
        });
        Ok(())
    }

    pub fn register_after(
        &mut self,
        kind: OpKind,
        table: Option<&str>,
        hook: AfterFn,
    ) -> Result<()> {
        self.after.push(Registered {
            kind,
            table: validated_table(table)?,
            hook,
        });
        Ok(())
    }

    /// Run every matching before hook, in registration order.
    pub fn run_before(
        &self,
        ctx: &Context,
        kind: OpKind,
        input: &mut OpInput<'_>,
    ) -> Result<()> {
        for reg in &self.before {
            if reg.applies(kind, input.table) {
                (reg.hook)(ctx, input)?;
            }
        }
        Ok(())
    }

    /// Run every matching after hook, in registration order.
    pub fn run_after(
        &self,
        ctx: &Context,
        kind: OpKind,
        table: &str,
        result: &mut OpResult,
    ) -> Result<()> {
        for reg in &self.after {
            if reg.applies(kind, table) {
                (reg.hook)(ctx, table, result)?;
            }
        }
        Ok(())
    }
}

fn validated_table(table: Option<&str>) -> Result<Option<String>> {
    match table {
        None => Ok(None),
        Some("") => Err(Error::InvalidPredicate(
            "hook table filter cannot be empty".into(),
        )),
        Some(t) => Ok(Some(t.to_string())),
    }
}
