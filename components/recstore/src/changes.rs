/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Transactional change batches and multi-reads.
//!
//! A change batch applies in the order supplied, inside one transaction.
//! `auto` resolves to update when a row with the pk exists, else insert.
//! String values of the form `${table.field}` are substituted at apply time
//! with the field value from the most recent insert/update of that table in
//! the same batch - the idiom for wiring generated keys into child rows.

use crate::client::{ops, StoreState};
use crate::context::Context;
use crate::error::*;
use crate::joinfetch::JoinFetch;
use crate::predicate::Predicate;
use crate::records::{pk_record, Record};
use interrupt_support::SqlInterruptScope;
use rusqlite::Connection;
use serde_derive::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChangeRequestAction {
    Insert,
    Update,
    Remove,
    RemoveWhere,
    Auto,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeRequest {
    pub table: String,
    pub action: ChangeRequestAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record: Option<Record>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Predicate>,
}

impl ChangeRequest {
    pub fn insert(table: impl Into<String>, record: Record) -> Self {
        Self::with_record(table, ChangeRequestAction::Insert, record)
    }

    pub fn update(table: impl Into<String>, record: Record) -> Self {
        Self::with_record(table, ChangeRequestAction::Update, record)
    }

    pub fn auto(table: impl Into<String>, record: Record) -> Self {
        Self::with_record(table, ChangeRequestAction::Auto, record)
    }

    pub fn remove(table: impl Into<String>, record: Record) -> Self {
        Self::with_record(table, ChangeRequestAction::Remove, record)
    }

    pub fn remove_where(table: impl Into<String>, conditions: Predicate) -> Self {
        ChangeRequest {
            table: table.into(),
            action: ChangeRequestAction::RemoveWhere,
            record: None,
            conditions: Some(conditions),
        }
    }

    fn with_record(table: impl Into<String>, action: ChangeRequestAction, record: Record) -> Self {
        ChangeRequest {
            table: table.into(),
            action,
            record: Some(record),
            conditions: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AppliedAction {
    Inserted,
    Updated,
    Removed,
    RemovedWhere { count: u64 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppliedChange {
    pub table: String,
    pub action: AppliedAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record: Option<Record>,
}

pub(crate) fn apply_changes(
    conn: &Connection,
    state: &StoreState,
    ctx: &Context,
    scope: &SqlInterruptScope,
    changes: &[ChangeRequest],
) -> Result<Vec<AppliedChange>> {
    // The most recent insert/update result per table, for token resolution.
    let mut latest: HashMap<String, Record> = HashMap::new();
    let mut applied = Vec::with_capacity(changes.len());

    for change in changes {
        scope.err_if_interrupted()?;
        let record = match &change.record {
            Some(r) => {
                let mut r = r.clone();
                substitute_tokens(&mut r, &latest)?;
                Some(r)
            }
            None => None,
        };
        let need_record = || {
            record.clone().ok_or_else(|| {
                Error::InvalidPredicate(format!(
                    "change on {} needs a record",
                    change.table
                ))
            })
        };

        let result = match change.action {
            ChangeRequestAction::Insert => {
                let rec = ops::insert(conn, state, ctx, &change.table, &need_record()?)?;
                latest.insert(change.table.clone(), rec.clone());
                AppliedChange {
                    table: change.table.clone(),
                    action: AppliedAction::Inserted,
                    record: Some(rec),
                }
            }
            ChangeRequestAction::Update => {
                let rec = ops::update(conn, state, ctx, &change.table, &need_record()?)?;
                latest.insert(change.table.clone(), rec.clone());
                AppliedChange {
                    table: change.table.clone(),
                    action: AppliedAction::Updated,
                    record: Some(rec),
                }
            }
            ChangeRequestAction::Auto => {
                let record = need_record()?;
                let catalog = state.catalog.load(conn)?;
                let schema = catalog.table(&change.table)?;
                let exists = match pk_record(schema, &record) {
                    Ok(pk) => ops::read_row_by_pk(conn, schema, &pk)?.is_some(),
                    // No usable pk in the record: a new row.
                    Err(_) => false,
                };
                let (rec, action) = if exists {
                    (
                        ops::update(conn, state, ctx, &change.table, &record)?,
                        AppliedAction::Updated,
                    )
                } else {
                    (
                        ops::insert(conn, state, ctx, &change.table, &record)?,
                        AppliedAction::Inserted,
                    )
                };
                latest.insert(change.table.clone(), rec.clone());
                AppliedChange {
                    table: change.table.clone(),
                    action,
                    record: Some(rec),
                }
            }
            ChangeRequestAction::Remove => {
                let record = need_record()?;
                ops::remove(conn, state, ctx, &change.table, &Value::Object(record))?;
                AppliedChange {
                    table: change.table.clone(),
                    action: AppliedAction::Removed,
                    record: None,
                }
            }
            ChangeRequestAction::RemoveWhere => {
                let conditions = change.conditions.as_ref().ok_or_else(|| {
                    Error::InvalidPredicate(format!(
                        "removeWhere on {} needs conditions",
                        change.table
                    ))
                })?;
                let count =
                    ops::remove_where(conn, state, ctx, scope, &change.table, conditions)?;
                AppliedChange {
                    table: change.table.clone(),
                    action: AppliedAction::RemovedWhere { count },
                    record: None,
                }
            }
        };
        applied.push(result);
    }
    Ok(applied)
}

/// Replace `${table.field}` string values using the batch's running
/// results. An unresolvable token is an error - silently writing the
/// placeholder would corrupt the row.
fn substitute_tokens(record: &mut Record, latest: &HashMap<String, Record>) -> Result<()> {
    for value in record.values_mut() {
        let token = match value {
            Value::String(s) if s.starts_with("${") && s.ends_with('}') => {
                s[2..s.len() - 1].to_string()
            }
            _ => continue,
        };
        let (table, field) = token
            .split_once('.')
            .ok_or_else(|| Error::UnknownToken(token.clone()))?;
        let source = latest
            .get(table)
            .and_then(|rec| rec.get(field))
            .ok_or_else(|| Error::UnknownToken(token.clone()))?;
        *value = source.clone();
    }
    Ok(())
}

/// One named read in a multiread batch: exactly one of `pk`, `search` or
/// `search_first` must be set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadSpec {
    pub table: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pk: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search: Option<Predicate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search_first: Option<Predicate>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub join_fetch: Vec<JoinFetch>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ReadResult {
    Record(Option<Record>),
    Records(Vec<Record>),
}

pub(crate) fn do_multiread(
    conn: &Connection,
    state: &StoreState,
    ctx: &Context,
    scope: &SqlInterruptScope,
    reads: &HashMap<String, ReadSpec>,
) -> Result<HashMap<String, ReadResult>> {
    let mut out = HashMap::with_capacity(reads.len());
    for (name, spec) in reads {
        scope.err_if_interrupted()?;
        let joins = if spec.join_fetch.is_empty() {
            None
        } else {
            Some(spec.join_fetch.as_slice())
        };
        let result = match (&spec.pk, &spec.search, &spec.search_first) {
            (Some(pk), None, None) => ReadResult::Record(ops::get_by_pk(
                conn, state, ctx, scope, &spec.table, pk, joins,
            )?),
            (None, Some(predicate), None) => ReadResult::Records(ops::search(
                conn,
                state,
                ctx,
                scope,
                &spec.table,
                predicate,
                joins,
                spec.order_by.as_deref(),
                spec.offset,
                spec.limit,
            )?),
            (None, None, Some(predicate)) => ReadResult::Record(ops::search_first(
                conn,
                state,
                ctx,
                scope,
                &spec.table,
                predicate,
                joins,
                spec.order_by.as_deref(),
            )?),
            _ => {
                return Err(Error::InvalidPredicate(format!(
                    "multiread {:?} needs exactly one of pk, search, searchFirst",
                    name
                )))
            }
        };
        out.insert(name.clone(), result);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::test_utils::new_store;
    use serde_json::json;

    fn record(v: Value) -> Record {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn test_changes_apply_in_order_with_tokens() {
        let store = new_store("changes-tokens");
        let ctx = Context::new("ada");
        store
            .unsafe_scope(&ctx, |s| {
                s.execute_batch(
                    "CREATE TABLE parents (id INTEGER PRIMARY KEY, label TEXT);
                     CREATE TABLE kids (id INTEGER PRIMARY KEY, parent_id INTEGER, label TEXT);",
                )
            })
            .unwrap();
        store.prepare_tracking().unwrap();

        let applied = store
            .changes(
                &ctx,
                &[
                    ChangeRequest::insert("parents", record(json!({"label": "p"}))),
                    ChangeRequest::insert(
                        "kids",
                        record(json!({"parent_id": "${parents.id}", "label": "k"})),
                    ),
                ],
            )
            .unwrap();
        assert_eq!(applied.len(), 2);
        let parent_id = applied[0].record.as_ref().unwrap().get("id").unwrap().clone();
        let kid = applied[1].record.as_ref().unwrap();
        assert_eq!(kid.get("parent_id"), Some(&parent_id));
    }

    #[test]
    fn test_changes_auto() {
        let store = new_store("changes-auto");
        let ctx = Context::new("ada");
        store
            .changes(
                &ctx,
                &[ChangeRequest::auto(
                    "foo",
                    record(json!({"id": "a", "name": "first"})),
                )],
            )
            .unwrap();
        let applied = store
            .changes(
                &ctx,
                &[ChangeRequest::auto(
                    "foo",
                    record(json!({"id": "a", "name": "second"})),
                )],
            )
            .unwrap();
        assert_eq!(applied[0].action, AppliedAction::Updated);
        let rec = store
            .get_by_pk(&ctx, "foo", &json!("a"), None)
            .unwrap()
            .unwrap();
        assert_eq!(rec.get("name"), Some(&json!("second")));
        assert_eq!(rec.get("version_record"), Some(&json!(1)));
    }

    #[test]
    fn test_changes_are_atomic() {
        let store = new_store("changes-atomic");
        let ctx = Context::new("ada");
        let err = store.changes(
            &ctx,
            &[
                ChangeRequest::insert("foo", record(json!({"id": "a", "name": "x"}))),
                // Fails: no such row to update.
                ChangeRequest::update("foo", record(json!({"id": "missing", "name": "y"}))),
            ],
        );
        assert!(err.is_err());
        assert!(store
            .get_by_pk(&ctx, "foo", &json!("a"), None)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_unresolvable_token_rejected() {
        let store = new_store("changes-bad-token");
        let ctx = Context::new("ada");
        let err = store.changes(
            &ctx,
            &[ChangeRequest::insert(
                "foo",
                record(json!({"id": "a", "name": "${nothing.id}"})),
            )],
        );
        assert!(matches!(err, Err(Error::UnknownToken(_))));
    }

    #[test]
    fn test_multiread() {
        let store = new_store("changes-multiread");
        let ctx = Context::new("ada");
        for (id, name, qty) in [("a", "x", 1), ("b", "y", 2), ("c", "y", 3)] {
            store
                .insert(&ctx, "foo", &record(json!({"id": id, "name": name, "qty": qty})))
                .unwrap();
        }
        let reads: HashMap<String, ReadSpec> = serde_json::from_value(json!({
            "one": {"table": "foo", "pk": "a"},
            "ys": {"table": "foo", "search": {"name": "y"}, "orderBy": "qty desc"},
            "firstY": {"table": "foo", "searchFirst": {"name": "y"}, "orderBy": "qty"},
        }))
        .unwrap();
        let results = store.multiread(&ctx, &reads).unwrap();
        match &results["one"] {
            ReadResult::Record(Some(rec)) => assert_eq!(rec.get("name"), Some(&json!("x"))),
            other => panic!("unexpected result: {:?}", other),
        }
        match &results["ys"] {
            ReadResult::Records(rows) => {
                assert_eq!(rows.len(), 2);
                assert_eq!(rows[0].get("qty"), Some(&json!(3)));
            }
            other => panic!("unexpected result: {:?}", other),
        }
        match &results["firstY"] {
            ReadResult::Record(Some(rec)) => assert_eq!(rec.get("qty"), Some(&json!(2))),
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
