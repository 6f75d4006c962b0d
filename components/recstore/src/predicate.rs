/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The example-based search grammar, represented as a recursive tagged value
//! so the SQL builder never does ad-hoc string parsing. JSON shapes accepted
//! at the boundary:
//!
//! - `{"col": v}` - equals (IS NULL when v is null)
//! - `{"col": [v1, v2]}` - IN
//! - `{"col": "%x%"}` - case-insensitive LIKE (any string containing `%`)
//! - `{"col": {"op": ">", "value": v}}` - explicit operator
//! - `{"$and": [p, ...]}` / `{"$or": [p, ...]}` - boolean trees

use crate::catalog::TableSchema;
use crate::error::*;
use crate::records::{json_to_sql, value_repr, Record};
use rusqlite::types::Value as SqlValue;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Field { column: String, op: FieldOp },
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldOp {
    Eq(Value),
    Ne(Value),
    Gt(Value),
    Ge(Value),
    Lt(Value),
    Le(Value),
    In(Vec<Value>),
    NotIn(Vec<Value>),
    Like(String),
    Between(Value, Value),
    IsNull,
    IsNotNull,
}

impl Predicate {
    /// Matches every row.
    pub fn all() -> Predicate {
        Predicate::And(vec![])
    }

    pub fn field(column: impl Into<String>, op: FieldOp) -> Predicate {
        Predicate::Field {
            column: column.into(),
            op,
        }
    }

    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Predicate {
        Self::field(column, FieldOp::Eq(value.into()))
    }

    pub fn gt(column: impl Into<String>, value: impl Into<Value>) -> Predicate {
        Self::field(column, FieldOp::Gt(value.into()))
    }

    /// Equality on every column of `record` (used for pk lookups).
    pub fn all_of(record: &Record) -> Predicate {
        Predicate::And(
            record
                .iter()
                .map(|(k, v)| Predicate::eq(k.clone(), v.clone()))
                .collect(),
        )
    }

    /// Parse the JSON form described in the module docs.
    pub fn from_json(v: &Value) -> Result<Predicate> {
        let obj = v
            .as_object()
            .ok_or_else(|| Error::InvalidPredicate("conditions must be an object".into()))?;
        let mut terms = Vec::with_capacity(obj.len());
        for (key, value) in obj {
            match key.as_str() {
                "$and" => terms.push(Predicate::And(Self::parse_list(value, "$and")?)),
                "$or" => terms.push(Predicate::Or(Self::parse_list(value, "$or")?)),
                column => terms.push(Predicate::Field {
                    column: column.to_string(),
                    op: FieldOp::from_json(column, value)?,
                }),
            }
        }
        Ok(match terms.len() {
            1 => terms.pop().expect("len checked"),
            _ => Predicate::And(terms),
        })
    }

    fn parse_list(v: &Value, ctx: &str) -> Result<Vec<Predicate>> {
        let list = v
            .as_array()
            .ok_or_else(|| Error::InvalidPredicate(format!("{} takes an array", ctx)))?;
        list.iter().map(Predicate::from_json).collect()
    }

    /// Render into a SQL fragment against `alias`, validating every column
    /// against the table schema and pushing bind values onto `params`.
    pub(crate) fn append_sql(
        &self,
        schema: &TableSchema,
        alias: &str,
        sql: &mut String,
        params: &mut Vec<SqlValue>,
    ) -> Result<()> {
        match self {
            Predicate::And(terms) => append_tree(terms, " AND ", "1", schema, alias, sql, params),
            Predicate::Or(terms) => append_tree(terms, " OR ", "0", schema, alias, sql, params),
            Predicate::Field { column, op } => {
                schema.check_column(column)?;
                op.append_sql(&format!("{}.\"{}\"", alias, column), sql, params);
                Ok(())
            }
        }
    }

    /// Reference interpreter: does `record` satisfy this predicate? This is
    /// deliberately independent from the SQL path so the two can be checked
    /// against each other.
    pub fn matches(&self, record: &Record) -> bool {
        match self {
            Predicate::And(terms) => terms.iter().all(|t| t.matches(record)),
            Predicate::Or(terms) => terms.iter().any(|t| t.matches(record)),
            Predicate::Field { column, op } => {
                let value = record.get(column).unwrap_or(&Value::Null);
                op.matches(value)
            }
        }
    }
}

fn non_empty_list(column: &str, value: Value) -> Result<Vec<Value>> {
    match value {
        Value::Array(items) if !items.is_empty() => Ok(items),
        _ => Err(Error::EmptyInList(column.to_string())),
    }
}

fn append_tree(
    terms: &[Predicate],
    sep: &str,
    empty: &str,
    schema: &TableSchema,
    alias: &str,
    sql: &mut String,
    params: &mut Vec<SqlValue>,
) -> Result<()> {
    if terms.is_empty() {
        sql.push_str(empty);
        return Ok(());
    }
    sql.push('(');
    for (i, term) in terms.iter().enumerate() {
        if i != 0 {
            sql.push_str(sep);
        }
        term.append_sql(schema, alias, sql, params)?;
    }
    sql.push(')');
    Ok(())
}

impl FieldOp {
    fn from_json(column: &str, v: &Value) -> Result<FieldOp> {
        Ok(match v {
            Value::Null => FieldOp::IsNull,
            Value::Array(items) => {
                if items.is_empty() {
                    return Err(Error::EmptyInList(column.to_string()));
                }
                FieldOp::In(items.clone())
            }
            Value::String(s) if s.contains('%') => FieldOp::Like(s.clone()),
            Value::Object(obj) => {
                let op = obj
                    .get("op")
                    .and_then(Value::as_str)
                    .ok_or_else(|| Error::InvalidPredicate(format!("{}: missing op", column)))?;
                let value = obj.get("value").cloned().unwrap_or(Value::Null);
                Self::from_op(column, op, value)?
            }
            v => FieldOp::Eq(v.clone()),
        })
    }

    fn from_op(column: &str, op: &str, value: Value) -> Result<FieldOp> {
        Ok(match op.to_lowercase().as_str() {
            "=" => match value {
                Value::Null => FieldOp::IsNull,
                v => FieldOp::Eq(v),
            },
            "<>" | "!=" => match value {
                Value::Null => FieldOp::IsNotNull,
                v => FieldOp::Ne(v),
            },
            ">" => FieldOp::Gt(value),
            ">=" => FieldOp::Ge(value),
            "<" => FieldOp::Lt(value),
            "<=" => FieldOp::Le(value),
            "in" => FieldOp::In(non_empty_list(column, value)?),
            "not in" => FieldOp::NotIn(non_empty_list(column, value)?),
            "between" => {
                let mut items = match value {
                    Value::Array(items) if items.len() == 2 => items,
                    _ => return Err(Error::InvalidBetween(column.to_string())),
                };
                let high = items.pop().expect("len checked");
                let low = items.pop().expect("len checked");
                FieldOp::Between(low, high)
            }
            "ilike" | "like" => match value {
                Value::String(s) => FieldOp::Like(s),
                _ => {
                    return Err(Error::InvalidPredicate(format!(
                        "{}: like takes a string",
                        column
                    )))
                }
            },
            other => return Err(Error::UnknownOperator(other.to_string())),
        })
    }

    fn append_sql(&self, column_sql: &str, sql: &mut String, params: &mut Vec<SqlValue>) {
        match self {
            FieldOp::Eq(v) => {
                sql.push_str(column_sql);
                sql.push_str(" = ?");
                params.push(json_to_sql(v));
            }
            FieldOp::Ne(v) => {
                sql.push_str(column_sql);
                sql.push_str(" <> ?");
                params.push(json_to_sql(v));
            }
            FieldOp::Gt(v) => {
                sql.push_str(column_sql);
                sql.push_str(" > ?");
                params.push(json_to_sql(v));
            }
            FieldOp::Ge(v) => {
                sql.push_str(column_sql);
                sql.push_str(" >= ?");
                params.push(json_to_sql(v));
            }
            FieldOp::Lt(v) => {
                sql.push_str(column_sql);
                sql.push_str(" < ?");
                params.push(json_to_sql(v));
            }
            FieldOp::Le(v) => {
                sql.push_str(column_sql);
                sql.push_str(" <= ?");
                params.push(json_to_sql(v));
            }
            FieldOp::In(items) => {
                sql.push_str(column_sql);
                sql.push_str(&format!(
                    " IN ({})",
                    sql_support::repeat_sql_vars(items.len())
                ));
                params.extend(items.iter().map(json_to_sql));
            }
            FieldOp::NotIn(items) => {
                sql.push_str(column_sql);
                sql.push_str(&format!(
                    " NOT IN ({})",
                    sql_support::repeat_sql_vars(items.len())
                ));
                params.extend(items.iter().map(json_to_sql));
            }
            FieldOp::Like(pattern) => {
                // SQLite LIKE is case-insensitive for ASCII, which is the
                // "ilike" semantics we document.
                sql.push_str(column_sql);
                sql.push_str(" LIKE ?");
                params.push(SqlValue::Text(pattern.clone()));
            }
            FieldOp::Between(low, high) => {
                sql.push_str(column_sql);
                sql.push_str(" BETWEEN ? AND ?");
                params.push(json_to_sql(low));
                params.push(json_to_sql(high));
            }
            FieldOp::IsNull => {
                sql.push_str(column_sql);
                sql.push_str(" IS NULL");
            }
            FieldOp::IsNotNull => {
                sql.push_str(column_sql);
                sql.push_str(" IS NOT NULL");
            }
        }
    }

    fn matches(&self, value: &Value) -> bool {
        match self {
            FieldOp::Eq(expect) => loose_eq(value, expect),
            FieldOp::Ne(expect) => !value.is_null() && !loose_eq(value, expect),
            FieldOp::Gt(expect) => compare(value, expect).map_or(false, |o| o.is_gt()),
            FieldOp::Ge(expect) => compare(value, expect).map_or(false, |o| o.is_ge()),
            FieldOp::Lt(expect) => compare(value, expect).map_or(false, |o| o.is_lt()),
            FieldOp::Le(expect) => compare(value, expect).map_or(false, |o| o.is_le()),
            FieldOp::In(items) => items.iter().any(|i| loose_eq(value, i)),
            FieldOp::NotIn(items) => {
                !value.is_null() && !items.iter().any(|i| loose_eq(value, i))
            }
            FieldOp::Like(pattern) => match value {
                Value::String(s) => like_match(pattern, s),
                _ => false,
            },
            FieldOp::Between(low, high) => {
                compare(value, low).map_or(false, |o| o.is_ge())
                    && compare(value, high).map_or(false, |o| o.is_le())
            }
            FieldOp::IsNull => value.is_null(),
            FieldOp::IsNotNull => !value.is_null(),
        }
    }
}

/// Equality the way the SQL comparison behaves: numbers compare numerically,
/// everything else on its textual form.
fn loose_eq(a: &Value, b: &Value) -> bool {
    if a.is_null() || b.is_null() {
        return false;
    }
    if let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) {
        return x == y;
    }
    value_repr(a) == value_repr(b)
}

fn compare(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    if a.is_null() || b.is_null() {
        return None;
    }
    if let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) {
        return x.partial_cmp(&y);
    }
    Some(value_repr(a)?.cmp(&value_repr(b)?))
}

/// A tiny case-insensitive LIKE interpreter (`%` = any run, `_` = any char)
/// for the in-memory reference path.
fn like_match(pattern: &str, s: &str) -> bool {
    fn inner(p: &[char], s: &[char]) -> bool {
        match p.first() {
            None => s.is_empty(),
            Some('%') => (0..=s.len()).any(|i| inner(&p[1..], &s[i..])),
            Some('_') => !s.is_empty() && inner(&p[1..], &s[1..]),
            Some(c) => s
                .first()
                .map_or(false, |sc| sc == c && inner(&p[1..], &s[1..])),
        }
    }
    let p: Vec<char> = pattern.to_lowercase().chars().collect();
    let s: Vec<char> = s.to_lowercase().chars().collect();
    inner(&p, &s)
}

impl<'de> Deserialize<'de> for Predicate {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let v = Value::deserialize(deserializer)?;
        Predicate::from_json(&v).map_err(serde::de::Error::custom)
    }
}

impl Serialize for Predicate {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl Predicate {
    /// Back to the JSON wire form. The output always parses back to an
    /// equivalent predicate.
    pub fn to_json(&self) -> Value {
        match self {
            Predicate::And(terms) => {
                serde_json::json!({ "$and": terms.iter().map(|t| t.to_json()).collect::<Vec<_>>() })
            }
            Predicate::Or(terms) => {
                serde_json::json!({ "$or": terms.iter().map(|t| t.to_json()).collect::<Vec<_>>() })
            }
            Predicate::Field { column, op } => {
                let body = match op {
                    FieldOp::Eq(v) => serde_json::json!({ "op": "=", "value": v }),
                    FieldOp::Ne(v) => serde_json::json!({ "op": "<>", "value": v }),
                    FieldOp::Gt(v) => serde_json::json!({ "op": ">", "value": v }),
                    FieldOp::Ge(v) => serde_json::json!({ "op": ">=", "value": v }),
                    FieldOp::Lt(v) => serde_json::json!({ "op": "<", "value": v }),
                    FieldOp::Le(v) => serde_json::json!({ "op": "<=", "value": v }),
                    FieldOp::In(items) => serde_json::json!({ "op": "in", "value": items }),
                    FieldOp::NotIn(items) => serde_json::json!({ "op": "not in", "value": items }),
                    FieldOp::Like(p) => serde_json::json!({ "op": "ilike", "value": p }),
                    FieldOp::Between(l, h) => {
                        serde_json::json!({ "op": "between", "value": [l, h] })
                    }
                    FieldOp::IsNull => serde_json::json!({ "op": "=", "value": null }),
                    FieldOp::IsNotNull => serde_json::json!({ "op": "<>", "value": null }),
                };
                serde_json::json!({ column: body })
            }
        }
    }
}

/// A parsed, validated order-by clause. The grammar is a comma-separated
/// column list with one optional trailing direction per column; mixing ASC
/// and DESC in one clause is rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBy {
    pub columns: Vec<String>,
    pub descending: bool,
}

impl OrderBy {
    pub fn parse(spec: &str, schema: &TableSchema) -> Result<OrderBy> {
        let mut columns = Vec::new();
        let mut direction: Option<bool> = None;
        for term in spec.split(',') {
            let term = term.trim();
            if term.is_empty() {
                return Err(Error::InvalidOrderBy(spec.to_string()));
            }
            let mut parts = term.split_whitespace();
            let column = parts.next().ok_or_else(|| Error::InvalidOrderBy(spec.into()))?;
            let this_desc = match parts.next().map(str::to_lowercase).as_deref() {
                None => None,
                Some("asc") => Some(false),
                Some("desc") => Some(true),
                Some(_) => return Err(Error::InvalidOrderBy(spec.to_string())),
            };
            if parts.next().is_some() {
                return Err(Error::InvalidOrderBy(spec.to_string()));
            }
            schema.check_column(column)?;
            if let Some(d) = this_desc {
                match direction {
                    None => direction = Some(d),
                    Some(prev) if prev != d => {
                        return Err(Error::MixedOrderDirections(spec.to_string()))
                    }
                    Some(_) => {}
                }
            }
            columns.push(column.to_string());
        }
        Ok(OrderBy {
            columns,
            descending: direction.unwrap_or(false),
        })
    }

    pub(crate) fn to_sql(&self, alias: &str) -> String {
        let dir = if self.descending { " DESC" } else { "" };
        self.columns
            .iter()
            .map(|c| format!("{}.\"{}\"{}", alias, c, dir))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ColumnSchema;
    use serde_json::json;

    fn schema() -> TableSchema {
        TableSchema {
            name: "foo".into(),
            columns: vec![
                ColumnSchema::new("id", "TEXT"),
                ColumnSchema::new("name", "TEXT"),
                ColumnSchema::new("qty", "INTEGER"),
            ],
            pk: vec!["id".into()],
            fks: vec![],
            view_of: vec![],
        }
    }

    fn sql_of(p: &Predicate) -> (String, usize) {
        let mut sql = String::new();
        let mut params = Vec::new();
        p.append_sql(&schema(), "t", &mut sql, &mut params).unwrap();
        (sql, params.len())
    }

    #[test]
    fn test_parse_scalar_and_null() {
        let p = Predicate::from_json(&json!({"name": "x", "qty": null})).unwrap();
        assert_eq!(
            p,
            Predicate::And(vec![
                Predicate::field("name", FieldOp::Eq(json!("x"))),
                Predicate::field("qty", FieldOp::IsNull),
            ])
        );
    }

    #[test]
    fn test_parse_like_in_between() {
        let p = Predicate::from_json(&json!({"name": "%smith%"})).unwrap();
        assert_eq!(p, Predicate::field("name", FieldOp::Like("%smith%".into())));

        let p = Predicate::from_json(&json!({"qty": [1, 2, 3]})).unwrap();
        assert_eq!(
            p,
            Predicate::field("qty", FieldOp::In(vec![json!(1), json!(2), json!(3)]))
        );

        let p =
            Predicate::from_json(&json!({"qty": {"op": "between", "value": [1, 10]}})).unwrap();
        assert_eq!(p, Predicate::field("qty", FieldOp::Between(json!(1), json!(10))));
    }

    #[test]
    fn test_parse_bool_tree() {
        let p = Predicate::from_json(&json!({
            "$or": [{"name": "a"}, {"$and": [{"qty": {"op": ">", "value": 2}}, {"name": "b"}]}]
        }))
        .unwrap();
        let (sql, n) = sql_of(&p);
        assert_eq!(sql, "(t.\"name\" = ? OR (t.\"qty\" > ? AND t.\"name\" = ?))");
        assert_eq!(n, 3);
    }

    #[test]
    fn test_parse_rejects() {
        assert!(matches!(
            Predicate::from_json(&json!({"qty": []})),
            Err(Error::EmptyInList(_))
        ));
        assert!(matches!(
            Predicate::from_json(&json!({"qty": {"op": "in", "value": []}})),
            Err(Error::EmptyInList(_))
        ));
        assert!(matches!(
            Predicate::from_json(&json!({"qty": {"op": "between", "value": [1]}})),
            Err(Error::InvalidBetween(_))
        ));
        assert!(matches!(
            Predicate::from_json(&json!({"qty": {"op": "~", "value": 1}})),
            Err(Error::UnknownOperator(_))
        ));
    }

    #[test]
    fn test_unknown_column_rejected_at_build() {
        let p = Predicate::from_json(&json!({"nope": 1})).unwrap();
        let mut sql = String::new();
        let mut params = Vec::new();
        assert!(matches!(
            p.append_sql(&schema(), "t", &mut sql, &mut params),
            Err(Error::UnknownColumn { .. })
        ));
    }

    #[test]
    fn test_empty_trees() {
        assert_eq!(sql_of(&Predicate::all()).0, "1");
        assert_eq!(sql_of(&Predicate::Or(vec![])).0, "0");
    }

    #[test]
    fn test_matches_reference() {
        let rec: Record =
            serde_json::from_value(json!({"id": "a", "name": "Smith", "qty": 5})).unwrap();
        let check = |j: Value| Predicate::from_json(&j).unwrap().matches(&rec);
        assert!(check(json!({"name": "Smith"})));
        assert!(check(json!({"name": "%mit%"})));
        assert!(!check(json!({"name": "%zzz%"})));
        assert!(check(json!({"qty": {"op": ">", "value": 4}})));
        assert!(!check(json!({"qty": {"op": ">", "value": 5}})));
        assert!(check(json!({"qty": {"op": "between", "value": [1, 5]}})));
        assert!(check(json!({"qty": [4, 5]})));
        assert!(check(json!({"$or": [{"name": "x"}, {"qty": 5}]})));
        assert!(!check(json!({"$or": [{"name": "x"}, {"qty": 6}]})));
    }

    #[test]
    fn test_order_by() {
        let s = schema();
        let o = OrderBy::parse("name asc, qty", &s).unwrap();
        assert_eq!(o.columns, vec!["name", "qty"]);
        assert!(!o.descending);
        assert_eq!(o.to_sql("t"), "t.\"name\", t.\"qty\"");

        let o = OrderBy::parse("name desc", &s).unwrap();
        assert!(o.descending);

        assert!(matches!(
            OrderBy::parse("name asc, qty desc", &s),
            Err(Error::MixedOrderDirections(_))
        ));
        assert!(matches!(
            OrderBy::parse("nope", &s),
            Err(Error::UnknownColumn { .. })
        ));
    }

    #[test]
    fn test_json_roundtrip() {
        let p = Predicate::from_json(&json!({
            "$or": [{"name": "%x%"}, {"qty": {"op": "not in", "value": [1, 2]}}]
        }))
        .unwrap();
        let back = Predicate::from_json(&p.to_json()).unwrap();
        assert_eq!(p, back);
    }
}
