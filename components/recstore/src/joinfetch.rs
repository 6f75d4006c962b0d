/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Recursive join-fetch: a data-shape directive instructing the query layer
//! to attach related rows to their parents. The SQL side is a single SELECT
//! with LEFT JOINs; the shaping side groups to-many children by the parent
//! pk tuple in the application layer.
//!
//! Alias discipline: the root table is `t`, each join gets `t<n>` in
//! depth-first order, and every node carries an alias-id path
//! (`main_<join-name>_...`) so nested joins can be located during result
//! assembly.
//!
//! Paging over a joined result pages the *parent* row set: the root rows are
//! ranked in a subquery with ROW_NUMBER() over the parent ordering and the
//! outer query filters on the rank, so a page holds whole parents no matter
//! how many joined rows they fan out to.

use crate::catalog::{Catalog, TableSchema};
use crate::error::*;
use crate::predicate::{OrderBy, Predicate};
use crate::query::{column_list, read_record, row_side_is_null, SelectSource};
use crate::records::{value_repr, Record};
use error_support::trace;
use interrupt_support::Interruptee;
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, Row};
use serde_derive::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JoinKind {
    #[serde(rename = "2one")]
    ToOne,
    #[serde(rename = "2many")]
    ToMany,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinFetch {
    pub other_table: String,
    /// Defaults to the parent table of this node; if supplied it must match.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub this_table: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub this_field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub other_field: Option<String>,
    #[serde(rename = "type")]
    pub kind: JoinKind,
    /// The key the joined rows are attached under; defaults to other_table.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Extra predicates on the joined table, attached to the JOIN's
    /// ON-clause rather than the outer WHERE.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join_search: Option<Predicate>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub joins: Vec<JoinFetch>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_by: Option<String>,
}

impl JoinFetch {
    pub fn to_many(other_table: impl Into<String>) -> Self {
        Self::new(other_table, JoinKind::ToMany)
    }

    pub fn to_one(other_table: impl Into<String>) -> Self {
        Self::new(other_table, JoinKind::ToOne)
    }

    fn new(other_table: impl Into<String>, kind: JoinKind) -> Self {
        JoinFetch {
            other_table: other_table.into(),
            this_table: None,
            this_field: None,
            other_field: None,
            kind,
            name: None,
            join_search: None,
            joins: vec![],
            order_by: None,
        }
    }
}

/// One resolved join, in depth-first select-list order. The SQL alias and
/// alias-id path are consumed while the statement is built; result assembly
/// locates each node by its column offset in the same DFS order.
pub(crate) struct JoinNode {
    /// Attachment key in the parent record.
    key: String,
    kind: JoinKind,
    schema: TableSchema,
    col_offset: usize,
    children: Vec<JoinNode>,
}

pub(crate) struct QueryPlan {
    pub sql: String,
    pub params: Vec<SqlValue>,
    root: TableSchema,
    nodes: Vec<JoinNode>,
}

struct PlanBuilder<'a> {
    catalog: &'a Catalog,
    resolve_view: &'a dyn Fn(&str) -> Option<String>,
    select_items: Vec<String>,
    join_sql: String,
    join_params: Vec<SqlValue>,
    order_items: Vec<String>,
    next_alias: usize,
    next_offset: usize,
}

pub(crate) fn build_query(
    catalog: &Catalog,
    resolve_view: &dyn Fn(&str) -> Option<String>,
    table: &str,
    predicate: &Predicate,
    joins: &[JoinFetch],
    order_by: Option<&str>,
    offset: Option<u64>,
    limit: Option<u64>,
) -> Result<QueryPlan> {
    let root = catalog.table(table)?.clone();
    let root_source = SelectSource {
        table: root.name.clone(),
        view_expr: resolve_view(&root.name),
    };

    let root_order = match order_by {
        Some(spec) => OrderBy::parse(spec, &root)?,
        None => OrderBy {
            columns: root.pk.clone(),
            descending: false,
        },
    };

    let mut where_sql = String::new();
    let mut where_params = Vec::new();
    predicate.append_sql(&root, "t", &mut where_sql, &mut where_params)?;

    let mut builder = PlanBuilder {
        catalog,
        resolve_view,
        select_items: vec![column_list(&root, "t")],
        join_sql: String::new(),
        join_params: Vec::new(),
        order_items: Vec::new(),
        next_alias: 1,
        next_offset: root.columns.len(),
    };

    let mut nodes = Vec::with_capacity(joins.len());
    for spec in joins {
        nodes.push(builder.add_join(&root, "t", "main", spec)?);
    }

    let paged = offset.is_some() || limit.is_some();
    let mut sql = String::new();
    let mut params = Vec::new();

    if nodes.is_empty() {
        // Plain query: native LIMIT/OFFSET.
        sql.push_str(&format!(
            "SELECT {} FROM {} WHERE {} ORDER BY {}",
            builder.select_items.join(", "),
            root_source.sql("t"),
            where_sql,
            root_order.to_sql("t"),
        ));
        params.append(&mut where_params);
        if paged {
            sql.push_str(" LIMIT ? OFFSET ?");
            params.push(SqlValue::Integer(limit.map_or(-1, |l| l as i64)));
            params.push(SqlValue::Integer(offset.unwrap_or(0) as i64));
        }
    } else if paged {
        // Rank the parents in a subquery, then join against the page.
        sql.push_str(&format!(
            "SELECT {} FROM (SELECT t.*, ROW_NUMBER() OVER (ORDER BY {}) AS __rank \
             FROM {} WHERE {}) AS t{}",
            builder.select_items.join(", "),
            root_order.to_sql("t"),
            root_source.sql("t"),
            where_sql,
            builder.join_sql,
        ));
        params.append(&mut where_params);
        params.append(&mut builder.join_params);
        let lower = offset.unwrap_or(0) as i64;
        match limit {
            Some(l) => {
                sql.push_str(" WHERE t.__rank > ? AND t.__rank <= ?");
                params.push(SqlValue::Integer(lower));
                params.push(SqlValue::Integer(lower + l as i64));
            }
            None => {
                sql.push_str(" WHERE t.__rank > ?");
                params.push(SqlValue::Integer(lower));
            }
        }
        sql.push_str(" ORDER BY t.__rank");
        for item in &builder.order_items {
            sql.push_str(", ");
            sql.push_str(item);
        }
    } else {
        sql.push_str(&format!(
            "SELECT {} FROM {}{} WHERE {} ORDER BY {}",
            builder.select_items.join(", "),
            root_source.sql("t"),
            builder.join_sql,
            where_sql,
            root_order.to_sql("t"),
        ));
        params.append(&mut builder.join_params);
        params.append(&mut where_params);
        for item in &builder.order_items {
            sql.push_str(", ");
            sql.push_str(item);
        }
    }

    Ok(QueryPlan {
        sql,
        params,
        root,
        nodes,
    })
}

impl<'a> PlanBuilder<'a> {
    fn add_join(
        &mut self,
        parent: &TableSchema,
        parent_alias: &str,
        parent_path: &str,
        spec: &JoinFetch,
    ) -> Result<JoinNode> {
        if let Some(this_table) = &spec.this_table {
            if this_table != &parent.name {
                return Err(Error::InvalidJoinSpec(format!(
                    "thisTable {} does not match the parent table {}",
                    this_table, parent.name
                )));
            }
        }
        let other = self.catalog.table(&spec.other_table)?.clone();
        let (this_field, other_field) = resolve_join_fields(parent, &other, spec)?;

        let alias = format!("t{}", self.next_alias);
        self.next_alias += 1;
        let key = spec
            .name
            .clone()
            .unwrap_or_else(|| spec.other_table.clone());
        let path = format!("{}_{}", parent_path, key);
        trace!("join {} at {} ({})", other.name, alias, path);

        let source = SelectSource {
            table: other.name.clone(),
            view_expr: (self.resolve_view)(&other.name),
        };
        self.join_sql.push_str(&format!(
            " LEFT JOIN {} ON {}.\"{}\" = {}.\"{}\"",
            source.sql(&alias),
            alias,
            other_field,
            parent_alias,
            this_field,
        ));
        if let Some(join_search) = &spec.join_search {
            self.join_sql.push_str(" AND ");
            join_search.append_sql(&other, &alias, &mut self.join_sql, &mut self.join_params)?;
        }

        self.select_items.push(column_list(&other, &alias));
        let col_offset = self.next_offset;
        self.next_offset += other.columns.len();

        // Deterministic row sequence for the children: their orderBy when
        // given, else their pk.
        let child_order = match &spec.order_by {
            Some(spec) => OrderBy::parse(spec, &other)?,
            None => OrderBy {
                columns: other.pk.clone(),
                descending: false,
            },
        };
        self.order_items.push(child_order.to_sql(&alias));

        let mut children = Vec::with_capacity(spec.joins.len());
        for child_spec in &spec.joins {
            children.push(self.add_join(&other, &alias, &path, child_spec)?);
        }

        Ok(JoinNode {
            key,
            kind: spec.kind,
            schema: other,
            col_offset,
            children,
        })
    }
}

/// Work out which columns link parent and child: explicit fields when both
/// are given, FK metadata otherwise (this->other first, then the reverse).
fn resolve_join_fields(
    parent: &TableSchema,
    other: &TableSchema,
    spec: &JoinFetch,
) -> Result<(String, String)> {
    match (&spec.this_field, &spec.other_field) {
        (Some(this_field), Some(other_field)) => {
            parent.check_column(this_field)?;
            other.check_column(other_field)?;
            Ok((this_field.clone(), other_field.clone()))
        }
        (None, None) => {
            if let Some(fk) = parent.fk_to(&other.name) {
                Ok((fk.this_column.clone(), fk.target_column.clone()))
            } else if let Some(fk) = other.fk_to(&parent.name) {
                Ok((fk.target_column.clone(), fk.this_column.clone()))
            } else {
                Err(Error::CannotResolveJoin {
                    this: parent.name.clone(),
                    other: other.name.clone(),
                })
            }
        }
        _ => Err(Error::InvalidJoinSpec(format!(
            "join {} -> {}: thisField and otherField must be given together",
            parent.name, other.name
        ))),
    }
}

pub(crate) fn run_query(
    conn: &Connection,
    plan: &QueryPlan,
    scope: &dyn Interruptee,
) -> Result<Vec<Record>> {
    let mut stmt = conn.prepare(&plan.sql)?;
    let mut rows = stmt.query(rusqlite::params_from_iter(plan.params.iter()))?;

    let mut out: Vec<Record> = Vec::new();
    let mut index: std::collections::HashMap<String, usize> = std::collections::HashMap::new();

    while let Some(row) = rows.next()? {
        scope.err_if_interrupted()?;
        let root_rec = read_record(row, &plan.root, 0)?;
        let key = grouping_key(&plan.root, &root_rec);
        let idx = match index.get(&key) {
            Some(idx) => *idx,
            None => {
                let mut rec = root_rec;
                init_child_keys(&plan.nodes, &mut rec);
                out.push(rec);
                index.insert(key, out.len() - 1);
                out.len() - 1
            }
        };
        for node in &plan.nodes {
            attach(node, row, &mut out[idx])?;
        }
    }
    Ok(out)
}

/// Group rows by the parent's pk tuple. NULLs can't occur on the root side,
/// but a textual sentinel keeps this total anyway.
fn grouping_key(schema: &TableSchema, record: &Record) -> String {
    schema
        .pk
        .iter()
        .map(|c| {
            record
                .get(c)
                .and_then(value_repr)
                .unwrap_or_else(|| "\u{0}null".into())
        })
        .collect::<Vec<_>>()
        .join("\u{0}")
}

fn init_child_keys(nodes: &[JoinNode], record: &mut Record) {
    for node in nodes {
        match node.kind {
            JoinKind::ToMany => {
                record.insert(node.key.clone(), Value::Array(vec![]));
            }
            JoinKind::ToOne => {
                record.insert(node.key.clone(), Value::Null);
            }
        }
    }
}

fn attach(node: &JoinNode, row: &Row<'_>, parent: &mut Record) -> Result<()> {
    if row_side_is_null(row, &node.schema, node.col_offset)? {
        return Ok(());
    }
    let mut child = read_record(row, &node.schema, node.col_offset)?;
    init_child_keys(&node.children, &mut child);
    let child_key = grouping_key(&node.schema, &child);

    let slot = parent
        .get_mut(&node.key)
        .expect("child keys initialized with the parent");
    let child_obj: &mut Record = match node.kind {
        JoinKind::ToMany => {
            let arr = slot.as_array_mut().expect("2many slots are arrays");
            let pos = arr.iter().position(|v| {
                v.as_object()
                    .map_or(false, |o| grouping_key(&node.schema, o) == child_key)
            });
            let pos = match pos {
                Some(pos) => pos,
                None => {
                    arr.push(Value::Object(child));
                    arr.len() - 1
                }
            };
            arr[pos].as_object_mut().expect("pushed as object")
        }
        JoinKind::ToOne => {
            if slot.is_null() {
                *slot = Value::Object(child);
            }
            // else: keep the first matching row - the ORDER BY makes "first"
            // deterministic.
            slot.as_object_mut().expect("set as object")
        }
    };
    for grandchild in &node.children {
        attach(grandchild, row, child_obj)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::SchemaCatalog;
    use interrupt_support::NeverInterrupts;
    use serde_json::json;

    fn setup() -> (Connection, SchemaCatalog) {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE orders (id TEXT PRIMARY KEY, customer TEXT);
             CREATE TABLE lines (id INTEGER PRIMARY KEY, order_id TEXT REFERENCES orders(id), sku TEXT, qty INTEGER);
             CREATE TABLE products (sku TEXT PRIMARY KEY, label TEXT);
             INSERT INTO orders VALUES ('o1', 'ada'), ('o2', 'grace'), ('o3', 'alan');
             INSERT INTO lines VALUES (1, 'o1', 'p1', 2), (2, 'o1', 'p2', 1), (3, 'o2', 'p1', 5);
             INSERT INTO products VALUES ('p1', 'widget'), ('p2', 'gadget');",
        )
        .unwrap();
        (conn, SchemaCatalog::new(vec![]))
    }

    fn no_views(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_plain_query() {
        let (conn, catalog) = setup();
        let cat = catalog.load(&conn).unwrap();
        let plan = build_query(
            &cat,
            &no_views,
            "orders",
            &Predicate::all(),
            &[],
            Some("id desc"),
            None,
            Some(2),
        )
        .unwrap();
        let rows = run_query(&conn, &plan, &NeverInterrupts).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get("id"), Some(&json!("o3")));
        assert_eq!(rows[1].get("id"), Some(&json!("o2")));
    }

    #[test]
    fn test_join_to_many_grouping() {
        let (conn, catalog) = setup();
        let cat = catalog.load(&conn).unwrap();
        let plan = build_query(
            &cat,
            &no_views,
            "orders",
            &Predicate::all(),
            &[JoinFetch::to_many("lines")],
            None,
            None,
            None,
        )
        .unwrap();
        let rows = run_query(&conn, &plan, &NeverInterrupts).unwrap();
        assert_eq!(rows.len(), 3);
        let o1 = &rows[0];
        assert_eq!(o1.get("id"), Some(&json!("o1")));
        let lines = o1.get("lines").unwrap().as_array().unwrap();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].get("sku"), Some(&json!("p1")));
        // Order with no lines gets an empty list, not a missing key.
        let o3 = &rows[2];
        assert_eq!(o3.get("lines"), Some(&json!([])));
    }

    #[test]
    fn test_join_paging_pages_parents() {
        let (conn, catalog) = setup();
        let cat = catalog.load(&conn).unwrap();
        // 2 orders per page, however many joined rows they have.
        let plan = build_query(
            &cat,
            &no_views,
            "orders",
            &Predicate::all(),
            &[JoinFetch::to_many("lines")],
            Some("id asc"),
            Some(0),
            Some(2),
        )
        .unwrap();
        let rows = run_query(&conn, &plan, &NeverInterrupts).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get("id"), Some(&json!("o1")));
        assert_eq!(
            rows[0].get("lines").unwrap().as_array().unwrap().len(),
            2
        );
        assert_eq!(rows[1].get("id"), Some(&json!("o2")));

        let plan = build_query(
            &cat,
            &no_views,
            "orders",
            &Predicate::all(),
            &[JoinFetch::to_many("lines")],
            Some("id asc"),
            Some(2),
            Some(2),
        )
        .unwrap();
        let rows = run_query(&conn, &plan, &NeverInterrupts).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("id"), Some(&json!("o3")));
    }

    #[test]
    fn test_nested_joins_and_to_one() {
        let (conn, catalog) = setup();
        let cat = catalog.load(&conn).unwrap();
        let mut lines = JoinFetch::to_many("lines");
        let mut product = JoinFetch::to_one("products");
        product.this_field = Some("sku".into());
        product.other_field = Some("sku".into());
        product.name = Some("product".into());
        lines.joins = vec![product];
        let plan = build_query(
            &cat,
            &no_views,
            "orders",
            &Predicate::from_json(&json!({"id": "o1"})).unwrap(),
            &[lines],
            None,
            None,
            None,
        )
        .unwrap();
        let rows = run_query(&conn, &plan, &NeverInterrupts).unwrap();
        assert_eq!(rows.len(), 1);
        let lines = rows[0].get("lines").unwrap().as_array().unwrap();
        assert_eq!(
            lines[0].get("product").unwrap().get("label"),
            Some(&json!("widget"))
        );
    }

    #[test]
    fn test_join_search_lands_in_on_clause() {
        let (conn, catalog) = setup();
        let cat = catalog.load(&conn).unwrap();
        let mut lines = JoinFetch::to_many("lines");
        lines.join_search =
            Some(Predicate::from_json(&json!({"qty": {"op": ">", "value": 1}})).unwrap());
        let plan = build_query(
            &cat,
            &no_views,
            "orders",
            &Predicate::all(),
            &[lines],
            None,
            None,
            None,
        )
        .unwrap();
        let rows = run_query(&conn, &plan, &NeverInterrupts).unwrap();
        // All three orders survive (ON-clause filter, not WHERE), o1 keeps
        // only its qty=2 line.
        assert_eq!(rows.len(), 3);
        let o1_lines = rows[0].get("lines").unwrap().as_array().unwrap();
        assert_eq!(o1_lines.len(), 1);
        assert_eq!(o1_lines[0].get("qty"), Some(&json!(2)));
    }

    #[test]
    fn test_unresolvable_join_rejected() {
        let (conn, catalog) = setup();
        let cat = catalog.load(&conn).unwrap();
        assert!(matches!(
            build_query(
                &cat,
                &no_views,
                "orders",
                &Predicate::all(),
                &[JoinFetch::to_many("products")],
                None,
                None,
                None,
            ),
            Err(Error::CannotResolveJoin { .. })
        ));

        let mut half = JoinFetch::to_many("lines");
        half.this_field = Some("id".into());
        assert!(matches!(
            build_query(
                &cat,
                &no_views,
                "orders",
                &Predicate::all(),
                &[half],
                None,
                None,
                None,
            ),
            Err(Error::InvalidJoinSpec(_))
        ));
    }
}
