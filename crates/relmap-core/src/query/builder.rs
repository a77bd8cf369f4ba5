//! Per-query mutable state machine compiling to exactly one SQL statement.
//!
//! A builder accumulates statement kind, predicates, joins, projection,
//! ordering, pagination and a populate tree, then compiles to a single
//! [`Statement`]. Populate fan-out happens after execution, through
//! separate statements issued by the populate engine.

use serde_json::Value as JsonValue;
use tracing::debug;

use crate::codec::codec_for;
use crate::driver::{ExecResult, SqlExecutor, Statement};
use crate::error::{Error, QueryError};
use crate::schema::{ModelMeta, OrderDirection, Registry, RelationStorage, ID_COLUMN};
use crate::value::{Record, Row, SqlValue};

use super::join::{next_alias, Join};
use super::populate::{self, PopulateSpec};
use super::predicate::{
    compile_filter, compile_order_path, parse_order_spec, FilterContext,
};
use super::sql::SqlExpr;

/// The statement a builder compiles to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    /// Row-returning select.
    Select,
    /// Row insertion.
    Insert,
    /// Row update.
    Update,
    /// Row deletion.
    Delete,
    /// Row count.
    Count,
}

/// A single query under construction.
#[derive(Debug)]
pub struct QueryBuilder<'a> {
    registry: &'a Registry,
    uid: String,
    kind: StatementKind,
    table: String,
    alias: String,
    counter: u32,
    projection: Vec<String>,
    raw_projection: Vec<String>,
    raw_only: bool,
    filters: Vec<SqlExpr>,
    joins: Vec<Join>,
    order: Vec<(String, OrderDirection)>,
    group: Vec<String>,
    limit: Option<u64>,
    offset: Option<u64>,
    populate: Option<PopulateSpec>,
    data: Vec<(String, SqlValue)>,
}

impl<'a> QueryBuilder<'a> {
    fn new(registry: &'a Registry, uid: &str, kind: StatementKind) -> Result<Self, QueryError> {
        let model = registry.model(uid)?;
        let table = model.table_name.clone();
        // Writes address the table directly; selects get alias `t0` and a
        // monotonic counter for implicit joins.
        let alias = match kind {
            StatementKind::Select | StatementKind::Count => "t0".to_string(),
            _ => table.clone(),
        };
        Ok(Self {
            registry,
            uid: uid.to_string(),
            kind,
            table,
            alias,
            counter: 1,
            projection: Vec::new(),
            raw_projection: Vec::new(),
            raw_only: false,
            filters: Vec::new(),
            joins: Vec::new(),
            order: Vec::new(),
            group: Vec::new(),
            limit: None,
            offset: None,
            populate: None,
            data: Vec::new(),
        })
    }

    /// Start a select query.
    pub fn select(registry: &'a Registry, uid: &str) -> Result<Self, QueryError> {
        Self::new(registry, uid, StatementKind::Select)
    }

    /// Start an insert.
    pub fn insert(registry: &'a Registry, uid: &str) -> Result<Self, QueryError> {
        Self::new(registry, uid, StatementKind::Insert)
    }

    /// Start an update.
    pub fn update(registry: &'a Registry, uid: &str) -> Result<Self, QueryError> {
        Self::new(registry, uid, StatementKind::Update)
    }

    /// Start a delete.
    pub fn delete(registry: &'a Registry, uid: &str) -> Result<Self, QueryError> {
        Self::new(registry, uid, StatementKind::Delete)
    }

    /// Start a count query.
    pub fn count(registry: &'a Registry, uid: &str) -> Result<Self, QueryError> {
        Self::new(registry, uid, StatementKind::Count)
    }

    fn model(&self) -> &'a ModelMeta {
        // The constructor validated the uid.
        self.registry
            .get(&self.uid)
            .expect("model present in registry")
    }

    /// Add criteria from a declarative filter tree.
    pub fn filter(mut self, criteria: &JsonValue) -> Result<Self, QueryError> {
        let model = self.model();
        let alias = self.alias.clone();
        let mut cx = FilterContext {
            registry: self.registry,
            joins: &mut self.joins,
            counter: &mut self.counter,
        };
        let expr = compile_filter(&mut cx, model, &alias, criteria)?;
        self.filters.push(expr);
        Ok(self)
    }

    /// Project a subset of scalar attributes. The identifier is always kept.
    pub fn fields(mut self, fields: &[&str]) -> Result<Self, QueryError> {
        let model = self.model();
        let mut projection = vec![format!("{}.{ID_COLUMN}", self.alias)];
        for field in fields {
            if *field == ID_COLUMN {
                continue;
            }
            let column = model
                .scalar_column(field)
                .ok_or_else(|| QueryError::UnknownAttribute {
                    model: model.uid.clone(),
                    attribute: (*field).to_string(),
                })?;
            projection.push(format!("{}.{column}", self.alias));
        }
        self.projection = projection;
        Ok(self)
    }

    /// Add an order-by entry (`"title"`, `"title:desc"`, `"author.name"`).
    ///
    /// Relation segments allocate their own joins; only scalar attributes
    /// are sortable.
    pub fn order_by(mut self, spec: &str) -> Result<Self, QueryError> {
        let (path, direction) = parse_order_spec(spec);
        let model = self.model();
        let alias = self.alias.clone();
        let mut cx = FilterContext {
            registry: self.registry,
            joins: &mut self.joins,
            counter: &mut self.counter,
        };
        let column = compile_order_path(&mut cx, model, &alias, path)?;
        self.order.push((column, direction));
        Ok(self)
    }

    /// Limit the number of returned rows.
    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Skip the first `offset` rows.
    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Page-based pagination mapped onto limit/offset. Pages are 1-based.
    pub fn page(mut self, page: u64, page_size: u64) -> Self {
        self.limit = Some(page_size);
        self.offset = Some(page.saturating_sub(1) * page_size);
        self
    }

    /// Set the populate tree from a declarative spec: `true` for all direct
    /// relations, an array of dot paths, or a nested object.
    pub fn populate(mut self, spec: &JsonValue) -> Result<Self, QueryError> {
        let model = self.model();
        let parsed = PopulateSpec::parse(self.registry, model, spec)?;
        self.ensure_populate_columns(&parsed);
        self.populate = Some(parsed);
        Ok(self)
    }

    /// Populate every direct relation.
    pub fn populate_all(mut self) -> Self {
        let parsed = PopulateSpec::all(self.model());
        self.ensure_populate_columns(&parsed);
        self.populate = Some(parsed);
        self
    }

    /// Owning-side foreign keys and discriminators must be projected for
    /// hydration matching even under a narrowed field set.
    fn ensure_populate_columns(&mut self, spec: &PopulateSpec) {
        let model = self.model();
        for (attribute, _) in &spec.entries {
            if let Some(relation) = model.relation(attribute) {
                match &relation.storage {
                    RelationStorage::JoinColumn(jc) => {
                        self.ensure_column(&jc.name);
                    }
                    RelationStorage::MorphColumn(mc) => {
                        self.ensure_column(&mc.id_column);
                        self.ensure_column(&mc.type_column);
                    }
                    _ => {}
                }
            }
        }
    }

    /// Column values for an insert or update.
    pub fn values(mut self, data: Vec<(String, SqlValue)>) -> Self {
        self.data = data;
        self
    }

    pub(crate) fn alias(&self) -> &str {
        &self.alias
    }

    pub(crate) fn next_alias(&mut self) -> String {
        next_alias(&mut self.counter)
    }

    pub(crate) fn add_join(&mut self, join: Join) {
        self.joins.push(join);
    }

    pub(crate) fn raw_select(&mut self, expr: impl Into<String>) {
        self.raw_projection.push(expr.into());
    }

    /// Project only the raw select items, dropping the default `alias.*`.
    pub(crate) fn select_only_raw(&mut self) {
        self.raw_only = true;
    }

    pub(crate) fn group_by(&mut self, column: impl Into<String>) {
        self.group.push(column.into());
    }

    pub(crate) fn order_raw(&mut self, column: impl Into<String>, direction: OrderDirection) {
        self.order.push((column.into(), direction));
    }

    pub(crate) fn push_where(&mut self, expr: SqlExpr) {
        self.filters.push(expr);
    }

    /// Predicate on a raw column of the root table, bypassing attribute
    /// validation. Used by the populate engine for foreign-key columns.
    pub(crate) fn where_in_column(&mut self, column: &str, values: Vec<SqlValue>) {
        let qualified = format!("{}.{column}", self.alias);
        self.filters.push(SqlExpr::is_in(qualified, values));
    }

    pub(crate) fn where_eq_column(&mut self, column: &str, value: SqlValue) {
        let qualified = format!("{}.{column}", self.alias);
        self.filters.push(SqlExpr::eq(qualified, value));
    }

    pub(crate) fn ensure_column(&mut self, column: &str) {
        if self.projection.is_empty() {
            return;
        }
        let qualified = format!("{}.{column}", self.alias);
        if !self.projection.contains(&qualified) {
            self.projection.push(qualified);
        }
    }

    pub(crate) fn set_populate(&mut self, spec: Option<PopulateSpec>) {
        if let Some(spec) = &spec {
            self.ensure_populate_columns(spec);
        }
        self.populate = spec;
    }

    /// Compile the accumulated state into exactly one statement.
    pub fn build(&self) -> Result<Statement, QueryError> {
        match self.kind {
            StatementKind::Select => self.build_select(),
            StatementKind::Count => self.build_count(),
            StatementKind::Insert => self.build_insert(),
            StatementKind::Update => self.build_update(),
            StatementKind::Delete => self.build_delete(),
        }
    }

    fn build_select(&self) -> Result<Statement, QueryError> {
        let mut sql = String::from("SELECT ");
        let mut params = Vec::new();

        // One-to-many joins multiply parent rows; DISTINCT collapses the
        // duplicates. Grouped and raw projections manage their own rows.
        let distinct =
            !self.joins.is_empty() && self.group.is_empty() && self.raw_projection.is_empty();
        if distinct {
            sql.push_str("DISTINCT ");
        }

        if self.raw_only {
            sql.push_str(&self.raw_projection.join(", "));
        } else {
            if self.projection.is_empty() {
                sql.push_str(&format!("{}.*", self.alias));
            } else {
                sql.push_str(&self.projection.join(", "));
            }
            for raw in &self.raw_projection {
                sql.push_str(", ");
                sql.push_str(raw);
            }
        }

        sql.push_str(&format!(" FROM {} AS {}", self.table, self.alias));
        self.render_tail(&mut sql, &mut params);
        Ok(Statement::new(sql, params))
    }

    fn build_count(&self) -> Result<Statement, QueryError> {
        let mut sql = String::from("SELECT ");
        let mut params = Vec::new();

        if self.joins.is_empty() {
            sql.push_str("COUNT(*) AS count");
        } else {
            // Joined rows would inflate the count; count distinct roots.
            sql.push_str(&format!("COUNT(DISTINCT {}.{ID_COLUMN}) AS count", self.alias));
        }

        sql.push_str(&format!(" FROM {} AS {}", self.table, self.alias));
        for join in &self.joins {
            join.render(&mut sql, &mut params);
        }
        self.render_where(&mut sql, &mut params);
        Ok(Statement::new(sql, params))
    }

    fn build_insert(&self) -> Result<Statement, QueryError> {
        if self.data.is_empty() {
            return Err(QueryError::EmptyWrite);
        }
        let columns: Vec<&str> = self.data.iter().map(|(c, _)| c.as_str()).collect();
        let placeholders: Vec<&str> = self.data.iter().map(|_| "?").collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            self.table,
            columns.join(", "),
            placeholders.join(", ")
        );
        let params = self.data.iter().map(|(_, v)| v.clone()).collect();
        Ok(Statement::new(sql, params))
    }

    fn build_update(&self) -> Result<Statement, QueryError> {
        if self.data.is_empty() {
            return Err(QueryError::EmptyWrite);
        }
        self.reject_write_joins()?;
        let mut sql = format!("UPDATE {} SET ", self.table);
        let mut params = Vec::new();
        for (i, (column, value)) in self.data.iter().enumerate() {
            if i > 0 {
                sql.push_str(", ");
            }
            sql.push_str(column);
            sql.push_str(" = ?");
            params.push(value.clone());
        }
        self.render_where(&mut sql, &mut params);
        Ok(Statement::new(sql, params))
    }

    fn build_delete(&self) -> Result<Statement, QueryError> {
        self.reject_write_joins()?;
        let mut sql = format!("DELETE FROM {}", self.table);
        let mut params = Vec::new();
        self.render_where(&mut sql, &mut params);
        Ok(Statement::new(sql, params))
    }

    fn reject_write_joins(&self) -> Result<(), QueryError> {
        if self.joins.is_empty() {
            Ok(())
        } else {
            Err(QueryError::InvalidOperand {
                op: "filters".into(),
                expected: "column criteria without relation traversal in a write statement",
            })
        }
    }

    fn render_where(&self, sql: &mut String, params: &mut Vec<SqlValue>) {
        if self.filters.is_empty() {
            return;
        }
        sql.push_str(" WHERE ");
        SqlExpr::And(self.filters.clone()).render(sql, params);
    }

    fn render_tail(&self, sql: &mut String, params: &mut Vec<SqlValue>) {
        for join in &self.joins {
            join.render(sql, params);
        }
        self.render_where(sql, params);
        if !self.group.is_empty() {
            sql.push_str(" GROUP BY ");
            sql.push_str(&self.group.join(", "));
        }
        if !self.order.is_empty() {
            sql.push_str(" ORDER BY ");
            for (i, (column, direction)) in self.order.iter().enumerate() {
                if i > 0 {
                    sql.push_str(", ");
                }
                sql.push_str(column);
                sql.push(' ');
                sql.push_str(direction.sql());
            }
        }
        if let Some(limit) = self.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        if let Some(offset) = self.offset {
            sql.push_str(&format!(" OFFSET {offset}"));
        }
    }

    /// Execute a select: one statement, rows decoded through the scalar
    /// codecs, then populate fan-out when a populate tree is set.
    pub async fn fetch_all<E: SqlExecutor>(self, exec: &E) -> Result<Vec<Record>, Error> {
        let stmt = self.build()?;
        debug!(model = %self.uid, sql = %stmt.sql, "executing select");
        let rows = exec.query(stmt).await?;

        let model = self.model();
        let mut records = rows
            .into_iter()
            .map(|row| decode_row(model, row))
            .collect::<Result<Vec<_>, _>>()?;

        if let Some(spec) = &self.populate {
            populate::apply(self.registry, &self.uid, &mut records, spec, exec).await?;
        }
        Ok(records)
    }

    /// Execute a select limited to one row.
    pub async fn fetch_one<E: SqlExecutor>(self, exec: &E) -> Result<Option<Record>, Error> {
        let mut records = self.limit(1).fetch_all(exec).await?;
        Ok(if records.is_empty() {
            None
        } else {
            Some(records.remove(0))
        })
    }

    /// Execute a count query.
    pub async fn fetch_count<E: SqlExecutor>(self, exec: &E) -> Result<u64, Error> {
        let stmt = self.build()?;
        let rows = exec.query(stmt).await?;
        let count = rows
            .first()
            .and_then(|row| row.first())
            .and_then(|(_, v)| v.as_int())
            .unwrap_or(0);
        Ok(count.max(0) as u64)
    }

    /// Execute a write statement.
    pub async fn exec<E: SqlExecutor>(self, exec: &E) -> Result<ExecResult, Error> {
        let stmt = self.build()?;
        debug!(model = %self.uid, sql = %stmt.sql, "executing write");
        exec.execute(stmt).await
    }

    /// Execute an insert, reading the generated identifier either from a
    /// `RETURNING` clause or from the driver's last-insert id.
    pub async fn exec_insert<E: SqlExecutor>(
        self,
        exec: &E,
        use_returning: bool,
    ) -> Result<Option<i64>, Error> {
        let mut stmt = self.build()?;
        if use_returning {
            stmt.sql.push_str(&format!(" RETURNING {ID_COLUMN}"));
            let rows = exec.query(stmt).await?;
            Ok(rows
                .first()
                .and_then(|row| row.first())
                .and_then(|(_, v)| v.as_int()))
        } else {
            let result = exec.execute(stmt).await?;
            Ok(result.last_insert_id)
        }
    }
}

/// Decode a driver row into a record: columns backing scalar attributes go
/// through their codec under the attribute name; any other column (foreign
/// keys, discriminators, synthetic keys) passes through raw.
pub(crate) fn decode_row(model: &ModelMeta, row: Row) -> Result<Record, Error> {
    let mut record = Record::new();
    for (column, value) in row {
        match model.scalar_for_column(&column) {
            Some((name, scalar)) => {
                let decoded = codec_for(scalar.scalar).from_db(&value)?;
                record.insert(name.to_string(), decoded);
            }
            None => {
                record.insert(column, value.into_json());
            }
        }
    }
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ModelDef, RelationDef, ScalarType};
    use serde_json::json;

    fn registry() -> Registry {
        Registry::build(vec![
            ModelDef::new("api::article.article", "article")
                .with_scalar("title", ScalarType::String)
                .with_scalar("views", ScalarType::Integer)
                .with_relation("author", RelationDef::many_to_one("api::author.author"))
                .with_relation("tags", RelationDef::many_to_many("api::tag.tag")),
            ModelDef::new("api::author.author", "author").with_scalar("name", ScalarType::String),
            ModelDef::new("api::tag.tag", "tag").with_scalar("label", ScalarType::String),
        ])
        .unwrap()
    }

    #[test]
    fn test_plain_select() {
        let registry = registry();
        let stmt = QueryBuilder::select(&registry, "api::article.article")
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(stmt.sql, "SELECT t0.* FROM articles AS t0");
        assert!(stmt.params.is_empty());
    }

    #[test]
    fn test_select_with_filter_order_and_pagination() {
        let registry = registry();
        let stmt = QueryBuilder::select(&registry, "api::article.article")
            .unwrap()
            .filter(&json!({"views": {"$gt": 10}}))
            .unwrap()
            .order_by("title:desc")
            .unwrap()
            .page(2, 10)
            .build()
            .unwrap();

        assert_eq!(
            stmt.sql,
            "SELECT t0.* FROM articles AS t0 WHERE t0.views > ? ORDER BY t0.title DESC LIMIT 10 OFFSET 10"
        );
        assert_eq!(stmt.params, vec![SqlValue::Int(10)]);
    }

    #[test]
    fn test_join_applies_distinct_workaround() {
        let registry = registry();
        let stmt = QueryBuilder::select(&registry, "api::article.article")
            .unwrap()
            .filter(&json!({"tags": {"label": "rust"}}))
            .unwrap()
            .build()
            .unwrap();

        assert!(stmt.sql.starts_with("SELECT DISTINCT t0.*"));
        assert!(stmt.sql.contains("LEFT JOIN articles_tags_links AS t1"));
        assert!(stmt.sql.contains("LEFT JOIN tags AS t2"));
        assert!(stmt.sql.ends_with("WHERE t2.label = ?"));
    }

    #[test]
    fn test_count_with_join_counts_distinct_roots() {
        let registry = registry();
        let stmt = QueryBuilder::count(&registry, "api::article.article")
            .unwrap()
            .filter(&json!({"author": {"name": "Ann"}}))
            .unwrap()
            .build()
            .unwrap();

        assert!(stmt.sql.starts_with("SELECT COUNT(DISTINCT t0.id) AS count"));
    }

    #[test]
    fn test_fields_projects_subset_and_keeps_id() {
        let registry = registry();
        let stmt = QueryBuilder::select(&registry, "api::article.article")
            .unwrap()
            .fields(&["title"])
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(stmt.sql, "SELECT t0.id, t0.title FROM articles AS t0");
    }

    #[test]
    fn test_populate_projects_owning_join_column() {
        let registry = registry();
        let stmt = QueryBuilder::select(&registry, "api::article.article")
            .unwrap()
            .fields(&["title"])
            .unwrap()
            .populate(&json!(["author"]))
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(
            stmt.sql,
            "SELECT t0.id, t0.title, t0.author_id FROM articles AS t0"
        );
    }

    #[test]
    fn test_populate_rejects_scalar_attribute() {
        let registry = registry();
        let err = QueryBuilder::select(&registry, "api::article.article")
            .unwrap()
            .populate(&json!(["title"]))
            .unwrap_err();
        assert!(matches!(err, QueryError::NotPopulatable { .. }));
    }

    #[test]
    fn test_insert_statement() {
        let registry = registry();
        let stmt = QueryBuilder::insert(&registry, "api::article.article")
            .unwrap()
            .values(vec![
                ("title".into(), SqlValue::Text("A".into())),
                ("author_id".into(), SqlValue::Int(1)),
            ])
            .build()
            .unwrap();
        assert_eq!(
            stmt.sql,
            "INSERT INTO articles (title, author_id) VALUES (?, ?)"
        );
        assert_eq!(stmt.params.len(), 2);
    }

    #[test]
    fn test_empty_insert_is_rejected() {
        let registry = registry();
        let err = QueryBuilder::insert(&registry, "api::article.article")
            .unwrap()
            .build()
            .unwrap_err();
        assert_eq!(err, QueryError::EmptyWrite);
    }

    #[test]
    fn test_update_statement() {
        let registry = registry();
        let stmt = QueryBuilder::update(&registry, "api::article.article")
            .unwrap()
            .values(vec![("title".into(), SqlValue::Text("B".into()))])
            .filter(&json!({"id": 3}))
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(
            stmt.sql,
            "UPDATE articles SET title = ? WHERE articles.id = ?"
        );
        assert_eq!(
            stmt.params,
            vec![SqlValue::Text("B".into()), SqlValue::Int(3)]
        );
    }

    #[test]
    fn test_delete_statement() {
        let registry = registry();
        let stmt = QueryBuilder::delete(&registry, "api::article.article")
            .unwrap()
            .filter(&json!({"id": 3}))
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(stmt.sql, "DELETE FROM articles WHERE articles.id = ?");
    }

    #[test]
    fn test_write_statements_reject_relation_traversal() {
        let registry = registry();
        let err = QueryBuilder::delete(&registry, "api::article.article")
            .unwrap()
            .filter(&json!({"author": {"name": "Ann"}}))
            .unwrap()
            .build()
            .unwrap_err();
        assert!(matches!(err, QueryError::InvalidOperand { .. }));
    }

    #[test]
    fn test_decode_row_through_codecs() {
        let registry = registry();
        let model = registry.get("api::article.article").unwrap();
        let record = decode_row(
            model,
            vec![
                ("id".into(), SqlValue::Int(1)),
                ("title".into(), SqlValue::Text("A".into())),
                ("author_id".into(), SqlValue::Int(9)),
            ],
        )
        .unwrap();

        assert_eq!(record.get("id"), Some(&json!(1)));
        assert_eq!(record.get("title"), Some(&json!("A")));
        // Raw foreign-key column passes through for hydration matching.
        assert_eq!(record.get("author_id"), Some(&json!(9)));
    }

    #[test]
    fn test_unknown_model_is_rejected() {
        let registry = registry();
        let err = QueryBuilder::select(&registry, "api::missing.missing").unwrap_err();
        assert!(matches!(err, QueryError::UnknownModel { .. }));
    }
}
