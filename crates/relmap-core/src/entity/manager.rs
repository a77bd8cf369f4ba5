//! Entity manager: CRUD orchestration over the query builder, the relation
//! writer, and the lifecycle hooks.
//!
//! Every operation takes an explicit [`Conn`] scope; [`EntityManager::conn`]
//! is the thin "use the root driver" helper for the outermost boundary.
//! Multi-statement operations (create with relations, update, delete) are
//! not self-wrapped in a transaction — callers open one around the whole
//! call via [`crate::tx::with_transaction`] when they need atomicity.

use serde_json::{Map, Value as JsonValue};
use tracing::debug;

use crate::codec::codec_for;
use crate::driver::SqlDriver;
use crate::error::{Error, QueryError};
use crate::lifecycle::{Action, Lifecycle, LifecycleEvent};
use crate::query::QueryBuilder;
use crate::schema::{naming, Attribute, ModelMeta, Registry, RelationStorage, ScalarAttribute, ScalarType};
use crate::tx::Conn;
use crate::value::{Record, SqlValue};

use super::relations::{self, RelationMutation};

/// Column values and deferred relation operations produced from one write
/// payload.
struct WriteSet {
    columns: Vec<(String, SqlValue)>,
    /// Unique foreign-key columns whose previous holder must be cleared
    /// before this row claims the value.
    evictions: Vec<(String, i64)>,
    ops: Vec<(String, RelationMutation)>,
}

/// CRUD surface over a compiled registry and a SQL driver.
pub struct EntityManager<'a, D: SqlDriver> {
    registry: &'a Registry,
    driver: &'a D,
    hooks: Option<&'a dyn Lifecycle>,
}

impl<'a, D: SqlDriver> EntityManager<'a, D> {
    /// Create a manager over `registry` and `driver`.
    pub fn new(registry: &'a Registry, driver: &'a D) -> Self {
        Self {
            registry,
            driver,
            hooks: None,
        }
    }

    /// Install lifecycle hooks invoked around every operation.
    pub fn with_hooks(mut self, hooks: &'a dyn Lifecycle) -> Self {
        self.hooks = Some(hooks);
        self
    }

    /// The compiled registry this manager reads.
    pub fn registry(&self) -> &'a Registry {
        self.registry
    }

    /// Root connection scope, for callers outside any transaction.
    pub fn conn(&self) -> Conn<'a, D> {
        Conn::Driver(self.driver)
    }

    fn before(&self, action: Action, uid: &str, params: JsonValue) -> Result<LifecycleEvent, Error> {
        let mut event = LifecycleEvent::new(action, uid, params);
        if let Some(hooks) = self.hooks {
            hooks.before(&mut event)?;
        }
        Ok(event)
    }

    fn after(&self, event: &mut LifecycleEvent, result: Option<&JsonValue>) -> Result<(), Error> {
        if let Some(hooks) = self.hooks {
            hooks.after(event, result)?;
        }
        Ok(())
    }

    /// Create an entity. `params` is `{data, populate?}`; the returned
    /// record reflects the stored row with relations applied.
    pub async fn create(
        &self,
        conn: Conn<'_, D>,
        uid: &str,
        params: JsonValue,
    ) -> Result<Record, Error> {
        let model = self.registry.model(uid)?;
        let mut event = self.before(Action::Create, uid, params)?;
        let data = take_data(&event.params)?;
        let write = split_input(model, &data, true)?;

        for (column, value) in &write.evictions {
            relations::evict_column_holder(&conn, &model.table_name, column, *value).await?;
        }
        let inserted = QueryBuilder::insert(self.registry, uid)?
            .values(write.columns)
            .exec_insert(&conn, self.driver.use_returning())
            .await
            .map_err(|err| self.driver.transform_error(err))?;
        let id = inserted
            .ok_or_else(|| Error::Driver("driver reported no generated identifier".into()))?;
        debug!(model = %uid, id, "created entity");

        relations::apply_relations(self.registry, self.driver, conn, model, id, &write.ops)
            .await?;

        let record = self
            .fetch_by_id(conn, uid, id, event.params.get("populate"))
            .await?
            .ok_or(Error::NotFound)?;
        let result = JsonValue::Object(record.clone());
        self.after(&mut event, Some(&result))?;
        Ok(record)
    }

    /// Fetch one record matching `params`
    /// (`{filters?, fields?, sort?, populate?}`).
    pub async fn find_one(
        &self,
        conn: Conn<'_, D>,
        uid: &str,
        params: JsonValue,
    ) -> Result<Option<Record>, Error> {
        let mut event = self.before(Action::FindOne, uid, params)?;
        let qb = self.build_select(uid, &event.params)?;
        let record = qb
            .fetch_one(&conn)
            .await
            .map_err(|err| self.driver.transform_error(err))?;
        let result = match &record {
            Some(record) => JsonValue::Object(record.clone()),
            None => JsonValue::Null,
        };
        self.after(&mut event, Some(&result))?;
        Ok(record)
    }

    /// Fetch all records matching `params`
    /// (`{filters?, fields?, sort?, populate?, limit?, offset?, page?, pageSize?}`).
    pub async fn find_many(
        &self,
        conn: Conn<'_, D>,
        uid: &str,
        params: JsonValue,
    ) -> Result<Vec<Record>, Error> {
        let mut event = self.before(Action::FindMany, uid, params)?;
        let qb = self.build_select(uid, &event.params)?;
        let records = qb
            .fetch_all(&conn)
            .await
            .map_err(|err| self.driver.transform_error(err))?;
        let result =
            JsonValue::Array(records.iter().cloned().map(JsonValue::Object).collect());
        self.after(&mut event, Some(&result))?;
        Ok(records)
    }

    /// Update entity `id`. `params` is `{data, populate?}`.
    pub async fn update(
        &self,
        conn: Conn<'_, D>,
        uid: &str,
        id: i64,
        params: JsonValue,
    ) -> Result<Record, Error> {
        let model = self.registry.model(uid)?;
        let mut event = self.before(Action::Update, uid, params)?;
        let data = take_data(&event.params)?;
        let write = split_input(model, &data, false)?;

        for (column, value) in &write.evictions {
            relations::evict_column_holder(&conn, &model.table_name, column, *value).await?;
        }
        if !write.columns.is_empty() {
            QueryBuilder::update(self.registry, uid)?
                .values(write.columns)
                .filter(&serde_json::json!({ "id": id }))?
                .exec(&conn)
                .await
                .map_err(|err| self.driver.transform_error(err))?;
        }
        relations::apply_relations(self.registry, self.driver, conn, model, id, &write.ops)
            .await?;

        let record = self
            .fetch_by_id(conn, uid, id, event.params.get("populate"))
            .await?
            .ok_or(Error::NotFound)?;
        let result = JsonValue::Object(record.clone());
        self.after(&mut event, Some(&result))?;
        Ok(record)
    }

    /// Delete entity `id`, returning its last state.
    pub async fn delete(
        &self,
        conn: Conn<'_, D>,
        uid: &str,
        id: i64,
        params: JsonValue,
    ) -> Result<Record, Error> {
        let model = self.registry.model(uid)?;
        let mut event = self.before(Action::Delete, uid, params)?;

        let record = self
            .fetch_by_id(conn, uid, id, event.params.get("populate"))
            .await?
            .ok_or(Error::NotFound)?;
        relations::delete_relations(self.registry, self.driver, conn, model, id).await?;
        QueryBuilder::delete(self.registry, uid)?
            .filter(&serde_json::json!({ "id": id }))?
            .exec(&conn)
            .await
            .map_err(|err| self.driver.transform_error(err))?;
        debug!(model = %uid, id, "deleted entity");

        let result = JsonValue::Object(record.clone());
        self.after(&mut event, Some(&result))?;
        Ok(record)
    }

    /// Count records matching `params` (`{filters?}`).
    pub async fn count(
        &self,
        conn: Conn<'_, D>,
        uid: &str,
        params: JsonValue,
    ) -> Result<u64, Error> {
        let mut event = self.before(Action::Count, uid, params)?;
        let mut qb = QueryBuilder::count(self.registry, uid)?;
        if let Some(filters) = event.params.get("filters") {
            qb = qb.filter(filters)?;
        }
        let count = qb
            .fetch_count(&conn)
            .await
            .map_err(|err| self.driver.transform_error(err))?;
        self.after(&mut event, Some(&JsonValue::from(count)))?;
        Ok(count)
    }

    async fn fetch_by_id(
        &self,
        conn: Conn<'_, D>,
        uid: &str,
        id: i64,
        populate: Option<&JsonValue>,
    ) -> Result<Option<Record>, Error> {
        let mut qb = QueryBuilder::select(self.registry, uid)?
            .filter(&serde_json::json!({ "id": id }))?;
        if let Some(populate) = populate {
            qb = qb.populate(populate)?;
        }
        qb.fetch_one(&conn)
            .await
            .map_err(|err| self.driver.transform_error(err))
    }

    fn build_select(&self, uid: &str, params: &JsonValue) -> Result<QueryBuilder<'a>, Error> {
        let mut qb = QueryBuilder::select(self.registry, uid)?;
        if let Some(filters) = params.get("filters") {
            qb = qb.filter(filters)?;
        }
        if let Some(fields) = params.get("fields") {
            let names = string_list(fields, "fields")?;
            let refs: Vec<&str> = names.iter().map(String::as_str).collect();
            qb = qb.fields(&refs)?;
        }
        if let Some(sort) = params.get("sort") {
            for spec in string_list(sort, "sort")? {
                qb = qb.order_by(&spec)?;
            }
        }
        if let Some(populate) = params.get("populate") {
            qb = qb.populate(populate)?;
        }
        if let Some(page) = params.get("page").and_then(JsonValue::as_u64) {
            let page_size = params
                .get("pageSize")
                .and_then(JsonValue::as_u64)
                .unwrap_or(25);
            qb = qb.page(page, page_size);
        } else {
            if let Some(limit) = params.get("limit").and_then(JsonValue::as_u64) {
                qb = qb.limit(limit);
            }
            if let Some(offset) = params.get("offset").and_then(JsonValue::as_u64) {
                qb = qb.offset(offset);
            }
        }
        Ok(qb)
    }
}

fn take_data(params: &JsonValue) -> Result<Map<String, JsonValue>, Error> {
    params
        .get("data")
        .and_then(JsonValue::as_object)
        .cloned()
        .ok_or_else(|| {
            QueryError::InvalidOperand {
                op: "data".into(),
                expected: "an object of attribute values",
            }
            .into()
        })
}

fn string_list(value: &JsonValue, op: &'static str) -> Result<Vec<String>, Error> {
    match value {
        JsonValue::String(s) => Ok(vec![s.clone()]),
        JsonValue::Array(items) => items
            .iter()
            .map(|item| {
                item.as_str().map(str::to_string).ok_or_else(|| {
                    QueryError::InvalidOperand {
                        op: op.into(),
                        expected: "a string or an array of strings",
                    }
                    .into()
                })
            })
            .collect(),
        _ => Err(QueryError::InvalidOperand {
            op: op.into(),
            expected: "a string or an array of strings",
        }
        .into()),
    }
}

fn serialize_scalar(
    model: &ModelMeta,
    name: &str,
    scalar: &ScalarAttribute,
    value: &JsonValue,
) -> Result<SqlValue, Error> {
    if scalar.scalar == ScalarType::Enumeration
        && !scalar.enum_values.is_empty()
        && !value.is_null()
    {
        let ok = value
            .as_str()
            .is_some_and(|s| scalar.enum_values.iter().any(|v| v == s));
        if !ok {
            return Err(Error::Validation(format!(
                "`{}.{name}` must be one of {:?}",
                model.uid, scalar.enum_values
            )));
        }
    }
    codec_for(scalar.scalar).to_db(value)
}

/// Split a write payload into row column values, uniqueness evictions, and
/// deferred relation operations.
///
/// Owning join columns and morph discriminator columns are written with the
/// row itself; everything else becomes a relation operation applied after
/// the row exists.
fn split_input(
    model: &ModelMeta,
    data: &Map<String, JsonValue>,
    create: bool,
) -> Result<WriteSet, Error> {
    for key in data.keys() {
        if key != "id" && model.attribute(key).is_none() {
            return Err(QueryError::UnknownAttribute {
                model: model.uid.clone(),
                attribute: key.clone(),
            }
            .into());
        }
    }

    let mut write = WriteSet {
        columns: Vec::new(),
        evictions: Vec::new(),
        ops: Vec::new(),
    };
    for (name, attribute) in &model.attributes {
        if name == "id" {
            continue;
        }
        match attribute {
            Attribute::Scalar(scalar) => match data.get(name) {
                Some(value) => {
                    if scalar.required && value.is_null() {
                        return Err(Error::Validation(format!(
                            "`{}.{name}` is required",
                            model.uid
                        )));
                    }
                    let column = scalar
                        .column
                        .clone()
                        .unwrap_or_else(|| naming::column_name(name));
                    write
                        .columns
                        .push((column, serialize_scalar(model, name, scalar, value)?));
                }
                None if create => {
                    if let Some(default) = &scalar.default {
                        let column = scalar
                            .column
                            .clone()
                            .unwrap_or_else(|| naming::column_name(name));
                        write
                            .columns
                            .push((column, serialize_scalar(model, name, scalar, default)?));
                    } else if scalar.required {
                        return Err(Error::Validation(format!(
                            "`{}.{name}` is required",
                            model.uid
                        )));
                    }
                }
                None => {}
            },
            Attribute::Relation(relation) => {
                let Some(value) = data.get(name) else {
                    continue;
                };
                let mutation = RelationMutation::parse(model, name, value)?;
                match &relation.storage {
                    RelationStorage::JoinColumn(jc) if relation.owner => {
                        match mutation.resolve_single(model, name)? {
                            Some(Some(target)) => {
                                if relation.kind == crate::schema::RelationKind::OneToOne {
                                    write.evictions.push((jc.name.clone(), target.id));
                                }
                                write.columns.push((jc.name.clone(), SqlValue::Int(target.id)));
                            }
                            Some(None) => write.columns.push((jc.name.clone(), SqlValue::Null)),
                            None => {}
                        }
                    }
                    RelationStorage::MorphColumn(mc) => {
                        match mutation.resolve_single(model, name)? {
                            Some(Some(target)) => {
                                let type_uid = target.type_uid.ok_or_else(|| {
                                    Error::Validation(format!(
                                        "polymorphic relation `{}.{name}` requires `__type` on every target",
                                        model.uid
                                    ))
                                })?;
                                write
                                    .columns
                                    .push((mc.id_column.clone(), SqlValue::Int(target.id)));
                                write
                                    .columns
                                    .push((mc.type_column.clone(), SqlValue::Text(type_uid)));
                            }
                            Some(None) => {
                                write.columns.push((mc.id_column.clone(), SqlValue::Null));
                                write.columns.push((mc.type_column.clone(), SqlValue::Null));
                            }
                            None => {}
                        }
                    }
                    _ => write.ops.push((name.clone(), mutation)),
                }
            }
        }
    }
    Ok(write)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ModelDef, RelationDef, ScalarType};
    use crate::test_support::{row, MockDriver};
    use parking_lot::Mutex;
    use serde_json::json;

    fn registry() -> Registry {
        Registry::build(vec![
            ModelDef::new("api::article.article", "article")
                .with_scalar("title", ScalarType::String)
                .with_scalar_options(
                    "status",
                    ScalarAttribute::new(ScalarType::Enumeration)
                        .with_values(["draft", "published"])
                        .with_default(json!("draft")),
                )
                .with_relation(
                    "author",
                    RelationDef::many_to_one("api::author.author").inversed_by("articles"),
                )
                .with_relation(
                    "tags",
                    RelationDef::many_to_many("api::tag.tag").inversed_by("articles"),
                ),
            ModelDef::new("api::author.author", "author")
                .with_scalar("name", ScalarType::String)
                .with_relation(
                    "articles",
                    RelationDef::one_to_many("api::article.article").mapped_by("author"),
                ),
            ModelDef::new("api::tag.tag", "tag")
                .with_scalar("label", ScalarType::String)
                .with_relation(
                    "articles",
                    RelationDef::many_to_many("api::article.article").mapped_by("tags"),
                ),
        ])
        .unwrap()
    }

    #[tokio::test]
    async fn test_create_writes_row_and_ordered_pivot_rows() {
        let registry = registry();
        let driver = MockDriver::new();
        let manager = EntityManager::new(&registry, &driver);
        // Link scans and MAX/grouped-max probes come back empty; the final
        // fetch returns the stored row.
        for _ in 0..4 {
            driver.enqueue_rows(vec![]);
        }
        driver.enqueue_rows(vec![row(&[
            ("id", SqlValue::Int(1)),
            ("title", SqlValue::Text("A".into())),
        ])]);

        let record = manager
            .create(
                manager.conn(),
                "api::article.article",
                json!({"data": {"title": "A", "author": 1, "tags": [1, 2]}}),
            )
            .await
            .unwrap();
        assert_eq!(record.get("title"), Some(&json!("A")));

        let statements = driver.statements();
        // Exactly one entity insert; the foreign key rides on the row.
        let inserts: Vec<_> = statements
            .iter()
            .filter(|s| s.sql.starts_with("INSERT INTO articles "))
            .collect();
        assert_eq!(inserts.len(), 1);
        assert_eq!(
            inserts[0].sql,
            "INSERT INTO articles (title, status, author_id) VALUES (?, ?, ?)"
        );
        assert_eq!(
            inserts[0].params,
            vec![
                SqlValue::Text("A".into()),
                SqlValue::Text("draft".into()),
                SqlValue::Int(1)
            ]
        );

        // Two pivot rows, ordered 1 and 2.
        let links: Vec<_> = statements
            .iter()
            .filter(|s| s.sql.starts_with("INSERT INTO articles_tags_links"))
            .collect();
        assert_eq!(links.len(), 2);
        assert_eq!(links[0].params[2], SqlValue::Int(1));
        assert_eq!(links[1].params[2], SqlValue::Int(2));
    }

    #[tokio::test]
    async fn test_create_rejects_unknown_attribute() {
        let registry = registry();
        let driver = MockDriver::new();
        let manager = EntityManager::new(&registry, &driver);

        let err = manager
            .create(
                manager.conn(),
                "api::article.article",
                json!({"data": {"headline": "A"}}),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Query(QueryError::UnknownAttribute { .. })
        ));
        assert!(driver.statements().is_empty());
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_enumeration_value() {
        let registry = registry();
        let driver = MockDriver::new();
        let manager = EntityManager::new(&registry, &driver);

        let err = manager
            .create(
                manager.conn(),
                "api::article.article",
                json!({"data": {"title": "A", "status": "archived"}}),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn test_update_with_only_relations_skips_row_update() {
        let registry = registry();
        let driver = MockDriver::new();
        let manager = EntityManager::new(&registry, &driver);
        // The disconnect path issues no reads before the final fetch.
        driver.enqueue_rows(vec![row(&[("id", SqlValue::Int(3))])]);

        manager
            .update(
                manager.conn(),
                "api::article.article",
                3,
                json!({"data": {"tags": {"disconnect": [1]}}}),
            )
            .await
            .unwrap();

        assert!(!driver
            .statements()
            .iter()
            .any(|s| s.sql.starts_with("UPDATE articles SET")));
    }

    #[tokio::test]
    async fn test_update_missing_row_is_not_found() {
        let registry = registry();
        let driver = MockDriver::new();
        let manager = EntityManager::new(&registry, &driver);
        driver.enqueue_rows(vec![]); // fetch finds nothing

        let err = manager
            .update(
                manager.conn(),
                "api::article.article",
                99,
                json!({"data": {"title": "B"}}),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound));
    }

    #[tokio::test]
    async fn test_delete_cleans_links_then_removes_row() {
        let registry = registry();
        let driver = MockDriver::new();
        let manager = EntityManager::new(&registry, &driver);
        driver.enqueue_rows(vec![row(&[("id", SqlValue::Int(3))])]);

        let record = manager
            .delete(manager.conn(), "api::article.article", 3, json!({}))
            .await
            .unwrap();
        assert_eq!(record.get("id"), Some(&json!(3)));

        let statements = driver.statements();
        let cleanup = statements
            .iter()
            .position(|s| s.sql.contains("articles_tags_links"))
            .unwrap();
        let delete = statements
            .iter()
            .position(|s| s.sql == "DELETE FROM articles WHERE articles.id = ?")
            .unwrap();
        assert!(cleanup < delete);
    }

    #[tokio::test]
    async fn test_delete_with_enforced_foreign_keys_skips_cleanup() {
        let registry = registry();
        let driver = MockDriver::new().with_foreign_keys(true);
        let manager = EntityManager::new(&registry, &driver);
        driver.enqueue_rows(vec![row(&[("id", SqlValue::Int(3))])]);

        manager
            .delete(manager.conn(), "api::article.article", 3, json!({}))
            .await
            .unwrap();

        assert!(driver.statements_matching("articles_tags_links").is_empty());
    }

    #[tokio::test]
    async fn test_find_many_applies_params() {
        let registry = registry();
        let driver = MockDriver::new();
        let manager = EntityManager::new(&registry, &driver);

        manager
            .find_many(
                manager.conn(),
                "api::article.article",
                json!({
                    "filters": {"$or": [{"title": "A"}, {"title": "B"}]},
                    "sort": "title:desc",
                    "page": 2,
                    "pageSize": 10,
                }),
            )
            .await
            .unwrap();

        let statements = driver.statements();
        assert_eq!(statements.len(), 1);
        assert_eq!(
            statements[0].sql,
            "SELECT t0.* FROM articles AS t0 WHERE (t0.title = ? OR t0.title = ?) \
             ORDER BY t0.title DESC LIMIT 10 OFFSET 10"
        );
    }

    #[tokio::test]
    async fn test_count_uses_filters_only() {
        let registry = registry();
        let driver = MockDriver::new();
        let manager = EntityManager::new(&registry, &driver);
        driver.enqueue_rows(vec![row(&[("count", SqlValue::Int(4))])]);

        let count = manager
            .count(
                manager.conn(),
                "api::article.article",
                json!({"filters": {"title": {"$startsWith": "A"}}}),
            )
            .await
            .unwrap();
        assert_eq!(count, 4);
    }

    struct Recorder {
        calls: Mutex<Vec<String>>,
    }

    impl Lifecycle for Recorder {
        fn before(&self, event: &mut LifecycleEvent) -> Result<(), Error> {
            self.calls.lock().push(format!("before:{}", event.action));
            event
                .state
                .insert("tag".into(), JsonValue::String("x".into()));
            Ok(())
        }

        fn after(&self, event: &mut LifecycleEvent, result: Option<&JsonValue>) -> Result<(), Error> {
            assert_eq!(event.state.get("tag"), Some(&JsonValue::String("x".into())));
            assert!(result.is_some());
            self.calls.lock().push(format!("after:{}", event.action));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_lifecycle_hooks_wrap_operations() {
        let registry = registry();
        let driver = MockDriver::new();
        let hooks = Recorder {
            calls: Mutex::new(Vec::new()),
        };
        let manager = EntityManager::new(&registry, &driver).with_hooks(&hooks);

        manager
            .find_many(manager.conn(), "api::article.article", json!({}))
            .await
            .unwrap();
        driver.enqueue_rows(vec![row(&[("count", SqlValue::Int(0))])]);
        manager
            .count(manager.conn(), "api::article.article", json!({}))
            .await
            .unwrap();

        assert_eq!(
            *hooks.calls.lock(),
            vec!["before:findMany", "after:findMany", "before:count", "after:count"]
        );
    }

    #[test]
    fn test_split_input_routes_storage_shapes() {
        let registry = registry();
        let model = registry.get("api::article.article").unwrap();
        let data = json!({"title": "A", "author": 2, "tags": [5]});
        let write = split_input(model, data.as_object().unwrap(), true).unwrap();

        assert!(write
            .columns
            .iter()
            .any(|(c, v)| c == "author_id" && *v == SqlValue::Int(2)));
        assert_eq!(write.ops.len(), 1);
        assert_eq!(write.ops[0].0, "tags");
        assert!(write.evictions.is_empty());
    }
}
