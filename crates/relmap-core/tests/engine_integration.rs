//! Integration tests for the mapping engine: registry compilation, query
//! building, populate fan-out, and relation writes against a scripted
//! in-memory driver.

use relmap_core::test_support::{row, MockDriver};
use relmap_core::{
    with_transaction, Conn, EntityManager, ModelDef, QueryBuilder, Registry, RelationDef,
    ScalarType, SqlValue,
};
use serde_json::json;

fn blog_registry() -> Registry {
    Registry::build(vec![
        ModelDef::new("api::article.article", "article")
            .with_scalar("title", ScalarType::String)
            .with_scalar("views", ScalarType::Integer)
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
async fn test_create_article_with_author_and_tags() {
    let registry = blog_registry();
    let driver = MockDriver::new();
    let manager = EntityManager::new(&registry, &driver);

    // Pivot scans and order probes find nothing; the final fetch returns
    // the stored row.
    for _ in 0..4 {
        driver.enqueue_rows(vec![]);
    }
    driver.enqueue_rows(vec![row(&[
        ("id", SqlValue::Int(1)),
        ("title", SqlValue::Text("A".into())),
        ("author_id", SqlValue::Int(1)),
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

    // One articles row, with the foreign key on the row itself.
    let article_inserts: Vec<_> = statements
        .iter()
        .filter(|s| s.sql.starts_with("INSERT INTO articles "))
        .collect();
    assert_eq!(article_inserts.len(), 1);
    assert_eq!(
        article_inserts[0].sql,
        "INSERT INTO articles (title, author_id) VALUES (?, ?)"
    );

    // Two pivot rows in articles_tags_links, ordered 1 and 2.
    let links: Vec<_> = statements
        .iter()
        .filter(|s| s.sql.starts_with("INSERT INTO articles_tags_links"))
        .collect();
    assert_eq!(links.len(), 2);
    assert!(links[0]
        .sql
        .contains("(article_id, tag_id, tag_order, article_order)"));
    assert_eq!(
        links[0].params,
        vec![
            SqlValue::Int(1),
            SqlValue::Int(1),
            SqlValue::Int(1),
            SqlValue::Int(1)
        ]
    );
    assert_eq!(
        links[1].params,
        vec![
            SqlValue::Int(1),
            SqlValue::Int(2),
            SqlValue::Int(2),
            SqlValue::Int(1)
        ]
    );
}

#[tokio::test]
async fn test_disconnect_deletes_link_and_resequences() {
    let registry = blog_registry();
    let driver = MockDriver::new();
    let manager = EntityManager::new(&registry, &driver);
    driver.enqueue_rows(vec![row(&[("id", SqlValue::Int(1))])]);

    manager
        .update(
            manager.conn(),
            "api::article.article",
            1,
            json!({"data": {"tags": {"disconnect": [1]}}}),
        )
        .await
        .unwrap();

    let statements = driver.statements();
    let delete = statements
        .iter()
        .find(|s| s.sql.starts_with("DELETE FROM articles_tags_links"))
        .unwrap();
    assert!(delete.sql.contains("article_id = ? AND tag_id IN (?)"));

    // The surviving links are renumbered to a dense sequence per article,
    // and per tag on the inverse side.
    let reseq: Vec<_> = statements
        .iter()
        .filter(|s| s.sql.contains("ROW_NUMBER"))
        .collect();
    assert_eq!(reseq.len(), 2);
    assert!(reseq[0]
        .sql
        .contains("PARTITION BY article_id ORDER BY tag_order"));
    assert!(reseq[1]
        .sql
        .contains("PARTITION BY tag_id ORDER BY article_order"));
}

#[tokio::test]
async fn test_or_filter_compiles_to_bracketed_disjunction() {
    let registry = blog_registry();
    let stmt = QueryBuilder::select(&registry, "api::article.article")
        .unwrap()
        .filter(&json!({"$or": [{"views": 1}, {"views": 2}]}))
        .unwrap()
        .build()
        .unwrap();

    assert_eq!(
        stmt.sql,
        "SELECT t0.* FROM articles AS t0 WHERE (t0.views = ? OR t0.views = ?)"
    );
    assert_eq!(stmt.params, vec![SqlValue::Int(1), SqlValue::Int(2)]);
}

#[tokio::test]
async fn test_populate_hydrates_relations_in_batches() {
    let registry = blog_registry();
    let driver = MockDriver::new();

    // Parent select: two articles by the same author.
    driver.enqueue_rows(vec![
        row(&[
            ("id", SqlValue::Int(1)),
            ("title", SqlValue::Text("A".into())),
            ("author_id", SqlValue::Int(9)),
        ]),
        row(&[
            ("id", SqlValue::Int(2)),
            ("title", SqlValue::Text("B".into())),
            ("author_id", SqlValue::Int(9)),
        ]),
    ]);
    // One batched author query for the distinct key 9.
    driver.enqueue_rows(vec![row(&[
        ("id", SqlValue::Int(9)),
        ("name", SqlValue::Text("Ann".into())),
    ])]);
    // One batched tag query through the pivot; both tags belong to article 1.
    driver.enqueue_rows(vec![
        row(&[
            ("id", SqlValue::Int(5)),
            ("label", SqlValue::Text("rust".into())),
            ("__parent", SqlValue::Int(1)),
        ]),
        row(&[
            ("id", SqlValue::Int(6)),
            ("label", SqlValue::Text("db".into())),
            ("__parent", SqlValue::Int(1)),
        ]),
    ]);

    let records = QueryBuilder::select(&registry, "api::article.article")
        .unwrap()
        .populate(&json!(["author", "tags"]))
        .unwrap()
        .fetch_all(&driver)
        .await
        .unwrap();

    // Exactly three statements: parent select plus one per populated
    // attribute, never one per row.
    assert_eq!(driver.statements().len(), 3);

    assert_eq!(records[0]["author"]["name"], json!("Ann"));
    assert_eq!(records[1]["author"]["name"], json!("Ann"));
    let tags = records[0]["tags"].as_array().unwrap();
    assert_eq!(tags.len(), 2);
    assert_eq!(tags[0]["label"], json!("rust"));
    assert_eq!(records[1]["tags"], json!([]));
}

#[tokio::test]
async fn test_populate_over_empty_parents_issues_no_queries() {
    let registry = blog_registry();
    let driver = MockDriver::new();

    let records = QueryBuilder::select(&registry, "api::article.article")
        .unwrap()
        .populate(&json!(true))
        .unwrap()
        .fetch_all(&driver)
        .await
        .unwrap();

    assert!(records.is_empty());
    // Only the parent select ran.
    assert_eq!(driver.statements().len(), 1);
}

#[tokio::test]
async fn test_populate_with_no_referenced_values_fills_empty() {
    let registry = blog_registry();
    let driver = MockDriver::new();
    driver.enqueue_rows(vec![row(&[
        ("id", SqlValue::Int(1)),
        ("title", SqlValue::Text("A".into())),
        ("author_id", SqlValue::Null),
    ])]);

    let records = QueryBuilder::select(&registry, "api::article.article")
        .unwrap()
        .populate(&json!(["author"]))
        .unwrap()
        .fetch_all(&driver)
        .await
        .unwrap();

    assert_eq!(records[0]["author"], json!(null));
    assert_eq!(driver.statements().len(), 1);
}

#[tokio::test]
async fn test_transaction_wraps_multi_statement_write() {
    let registry = blog_registry();
    let driver = MockDriver::new();

    for _ in 0..4 {
        driver.enqueue_rows(vec![]);
    }
    driver.enqueue_rows(vec![row(&[("id", SqlValue::Int(1))])]);

    let registry_clone = registry.clone();
    let driver_clone = driver.clone();
    with_transaction(&driver, Conn::Driver(&driver), move |conn| {
        Box::pin(async move {
            let manager = EntityManager::new(&registry_clone, &driver_clone);
            manager
                .create(
                    conn,
                    "api::article.article",
                    json!({"data": {"title": "A", "tags": [1, 2]}}),
                )
                .await?;
            Ok(())
        })
    })
    .await
    .unwrap();

    let sql: Vec<String> = driver.statements().into_iter().map(|s| s.sql).collect();
    assert_eq!(sql.first().map(String::as_str), Some("BEGIN"));
    assert_eq!(sql.last().map(String::as_str), Some("COMMIT"));
    // Every engine statement ran inside the scope.
    assert!(sql
        .iter()
        .skip(1)
        .take(sql.len() - 2)
        .all(|s| s != "BEGIN" && s != "COMMIT"));
}

#[tokio::test]
async fn test_failed_statement_rolls_back_scope() {
    let registry = blog_registry();
    let driver = MockDriver::new();
    driver.enqueue_error("unique constraint violated");

    let registry_clone = registry.clone();
    let err = with_transaction(&driver, Conn::Driver(&driver), move |conn| {
        Box::pin(async move {
            QueryBuilder::select(&registry_clone, "api::article.article")
                .unwrap()
                .fetch_all(&conn)
                .await?;
            Ok(())
        })
    })
    .await
    .unwrap_err();

    assert!(matches!(err, relmap_core::Error::Driver(_)));
    let sql: Vec<String> = driver.statements().into_iter().map(|s| s.sql).collect();
    assert_eq!(sql.last().map(String::as_str), Some("ROLLBACK"));
}

#[tokio::test]
async fn test_self_referencing_pivot_has_distinct_columns() {
    let registry = Registry::build(vec![ModelDef::new("api::article.article", "article")
        .with_scalar("title", ScalarType::String)
        .with_relation(
            "related",
            RelationDef::many_to_many("api::article.article"),
        )])
    .unwrap();

    let relation = registry
        .get("api::article.article")
        .unwrap()
        .relation("related")
        .unwrap();
    let jt = relation.join_table().unwrap();
    assert_ne!(jt.join_column.name, jt.inverse_join_column.name);
    assert_eq!(jt.join_column.referenced_table, "articles");
    assert_eq!(jt.inverse_join_column.referenced_table, "articles");

    // Writes address the two sides by their distinct column names.
    let driver = MockDriver::new();
    let manager = EntityManager::new(&registry, &driver);
    for _ in 0..4 {
        driver.enqueue_rows(vec![]);
    }
    driver.enqueue_rows(vec![row(&[("id", SqlValue::Int(1))])]);
    manager
        .create(
            manager.conn(),
            "api::article.article",
            json!({"data": {"title": "A", "related": [2]}}),
        )
        .await
        .unwrap();

    let links = driver.statements_matching("INSERT INTO articles_related_links");
    assert_eq!(links.len(), 1);
    assert!(links[0].sql.contains("article_id"));
    assert!(links[0].sql.contains("inv_article_id"));
}
