//! End-to-end tests for templated statements running against SQLite.

use serde_json::json;
use sqlsheet::{Config, DbAccess, DbContext, Registry};
use std::sync::Arc;

const SHEET: &str = r#"
namespace: customer
sql:
  - id: searchBase
    body:
      - "SELECT * FROM CUSTOMER"
query:
  - id: search
    body:
      - sql: { ref: searchBase }
      - if:
          test: "custID != null"
          body: ["WHERE CUST_ID = #{custID}"]
      - "ORDER BY CUST_ID"
  - id: byIds
    body:
      - "SELECT * FROM CUSTOMER WHERE CUST_ID IN ("
      - foreach:
          items: ids
          var: id
          separator: ", "
          body: ["#{id}"]
      - ") ORDER BY CUST_ID"
update:
  - id: insertCustomer
    body:
      - "INSERT INTO CUSTOMER (CUST_ID, CUST_NAME) VALUES (#{custID}, #{name})"
"#;

fn registry() -> Arc<Registry> {
    let config = Config::from_yaml(
        "connections:\n  - name: main\n    url: \"sqlite::memory:\"\n",
    )
    .unwrap();
    let registry = Registry::from_config(config, None).unwrap();
    registry.load_sheet_str(SHEET).unwrap();
    registry
}

async fn seeded(db: &DbAccess, ctx: &mut DbContext) {
    db.perform(ctx, |db, ctx| {
        Box::pin(async move {
            let mut update = db.update();
            update.sql("CREATE TABLE CUSTOMER (CUST_ID TEXT PRIMARY KEY, CUST_NAME TEXT)");
            update.execute(ctx).await?;
            for (id, name) in [("00001", "Ann"), ("00002", "Ben"), ("00003", "Cleo")] {
                let mut insert = db.update();
                insert.sql_id("customer.insertCustomer");
                insert.param("custID", json!(id)).param("name", json!(name));
                insert.execute(ctx).await?;
            }
            Ok(())
        })
    })
    .await
    .unwrap()
}

#[tokio::test]
async fn conditional_fragment_included_per_parameter() {
    let db = DbAccess::new(registry(), "main").unwrap();
    let mut ctx = DbContext::new();

    let rows = db
        .perform(&mut ctx, |db, ctx| {
            Box::pin(async move {
                seeded_inline(db, ctx).await?;

                let mut query = db.query();
                query.sql_id("customer.search");
                query.param("custID", json!("00002"));
                let one = query.dataset(ctx).await?;

                let mut query = db.query();
                query.sql_id("customer.search");
                let all = query.dataset(ctx).await?;
                Ok((one, all))
            })
        })
        .await
        .unwrap();

    let (one, all) = rows;
    assert_eq!(one.len(), 1);
    assert_eq!(one.get(0).unwrap().get("CUST_NAME"), Some(&json!("Ben")));
    assert_eq!(all.len(), 3);
}

async fn seeded_inline(db: &DbAccess, ctx: &mut DbContext) -> sqlsheet::DbResult<()> {
    let mut update = db.update();
    update.sql("CREATE TABLE CUSTOMER (CUST_ID TEXT PRIMARY KEY, CUST_NAME TEXT)");
    update.execute(ctx).await?;
    for (id, name) in [("00001", "Ann"), ("00002", "Ben"), ("00003", "Cleo")] {
        let mut insert = db.update();
        insert.sql_id("customer.insertCustomer");
        insert.param("custID", json!(id)).param("name", json!(name));
        insert.execute(ctx).await?;
    }
    Ok(())
}

#[tokio::test]
async fn foreach_expands_in_clause() {
    let db = DbAccess::new(registry(), "main").unwrap();
    let mut ctx = DbContext::new();

    let dataset = db
        .perform(&mut ctx, |db, ctx| {
            Box::pin(async move {
                seeded_inline(db, ctx).await?;
                let mut query = db.query();
                query.sql_id("customer.byIds");
                query.param("ids", json!(["00001", "00003"]));
                query.dataset(ctx).await
            })
        })
        .await
        .unwrap();

    assert_eq!(dataset.len(), 2);
    assert_eq!(
        dataset.get(0).unwrap().get("CUST_ID"),
        Some(&json!("00001"))
    );
    assert_eq!(
        dataset.get(1).unwrap().get("CUST_ID"),
        Some(&json!("00003"))
    );
}

#[tokio::test]
async fn literal_and_bind_tokens_in_raw_sql() {
    let db = DbAccess::new(registry(), "main").unwrap();
    let mut ctx = DbContext::new();

    let value = db
        .perform(&mut ctx, |db, ctx| {
            Box::pin(async move {
                seeded_inline(db, ctx).await?;
                let mut query = db.query();
                query.sql("SELECT CUST_NAME FROM ${table} WHERE ${col} = #{val}");
                query
                    .param("table", json!("CUSTOMER"))
                    .param("col", json!("CUST_ID"))
                    .param("val", json!("00001"));
                query.value(ctx).await
            })
        })
        .await
        .unwrap();

    assert_eq!(value, json!("Ann"));
}

#[tokio::test]
async fn positional_parameters_bind_in_order() {
    let db = DbAccess::new(registry(), "main").unwrap();
    let mut ctx = DbContext::new();

    let value = db
        .perform(&mut ctx, |db, ctx| {
            Box::pin(async move {
                seeded_inline(db, ctx).await?;
                let mut query = db.query();
                query.sql("SELECT COUNT(*) FROM CUSTOMER WHERE CUST_ID > ?");
                query.params(vec![json!("00001")])?;
                query.value(ctx).await
            })
        })
        .await
        .unwrap();

    assert_eq!(value, json!(2));
}

#[tokio::test]
async fn scalar_value_of_empty_result_is_null() {
    let db = DbAccess::new(registry(), "main").unwrap();
    let mut ctx = DbContext::new();

    let value = db
        .perform(&mut ctx, |db, ctx| {
            Box::pin(async move {
                seeded_inline(db, ctx).await?;
                let mut query = db.query();
                query.sql("SELECT CUST_NAME FROM CUSTOMER WHERE CUST_ID = ?");
                query.params(vec![json!("99999")])?;
                query.value(ctx).await
            })
        })
        .await
        .unwrap();

    assert_eq!(value, serde_json::Value::Null);
}

#[tokio::test]
async fn datasets_returns_one_per_result_set() {
    let db = DbAccess::new(registry(), "main").unwrap();
    let mut ctx = DbContext::new();

    let sets = db
        .perform(&mut ctx, |db, ctx| {
            Box::pin(async move {
                seeded_inline(db, ctx).await?;
                let mut query = db.query();
                query.sql(
                    "SELECT CUST_ID FROM CUSTOMER WHERE CUST_ID = '00001'; \
                     SELECT CUST_ID FROM CUSTOMER WHERE CUST_ID > '00001' ORDER BY CUST_ID",
                );
                query.datasets(ctx).await
            })
        })
        .await
        .unwrap();

    assert_eq!(sets.len(), 2);
    assert_eq!(sets[0].len(), 1);
    assert_eq!(sets[1].len(), 2);
}

#[tokio::test]
async fn unknown_fragment_id_fails() {
    let db = DbAccess::new(registry(), "main").unwrap();
    let mut ctx = DbContext::new();

    let result = db
        .perform(&mut ctx, |db, ctx| {
            Box::pin(async move {
                let mut query = db.query();
                query.sql_id("customer.noSuchFragment");
                query.dataset(ctx).await
            })
        })
        .await;

    assert!(result.is_err());
}

#[tokio::test]
async fn seeding_helper_used_by_transact_path_too() {
    // Guards the shared fixture against drift; also exercises the
    // `perform` wrapper with the no-result task shape.
    let db = DbAccess::new(registry(), "main").unwrap();
    let mut ctx = DbContext::new();
    seeded(&db, &mut ctx).await;
    assert!(!db.is_open(&ctx));
}
