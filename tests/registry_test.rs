//! Configuration and sheet loading from files, coordinator delegation.

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::json;
use sqlsheet::{
    Config, DbAccess, DbContext, DbResult, Registry, TransactionCoordinator, TxStatus,
};
use std::sync::Arc;
use tempfile::TempDir;

const SHEET: &str = r#"
namespace: customer
query:
  - id: all
    body: ["SELECT * FROM CUSTOMER ORDER BY CUST_ID"]
update:
  - id: insert
    body: ["INSERT INTO CUSTOMER (CUST_ID, CUST_NAME) VALUES (#{id}, #{name})"]
"#;

#[test]
fn registry_loads_config_and_sheets_from_files() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("customer.yaml"), SHEET).unwrap();
    std::fs::write(
        dir.path().join("dbaccess.yaml"),
        "connections:\n  - name: main\n    url: \"sqlite::memory:\"\nsqlsheets: \"customer.yaml\"\n",
    )
    .unwrap();

    let registry = Registry::load(dir.path().join("dbaccess.yaml")).unwrap();
    assert!(registry.fragment("customer.all").is_ok());
    assert!(registry.fragment("customer.insert").is_ok());
    assert!(registry.config().entry("main").is_some());
}

#[test]
fn missing_sheet_file_fails_the_load() {
    let dir = TempDir::new().unwrap();
    std::fs::write(
        dir.path().join("dbaccess.yaml"),
        "connections: []\nsqlsheets: \"ghost.yaml\"\n",
    )
    .unwrap();
    assert!(Registry::load(dir.path().join("dbaccess.yaml")).is_err());
}

#[test]
fn equal_configuration_yields_equal_identity_keys() {
    let config = Config::from_yaml(
        "connections:\n  - name: main\n    url: \"sqlite::memory:\"\n",
    )
    .unwrap();
    let registry = Registry::from_config(config, None).unwrap();
    let a = DbAccess::new(registry.clone(), "main").unwrap();
    let b = DbAccess::new(registry.clone(), "main").unwrap();
    assert_eq!(a.key(), b.key());
}

#[tokio::test]
async fn facades_with_equal_keys_share_one_connection() {
    let config = Config::from_yaml(
        "connections:\n  - name: main\n    url: \"sqlite::memory:\"\n",
    )
    .unwrap();
    let registry = Registry::from_config(config, None).unwrap();
    let a = DbAccess::new(registry.clone(), "main").unwrap();
    let b = DbAccess::new(registry.clone(), "main").unwrap();

    let mut ctx = DbContext::new();
    a.perform(&mut ctx, |_a, ctx| {
        Box::pin(async move {
            // The second facade sees the first facade's open connection:
            // same in-memory database, same session.
            assert!(b.is_open(ctx));
            b.perform(ctx, |b, ctx| {
                Box::pin(async move {
                    let mut update = b.update();
                    update.sql("CREATE TABLE SHARED (V INTEGER)");
                    update.execute(ctx).await?;
                    Ok(())
                })
            })
            .await?;

            let mut query = b.query();
            query.sql("SELECT COUNT(*) FROM SHARED");
            let count = query.value(ctx).await?;
            assert_eq!(count, json!(0));
            Ok(())
        })
    })
    .await
    .unwrap();
}

/// Coordinator double standing in for an externally managed transaction.
struct Recording {
    status: Mutex<TxStatus>,
    calls: Mutex<Vec<&'static str>>,
}

impl Recording {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            status: Mutex::new(TxStatus::NoTransaction),
            calls: Mutex::new(Vec::new()),
        })
    }
}

impl TransactionCoordinator for Recording {
    fn begin(&self) -> BoxFuture<'_, DbResult<()>> {
        Box::pin(async {
            *self.status.lock() = TxStatus::Active;
            self.calls.lock().push("begin");
            Ok(())
        })
    }

    fn commit(&self) -> BoxFuture<'_, DbResult<()>> {
        Box::pin(async {
            *self.status.lock() = TxStatus::Committed;
            self.calls.lock().push("commit");
            Ok(())
        })
    }

    fn rollback(&self) -> BoxFuture<'_, DbResult<()>> {
        Box::pin(async {
            *self.status.lock() = TxStatus::RolledBack;
            self.calls.lock().push("rollback");
            Ok(())
        })
    }

    fn set_rollback_only(&self) -> BoxFuture<'_, DbResult<()>> {
        Box::pin(async {
            self.calls.lock().push("set_rollback_only");
            Ok(())
        })
    }

    fn status(&self) -> TxStatus {
        *self.status.lock()
    }
}

#[tokio::test]
async fn user_transaction_strategy_delegates_commit() {
    let config = Config::from_yaml(
        "connections:\n  - name: main\n    url: \"sqlite::memory:\"\n    userTransaction: utx\n",
    )
    .unwrap();
    let registry = Registry::from_config(config, None).unwrap();
    let coordinator = Recording::new();
    registry.register_coordinator("utx", coordinator.clone());

    let db = DbAccess::new(registry, "main").unwrap();
    let mut ctx = DbContext::new();
    db.transact(&mut ctx, |_db, _ctx| Box::pin(async move { Ok(()) }))
        .await
        .unwrap();

    assert_eq!(*coordinator.calls.lock(), vec!["begin", "commit"]);
}

#[tokio::test]
async fn manager_strategy_requests_rollback_only_on_failure() {
    let config = Config::from_yaml(
        "connections:\n  - name: main\n    url: \"sqlite::memory:\"\n    transactionManager: tm\n",
    )
    .unwrap();
    let registry = Registry::from_config(config, None).unwrap();
    let coordinator = Recording::new();
    registry.register_coordinator("tm", coordinator.clone());

    let db = DbAccess::new(registry, "main").unwrap();
    let mut ctx = DbContext::new();
    let result: DbResult<()> = db
        .transact(&mut ctx, |_db, _ctx| {
            Box::pin(async move { Err(sqlsheet::DbError::internal("boom")) })
        })
        .await;

    assert!(result.is_err());
    assert_eq!(
        *coordinator.calls.lock(),
        vec!["begin", "set_rollback_only"]
    );
}

#[tokio::test]
async fn unregistered_coordinator_is_a_configuration_error() {
    let config = Config::from_yaml(
        "connections:\n  - name: main\n    url: \"sqlite::memory:\"\n    userTransaction: utx\n",
    )
    .unwrap();
    let registry = Registry::from_config(config, None).unwrap();
    let db = DbAccess::new(registry, "main").unwrap();
    let mut ctx = DbContext::new();
    let result: DbResult<()> = db
        .transact(&mut ctx, |_db, _ctx| Box::pin(async move { Ok(()) }))
        .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn camel_case_rewrite_on_fetched_dataset() {
    let config = Config::from_yaml(
        "connections:\n  - name: main\n    url: \"sqlite::memory:\"\n",
    )
    .unwrap();
    let registry = Registry::from_config(config, None).unwrap();
    registry.load_sheet_str(SHEET).unwrap();
    let db = DbAccess::new(registry, "main").unwrap();

    let mut ctx = DbContext::new();
    let dataset = db
        .perform(&mut ctx, |db, ctx| {
            Box::pin(async move {
                let mut update = db.update();
                update.sql("CREATE TABLE CUSTOMER (CUST_ID TEXT, CUST_NAME TEXT)");
                update.execute(ctx).await?;
                let mut insert = db.update();
                insert.sql_id("customer.insert");
                insert.param("id", json!("00001")).param("name", json!("Ann"));
                insert.execute(ctx).await?;

                let mut query = db.query();
                query.sql_id("customer.all");
                query.dataset(ctx).await
            })
        })
        .await
        .unwrap()
        .underscored_to_camel_case();

    let row = dataset.get(0).unwrap();
    assert_eq!(row.get("custId"), Some(&json!("00001")));
    assert_eq!(row.get("custName"), Some(&json!("Ann")));
}
