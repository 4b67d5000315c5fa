//! Nested-call flattening and exception handling over a file-backed
//! SQLite database.

use serde_json::json;
use sqlsheet::{Config, DbAccess, DbContext, DbError, DbResult, Registry, TxStatus};
use std::sync::Arc;
use tempfile::TempDir;

struct Fixture {
    registry: Arc<Registry>,
    // Holds the database file alive for the test's duration.
    _dir: TempDir,
}

fn fixture() -> Fixture {
    let dir = TempDir::new().unwrap();
    let url = format!("sqlite:{}?mode=rwc", dir.path().join("tx.db").display());
    let config = Config::from_yaml(&format!(
        "connections:\n  - name: main\n    url: \"{url}\"\n"
    ))
    .unwrap();
    Fixture {
        registry: Registry::from_config(config, None).unwrap(),
        _dir: dir,
    }
}

async fn create_table(db: &DbAccess) {
    let mut ctx = DbContext::new();
    db.perform(&mut ctx, |db, ctx| {
        Box::pin(async move {
            let mut update = db.update();
            update.sql("CREATE TABLE ACCOUNT (ID INTEGER PRIMARY KEY, BALANCE INTEGER)");
            update.execute(ctx).await?;
            Ok(())
        })
    })
    .await
    .unwrap();
}

async fn count_rows(db: &DbAccess) -> i64 {
    let mut ctx = DbContext::new();
    db.perform(&mut ctx, |db, ctx| {
        Box::pin(async move {
            let mut query = db.query();
            query.sql("SELECT COUNT(*) FROM ACCOUNT");
            query.value(ctx).await
        })
    })
    .await
    .unwrap()
    .as_i64()
    .unwrap()
}

async fn insert(db: &DbAccess, ctx: &mut DbContext, id: i64) -> DbResult<u64> {
    let mut update = db.update();
    update.sql("INSERT INTO ACCOUNT (ID, BALANCE) VALUES (?, 0)");
    update.params(vec![json!(id)])?;
    update.execute(ctx).await
}

#[tokio::test]
async fn outermost_transact_commits_once() {
    let f = fixture();
    let db = DbAccess::new(f.registry.clone(), "main").unwrap();
    create_table(&db).await;

    let mut ctx = DbContext::new();
    db.transact(&mut ctx, |db, ctx| {
        Box::pin(async move {
            insert(db, ctx, 1).await?;
            // Nested transact joins the running transaction.
            db.transact(ctx, |db, ctx| {
                Box::pin(async move {
                    insert(db, ctx, 2).await?;
                    Ok(())
                })
            })
            .await?;
            insert(db, ctx, 3).await?;
            Ok(())
        })
    })
    .await
    .unwrap();

    assert_eq!(count_rows(&db).await, 3);
}

#[tokio::test]
async fn inner_failure_rolls_back_the_whole_transaction_once() {
    let f = fixture();
    let db = DbAccess::new(f.registry.clone(), "main").unwrap();
    create_table(&db).await;

    let mut ctx = DbContext::new();
    let result: DbResult<()> = db
        .transact(&mut ctx, |db, ctx| {
            Box::pin(async move {
                insert(db, ctx, 1).await?;
                // The inner transact did not start the transaction, so its
                // failure propagates without its own rollback.
                db.transact(ctx, |db, ctx| {
                    Box::pin(async move {
                        insert(db, ctx, 1).await?; // duplicate key
                        Ok(())
                    })
                })
                .await
            })
        })
        .await;

    assert!(matches!(result, Err(DbError::Database { .. })));
    assert_eq!(count_rows(&db).await, 0);
}

#[tokio::test]
async fn nested_begin_reports_did_not_start() {
    let f = fixture();
    let db = DbAccess::new(f.registry.clone(), "main").unwrap();
    create_table(&db).await;

    let mut ctx = DbContext::new();
    db.transact(&mut ctx, |_db, ctx| {
        Box::pin(async move {
            assert_eq!(ctx.transaction_status(), TxStatus::Active);
            Ok(())
        })
    })
    .await
    .unwrap();
    assert_eq!(ctx.transaction_status(), TxStatus::NoTransaction);
}

#[tokio::test]
async fn handler_supplies_substitute_and_still_rolls_back() {
    let f = fixture();
    let db = DbAccess::new(f.registry.clone(), "main").unwrap();
    create_table(&db).await;

    let mut ctx = DbContext::new();
    let value = db
        .transact_or(
            &mut ctx,
            |db, ctx| {
                Box::pin(async move {
                    insert(db, ctx, 7).await?;
                    Err(DbError::internal("business rule violated"))
                })
            },
            |_error| -1i64,
        )
        .await
        .unwrap();

    assert_eq!(value, -1);
    // Handled or not, the transaction is rolled back.
    assert_eq!(count_rows(&db).await, 0);
}

#[tokio::test]
async fn handled_failure_suppresses_sibling_units() {
    let f = fixture();
    let db = DbAccess::new(f.registry.clone(), "main").unwrap();
    create_table(&db).await;

    let mut ctx = DbContext::new();
    let outcome: DbResult<i64> = db
        .transact(&mut ctx, |db, ctx| {
            Box::pin(async move {
                insert(db, ctx, 5).await?;

                // Inner unit handles its own failure.
                let handled = db
                    .perform_or(
                        ctx,
                        |_db, _ctx| {
                            Box::pin(async move {
                                Err::<i64, _>(DbError::internal("boom"))
                            })
                        },
                        |_error| 0,
                    )
                    .await?;
                assert_eq!(handled, 0);
                assert!(ctx.has_handled_failure());

                // A sibling unit in the same context is suppressed.
                let sibling: DbResult<i64> = db
                    .perform(ctx, |_db, _ctx| Box::pin(async move { Ok(1) }))
                    .await;
                assert!(matches!(sibling, Err(DbError::Halted)));
                Ok(42)
            })
        })
        .await;

    // The outer transact completes with its value; its commit turned into
    // a rollback because the context recorded a handled failure.
    assert_eq!(outcome.unwrap(), 42);
    assert_eq!(count_rows(&db).await, 0);
}

#[tokio::test]
async fn context_close_clears_the_handled_record() {
    let f = fixture();
    let db = DbAccess::new(f.registry.clone(), "main").unwrap();
    create_table(&db).await;

    let mut ctx = DbContext::new();
    let _ = db
        .perform_or(
            &mut ctx,
            |_db, _ctx| Box::pin(async move { Err::<(), _>(DbError::internal("boom")) }),
            |_error| (),
        )
        .await;
    // The outermost perform closed the context on exit, clearing the
    // record; later units run normally.
    assert!(!ctx.has_handled_failure());
    assert_eq!(count_rows(&db).await, 0);
}

#[tokio::test]
async fn update_outside_transact_is_its_own_transaction() {
    let f = fixture();
    let db = DbAccess::new(f.registry.clone(), "main").unwrap();
    create_table(&db).await;

    let mut ctx = DbContext::new();
    insert(&db, &mut ctx, 11).await.unwrap();
    assert!(!db.is_open(&ctx));
    assert_eq!(count_rows(&db).await, 1);
}

#[tokio::test]
async fn perform_opens_once_for_nested_calls() {
    let f = fixture();
    let db = DbAccess::new(f.registry.clone(), "main").unwrap();
    create_table(&db).await;

    let mut ctx = DbContext::new();
    db.perform(&mut ctx, |db, ctx| {
        Box::pin(async move {
            assert!(db.is_open(ctx));
            db.perform(ctx, |db, ctx| {
                Box::pin(async move {
                    // Still the same open connection; the inner call did
                    // not re-open and must not close it.
                    assert!(db.is_open(ctx));
                    Ok(())
                })
            })
            .await?;
            assert!(db.is_open(ctx));
            Ok(())
        })
    })
    .await
    .unwrap();
    assert!(!db.is_open(&ctx));
}
