//! Consistent writes against observed premises.

mod harness;

use std::time::Duration;

use anyhow::{anyhow, Result};
use harness::{init_tracing, Harness};
use rete_engine::{
    ConsistentWriter, Datom, Engine, EngineConfig, EntityId, MemoryStore, Query, WriteError,
};

fn e(n: u64) -> EntityId {
    EntityId(n)
}

#[tokio::test]
async fn write_with_holding_premise_commits_and_waits_for_the_engine() -> Result<()> {
    let h = Harness::new();
    h.write(vec![Datom::add(e(1), "stock", 3i64)]).await;

    let (_sub, mut rx) = h.engine.subscribe(Query::attribute("stock")).await?;
    let stock = rx.recv().await.ok_or_else(|| anyhow!("no initial set"))?.asserted[0].clone();

    let writer = ConsistentWriter::new(h.store.clone(), h.engine.clone());
    let change = writer
        .transact(
            &[stock.premise()],
            vec![
                Datom::retract(e(1), "stock", 3i64),
                Datom::add(e(1), "stock", 2i64),
            ],
        )
        .await?;

    assert!(h.engine.current_version() >= change.db_after.version());
    // The engine already processed the write, so the premise is gone.
    assert!(stock.is_invalidated());
    Ok(())
}

#[tokio::test]
async fn invalidated_premise_aborts_the_write() -> Result<()> {
    let h = Harness::new();
    h.write(vec![Datom::add(e(1), "stock", 3i64)]).await;

    let (_sub, mut rx) = h.engine.subscribe(Query::attribute("stock")).await?;
    let stock = rx.recv().await.ok_or_else(|| anyhow!("no initial set"))?.asserted[0].clone();

    h.write(vec![Datom::retract(e(1), "stock", 3i64)]).await;
    assert!(stock.is_invalidated());

    let writer = ConsistentWriter::new(h.store.clone(), h.engine.clone());
    let version = h.store.snapshot().version();
    let result = writer
        .transact(&[stock.premise()], vec![Datom::add(e(2), "order", "x")])
        .await;
    assert!(matches!(result, Err(WriteError::Invalidated(_))));
    assert_eq!(h.store.snapshot().version(), version, "nothing was written");
    Ok(())
}

/// Engine over `store` that only sees changes forwarded explicitly.
async fn lagging_engine(store: &MemoryStore) -> Result<Engine> {
    init_tracing();
    Ok(Engine::spawn(store.snapshot(), EngineConfig::default())?)
}

#[tokio::test]
async fn premise_contradicted_by_an_unprocessed_write_is_rejected() -> Result<()> {
    let store = MemoryStore::new();
    let engine = lagging_engine(&store).await?;
    let seed = store.transact(vec![Datom::add(e(1), "stock", 3i64)]).await;
    engine.propagate_change(seed.clone())?;
    engine.await_version(seed.db_after.version()).await?;

    let (_sub, mut rx) = engine.subscribe(Query::attribute("stock")).await?;
    let stock = rx.recv().await.ok_or_else(|| anyhow!("no initial set"))?.asserted[0].clone();

    // The store moves on; the engine does not hear about it.
    store.transact(vec![Datom::retract(e(1), "stock", 3i64)]).await;
    assert!(!stock.is_invalidated());

    let writer = ConsistentWriter::new(store.clone(), engine.clone());
    let result = writer
        .transact(&[stock.premise()], vec![Datom::add(e(2), "order", "x")])
        .await;
    assert!(matches!(result, Err(WriteError::Invalidated(_))));
    Ok(())
}

#[tokio::test]
async fn inconclusive_premise_waits_for_the_engine_to_catch_up() -> Result<()> {
    let store = MemoryStore::new();
    let changes = store.subscribe();
    let engine = lagging_engine(&store).await?;
    let seed = store.transact(vec![Datom::add(e(1), "stock", 3i64)]).await;
    engine.propagate_change(seed.clone())?;
    engine.await_version(seed.db_after.version()).await?;

    let (_sub, mut rx) = engine.subscribe(Query::attribute("stock").count()).await?;
    let count = rx.recv().await.ok_or_else(|| anyhow!("no initial set"))?.asserted[0].clone();

    // An unrelated write the engine has not seen yet.
    store.transact(vec![Datom::add(e(9), "note", "hi")]).await;

    let writer = ConsistentWriter::new(store.clone(), engine.clone());
    let premise = count.premise();
    let pending = tokio::spawn(async move {
        writer
            .transact(&[premise], vec![Datom::add(e(2), "order", "x")])
            .await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!pending.is_finished(), "must wait while the premise cannot be checked");

    // Forward the whole history; the seed arrives stale and is skipped.
    engine.attach(changes);
    let change = pending.await??;
    assert_eq!(change.db_after.version(), 3);
    assert!(engine.current_version() >= 3);
    assert!(!count.is_invalidated());
    Ok(())
}
