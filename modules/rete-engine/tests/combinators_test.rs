//! Combinator semantics checked against the engine: incremental results must
//! always agree with a fresh evaluation of the same query.

mod harness;

use anyhow::{anyhow, Result};
use harness::{sorted, Harness, Mirror};
use rete_engine::{BindKey, Datom, EntityId, Query, Validity, Value};

fn e(n: u64) -> EntityId {
    EntityId(n)
}

fn colors() -> Query<Value> {
    Query::attribute("color").map(|_, (_, v)| v.clone())
}

async fn seed_colors(h: &Harness) {
    h.write(vec![
        Datom::add(e(1), "color", "red"),
        Datom::add(e(2), "color", "red"),
        Datom::add(e(3), "color", "blue"),
        Datom::add(e(4), "shape", "square"),
        Datom::add(e(5), "shape", "circle"),
    ])
    .await;
}

#[tokio::test]
async fn distinct_is_idempotent() -> Result<()> {
    let h = Harness::new();
    seed_colors(&h).await;

    let once = sorted(h.engine.evaluate(colors().distinct()).await?);
    let twice = sorted(h.engine.evaluate(colors().distinct().distinct()).await?);
    assert_eq!(once, vec![Value::from("blue"), Value::from("red")]);
    assert_eq!(once, twice);
    Ok(())
}

#[tokio::test]
async fn distinct_tracks_the_last_holder_of_a_value() -> Result<()> {
    let h = Harness::new();
    seed_colors(&h).await;

    let (_sub, mut rx) = h.engine.subscribe(colors().distinct()).await?;
    let mut mirror = Mirror::new();
    mirror.apply(&rx.recv().await.ok_or_else(|| anyhow!("no initial set"))?);

    // One of two reds goes away: no change.
    h.write(vec![Datom::retract(e(1), "color", "red")]).await;
    assert!(rx.try_recv().is_err());

    // The last red goes away.
    h.write(vec![Datom::retract(e(2), "color", "red")]).await;
    let set = rx.recv().await.ok_or_else(|| anyhow!("no change set"))?;
    assert_eq!(set.retracted_values(), vec![Value::from("red")]);
    mirror.apply(&set);
    assert_eq!(mirror.sorted(), vec![Value::from("blue")]);
    Ok(())
}

#[tokio::test]
async fn union_is_commutative_and_associative() -> Result<()> {
    let h = Harness::new();
    seed_colors(&h).await;
    let shapes = || Query::attribute("shape").map(|_, (_, v)| v.clone());
    let extra = || Query::values(vec![Value::from("red"), Value::from("tiny")]);

    let ab = sorted(h.engine.evaluate(colors().union(shapes())).await?);
    let ba = sorted(h.engine.evaluate(shapes().union(colors())).await?);
    assert_eq!(ab.len(), 5);
    assert_eq!(ab, ba);

    let left = sorted(h.engine.evaluate(colors().union(shapes()).union(extra())).await?);
    let right = sorted(h.engine.evaluate(colors().union(shapes().union(extra()))).await?);
    assert_eq!(left.len(), 7);
    assert_eq!(left, right);
    Ok(())
}

#[tokio::test]
async fn product_size_is_the_product_of_sizes() -> Result<()> {
    let h = Harness::new();
    seed_colors(&h).await;

    let pairs = h
        .engine
        .evaluate(Query::entities("color").product(Query::entities("shape")))
        .await?;
    assert_eq!(pairs.len(), 3 * 2);

    let (_sub, mut rx) = h
        .engine
        .subscribe(Query::entities("color").product(Query::entities("shape")).count())
        .await?;
    let initial = rx.recv().await.ok_or_else(|| anyhow!("no initial set"))?;
    assert_eq!(initial.asserted_values(), vec![6]);

    h.write(vec![Datom::add(e(6), "shape", "star")]).await;
    let set = rx.recv().await.ok_or_else(|| anyhow!("no change set"))?;
    assert_eq!(set.asserted_values(), vec![9]);

    h.write(vec![Datom::retract(e(3), "color", "blue")]).await;
    let set = rx.recv().await.ok_or_else(|| anyhow!("no change set"))?;
    assert_eq!(set.asserted_values(), vec![6]);
    Ok(())
}

#[tokio::test]
async fn reductions_follow_the_live_set() -> Result<()> {
    let h = Harness::new();
    let scores = || {
        Query::attribute("score").try_map(|_, (_, v)| v.as_int().ok_or_else(|| anyhow!("not a score")))
    };
    let (_sum, mut sums) = h.engine.subscribe(scores().sum()).await?;
    let (_count, mut counts) = h.engine.subscribe(scores().count()).await?;
    let mut sum = Mirror::new();
    let mut count = Mirror::new();
    sum.apply(&sums.recv().await.ok_or_else(|| anyhow!("no initial set"))?);
    count.apply(&counts.recv().await.ok_or_else(|| anyhow!("no initial set"))?);
    assert_eq!(sum.values, vec![0]);
    assert_eq!(count.values, vec![0]);

    let writes = vec![
        vec![Datom::add(e(1), "score", 10i64), Datom::add(e(2), "score", 5i64)],
        vec![Datom::retract(e(1), "score", 10i64), Datom::add(e(1), "score", 7i64)],
        vec![Datom::add(e(3), "score", 1i64)],
        vec![Datom::retract(e(2), "score", 5i64)],
    ];
    for datoms in writes {
        h.write(datoms).await;
        while let Ok(set) = sums.try_recv() {
            sum.apply(&set);
        }
        while let Ok(set) = counts.try_recv() {
            count.apply(&set);
        }

        let live = h.engine.evaluate(scores()).await?;
        assert_eq!(sum.values, vec![live.iter().sum::<i64>()]);
        assert_eq!(count.values, vec![live.len() as i64]);
    }
    assert_eq!(sum.values, vec![8]);
    Ok(())
}

#[tokio::test]
async fn computed_matches_validate_inconclusive() -> Result<()> {
    let h = Harness::new();
    seed_colors(&h).await;

    let (_sub, mut rx) = h.engine.subscribe(colors().count()).await?;
    let initial = rx.recv().await.ok_or_else(|| anyhow!("no initial set"))?;
    let db = h.store.snapshot();
    assert_eq!(initial.asserted[0].premise().validate(&*db), Validity::Inconclusive);

    let (_sub, mut rx) = h.engine.subscribe(colors()).await?;
    let initial = rx.recv().await.ok_or_else(|| anyhow!("no initial set"))?;
    assert!(initial
        .asserted
        .iter()
        .all(|m| m.premise().validate(&*db) == Validity::Valid));
    Ok(())
}

#[tokio::test]
async fn incremental_results_match_fresh_evaluation() -> Result<()> {
    let h = Harness::new();
    let query = || {
        Query::entities("person")
            .lookup("name")
            .filter(|reads, (entity, _)| reads.value(*entity, "active") == Some(Value::Bool(true)))
            .map(|_, (_, name)| name.clone())
    };

    let (_sub, mut rx) = h.engine.subscribe(query()).await?;
    let mut mirror = Mirror::new();
    mirror.apply(&rx.recv().await.ok_or_else(|| anyhow!("no initial set"))?);

    let writes = vec![
        vec![Datom::add(e(1), "person", true), Datom::add(e(1), "name", "ann")],
        vec![Datom::add(e(1), "active", true)],
        vec![
            Datom::add(e(2), "person", true),
            Datom::add(e(2), "name", "bob"),
            Datom::add(e(2), "active", true),
        ],
        vec![Datom::retract(e(1), "name", "ann"), Datom::add(e(1), "name", "anna")],
        vec![Datom::retract(e(2), "active", true), Datom::add(e(2), "active", false)],
        vec![Datom::retract(e(1), "person", true)],
        vec![Datom::add(e(2), "active", true), Datom::retract(e(2), "active", false)],
    ];
    for datoms in writes {
        h.write(datoms).await;
        while let Ok(set) = rx.try_recv() {
            mirror.apply(&set);
        }
        let fresh = sorted(h.engine.evaluate(query()).await?);
        assert_eq!(mirror.sorted(), fresh);
    }
    assert_eq!(mirror.sorted(), vec![Value::from("bob")]);
    Ok(())
}

#[tokio::test]
async fn join_re_evaluates_when_a_key_changes() -> Result<()> {
    let h = Harness::new();
    h.write(vec![
        Datom::add(e(1), "person", true),
        Datom::add(e(1), "team", e(10)),
        Datom::add(e(10), "team-name", "core"),
        Datom::add(e(11), "team-name", "web"),
    ])
    .await;

    let members = Query::entities("person").join(
        Query::entities("team-name"),
        |reads, person| reads.value(*person, "team").and_then(|v| v.as_ref_id()),
        |_, team| Some(*team),
    );
    let (_sub, mut rx) = h.engine.subscribe(members).await?;
    let initial = rx.recv().await.ok_or_else(|| anyhow!("no initial set"))?;
    assert_eq!(initial.asserted_values(), vec![(e(1), e(10))]);

    h.write(vec![
        Datom::retract(e(1), "team", e(10)),
        Datom::add(e(1), "team", e(11)),
    ])
    .await;
    let set = rx.recv().await.ok_or_else(|| anyhow!("no change set"))?;
    assert_eq!(set.retracted_values(), vec![(e(1), e(10))]);
    assert_eq!(set.asserted_values(), vec![(e(1), e(11))]);
    Ok(())
}

#[tokio::test]
async fn values_and_bind_expose_provenance() -> Result<()> {
    let h = Harness::new();
    h.write(vec![Datom::add(e(1), "name", "a")]).await;

    let key = BindKey::fresh();
    let tagged = Query::attribute("name").bind(key).product(Query::values(vec![1i64, 2]));
    let (_sub, mut rx) = h.engine.subscribe(tagged).await?;
    let initial = rx.recv().await.ok_or_else(|| anyhow!("no initial set"))?;
    assert_eq!(initial.asserted.len(), 2);
    for m in &initial.asserted {
        let bound = m.as_match().bound(key).ok_or_else(|| anyhow!("binding lost"))?;
        assert_eq!(
            bound.datoms(),
            vec![rete_engine::Triple::new(e(1), "name", "a")]
        );
    }
    Ok(())
}

#[tokio::test]
async fn a_panicking_derivation_does_not_drop_its_siblings() -> Result<()> {
    let h = Harness::new();
    let query = || {
        Query::attribute("v").map(|_, (_, v)| {
            if *v == Value::from("boom") {
                panic!("cannot map {v:?}");
            }
            v.clone()
        })
    };
    let (_sub, mut rx) = h.engine.subscribe(query()).await?;
    let mut mirror = Mirror::new();
    mirror.apply(&rx.recv().await.ok_or_else(|| anyhow!("no initial set"))?);

    h.write(vec![
        Datom::add(e(1), "v", "boom"),
        Datom::add(e(2), "v", "ok"),
    ])
    .await;
    let set = rx.recv().await.ok_or_else(|| anyhow!("no change set"))?;
    assert_eq!(set.asserted_values(), vec![Value::from("ok")]);
    assert_eq!(set.failures.len(), 1);
    mirror.apply(&set);

    h.write(vec![Datom::retract(e(1), "v", "boom")]).await;
    while let Ok(set) = rx.try_recv() {
        mirror.apply(&set);
    }
    assert_eq!(mirror.sorted(), sorted(h.engine.evaluate(query()).await?));
    assert_eq!(mirror.sorted(), vec![Value::from("ok")]);
    Ok(())
}
