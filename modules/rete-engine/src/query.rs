//! Query / Producer / Collector combinators.
//!
//! A `Query<T>` is a recipe. Building it inside a scope yields a `Producer<T>`;
//! collecting a producer into a `Collector<T>` first replays every currently
//! valid match as an added token, then keeps delivering tokens for as long as
//! the scope lives. Producers are reusable across any number of collectors.

use std::any::TypeId;
use std::cell::RefCell;
use std::collections::HashMap;
use std::hash::Hash;
use std::marker::PhantomData;
use std::rc::Rc;
use std::sync::Arc;

use rete_store::{Attribute, Datom, EntityId, Pattern, Snapshot, Triple, Value};

use crate::error::EngineError;
use crate::intern;
use crate::matching::{BindKey, Match, QueryValue, Support, Token};
use crate::node::{InternKey, ScopeId};
use crate::rete::Cx;
use crate::subscriptions::{DatomPort, RevalidationPort};

pub(crate) type Collector<T> = Rc<dyn Fn(&mut Cx<'_>, Token<T>)>;

pub(crate) trait Producer<T> {
    fn collect(&self, cx: &mut Cx<'_>, emit: Collector<T>);
}

struct FnProducer<T, F> {
    f: F,
    _marker: PhantomData<fn(T)>,
}

impl<T, F> Producer<T> for FnProducer<T, F>
where
    F: Fn(&mut Cx<'_>, Collector<T>),
{
    fn collect(&self, cx: &mut Cx<'_>, emit: Collector<T>) {
        (self.f)(cx, emit)
    }
}

pub(crate) fn producer<T: 'static>(
    f: impl Fn(&mut Cx<'_>, Collector<T>) + 'static,
) -> Rc<dyn Producer<T>> {
    Rc::new(FnProducer {
        f,
        _marker: PhantomData,
    })
}

pub(crate) type BuildResult<T> = Result<Rc<dyn Producer<T>>, EngineError>;

type Recipe<T> = dyn Fn(&mut Cx<'_>) -> BuildResult<T> + Send + Sync;

type DeriveFn<T, U> = dyn Fn(&Reads<'_>, &T) -> anyhow::Result<Vec<U>> + Send + Sync;

// ---------------------------------------------------------------------------
// Reads
// ---------------------------------------------------------------------------

/// Snapshot view handed to user functions. Every read is recorded; when a
/// later change touches a recorded pattern the function is re-run.
pub struct Reads<'a> {
    db: &'a dyn Snapshot,
    patterns: RefCell<Vec<Pattern>>,
}

impl<'a> Reads<'a> {
    pub(crate) fn new(db: &'a dyn Snapshot) -> Self {
        Self {
            db,
            patterns: RefCell::new(Vec::new()),
        }
    }

    pub fn query(&self, pattern: Pattern) -> Vec<Triple> {
        let found = self.db.query_index(&pattern);
        self.patterns.borrow_mut().push(pattern);
        found
    }

    pub fn values(&self, entity: EntityId, attribute: impl Into<Attribute>) -> Vec<Value> {
        self.query(Pattern::entity_attribute(entity, attribute))
            .into_iter()
            .map(|t| t.value)
            .collect()
    }

    pub fn value(&self, entity: EntityId, attribute: impl Into<Attribute>) -> Option<Value> {
        self.values(entity, attribute).into_iter().next()
    }

    pub fn contains(&self, triple: &Triple) -> bool {
        self.patterns.borrow_mut().push(Pattern::exact(triple));
        self.db.contains(triple)
    }

    pub(crate) fn into_patterns(self) -> Vec<Pattern> {
        self.patterns.into_inner()
    }
}

// ---------------------------------------------------------------------------
// Query
// ---------------------------------------------------------------------------

pub struct Query<T> {
    recipe: Arc<Recipe<T>>,
}

impl<T> Clone for Query<T> {
    fn clone(&self) -> Self {
        Self {
            recipe: self.recipe.clone(),
        }
    }
}

impl<T> std::fmt::Debug for Query<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Query<{}>", std::any::type_name::<T>())
    }
}

impl Query<Triple> {
    /// Every triple matching `pattern`. Replays through the point-query API,
    /// then follows the store's datoms.
    pub fn pattern(pattern: Pattern) -> Self {
        Query::new(move |_cx| {
            let pattern = pattern.clone();
            Ok(producer(move |cx: &mut Cx<'_>, emit: Collector<Triple>| {
                let port: DatomPort = {
                    let emit = emit.clone();
                    Rc::new(move |cx: &mut Cx<'_>, datom: &Datom| {
                        emit(
                            cx,
                            Token {
                                added: datom.added,
                                item: Match::datom(datom.triple()),
                            },
                        )
                    })
                };
                cx.subscribe(pattern.clone(), port);
                let current = cx.db().query_index(&pattern);
                for triple in current {
                    emit(cx, Token::added(Match::datom(triple)));
                }
            }))
        })
    }
}

impl Query<(EntityId, Value)> {
    /// (entity, value) for every fact of `attribute`.
    pub fn attribute(attribute: impl Into<Attribute>) -> Self {
        Query::pattern(Pattern::attribute(attribute)).map(|_, t| (t.entity, t.value.clone()))
    }
}

impl Query<EntityId> {
    /// Entities carrying `attribute`, once per fact.
    pub fn entities(attribute: impl Into<Attribute>) -> Self {
        Query::pattern(Pattern::attribute(attribute)).map(|_, t| t.entity)
    }

    /// For each upstream entity, its values of `attribute`. One nested
    /// subscription per upstream match, removed with it.
    pub fn lookup(self, attribute: impl Into<Attribute>) -> Query<(EntityId, Value)> {
        let attribute = attribute.into();
        self.nest(
            move |entity| Query::pattern(Pattern::entity_attribute(*entity, attribute.clone())),
            |entity: &EntityId, triple: &Triple| (*entity, triple.value.clone()),
        )
    }
}

impl Query<i64> {
    /// Running sum of the live matches.
    pub fn sum(self) -> Query<i64> {
        self.reductions(0, |acc, token| {
            let v = *token.item.value();
            if token.added {
                acc + v
            } else {
                acc - v
            }
        })
    }
}

impl<T: QueryValue> Query<T> {
    pub(crate) fn new(recipe: impl Fn(&mut Cx<'_>) -> BuildResult<T> + Send + Sync + 'static) -> Self {
        Self {
            recipe: Arc::new(recipe),
        }
    }

    pub(crate) fn build(&self, cx: &mut Cx<'_>) -> BuildResult<T> {
        (self.recipe)(cx)
    }

    /// Fixed matches with constant provenance.
    pub fn values(values: Vec<T>) -> Self {
        Query::new(move |_cx| {
            let values = values.clone();
            Ok(producer(move |cx: &mut Cx<'_>, emit: Collector<T>| {
                for value in &values {
                    emit(cx, Token::added(Match::constant(value.clone())));
                }
            }))
        })
    }

    /// Defer construction of the query to each build.
    pub fn lazy(make: impl Fn() -> Query<T> + Send + Sync + 'static) -> Self {
        Query::new(move |cx| make().build(cx))
    }

    // -----------------------------------------------------------------------
    // Per-match derivation
    // -----------------------------------------------------------------------

    pub fn map<U: QueryValue>(
        self,
        f: impl Fn(&Reads<'_>, &T) -> U + Send + Sync + 'static,
    ) -> Query<U> {
        self.derive_each(Arc::new(
            move |reads: &Reads<'_>, value: &T| -> anyhow::Result<Vec<U>> { Ok(vec![f(reads, value)]) },
        ))
    }

    /// Like `map`, but errors become failures of the enclosing node.
    pub fn try_map<U: QueryValue>(
        self,
        f: impl Fn(&Reads<'_>, &T) -> anyhow::Result<U> + Send + Sync + 'static,
    ) -> Query<U> {
        self.derive_each(Arc::new(
            move |reads: &Reads<'_>, value: &T| -> anyhow::Result<Vec<U>> { f(reads, value).map(|u| vec![u]) },
        ))
    }

    pub fn flat_map<U: QueryValue>(
        self,
        f: impl Fn(&Reads<'_>, &T) -> Vec<U> + Send + Sync + 'static,
    ) -> Query<U> {
        self.derive_each(Arc::new(
            move |reads: &Reads<'_>, value: &T| -> anyhow::Result<Vec<U>> { Ok(f(reads, value)) },
        ))
    }

    /// A flat_map yielding zero or one match, so predicates reading the store
    /// are re-evaluated when what they read changes.
    pub fn filter(
        self,
        predicate: impl Fn(&Reads<'_>, &T) -> bool + Send + Sync + 'static,
    ) -> Query<T> {
        self.flat_map(move |reads, value| {
            if predicate(reads, value) {
                vec![value.clone()]
            } else {
                Vec::new()
            }
        })
    }

    fn derive_each<U: QueryValue>(self, f: Arc<DeriveFn<T, U>>) -> Query<U> {
        Query::new(move |cx| {
            let upstream = self.build(cx)?;
            let f = f.clone();
            Ok(producer(move |cx: &mut Cx<'_>, emit: Collector<U>| {
                let home = cx.scope();
                let children: Rc<RefCell<HashMap<Match<T>, Vec<ScopeId>>>> = Rc::default();
                let f = f.clone();
                upstream.collect(
                    cx,
                    Rc::new(move |cx: &mut Cx<'_>, token: Token<T>| {
                        if token.added {
                            if let Some(scope) = open_derivation(cx, home, &f, &token.item, &emit) {
                                children
                                    .borrow_mut()
                                    .entry(token.item)
                                    .or_default()
                                    .push(scope);
                            }
                        } else if let Some(scope) = take_child(&children, &token.item) {
                            cx.close_scope(scope);
                        }
                    }),
                );
            }))
        })
    }

    // -----------------------------------------------------------------------
    // Nesting and joins
    // -----------------------------------------------------------------------

    /// For each upstream match, subscribe to `body(value)` in a child scope and
    /// emit `combine(value, inner)` resting on both provenances. Retracting the
    /// upstream match closes the child scope and retracts everything it emitted.
    pub fn nest<U: QueryValue, V: QueryValue>(
        self,
        body: impl Fn(&T) -> Query<U> + Send + Sync + 'static,
        combine: impl Fn(&T, &U) -> V + Send + Sync + 'static,
    ) -> Query<V> {
        let body: Arc<dyn Fn(&T) -> Query<U> + Send + Sync> = Arc::new(body);
        let combine: Arc<dyn Fn(&T, &U) -> V + Send + Sync> = Arc::new(combine);
        Query::new(move |cx| {
            let upstream = self.build(cx)?;
            let body = body.clone();
            let combine = combine.clone();
            Ok(producer(move |cx: &mut Cx<'_>, emit: Collector<V>| {
                let home = cx.scope();
                let children: Rc<RefCell<HashMap<Match<T>, Vec<ScopeId>>>> = Rc::default();
                let body = body.clone();
                let combine = combine.clone();
                upstream.collect(
                    cx,
                    Rc::new(move |cx: &mut Cx<'_>, token: Token<T>| {
                        if !token.added {
                            if let Some(scope) = take_child(&children, &token.item) {
                                cx.close_scope(scope);
                            }
                            return;
                        }
                        let Some(scope) = cx.open_scope(home) else {
                            return;
                        };
                        children
                            .borrow_mut()
                            .entry(token.item.clone())
                            .or_default()
                            .push(scope);

                        let live: Rc<RefCell<Vec<Match<V>>>> = Rc::default();
                        cx.on_close(scope, retract_all(live.clone(), emit.clone()));

                        let outer = token.item;
                        let mut child = cx.enter(scope);
                        match body(outer.value()).build(&mut child) {
                            Ok(inner) => {
                                let emit = emit.clone();
                                let combine = combine.clone();
                                inner.collect(
                                    &mut child,
                                    Rc::new(move |cx: &mut Cx<'_>, token: Token<U>| {
                                        let out = outer.combine(&token.item, |t, u| combine(t, u));
                                        if token.added {
                                            live.borrow_mut().push(out.clone());
                                            emit(cx, Token::added(out));
                                        } else if remove_one(&live, &out) {
                                            emit(cx, Token::retracted(out));
                                        }
                                    }),
                                );
                            }
                            Err(err) => child.fail(err),
                        }
                    }),
                );
            }))
        })
    }

    /// Every pair. Re-subscribes `other` per match of `self`; intern `other`
    /// to share it.
    pub fn product<U: QueryValue>(self, other: Query<U>) -> Query<(T, U)> {
        self.nest(move |_| other.clone(), |t, u| (t.clone(), u.clone()))
    }

    /// Pairs whose projected keys are equal. Keys may read the store; a key
    /// change retracts the old pair and asserts the new one.
    pub fn join<U: QueryValue, K: PartialEq + 'static>(
        self,
        other: Query<U>,
        left_key: impl Fn(&Reads<'_>, &T) -> K + Send + Sync + 'static,
        right_key: impl Fn(&Reads<'_>, &U) -> K + Send + Sync + 'static,
    ) -> Query<(T, U)> {
        self.product(other)
            .filter(move |reads, (l, r)| left_key(reads, l) == right_key(reads, r))
    }

    /// Both operands' matches, unordered and not deduplicated.
    pub fn union(self, other: Query<T>) -> Query<T> {
        Query::new(move |cx| {
            let left = self.build(cx)?;
            let right = other.build(cx)?;
            Ok(producer(move |cx: &mut Cx<'_>, emit: Collector<T>| {
                left.collect(cx, emit.clone());
                right.collect(cx, emit);
            }))
        })
    }

    // -----------------------------------------------------------------------
    // Stateful operators
    // -----------------------------------------------------------------------

    /// Fold the token stream into one running value, exposed as a single
    /// match. A changed accumulator is emitted as retract-old + assert-new.
    pub fn reductions<A: QueryValue>(
        self,
        seed: A,
        fold: impl Fn(&A, &Token<T>) -> A + Send + Sync + 'static,
    ) -> Query<A> {
        let fold: Arc<dyn Fn(&A, &Token<T>) -> A + Send + Sync> = Arc::new(fold);
        Query::new(move |cx| {
            let upstream = self.build(cx)?;
            let seed = seed.clone();
            let fold = fold.clone();
            Ok(producer(move |cx: &mut Cx<'_>, emit: Collector<A>| {
                let origin = cx.next_origin();
                // `current` stays None while the upstream replays.
                let state: Rc<RefCell<(A, Option<Match<A>>)>> =
                    Rc::new(RefCell::new((seed.clone(), None)));
                {
                    let state = state.clone();
                    let emit = emit.clone();
                    let fold = fold.clone();
                    upstream.collect(
                        cx,
                        Rc::new(move |cx: &mut Cx<'_>, token: Token<T>| {
                            let swap = {
                                let mut st = state.borrow_mut();
                                let next = fold(&st.0, &token);
                                if next == st.0 {
                                    None
                                } else {
                                    st.0 = next.clone();
                                    match st.1.take() {
                                        None => None,
                                        Some(old) => {
                                            let new = Match::new(next, Support::computed(origin));
                                            st.1 = Some(new.clone());
                                            Some((old, new))
                                        }
                                    }
                                }
                            };
                            if let Some((old, new)) = swap {
                                emit(cx, Token::retracted(old));
                                emit(cx, Token::added(new));
                            }
                        }),
                    );
                }
                let initial = {
                    let mut st = state.borrow_mut();
                    let first = Match::new(st.0.clone(), Support::computed(origin));
                    st.1 = Some(first.clone());
                    first
                };
                emit(cx, Token::added(initial));
            }))
        })
    }

    /// Number of live matches.
    pub fn count(self) -> Query<i64> {
        self.reductions(0, |acc, token| if token.added { acc + 1 } else { acc - 1 })
    }

    /// Each value once, for as long as at least one underlying match holds it.
    pub fn distinct(self) -> Query<T> {
        Query::new(move |cx| {
            let upstream = self.build(cx)?;
            Ok(producer(move |cx: &mut Cx<'_>, emit: Collector<T>| {
                let origin = cx.next_origin();
                let counts: Rc<RefCell<HashMap<T, usize>>> = Rc::default();
                upstream.collect(
                    cx,
                    Rc::new(move |cx: &mut Cx<'_>, token: Token<T>| {
                        let value = token.item.into_value();
                        let edge = {
                            let mut counts = counts.borrow_mut();
                            if token.added {
                                let n = counts.entry(value.clone()).or_insert(0);
                                *n += 1;
                                *n == 1
                            } else {
                                match counts.get_mut(&value) {
                                    Some(n) if *n > 1 => {
                                        *n -= 1;
                                        false
                                    }
                                    Some(_) => {
                                        counts.remove(&value);
                                        true
                                    }
                                    None => false,
                                }
                            }
                        };
                        if edge {
                            emit(
                                cx,
                                Token {
                                    added: token.added,
                                    item: Match::new(value, Support::computed(origin)),
                                },
                            );
                        }
                    }),
                );
            }))
        })
    }

    // -----------------------------------------------------------------------
    // Identity
    // -----------------------------------------------------------------------

    /// Share one node across every use of `key` within an engine.
    pub fn intern(self, key: impl Into<String>) -> Query<T> {
        let name = key.into();
        Query::new(move |cx| {
            let key = InternKey {
                type_id: TypeId::of::<T>(),
                name: name.clone(),
            };
            intern::intern(cx, key, &self)
        })
    }

    /// Tag every match with `key`; recover the tagged provenance downstream
    /// with `Match::bound`.
    pub fn bind(self, key: BindKey) -> Query<T> {
        Query::new(move |cx| {
            let upstream = self.build(cx)?;
            Ok(producer(move |cx: &mut Cx<'_>, emit: Collector<T>| {
                upstream.collect(
                    cx,
                    Rc::new(move |cx: &mut Cx<'_>, token: Token<T>| {
                        emit(
                            cx,
                            Token {
                                added: token.added,
                                item: token.item.bind(key),
                            },
                        )
                    }),
                );
            }))
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Child scope for one upstream match of a derivation: evaluates `f`,
/// registers a revalidation entry over what it read, and retracts the outputs
/// when the scope closes.
fn open_derivation<T: QueryValue, U: QueryValue>(
    cx: &mut Cx<'_>,
    home: ScopeId,
    f: &Arc<DeriveFn<T, U>>,
    item: &Match<T>,
    emit: &Collector<U>,
) -> Option<ScopeId> {
    let scope = cx.open_scope(home)?;
    let live: Rc<RefCell<Vec<Match<U>>>> = Rc::default();
    cx.on_close(scope, retract_all(live.clone(), emit.clone()));

    let (outputs, patterns) = evaluate(cx, f, item);
    live.borrow_mut().extend(outputs.iter().cloned());

    if !patterns.is_empty() {
        let port: RevalidationPort = {
            let f = f.clone();
            let item = item.clone();
            let live = live.clone();
            let emit = emit.clone();
            Rc::new(move |cx: &mut Cx<'_>| {
                let (fresh, patterns) = evaluate(cx, &f, &item);
                let stale = std::mem::replace(&mut *live.borrow_mut(), fresh.clone());
                emit_diff(cx, &emit, stale, fresh);
                patterns
            })
        };
        cx.enter(scope).revalidate(patterns, port);
    }

    for out in outputs {
        emit(cx, Token::added(out));
    }
    Some(scope)
}

fn evaluate<T: QueryValue, U: QueryValue>(
    cx: &mut Cx<'_>,
    f: &Arc<DeriveFn<T, U>>,
    item: &Match<T>,
) -> (Vec<Match<U>>, Vec<Pattern>) {
    let db = cx.db().clone();
    let reads = Reads::new(&*db);
    let result = f(&reads, item.value());
    let patterns = reads.into_patterns();
    match result {
        Ok(values) => (values.into_iter().map(|v| item.derive(v)).collect(), patterns),
        Err(err) => {
            cx.fail(EngineError::Query(err));
            (Vec::new(), patterns)
        }
    }
}

/// Retract what is in `stale` but not `fresh`, assert the reverse. Multiset
/// semantics.
fn emit_diff<U: QueryValue>(
    cx: &mut Cx<'_>,
    emit: &Collector<U>,
    stale: Vec<Match<U>>,
    fresh: Vec<Match<U>>,
) {
    let mut added = fresh;
    let mut removed = Vec::new();
    for old in stale {
        match added.iter().position(|m| *m == old) {
            Some(pos) => {
                added.swap_remove(pos);
            }
            None => removed.push(old),
        }
    }
    for old in removed {
        emit(cx, Token::retracted(old));
    }
    for new in added {
        emit(cx, Token::added(new));
    }
}

fn retract_all<U: QueryValue>(
    live: Rc<RefCell<Vec<Match<U>>>>,
    emit: Collector<U>,
) -> crate::node::CloseHook {
    Box::new(move |cx: &mut Cx<'_>| {
        let stale = std::mem::take(&mut *live.borrow_mut());
        for old in stale {
            emit(cx, Token::retracted(old));
        }
    })
}

fn remove_one<U: PartialEq>(live: &RefCell<Vec<U>>, item: &U) -> bool {
    let mut live = live.borrow_mut();
    match live.iter().position(|m| m == item) {
        Some(pos) => {
            live.swap_remove(pos);
            true
        }
        None => false,
    }
}

fn take_child<K: Eq + Hash>(
    children: &RefCell<HashMap<K, Vec<ScopeId>>>,
    key: &K,
) -> Option<ScopeId> {
    let mut children = children.borrow_mut();
    let scopes = children.get_mut(key)?;
    let scope = scopes.pop();
    if scopes.is_empty() {
        children.remove(key);
    }
    scope
}
