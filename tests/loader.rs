use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

use async_trait::async_trait;
use dataload_deferred::{
    BatchFunction, BoxError, Deferred, DispatchConfig, ExecutionContext, LoadError, Loaded, LoaderIdentity,
    LoaderKind,
};

#[derive(Debug, PartialEq, Eq, Clone)]
struct DummyData(String);

#[derive(Default)]
struct DummyContext {
    map: HashMap<i64, String>,
    calls: RefCell<Vec<Vec<i64>>>,
}

impl DummyContext {
    fn with(entries: &[(i64, &str)]) -> Rc<Self> {
        Rc::new(Self {
            map: entries.iter().map(|(k, v)| (*k, (*v).to_owned())).collect(),
            ..Default::default()
        })
    }

    fn calls(&self) -> Vec<Vec<i64>> {
        self.calls.borrow().clone()
    }
}

struct DummyDataLoader {
    context: Rc<DummyContext>,
    identity: LoaderIdentity,
}

impl DummyDataLoader {
    fn new(context: &Rc<DummyContext>) -> Self {
        Self::named(context, "dummy_data")
    }

    fn named(context: &Rc<DummyContext>, target: &str) -> Self {
        Self {
            context: Rc::clone(context),
            identity: LoaderIdentity::unqualified(LoaderKind::Custom("dummy"), target).unwrap(),
        }
    }
}

#[async_trait(?Send)]
impl BatchFunction for DummyDataLoader {
    type Key = i64;
    type Value = DummyData;

    fn identity(&self) -> &LoaderIdentity {
        &self.identity
    }

    async fn load(&self, keys: &[i64]) -> Result<Loaded<i64, DummyData>, BoxError> {
        self.context.calls.borrow_mut().push(keys.to_vec());
        Ok(keys
            .iter()
            .filter_map(|k| self.context.map.get(k).cloned().map(|v| (*k, DummyData(v))))
            .collect::<Vec<_>>()
            .into())
    }
}

/// Fails every batch, counting how often it was asked.
struct BrokenLoader {
    identity: LoaderIdentity,
    calls: Rc<RefCell<u32>>,
}

#[async_trait(?Send)]
impl BatchFunction for BrokenLoader {
    type Key = i64;
    type Value = DummyData;

    fn identity(&self) -> &LoaderIdentity {
        &self.identity
    }

    async fn load(&self, _keys: &[i64]) -> Result<Loaded<i64, DummyData>, BoxError> {
        *self.calls.borrow_mut() += 1;
        Err("database unavailable".into())
    }
}

/// Returns an aligned result that is one entry short.
struct ShortLoader {
    identity: LoaderIdentity,
}

#[async_trait(?Send)]
impl BatchFunction for ShortLoader {
    type Key = i64;
    type Value = DummyData;

    fn identity(&self) -> &LoaderIdentity {
        &self.identity
    }

    async fn load(&self, keys: &[i64]) -> Result<Loaded<i64, DummyData>, BoxError> {
        Ok(Loaded::Aligned(keys.iter().skip(1).map(|k| Some(DummyData(k.to_string()))).collect()))
    }
}

/// Sleeps before answering, so its batch is still in flight while others settle.
struct SlowLoader {
    context: Rc<DummyContext>,
    identity: LoaderIdentity,
}

#[async_trait(?Send)]
impl BatchFunction for SlowLoader {
    type Key = i64;
    type Value = DummyData;

    fn identity(&self) -> &LoaderIdentity {
        &self.identity
    }

    async fn load(&self, keys: &[i64]) -> Result<Loaded<i64, DummyData>, BoxError> {
        self.context.calls.borrow_mut().push(keys.to_vec());
        tokio::time::sleep(Duration::from_millis(20)).await;
        Ok(keys.iter().map(|k| (*k, DummyData(format!("slow {k}")))).collect::<Vec<_>>().into())
    }
}

fn slow_loader(context: &Rc<DummyContext>) -> SlowLoader {
    SlowLoader {
        context: Rc::clone(context),
        identity: LoaderIdentity::unqualified(LoaderKind::Custom("slow"), "slow").unwrap(),
    }
}

fn data(s: &str) -> Option<DummyData> {
    Some(DummyData(s.to_owned()))
}

#[tokio::test]
async fn basic_load() {
    let context = DummyContext::with(&[(42, "Foo")]);
    let ctx = ExecutionContext::default();

    let loader = ctx.loader(DummyDataLoader::new(&context)).unwrap();
    assert_eq!(ctx.resolve(loader.load(42)).await.unwrap(), data("Foo"));
}

#[tokio::test]
async fn repeated_load() {
    let context = DummyContext::with(&[(42, "Foo")]);
    let ctx = ExecutionContext::default();

    let loader = ctx.loader(DummyDataLoader::new(&context)).unwrap();
    assert_eq!(ctx.resolve(loader.load(42)).await.unwrap(), data("Foo"));

    let cached = loader.load(42);
    assert!(!cached.is_pending());
    assert!(!ctx.has_pending());
    assert_eq!(ctx.resolve(cached).await.unwrap(), data("Foo"));
    assert_eq!(context.calls(), vec![vec![42]]);
}

#[tokio::test]
async fn basic_load_many() {
    let context = DummyContext::with(&[(42, "one fish"), (12, "two fish"), (5, "red fish"), (8, "blue fish")]);
    let ctx = ExecutionContext::default();

    let loader = ctx.loader(DummyDataLoader::new(&context)).unwrap();
    assert_eq!(
        ctx.resolve(loader.load_many(vec![5, 12, 8])).await.unwrap(),
        vec![data("red fish"), data("two fish"), data("blue fish")]
    );
}

#[tokio::test]
async fn load_async() {
    let context = DummyContext::with(&[(42, "one fish"), (12, "two fish"), (5, "red fish"), (8, "blue fish")]);
    let ctx = ExecutionContext::default();
    let loader = ctx.loader(DummyDataLoader::new(&context)).unwrap();

    let one = loader.load(5);
    let many = loader.load_many(vec![5, 42]);
    let missing = loader.load(99);
    let other = loader.load(12);

    assert_eq!(ctx.dispatch().await, 1);
    assert_eq!(one.peek().unwrap().unwrap(), data("red fish"));
    assert_eq!(many.peek().unwrap().unwrap(), vec![data("red fish"), data("one fish")]);
    assert_eq!(missing.peek().unwrap().unwrap(), None);
    assert_eq!(other.peek().unwrap().unwrap(), data("two fish"));
    assert_eq!(context.calls(), vec![vec![5, 42, 99, 12]]);
}

#[tokio::test]
async fn distinct_requests_share_one_batch() {
    let context = DummyContext::with(&[]);
    let ctx = ExecutionContext::default();

    // Separate loader handles for the same identity, as independent resolvers would build them.
    let requests = (1..=20).map(|k| ctx.load(DummyDataLoader::new(&context), k)).collect::<Vec<_>>();
    assert_eq!(ctx.run_until_idle().await.unwrap(), 1);

    assert_eq!(context.calls(), vec![(1..=20).collect::<Vec<_>>()]);
    assert!(requests.iter().all(|request| request.peek().unwrap().unwrap().is_none()));
}

#[tokio::test]
async fn duplicate_requests_are_fetched_once() {
    let context = DummyContext::with(&[(7, "samurai")]);
    let ctx = ExecutionContext::default();
    let loader = ctx.loader(DummyDataLoader::new(&context)).unwrap();

    let first = loader.load(7);
    let second = ctx.load(DummyDataLoader::new(&context), 7);
    ctx.run_until_idle().await.unwrap();

    assert_eq!(context.calls(), vec![vec![7]]);
    assert_eq!(first.peek().unwrap().unwrap(), data("samurai"));
    assert_eq!(second.peek().unwrap().unwrap(), data("samurai"));
}

#[tokio::test]
async fn identities_batch_separately() {
    let context = DummyContext::with(&[(1, "one")]);
    let ctx = ExecutionContext::default();

    let a = ctx.load(DummyDataLoader::named(&context, "a"), 1);
    let b = ctx.load(DummyDataLoader::named(&context, "b"), 1);
    assert_eq!(ctx.dispatch().await, 2);

    assert_eq!(context.calls(), vec![vec![1], vec![1]]);
    assert_eq!(a.peek().unwrap().unwrap(), data("one"));
    assert_eq!(b.peek().unwrap().unwrap(), data("one"));
}

#[tokio::test]
async fn dependent_loads_dispatch_in_order() {
    let context = DummyContext::with(&[(1, "2"), (2, "3"), (3, "done")]);
    let ctx = ExecutionContext::default();
    let loader = ctx.loader(DummyDataLoader::new(&context)).unwrap();

    let next = |loaded: Option<DummyData>, loader: dataload_deferred::Loader<DummyDataLoader>| {
        let key = loaded.and_then(|d| d.0.parse::<i64>().ok());
        loader.load_optional(key)
    };
    let (l1, l2) = (loader.clone(), loader.clone());
    let chained = loader.load(1).then(move |a| next(a, l1)).then(move |b| next(b, l2));

    assert_eq!(ctx.resolve(chained).await.unwrap(), data("done"));
    assert_eq!(context.calls(), vec![vec![1], vec![2], vec![3]]);
    assert_eq!(ctx.ticks(), 3);
}

#[tokio::test]
async fn in_flight_keys_are_not_queued_again() {
    let context = DummyContext::with(&[(1, "fast")]);
    let ctx = ExecutionContext::default();
    let slow = ctx.loader(slow_loader(&context)).unwrap();
    let fast = ctx.loader(DummyDataLoader::new(&context)).unwrap();

    let first = slow.load(9);
    let slow_again = slow.clone();
    let joined = fast.load(1).then(move |_| slow_again.load(9));

    assert_eq!(ctx.dispatch().await, 2);
    assert!(!ctx.has_pending());
    assert_eq!(first.peek().unwrap().unwrap(), data("slow 9"));
    assert_eq!(joined.peek().unwrap().unwrap(), data("slow 9"));
    assert_eq!(context.calls(), vec![vec![9], vec![1]]);
}

#[tokio::test]
async fn batch_failures_reach_every_key_and_are_cached() {
    let calls = Rc::new(RefCell::new(0));
    let ctx = ExecutionContext::default();
    let loader = ctx
        .loader(BrokenLoader {
            identity: LoaderIdentity::unqualified(LoaderKind::Custom("broken"), "things").unwrap(),
            calls: Rc::clone(&calls),
        })
        .unwrap();

    let a = loader.load(1);
    let b = loader.load(2);
    ctx.run_until_idle().await.unwrap();
    for outcome in [a.peek().unwrap(), b.peek().unwrap(), loader.load(1).peek().unwrap()] {
        let err = outcome.unwrap_err();
        assert!(matches!(err, LoadError::BatchFetch { .. }), "{err:?}");
        assert_eq!(err.identity(), Some(loader.identity()));
        assert!(err.to_string().contains("database unavailable"));
    }
    assert_eq!(*calls.borrow(), 1);
}

#[tokio::test]
async fn misaligned_batches_fail() {
    let ctx = ExecutionContext::default();
    let loader = ctx
        .loader(ShortLoader { identity: LoaderIdentity::unqualified(LoaderKind::Custom("short"), "things").unwrap() })
        .unwrap();

    let err = ctx.resolve(loader.load_many(vec![1, 2, 3])).await.unwrap_err();
    assert!(matches!(err, LoadError::MisalignedBatch { requested: 3, returned: 2, .. }), "{err:?}");
}

#[tokio::test]
async fn identity_collisions_are_malformed() {
    let context = DummyContext::with(&[]);
    let ctx = ExecutionContext::default();
    let identity = LoaderIdentity::unqualified(LoaderKind::Custom("dummy"), "dummy_data").unwrap();

    ctx.loader(DummyDataLoader::new(&context)).unwrap();
    let err = ctx.loader(ShortLoader { identity: identity.clone() }).err().unwrap();
    assert!(matches!(err, LoadError::MalformedRequest(_)), "{err:?}");

    let failed = ctx.load(ShortLoader { identity }, 1);
    assert!(matches!(failed.peek(), Some(Err(LoadError::MalformedRequest(_)))));
    assert!(!ctx.has_pending());
}

#[tokio::test]
async fn primed_values_skip_the_fetch() {
    let context = DummyContext::with(&[(1, "fetched")]);
    let ctx = ExecutionContext::default();
    let loader = ctx.loader(DummyDataLoader::new(&context)).unwrap();

    assert!(loader.prime(1, DummyData("primed".to_owned())));
    assert!(!loader.prime(1, DummyData("again".to_owned())));
    assert_eq!(loader.prime_many(vec![(1, DummyData("x".to_owned())), (2, DummyData("two".to_owned()))]), 1);

    let queued = loader.load(3);
    assert!(!loader.prime(3, DummyData("too late".to_owned())));

    assert_eq!(ctx.resolve(loader.load_many(vec![1, 2])).await.unwrap(), vec![data("primed"), data("two")]);
    ctx.run_until_idle().await.unwrap();
    assert_eq!(queued.peek().unwrap().unwrap(), None);
    assert_eq!(context.calls(), vec![vec![3]]);
}

#[tokio::test]
async fn missing_keys_do_not_queue() {
    let context = DummyContext::with(&[]);
    let ctx = ExecutionContext::default();
    let loader = ctx.loader(DummyDataLoader::new(&context)).unwrap();

    assert_eq!(loader.load_optional(None).peek().unwrap().unwrap(), None);
    assert!(!ctx.has_pending());
    assert_eq!(ctx.dispatch().await, 0);
    assert!(context.calls().is_empty());
}

#[tokio::test]
async fn contexts_do_not_share_caches() {
    let context = DummyContext::with(&[(1, "one")]);
    let first = ExecutionContext::default();
    let second = ExecutionContext::default();

    first.resolve(first.load(DummyDataLoader::new(&context), 1)).await.unwrap();
    second.resolve(second.load(DummyDataLoader::new(&context), 1)).await.unwrap();
    assert_eq!(context.calls(), vec![vec![1], vec![1]]);

    let foreign: Deferred<Option<DummyData>> = first.load(DummyDataLoader::new(&context), 2);
    let err = second.resolve(foreign.clone()).await.unwrap_err();
    assert!(matches!(err, LoadError::Stalled { ticks: 0 }), "{err:?}");
    assert_eq!(first.finish(), 1);
    assert!(foreign.is_pending());
}

#[tokio::test]
async fn concurrent_resolvers_wait_for_the_in_flight_tick() {
    let context = DummyContext::with(&[]);
    let ctx = ExecutionContext::default();
    let loader = ctx.loader(slow_loader(&context)).unwrap();

    let (first, second) = futures::join!(ctx.resolve(loader.load(1)), ctx.resolve(loader.load(2)));
    assert_eq!(first.unwrap(), data("slow 1"));
    assert_eq!(second.unwrap(), data("slow 2"));
    assert_eq!(context.calls(), vec![vec![1, 2]]);
    assert_eq!(ctx.ticks(), 1);
    assert!(!ctx.has_in_flight());
}

#[tokio::test]
async fn resolve_alongside_run_until_idle() {
    let context = DummyContext::with(&[]);
    let ctx = ExecutionContext::default();
    let loader = ctx.loader(slow_loader(&context)).unwrap();

    let pending = loader.load(3);
    let (idle, resolved) = futures::join!(ctx.run_until_idle(), ctx.resolve(pending.clone()));
    assert_eq!(idle.unwrap(), 1);
    assert_eq!(resolved.unwrap(), data("slow 3"));
    assert_eq!(context.calls(), vec![vec![3]]);

    let next = loader.load(4);
    let (resolved, idle) = futures::join!(ctx.resolve(next), ctx.run_until_idle());
    assert_eq!(resolved.unwrap(), data("slow 4"));
    assert_eq!(idle.unwrap(), 0);
    assert_eq!(context.calls(), vec![vec![3], vec![4]]);
    assert_eq!(ctx.ticks(), 2);
}

#[tokio::test]
async fn loaders_fail_after_finish() {
    let context = DummyContext::with(&[(1, "one")]);
    let ctx = ExecutionContext::default();
    let loader = ctx.loader(DummyDataLoader::new(&context)).unwrap();
    assert_eq!(ctx.finish(), 0);
    assert!(ctx.is_finished());

    let err = ctx.resolve(loader.load(1)).await.unwrap_err();
    assert!(matches!(err, LoadError::MalformedRequest(_)), "{err:?}");
    assert!(!ctx.has_pending());
    assert!(!loader.prime(2, DummyData("two".to_owned())));
    assert!(matches!(ctx.loader(DummyDataLoader::new(&context)), Err(LoadError::MalformedRequest(_))));
    assert!(context.calls().is_empty());
}

#[tokio::test]
async fn tick_budget_bounds_dependent_chains() {
    let context = DummyContext::with(&[(1, "one"), (2, "two")]);
    let ctx = ExecutionContext::new(DispatchConfig::default().with_max_ticks(1).with_yield_between_ticks(false));
    let loader = ctx.loader(DummyDataLoader::new(&context)).unwrap();

    let second = loader.clone();
    let chained = loader.load(1).then(move |_| second.load(2));
    let err = ctx.resolve(chained).await.unwrap_err();
    assert!(matches!(err, LoadError::TickLimitExceeded { limit: 1 }), "{err:?}");
    assert_eq!(context.calls(), vec![vec![1]]);
}

#[cfg(feature = "stats")]
#[tokio::test]
async fn stats_track_requests_and_batches() {
    let context = DummyContext::with(&[(1, "one")]);
    let ctx = ExecutionContext::default();
    let loader = ctx.loader(DummyDataLoader::new(&context)).unwrap();

    loader.load(1);
    loader.load(1);
    loader.load(2);
    ctx.run_until_idle().await.unwrap();
    loader.load(1);

    let stats = loader.stats();
    assert_eq!(stats.load_requests, 4);
    assert_eq!(stats.joined_pending, 1);
    assert_eq!(stats.cache_hits, 1);
    assert_eq!(stats.batches, 1);
    assert_eq!(stats.keys_fetched, 2);
    assert_eq!(stats.values_found, 1);
    assert_eq!(stats.failed_batches, 0);
}
