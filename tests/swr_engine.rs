//! End-to-end behaviour of subscriptions, sessions and mutations on a paused
//! tokio clock.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::time::sleep;

use swrkit::{
    CacheEntry, CacheStore, Cleanup, Fingerprint, Key, LiveResult, MemoryStore, MutateOptions,
    Producer, ProducerError, SessionState, SharedResult, SwrConfig, SwrContext,
};

type Ctx = SwrContext<String>;

fn ms(value: u64) -> Duration {
    Duration::from_millis(value)
}

fn fingerprint(key: &str) -> Fingerprint {
    Fingerprint::of("", &[json!(key)])
}

/// Producer that takes 10ms and answers `loaded:<first arg>`.
fn slow_loader(calls: Arc<AtomicUsize>) -> Producer<String, ProducerError> {
    Producer::from_async(move |args: Vec<Value>| {
        calls.fetch_add(1, Ordering::SeqCst);
        async move {
            sleep(ms(10)).await;
            let name = args.first().and_then(Value::as_str).unwrap_or_default();
            Ok(format!("loaded:{name}"))
        }
    })
}

/// Producer whose outcome for call `n` (zero-based) is `script(n)`.
fn scripted<F>(calls: Arc<AtomicUsize>, script: F) -> Producer<String, ProducerError>
where
    F: Fn(usize) -> Result<String, ProducerError> + Send + Sync + 'static,
{
    let script = Arc::new(script);
    Producer::from_async(move |_args: Vec<Value>| {
        let call = calls.fetch_add(1, Ordering::SeqCst);
        let script = Arc::clone(&script);
        async move {
            sleep(ms(10)).await;
            script(call)
        }
    })
}

#[tokio::test(start_paused = true)]
async fn concurrent_subscribers_share_one_fetch() {
    let ctx = Ctx::new(SwrConfig {
        ttl: ms(1000),
        ..Default::default()
    });
    let calls = Arc::new(AtomicUsize::new(0));

    let first = ctx.subscribe("user/1", slow_loader(Arc::clone(&calls)));
    assert_eq!(
        first.snapshot(),
        LiveResult {
            data: None,
            error: None,
            is_validating: true,
        }
    );

    sleep(ms(5)).await;
    let second = ctx.subscribe("user/1", slow_loader(Arc::clone(&calls)));
    assert!(second.is_validating());
    assert!(second.data().is_none());

    sleep(ms(6)).await;
    for subscription in [&first, &second] {
        assert_eq!(subscription.data().as_deref(), Some("loaded:user/1"));
        assert!(subscription.error().is_none());
        assert!(!subscription.is_validating());
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(ctx.subscriber_count(&fingerprint("user/1")), 2);
}

#[tokio::test(start_paused = true)]
async fn many_subscribers_during_flight_dedupe() {
    let ctx = Ctx::default();
    let calls = Arc::new(AtomicUsize::new(0));

    let subscriptions: Vec<_> = (0..8)
        .map(|_| ctx.subscribe("feed", slow_loader(Arc::clone(&calls))))
        .collect();

    sleep(ms(20)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(
        subscriptions
            .iter()
            .all(|subscription| subscription.data().as_deref() == Some("loaded:feed"))
    );
    assert_eq!(ctx.subscriber_count(&fingerprint("feed")), 8);
}

#[tokio::test(start_paused = true)]
async fn fresh_entry_is_served_without_refetch() {
    let ctx = Ctx::default();
    let calls = Arc::new(AtomicUsize::new(0));

    let _first = ctx.subscribe("user/1", slow_loader(Arc::clone(&calls)));
    sleep(ms(100)).await;

    let late = ctx.subscribe("user/1", slow_loader(Arc::clone(&calls)));
    assert_eq!(late.data().as_deref(), Some("loaded:user/1"));
    assert!(!late.is_validating());

    sleep(ms(100)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn stale_entry_revalidates_with_data_visible() {
    let config = SwrConfig {
        deduping_interval: ms(50),
        ..Default::default()
    };
    let ctx = Ctx::new(config);
    let calls = Arc::new(AtomicUsize::new(0));
    let producer = scripted(Arc::clone(&calls), |call| Ok(format!("v{call}")));

    let first = ctx.subscribe("profile", producer.clone());
    sleep(ms(100)).await;
    assert_eq!(first.data().as_deref(), Some("v0"));

    let second = ctx.subscribe("profile", producer);
    assert_eq!(second.data().as_deref(), Some("v0"));
    assert!(second.is_validating());
    assert!(first.is_validating());

    sleep(ms(11)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(first.data().as_deref(), Some("v1"));
    assert_eq!(second.data().as_deref(), Some("v1"));
    assert!(!second.is_validating());
}

#[tokio::test(start_paused = true)]
async fn failures_are_retried_until_success() {
    let config = SwrConfig {
        error_retry_interval: ms(100),
        ..Default::default()
    };
    let ctx = Ctx::new(config);
    let calls = Arc::new(AtomicUsize::new(0));
    let producer = scripted(Arc::clone(&calls), |call| {
        if call < 2 {
            Err(ProducerError::new("unavailable"))
        } else {
            Ok("recovered".to_string())
        }
    });

    let subscription = ctx.subscribe("flaky", producer);

    sleep(ms(15)).await;
    let snapshot = subscription.snapshot();
    assert!(snapshot.data.is_none());
    assert_eq!(snapshot.error, Some(ProducerError::new("unavailable")));
    assert!(!snapshot.is_validating);
    assert_eq!(
        ctx.session_state(&fingerprint("flaky")),
        Some(SessionState::Scheduled)
    );

    sleep(ms(225)).await;
    let snapshot = subscription.snapshot();
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(snapshot.data.as_deref(), Some("recovered"));
    assert!(snapshot.error.is_none());
    assert_eq!(
        ctx.session_state(&fingerprint("flaky")),
        Some(SessionState::Idle)
    );
}

#[tokio::test(start_paused = true)]
async fn refresh_failure_keeps_previous_data() {
    let config = SwrConfig {
        refresh_interval: ms(100),
        should_retry_on_error: false,
        ..Default::default()
    };
    let ctx = Ctx::new(config);
    let calls = Arc::new(AtomicUsize::new(0));
    let producer = scripted(Arc::clone(&calls), |call| match call {
        0 => Ok("first".to_string()),
        _ => Err(ProducerError::new("refresh failed")),
    });

    let subscription = ctx.subscribe("dashboard", producer);

    sleep(ms(130)).await;
    let snapshot = subscription.snapshot();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(snapshot.data.as_deref(), Some("first"));
    assert_eq!(snapshot.error, Some(ProducerError::new("refresh failed")));
    assert_eq!(
        ctx.session_state(&fingerprint("dashboard")),
        Some(SessionState::Failed)
    );
}

#[tokio::test(start_paused = true)]
async fn last_detach_stops_refreshing() {
    let config = SwrConfig {
        refresh_interval: ms(50),
        ..Default::default()
    };
    let ctx = Ctx::new(config);
    let calls = Arc::new(AtomicUsize::new(0));

    let subscription = ctx.subscribe("ticker", slow_loader(Arc::clone(&calls)));
    sleep(ms(20)).await;
    drop(subscription);

    sleep(ms(500)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(ctx.subscriber_count(&fingerprint("ticker")), 0);
    assert!(ctx.session_state(&fingerprint("ticker")).is_none());
}

#[tokio::test(start_paused = true)]
async fn grace_period_keeps_entry_for_quick_resubscribe() {
    let config = SwrConfig {
        invalidated_cache_ttl: ms(1000),
        ..Default::default()
    };
    let ctx = Ctx::new(config);
    let calls = Arc::new(AtomicUsize::new(0));
    let key = fingerprint("user/1");

    let first = ctx.subscribe("user/1", slow_loader(Arc::clone(&calls)));
    sleep(ms(20)).await;
    drop(first);
    assert!(ctx.store().get(key.as_str()).is_some());

    sleep(ms(480)).await;
    let second = ctx.subscribe("user/1", slow_loader(Arc::clone(&calls)));
    assert_eq!(second.data().as_deref(), Some("loaded:user/1"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    drop(second);

    sleep(ms(1001)).await;
    assert!(ctx.store().get(key.as_str()).is_none());

    let third = ctx.subscribe("user/1", slow_loader(Arc::clone(&calls)));
    assert!(third.data().is_none());
    assert!(third.is_validating());
    sleep(ms(11)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(third.data().as_deref(), Some("loaded:user/1"));
}

#[tokio::test(start_paused = true)]
async fn mutate_is_visible_to_subscribers_immediately() {
    let ctx = Ctx::default();
    let calls = Arc::new(AtomicUsize::new(0));

    let subscription = ctx.subscribe("user/1", slow_loader(Arc::clone(&calls)));
    sleep(ms(20)).await;

    ctx.mutate("user/1", "edited".to_string()).await;
    assert_eq!(subscription.data().as_deref(), Some("edited"));

    subscription.mutate("edited again".to_string()).await;
    assert_eq!(subscription.data().as_deref(), Some("edited again"));

    sleep(ms(100)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn named_producers_need_scoped_mutations() {
    let ctx = Ctx::default();
    let calls = Arc::new(AtomicUsize::new(0));

    let subscription = ctx.subscribe("1", slow_loader(Arc::clone(&calls)).named("users"));
    sleep(ms(20)).await;
    assert_eq!(subscription.key(), &[json!("users"), json!("1")]);

    ctx.mutate("1", "unscoped".to_string()).await;
    assert_eq!(subscription.data().as_deref(), Some("loaded:1"));

    ctx.mutate_scoped("users", "1", "scoped".to_string()).await;
    assert_eq!(subscription.data().as_deref(), Some("scoped"));
}

#[tokio::test(start_paused = true)]
async fn absent_key_stays_idle() {
    let ctx = Ctx::default();
    let calls = Arc::new(AtomicUsize::new(0));

    let mut idle = ctx.subscribe(
        Key::deferred(|| Err(swrkit::KeyError::not_ready("no session"))),
        slow_loader(Arc::clone(&calls)).named("me"),
    );

    assert_eq!(idle.key(), &[json!("me")]);
    assert!(idle.fingerprint().is_none());
    assert_eq!(
        idle.snapshot(),
        LiveResult {
            data: None,
            error: None,
            is_validating: false,
        }
    );
    assert!(idle.changed().await.is_none());

    idle.mutate("ignored".to_string()).await;
    assert!(idle.data().is_none());
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn set_key_moves_the_subscription() {
    let ctx = Ctx::default();
    let calls = Arc::new(AtomicUsize::new(0));

    let mut subscription = ctx.subscribe(None::<&str>, slow_loader(Arc::clone(&calls)));
    assert!(!subscription.is_validating());

    subscription.set_key("user/1");
    let first = subscription
        .wait_for(|result| result.data.is_some())
        .await
        .expect("first key loads");
    assert_eq!(first.data.as_deref(), Some("loaded:user/1"));

    subscription.set_key(Key::args(["user/2"]));
    assert!(subscription.is_validating());
    let second = subscription
        .wait_for(|result| !result.is_validating)
        .await
        .expect("second key loads");
    assert_eq!(second.data.as_deref(), Some("loaded:user/2"));

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(ctx.subscriber_count(&fingerprint("user/1")), 0);
    assert_eq!(ctx.subscriber_count(&fingerprint("user/2")), 1);
    assert!(ctx.session_state(&fingerprint("user/1")).is_none());
}

#[tokio::test(start_paused = true)]
async fn streaming_producer_emits_in_order_and_cleans_up() {
    let ctx: SwrContext<u32> = SwrContext::default();
    let cleaned = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&cleaned);

    let producer = Producer::from_stream(move |_args, observer| {
        tokio::spawn(async move {
            observer.next(1);
            sleep(ms(10)).await;
            observer.error(ProducerError::new("blip"));
            sleep(ms(10)).await;
            observer.next(2);
        });
        let flag = Arc::clone(&flag);
        Some(Box::new(move || flag.store(true, Ordering::SeqCst)) as Cleanup)
    });

    let subscription = ctx.subscribe("prices", producer);

    sleep(ms(5)).await;
    assert_eq!(subscription.data(), Some(1));

    sleep(ms(10)).await;
    assert_eq!(subscription.data(), Some(1));
    assert_eq!(subscription.error(), Some(ProducerError::new("blip")));

    sleep(ms(10)).await;
    assert_eq!(subscription.data(), Some(2));
    assert!(subscription.error().is_none());

    assert!(!cleaned.load(Ordering::SeqCst));
    drop(subscription);
    assert!(cleaned.load(Ordering::SeqCst));
}

#[tokio::test(start_paused = true)]
async fn shutdown_cancels_sessions_and_clears_store() {
    let ctx: SwrContext<u32> = SwrContext::default();
    let cleaned = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&cleaned);

    let producer = Producer::from_stream(move |_args, observer| {
        tokio::spawn(async move {
            observer.next(7);
            sleep(Duration::from_secs(3600)).await;
            observer.complete();
        });
        let flag = Arc::clone(&flag);
        Some(Box::new(move || flag.store(true, Ordering::SeqCst)) as Cleanup)
    });

    let subscription = ctx.subscribe("socket", producer);
    sleep(ms(5)).await;
    assert_eq!(subscription.data(), Some(7));

    ctx.shutdown();

    assert!(cleaned.load(Ordering::SeqCst));
    assert!(ctx.session_state(&fingerprint("socket")).is_none());
    assert!(ctx.store().get(fingerprint("socket").as_str()).is_none());
    assert_eq!(subscription.data(), Some(7));
}

/// Store wrapper counting writes, to check custom stores are honoured.
struct CountingStore {
    inner: MemoryStore<SharedResult<String, ProducerError>>,
    writes: AtomicUsize,
}

impl CacheStore<SharedResult<String, ProducerError>> for CountingStore {
    fn get(&self, fingerprint: &str) -> Option<CacheEntry<SharedResult<String, ProducerError>>> {
        self.inner.get(fingerprint)
    }

    fn set(&self, fingerprint: &str, value: SharedResult<String, ProducerError>, ttl: Duration) {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.set(fingerprint, value, ttl);
    }

    fn delete(&self, fingerprint: &str) {
        self.inner.delete(fingerprint);
    }
}

#[tokio::test(start_paused = true)]
async fn custom_store_receives_entries() {
    let store = Arc::new(CountingStore {
        inner: MemoryStore::default(),
        writes: AtomicUsize::new(0),
    });
    let ctx = Ctx::with_store(SwrConfig::default(), store.clone());
    let calls = Arc::new(AtomicUsize::new(0));

    let subscription = ctx.subscribe("user/1", slow_loader(Arc::clone(&calls)));
    sleep(ms(20)).await;

    // Entry creation plus the write after the successful fetch.
    assert_eq!(store.writes.load(Ordering::SeqCst), 2);
    let entry = store
        .get(fingerprint("user/1").as_str())
        .expect("entry stored");
    assert_eq!(
        entry.value.snapshot().data.as_deref(),
        Some("loaded:user/1")
    );

    ctx.mutate_with(
        "user/1",
        "short lived".to_string(),
        MutateOptions::default().with_ttl(ms(50)),
    )
    .await;
    assert_eq!(subscription.data().as_deref(), Some("short lived"));
    assert_eq!(store.writes.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn resubscribe_during_grace_keeps_receiving_mutations() {
    let config = SwrConfig {
        invalidated_cache_ttl: ms(1000),
        ..Default::default()
    };
    let ctx = Ctx::new(config);
    let calls = Arc::new(AtomicUsize::new(0));
    let key = fingerprint("user/1");

    let first = ctx.subscribe("user/1", slow_loader(Arc::clone(&calls)));
    sleep(ms(20)).await;
    drop(first);

    sleep(ms(100)).await;
    let second = ctx.subscribe("user/1", slow_loader(Arc::clone(&calls)));
    assert_eq!(second.data().as_deref(), Some("loaded:user/1"));

    // The grace timer evicts the entry while `second` is still attached.
    sleep(ms(1500)).await;
    assert!(ctx.store().get(key.as_str()).is_none());
    assert_eq!(ctx.subscriber_count(&key), 1);

    ctx.mutate("user/1", "edited".to_string()).await;
    assert_eq!(second.data().as_deref(), Some("edited"));

    let third = ctx.subscribe("user/1", slow_loader(Arc::clone(&calls)));
    assert_eq!(third.data().as_deref(), Some("edited"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn entry_evicted_while_subscribed_still_reaches_subscribers() {
    let config = SwrConfig {
        ttl: ms(100),
        ..Default::default()
    };
    let ctx = Ctx::new(config);
    let calls = Arc::new(AtomicUsize::new(0));
    let key = fingerprint("user/1");

    let subscription = ctx.subscribe("user/1", slow_loader(Arc::clone(&calls)));
    sleep(ms(120)).await;
    assert!(ctx.store().get(key.as_str()).is_none());

    ctx.mutate("user/1", "edited".to_string()).await;
    assert_eq!(subscription.data().as_deref(), Some("edited"));
    let record = ctx.result(&key).expect("record stored again");
    assert_eq!(record.snapshot().data.as_deref(), Some("edited"));
}

#[tokio::test(start_paused = true)]
async fn each_success_extends_entry_ttl() {
    let config = SwrConfig {
        ttl: ms(100),
        refresh_interval: ms(60),
        invalidated_cache_ttl: ms(30),
        ..Default::default()
    };
    let ctx = Ctx::new(config);
    let calls = Arc::new(AtomicUsize::new(0));
    let key = fingerprint("clock");
    let start = tokio::time::Instant::now();

    // Successes land at t=10, 80 and 150.
    let subscription = ctx.subscribe("clock", slow_loader(Arc::clone(&calls)));

    sleep(ms(145)).await;
    let entry = ctx.store().get(key.as_str()).expect("kept alive by refreshes");
    assert_eq!(entry.created_at, start + ms(80));
    assert_eq!(entry.expires_at, Some(start + ms(180)));

    sleep(ms(10)).await;
    let entry = ctx.store().get(key.as_str()).expect("kept alive by refreshes");
    assert_eq!(entry.expires_at, Some(start + ms(250)));
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    // Detached at t=155: only the grace period is left.
    drop(subscription);
    sleep(ms(25)).await;
    assert!(ctx.store().get(key.as_str()).is_some());
    sleep(ms(10)).await;
    assert!(ctx.store().get(key.as_str()).is_none());
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

/// Store that namespaces every fingerprint it is asked to serialize.
struct TenantStore {
    inner: MemoryStore<SharedResult<String, ProducerError>>,
}

impl CacheStore<SharedResult<String, ProducerError>> for TenantStore {
    fn get(&self, fingerprint: &str) -> Option<CacheEntry<SharedResult<String, ProducerError>>> {
        self.inner.get(fingerprint)
    }

    fn set(&self, fingerprint: &str, value: SharedResult<String, ProducerError>, ttl: Duration) {
        self.inner.set(fingerprint, value, ttl);
    }

    fn delete(&self, fingerprint: &str) {
        self.inner.delete(fingerprint);
    }

    fn serialize_key(&self, key: &Key) -> String {
        format!("tenant-a:{}", swrkit::cache::serialize(key))
    }
}

#[tokio::test(start_paused = true)]
async fn custom_store_serializes_fingerprints() {
    let store = Arc::new(TenantStore {
        inner: MemoryStore::default(),
    });
    let ctx = Ctx::with_store(SwrConfig::default(), store.clone());
    let calls = Arc::new(AtomicUsize::new(0));

    let plain = ctx.subscribe("user/1", slow_loader(Arc::clone(&calls)));
    let named = ctx.subscribe("1", slow_loader(Arc::clone(&calls)).named("users"));
    sleep(ms(20)).await;

    let plain_key = plain.fingerprint().expect("resolved key").clone();
    assert!(plain_key.as_str().starts_with("tenant-a:"));
    assert_ne!(plain_key, fingerprint("user/1"));
    assert!(store.get(plain_key.as_str()).is_some());
    let named_key = named.fingerprint().expect("resolved key");
    assert!(named_key.as_str().starts_with("users@tenant-a:"));

    ctx.mutate("user/1", "edited".to_string()).await;
    assert_eq!(plain.data().as_deref(), Some("edited"));

    ctx.mutate_scoped("users", "1", "scoped".to_string()).await;
    assert_eq!(named.data().as_deref(), Some("scoped"));
    assert_eq!(ctx.subscriber_count(&plain_key), 1);
}
