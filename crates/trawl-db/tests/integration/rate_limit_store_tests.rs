use chrono::{DateTime, TimeDelta, Utc};
use trawl_core::rate_limit::{
    RateLimitConfig, RateLimitStore, RateLimitStrategy, RateLimiter,
};
use trawl_db::PgRateLimitStore;

use crate::integration::common::setup_test_db;

fn at(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap()
}

#[tokio::test]
async fn sliding_window_admits_up_to_limit() {
    let (pool, _container) = setup_test_db().await;
    let store = PgRateLimitStore::new(pool);
    let config = RateLimitConfig::new(3, 60);
    let t0 = at(1_700_000_000);

    for i in 0..3 {
        let decision = store
            .check_and_record("key:a", &config, t0 + TimeDelta::seconds(i))
            .await
            .unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 2 - i as u32);
    }

    let rejected = store
        .check_and_record("key:a", &config, t0 + TimeDelta::seconds(10))
        .await
        .unwrap();
    assert!(!rejected.allowed);
    assert_eq!(rejected.remaining, 0);
    assert_eq!(rejected.reset_at, t0 + TimeDelta::seconds(60));

    // Oldest admission has left the window.
    let later = store
        .check_and_record("key:a", &config, t0 + TimeDelta::seconds(61))
        .await
        .unwrap();
    assert!(later.allowed);
}

#[tokio::test]
async fn buckets_are_independent() {
    let (pool, _container) = setup_test_db().await;
    let store = PgRateLimitStore::new(pool);
    let config = RateLimitConfig::new(1, 60);
    let now = at(1_700_000_000);

    assert!(store.check_and_record("key:a", &config, now).await.unwrap().allowed);
    assert!(!store.check_and_record("key:a", &config, now).await.unwrap().allowed);
    assert!(store.check_and_record("key:b", &config, now).await.unwrap().allowed);
}

#[tokio::test]
async fn fixed_window_resets_at_boundary() {
    let (pool, _container) = setup_test_db().await;
    let store = PgRateLimitStore::new(pool);
    let config = RateLimitConfig::new(2, 60).with_strategy(RateLimitStrategy::Fixed);
    // Aligned to a 60 s boundary.
    let start = at(1_699_999_980);

    assert!(store.check_and_record("domain:x", &config, start).await.unwrap().allowed);
    assert!(store.check_and_record("domain:x", &config, start + TimeDelta::seconds(30)).await.unwrap().allowed);

    let rejected = store
        .check_and_record("domain:x", &config, start + TimeDelta::seconds(59))
        .await
        .unwrap();
    assert!(!rejected.allowed);
    assert_eq!(rejected.reset_at, start + TimeDelta::seconds(60));

    let next = store
        .check_and_record("domain:x", &config, start + TimeDelta::seconds(60))
        .await
        .unwrap();
    assert!(next.allowed);
    assert_eq!(next.remaining, 1);
}

#[tokio::test]
async fn concurrent_checks_never_over_admit() {
    let (pool, _container) = setup_test_db().await;
    let store = PgRateLimitStore::new(pool);
    let config = RateLimitConfig::new(5, 60);
    let now = Utc::now();

    let handles: Vec<_> = (0..20)
        .map(|_| {
            let store = store.clone();
            let config = config.clone();
            tokio::spawn(async move { store.check_and_record("key:hot", &config, now).await })
        })
        .collect();

    let mut admitted = 0;
    for handle in handles {
        if handle.await.unwrap().unwrap().allowed {
            admitted += 1;
        }
    }
    assert_eq!(admitted, 5);
}

#[tokio::test]
async fn limiter_over_shared_store_applies_zero_limit() {
    let (pool, _container) = setup_test_db().await;
    let limiter = RateLimiter::new(PgRateLimitStore::new(pool));

    let decision = limiter.check_limit("key:blocked", &RateLimitConfig::new(0, 60)).await;
    assert!(!decision.allowed);
    assert_eq!(decision.remaining, 0);
}

#[tokio::test]
async fn prune_removes_expired_rows() {
    let (pool, _container) = setup_test_db().await;
    let store = PgRateLimitStore::new(pool);
    let config = RateLimitConfig::new(10, 60);
    let t0 = at(1_700_000_000);

    store.check_and_record("key:a", &config, t0).await.unwrap();
    store.check_and_record("key:b", &config, t0 + TimeDelta::seconds(120)).await.unwrap();

    let removed = store.prune_before(t0 + TimeDelta::seconds(60)).await.unwrap();
    assert_eq!(removed, 1);
}
