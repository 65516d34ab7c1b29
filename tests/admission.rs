use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::DateTime;
use futures::future::join_all;
use http::StatusCode;
use tokio_test::{assert_err, assert_ok};

use tollgate::config::TollgateConfig;
use tollgate::identity::{CallerIdentity, IdentityResolver, Principal, RequestContext};
use tollgate::ratelimit::{guard, LimitSpec, ManualClock, RateLimiter, X_RATELIMIT_LIMIT};
use tollgate::routing::RoutingTable;

fn start_of_2024() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(
        DateTime::from_timestamp(1_704_067_200, 0).unwrap(),
    ))
}

fn peer(ip: &str) -> RequestContext {
    RequestContext::from_peer(ip.parse::<IpAddr>().unwrap())
}

#[tokio::test]
async fn concurrent_callers_never_exceed_the_budget() {
    let limiter = Arc::new(RateLimiter::in_memory().with_defaults(Vec::new()));
    let spec = LimitSpec::from_secs(10, 60).unwrap();
    let identity = CallerIdentity::from("alice");

    let checks = (0..100).map(|_| {
        let limiter = limiter.clone();
        let spec = spec.clone();
        let identity = identity.clone();
        tokio::spawn(async move { limiter.evaluate(&identity, &spec).await })
    });

    let admitted = join_all(checks)
        .await
        .into_iter()
        .filter(|result| matches!(result, Ok(decision) if decision.admitted))
        .count();
    assert_eq!(admitted, 10);
}

#[tokio::test]
async fn guarded_operation_is_skipped_when_rejected() {
    let clock = start_of_2024();
    let limiter = Arc::new(
        RateLimiter::in_memory()
            .with_defaults(vec![LimitSpec::per_minute(60).unwrap()])
            .with_clock(clock.clone()),
    );
    let resolver = Arc::new(IdentityResolver::new());

    let invocations = Arc::new(AtomicUsize::new(0));
    let counter = invocations.clone();
    let export = guard(
        &limiter,
        &resolver,
        "export",
        move |report: u32| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                format!("report-{}", report)
            }
        },
        LimitSpec::parse("2/minute").unwrap(),
    );

    let ctx = peer("203.0.113.5").with_principal(Principal::new("alice"));

    let first = assert_ok!(export.call(&ctx, 7).await);
    assert_eq!(first.value, "report-7");
    assert_eq!(first.headers()[&X_RATELIMIT_LIMIT], "2");
    assert_ok!(export.call(&ctx, 8).await);

    let rejection = assert_err!(export.call(&ctx, 9).await);
    assert_eq!(invocations.load(Ordering::SeqCst), 2);

    let response = rejection.to_response();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(response.headers()[http::header::RETRY_AFTER], "60");

    // A different user behind the same address has its own budget
    let bob = peer("203.0.113.5").with_principal(Principal::new("bob"));
    assert_ok!(export.call(&bob, 10).await);

    clock.advance(Duration::from_secs(60));
    assert_ok!(export.call(&ctx, 11).await);
}

#[tokio::test]
async fn anonymous_callers_share_a_budget_per_origin() {
    let limiter = Arc::new(RateLimiter::in_memory().with_defaults(Vec::new()));
    let resolver = Arc::new(IdentityResolver::behind_proxies(vec!["10.0.0.2".parse().unwrap()]));
    let op = guard(
        &limiter,
        &resolver,
        "lookup",
        |_: ()| async {},
        LimitSpec::from_secs(1, 60).unwrap(),
    );

    let via_proxy = peer("10.0.0.2").with_forwarded_for("198.51.100.20, 10.0.0.2");
    let direct = peer("198.51.100.20");
    let spoofed = peer("198.51.100.99").with_forwarded_for("198.51.100.20");

    assert_ok!(op.call(&via_proxy, ()).await);
    // Same origin, reached directly
    assert_err!(op.call(&direct, ()).await);
    // An untrusted peer cannot borrow someone else's budget
    assert_ok!(op.call(&spoofed, ()).await);
}

#[tokio::test]
async fn each_operation_spends_its_own_defaults() {
    let limiter = Arc::new(
        RateLimiter::in_memory()
            .with_defaults(vec![LimitSpec::from_secs(2, 60).unwrap()])
            .with_clock(start_of_2024()),
    );
    let resolver = Arc::new(IdentityResolver::new());
    let ctx = peer("203.0.113.8").with_principal(Principal::new("carol"));

    let upload = guard(
        &limiter,
        &resolver,
        "upload",
        |_: ()| async {},
        LimitSpec::from_secs(10, 60).unwrap(),
    );
    let search = guard(
        &limiter,
        &resolver,
        "search",
        |_: ()| async {},
        LimitSpec::from_secs(10, 60).unwrap(),
    );

    assert_ok!(upload.call(&ctx, ()).await);
    assert_ok!(upload.call(&ctx, ()).await);
    let rejection = assert_err!(upload.call(&ctx, ()).await);
    assert_eq!(rejection.decision.limit, 2);

    // Exhausting one operation leaves the other untouched
    assert_ok!(search.call(&ctx, ()).await);
    assert_ok!(search.call(&ctx, ()).await);
    assert_err!(search.call(&ctx, ()).await);
}

#[test]
fn config_wires_limiter_resolver_and_routes() {
    let yaml = r#"
rate_limiting:
  default_per_minute: 3
identity:
  trust_forwarded_for: true
routing:
  default_queue: default
  routes:
    - pattern: "billing.tasks.*"
      queue: billing
      time_limit_secs: 120
      soft_time_limit_secs: 90
"#;
    let config = TollgateConfig::from_yaml(yaml).unwrap();
    let limiter = RateLimiter::from_config(&config.rate_limiting).unwrap();
    let resolver = IdentityResolver::from_config(&config.identity);

    // Loopback is the implicit trusted proxy
    let ctx = peer("127.0.0.1").with_forwarded_for("192.0.2.44");
    let identity = resolver.identity(&ctx);
    assert_eq!(identity.as_str(), "ip:192.0.2.44");

    tokio_test::block_on(async {
        for _ in 0..3 {
            assert!(limiter.check(&identity, None, &[], true).await.admitted);
        }
        assert!(!limiter.check(&identity, None, &[], true).await.admitted);
    });

    let table: RoutingTable = config.routing.build().unwrap();
    let dispatch = table.prepare("billing.tasks.invoice");
    assert_eq!(dispatch.route.queue, "billing");
    assert_eq!(dispatch.deadlines.soft, Duration::from_secs(90));
    assert_eq!(table.classify("billing.report").queue, "default");
}
