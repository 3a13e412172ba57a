//! Integration tests for the orchestrator
//!
//! These tests drive full runs through the public API: registration,
//! scheduling, conflict resolution, caching and events together.

use async_trait::async_trait;
use leader::{
    ActionError, CacheError, CacheLookup, ConfigurationError, Emitter, Event, FieldKey, FieldWrite,
    FnPlugin, MemoryCache, Orchestrator, OrchestratorConfig, Patch, PluginOutcome, RecordView, Resolution,
    ResultCache, RunError, RunOutcome, RunState, Snapshot, WeightedResolver, Winner,
};
use serde_json::{Value, json};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// Helper to run an orchestrator against a target with an empty context
async fn run(leader: &Orchestrator, target: Value) -> RunOutcome {
    leader
        .run(target, json!({}))
        .unwrap()
        .wait()
        .await
        .unwrap()
}

/// Helper to count how often an action body executes
fn counter() -> Arc<AtomicUsize> {
    Arc::new(AtomicUsize::new(0))
}

fn email_domain(snapshot: &Snapshot) -> String {
    let email = snapshot.view().str_field("email").unwrap_or_default();
    email.split('@').nth(1).unwrap_or_default().to_string()
}

/// Registers the classic `email -> domain -> crunchbase` chain
fn enrichment_chain(leader: &mut Orchestrator) {
    leader
        .when("domain", |r| r.has("email"), |s| async move {
            Ok(Patch::new().set("domain", email_domain(&s)))
        })
        .unwrap()
        .when("crunchbase", |r| r.has("domain"), |s| async move {
            let domain = s.view().str_field("domain").unwrap_or_default().to_string();
            Ok(Patch::new().set(
                "company.crunchbase",
                format!("http://www.crunchbase.com/search?query={}", domain),
            ))
        })
        .unwrap();
}

// =============================================================================
// Scheduling
// =============================================================================

mod scheduling {
    use super::*;

    #[tokio::test]
    async fn test_predicate_that_never_fires_leaves_record_untouched() {
        let calls = counter();
        let seen = calls.clone();
        let mut leader = Orchestrator::new();
        leader
            .when("never", |r| r.has("phone"), move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
                async { Ok(Patch::new().set("never", true)) }
            })
            .unwrap();

        let outcome = run(&leader, json!({"email": "ilya@segment.io"})).await;

        assert!(outcome.is_success());
        assert_eq!(outcome.target, json!({"email": "ilya@segment.io"}));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(outcome.report.state, RunState::Complete);
        assert_eq!(
            outcome.report.plugin("never").map(|p| &p.outcome),
            Some(&PluginOutcome::NeverReady)
        );
    }

    #[tokio::test]
    async fn test_tiers_chain_through_fixpoint() {
        let mut leader = Orchestrator::new();
        leader
            .when_with(
                "second",
                |r| r.field("x") == Some(&json!(1)),
                |_| async { Ok(Patch::new().set("y", 2)) },
                1,
                None,
            )
            .unwrap()
            .when_with("first", |_| true, |_| async { Ok(Patch::new().set("x", 1)) }, 0, None)
            .unwrap();

        let outcome = run(&leader, json!({})).await;

        assert!(outcome.is_success());
        assert_eq!(outcome.target, json!({"x": 1, "y": 2}));
        let order: Vec<_> = outcome
            .report
            .plugins
            .iter()
            .map(|p| p.identity.as_str())
            .collect();
        assert_eq!(order, vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_enrichment_chain_builds_nested_fields() {
        let mut leader = Orchestrator::new();
        enrichment_chain(&mut leader);

        let outcome = run(&leader, json!({"email": "ilya@segment.io"})).await;

        assert!(outcome.is_success());
        assert_eq!(outcome.target["domain"], "segment.io");
        assert_eq!(
            outcome.target["company"]["crunchbase"],
            "http://www.crunchbase.com/search?query=segment.io"
        );
        assert_eq!(outcome.report.count(PluginOutcome::is_success), 2);
    }

    #[tokio::test]
    async fn test_each_plugin_runs_at_most_once() {
        let calls = counter();
        let seen = calls.clone();
        let mut leader = Orchestrator::new();
        leader
            .when("always", |_| true, move |_| {
                let n = seen.fetch_add(1, Ordering::SeqCst);
                async move { Ok(Patch::new().set("n", n as u64)) }
            })
            .unwrap();

        let outcome = run(&leader, json!({})).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.target, json!({"n": 0}));
    }

    #[tokio::test]
    async fn test_context_is_readable_and_writable() {
        let mut leader = Orchestrator::new();
        leader
            .when(
                "locale",
                |r| r.get(&FieldKey::context("country")).is_some(),
                |s| async move {
                    let country = s.context["country"].as_str().unwrap_or_default().to_string();
                    Ok(Patch::new()
                        .set("locale", format!("en-{}", country))
                        .set_context("resolved", true))
                },
            )
            .unwrap();

        let outcome = leader
            .run(json!({}), json!({"country": "US"}))
            .unwrap()
            .wait()
            .await
            .unwrap();

        assert_eq!(outcome.target, json!({"locale": "en-US"}));
        assert_eq!(outcome.context, json!({"country": "US", "resolved": true}));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_limit_caps_in_flight_plugins() {
        let in_flight = counter();
        let peak = counter();
        let mut leader = Orchestrator::new();
        leader.set_concurrency_limit(2).unwrap();

        for i in 0..6 {
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            leader
                .when(format!("p{}", i), |_| true, move |_| {
                    let in_flight = in_flight.clone();
                    let peak = peak.clone();
                    async move {
                        let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        in_flight.fetch_sub(1, Ordering::SeqCst);
                        Ok(Patch::new())
                    }
                })
                .unwrap();
        }

        let outcome = run(&leader, json!({})).await;

        assert!(outcome.is_success());
        assert_eq!(outcome.report.count(PluginOutcome::is_success), 6);
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert!(peak.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn test_run_rejects_non_object_context() {
        let leader = Orchestrator::new();
        let err = leader.run(json!({}), json!([1, 2])).unwrap_err();
        assert!(matches!(
            err,
            ConfigurationError::NotAnObject { field: "context", .. }
        ));
    }
}

// =============================================================================
// Conflict resolution
// =============================================================================

mod conflicts {
    use super::*;

    fn competing_domains(leader: &mut Orchestrator) {
        leader
            .when("badDomain", |r| r.has("email"), |_| async {
                Ok(Patch::new().set("domain", "wrong.example"))
            })
            .unwrap()
            .when("domain", |r| r.has("email"), |s| async move {
                Ok(Patch::new().set("domain", email_domain(&s)))
            })
            .unwrap();
    }

    #[tokio::test]
    async fn test_weighted_resolver_picks_preferred_producer() {
        let mut leader = Orchestrator::new();
        leader.set_conflict_resolver(
            WeightedResolver::new()
                .weight(FieldKey::target("domain"), "domain", 0.9)
                .weight(FieldKey::target("domain"), "badDomain", 0.3),
        );
        competing_domains(&mut leader);

        let outcome = run(&leader, json!({"email": "ilya@segment.io"})).await;

        assert!(outcome.is_success());
        assert_eq!(outcome.target["domain"], "segment.io");
        assert_eq!(outcome.report.conflicts, 1);
    }

    /// Same competitors, with one of them finishing late
    fn delayed_domains(leader: &mut Orchestrator, slow: &'static str) {
        let delay = move |identity: &str| {
            if identity == slow {
                Duration::from_millis(50)
            } else {
                Duration::ZERO
            }
        };
        let bad_delay = delay("badDomain");
        let good_delay = delay("domain");
        leader
            .when("badDomain", |r| r.has("email"), move |_| async move {
                tokio::time::sleep(bad_delay).await;
                Ok(Patch::new().set("domain", "wrong.example"))
            })
            .unwrap()
            .when("domain", |r| r.has("email"), move |s| async move {
                tokio::time::sleep(good_delay).await;
                Ok(Patch::new().set("domain", email_domain(&s)))
            })
            .unwrap();
    }

    fn weighted_domains() -> WeightedResolver {
        WeightedResolver::new()
            .weight(FieldKey::target("domain"), "domain", 0.9)
            .weight(FieldKey::target("domain"), "badDomain", 0.3)
    }

    #[tokio::test(start_paused = true)]
    async fn test_weighted_resolver_when_heavier_producer_finishes_last() {
        let mut leader = Orchestrator::new();
        leader.set_conflict_resolver(weighted_domains());
        delayed_domains(&mut leader, "domain");

        let outcome = run(&leader, json!({"email": "ilya@segment.io"})).await;

        assert!(outcome.is_success());
        assert_eq!(outcome.target["domain"], "segment.io");
        assert_eq!(outcome.report.conflicts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_weighted_resolver_when_lighter_producer_finishes_last() {
        let mut leader = Orchestrator::new();
        leader.set_conflict_resolver(weighted_domains());
        delayed_domains(&mut leader, "badDomain");

        let outcome = run(&leader, json!({"email": "ilya@segment.io"})).await;

        assert!(outcome.is_success());
        assert_eq!(outcome.target["domain"], "segment.io");
        assert_eq!(outcome.report.conflicts, 1);
    }

    #[tokio::test]
    async fn test_parent_object_write_merges_with_existing_children() {
        let mut leader = Orchestrator::new();
        leader
            .when("namer", |r| r.has("email"), |_| async {
                Ok(Patch::new().set("company.name", "Segment"))
            })
            .unwrap()
            .when("crunchbase", |r| r.has("company.name"), |_| async {
                Ok(Patch::new().set(
                    "company",
                    json!({"crunchbase": "http://www.crunchbase.com/search?query=segment.io"}),
                ))
            })
            .unwrap();

        let outcome = run(&leader, json!({"email": "ilya@segment.io"})).await;

        assert!(outcome.is_success());
        assert_eq!(
            outcome.target["company"],
            json!({
                "name": "Segment",
                "crunchbase": "http://www.crunchbase.com/search?query=segment.io"
            })
        );
        assert_eq!(outcome.report.conflicts, 0);
    }

    #[tokio::test]
    async fn test_parent_scalar_write_goes_through_resolver() {
        let consulted = counter();
        let seen = consulted.clone();
        let mut leader = Orchestrator::new();
        leader.set_conflict_resolver(
            move |_key: &FieldKey,
                  _existing: &FieldWrite,
                  _candidate: &FieldWrite,
                  _prior: &[Resolution],
                  _record: RecordView<'_>| {
                seen.fetch_add(1, Ordering::SeqCst);
                Winner::Existing
            },
        );
        leader
            .when("namer", |r| r.has("email"), |_| async {
                Ok(Patch::new().set("company.name", "Segment"))
            })
            .unwrap()
            .when("flattener", |r| r.has("company.name"), |_| async {
                Ok(Patch::new().set("company", "Segment Inc"))
            })
            .unwrap();

        let outcome = run(&leader, json!({"email": "ilya@segment.io"})).await;

        assert!(outcome.is_success());
        assert_eq!(outcome.target["company"], json!({"name": "Segment"}));
        assert_eq!(consulted.load(Ordering::SeqCst), 1);
        assert!(outcome.report.conflicts >= 1);
    }

    #[tokio::test]
    async fn test_weights_from_config_install_resolver() {
        let config = OrchestratorConfig::parse(
            r#"
[weights."target.domain"]
domain = 0.9
badDomain = 0.3
"#,
        )
        .unwrap();
        let mut leader = Orchestrator::with_config(config).unwrap();
        competing_domains(&mut leader);

        let outcome = run(&leader, json!({"email": "ilya@segment.io"})).await;

        assert_eq!(outcome.target["domain"], "segment.io");
    }

    #[tokio::test]
    async fn test_input_fields_go_through_resolver() {
        let mut leader = Orchestrator::new();
        leader.set_conflict_resolver(
            |_key: &FieldKey,
             existing: &FieldWrite,
             _candidate: &FieldWrite,
             _prior: &[Resolution],
             _record: RecordView<'_>| {
                if existing.producer == "input" {
                    Winner::Existing
                } else {
                    Winner::Candidate
                }
            },
        );
        leader
            .when("domain", |r| r.has("email"), |s| async move {
                Ok(Patch::new().set("domain", email_domain(&s)))
            })
            .unwrap();

        let outcome = run(
            &leader,
            json!({"email": "ilya@segment.io", "domain": "given.io"}),
        )
        .await;

        assert_eq!(outcome.target["domain"], "given.io");
        assert_eq!(outcome.report.conflicts, 1);
    }

    #[tokio::test]
    async fn test_default_resolver_lets_newest_write_win() {
        let mut leader = Orchestrator::new();
        leader
            .when("domain", |r| r.has("email"), |s| async move {
                Ok(Patch::new().set("domain", email_domain(&s)))
            })
            .unwrap();

        let outcome = run(
            &leader,
            json!({"email": "ilya@segment.io", "domain": "given.io"}),
        )
        .await;

        assert_eq!(outcome.target["domain"], "segment.io");
    }
}

// =============================================================================
// Caching
// =============================================================================

mod caching {
    use super::*;

    /// Cache whose writes always fail
    struct BrokenCache;

    #[async_trait]
    impl ResultCache for BrokenCache {
        async fn get(&self, _identity: &str, _record: &Snapshot) -> Result<CacheLookup, CacheError> {
            Ok(CacheLookup::Miss)
        }

        async fn set(&self, _identity: &str, _record: &Snapshot, _produced: &Patch) -> Result<(), CacheError> {
            Err(CacheError::Unavailable("disk full".into()))
        }
    }

    /// Cache whose reads always fail
    struct UnreadableCache;

    #[async_trait]
    impl ResultCache for UnreadableCache {
        async fn get(&self, _identity: &str, _record: &Snapshot) -> Result<CacheLookup, CacheError> {
            Err(anyhow::anyhow!("connection refused").into())
        }

        async fn set(&self, _identity: &str, _record: &Snapshot, _produced: &Patch) -> Result<(), CacheError> {
            Ok(())
        }
    }

    /// Cache whose reads panic
    struct PanickingCache;

    #[async_trait]
    impl ResultCache for PanickingCache {
        async fn get(&self, _identity: &str, _record: &Snapshot) -> Result<CacheLookup, CacheError> {
            panic!("cache backend exploded");
        }

        async fn set(&self, _identity: &str, _record: &Snapshot, _produced: &Patch) -> Result<(), CacheError> {
            Ok(())
        }
    }

    /// Cache whose reads never complete
    struct HangingCache;

    #[async_trait]
    impl ResultCache for HangingCache {
        async fn get(&self, _identity: &str, _record: &Snapshot) -> Result<CacheLookup, CacheError> {
            std::future::pending().await
        }

        async fn set(&self, _identity: &str, _record: &Snapshot, _produced: &Patch) -> Result<(), CacheError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_cache_hit_skips_action_but_merges_fields() {
        let calls = counter();
        let seen = calls.clone();
        let cache = Arc::new(MemoryCache::new());
        cache
            .insert("domain", Patch::new().set("domain", "cached.io"))
            .await;

        let mut leader = Orchestrator::new();
        leader.set_cache(cache.clone());
        leader
            .when("domain", |r| r.has("email"), move |s| {
                seen.fetch_add(1, Ordering::SeqCst);
                async move { Ok(Patch::new().set("domain", email_domain(&s))) }
            })
            .unwrap();

        let outcome = run(&leader, json!({"email": "ilya@segment.io"})).await;

        assert!(outcome.is_success());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(outcome.target["domain"], "cached.io");
        assert_eq!(cache.hits(), 1);
        assert!(matches!(
            outcome.report.plugin("domain").map(|p| &p.outcome),
            Some(PluginOutcome::Cached { .. })
        ));
    }

    #[tokio::test]
    async fn test_cached_fields_unlock_dependents() {
        let cache = Arc::new(MemoryCache::new());
        cache
            .insert("domain", Patch::new().set("domain", "cached.io"))
            .await;

        let mut leader = Orchestrator::new();
        leader.set_cache(cache.clone());
        enrichment_chain(&mut leader);

        let outcome = run(&leader, json!({"email": "ilya@segment.io"})).await;

        assert_eq!(
            outcome.target["company"]["crunchbase"],
            "http://www.crunchbase.com/search?query=cached.io"
        );
        // crunchbase missed and was stored after it ran
        assert_eq!(cache.misses(), 1);
    }

    #[tokio::test]
    async fn test_cache_events_are_namespaced() {
        let cache = Arc::new(MemoryCache::new());
        let mut leader = Orchestrator::new();
        leader.set_cache(cache);
        leader
            .when("domain", |r| r.has("email"), |s| async move {
                Ok(Patch::new().set("domain", email_domain(&s)))
            })
            .unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        leader.subscribe("cache:store", move |e: &Event| {
            let _ = tx.send(e.payload.clone());
        });

        run(&leader, json!({"email": "ilya@segment.io"})).await;

        let payload = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(payload["plugin"], "domain");
    }

    #[tokio::test]
    async fn test_failed_cache_write_only_emits_event() {
        let mut leader = Orchestrator::new();
        leader.set_cache(Arc::new(BrokenCache));
        leader
            .when("domain", |r| r.has("email"), |s| async move {
                Ok(Patch::new().set("domain", email_domain(&s)))
            })
            .unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        leader.subscribe("cache:error", move |e: &Event| {
            let _ = tx.send(e.payload.clone());
        });

        let outcome = run(&leader, json!({"email": "ilya@segment.io"})).await;
        assert!(outcome.is_success());
        assert_eq!(outcome.target["domain"], "segment.io");

        let payload = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(payload["operation"], "set");
        assert_eq!(payload["plugin"], "domain");
    }

    #[tokio::test]
    async fn test_failed_cache_read_falls_back_to_action() {
        let calls = counter();
        let seen = calls.clone();
        let mut leader = Orchestrator::new();
        leader.set_cache(Arc::new(UnreadableCache));
        leader
            .when("domain", |r| r.has("email"), move |s| {
                seen.fetch_add(1, Ordering::SeqCst);
                async move { Ok(Patch::new().set("domain", email_domain(&s))) }
            })
            .unwrap();

        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = errors.clone();
        leader.subscribe("cache:error", move |e: &Event| {
            sink.lock().unwrap().push(e.payload["operation"].clone())
        });

        let outcome = run(&leader, json!({"email": "ilya@segment.io"})).await;

        assert!(outcome.is_success());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.target["domain"], "segment.io");
        assert_eq!(*errors.lock().unwrap(), vec![json!("get")]);
    }

    #[tokio::test]
    async fn test_panicking_cache_read_still_finalizes_run() {
        let calls = counter();
        let seen = calls.clone();
        let mut leader = Orchestrator::new();
        leader.set_cache(Arc::new(PanickingCache));
        leader
            .when("domain", |r| r.has("email"), move |s| {
                seen.fetch_add(1, Ordering::SeqCst);
                async move { Ok(Patch::new().set("domain", email_domain(&s))) }
            })
            .unwrap();

        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = errors.clone();
        leader.subscribe("cache:error", move |e: &Event| {
            sink.lock().unwrap().push(e.payload["operation"].clone())
        });

        let finished = counter();
        let done = finished.clone();
        let handle = leader
            .run_with_callback(json!({"email": "ilya@segment.io"}), json!({}), move |_, _, _| {
                done.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        let outcome = tokio::time::timeout(Duration::from_secs(3), handle.wait())
            .await
            .expect("run should finish")
            .unwrap();

        assert!(outcome.is_success());
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.target["domain"], "segment.io");
        assert_eq!(*errors.lock().unwrap(), vec![json!("get")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_cache_read_is_bounded_by_plugin_timeout() {
        let mut leader = Orchestrator::new();
        leader.set_cache(Arc::new(HangingCache));
        leader
            .when_with(
                "domain",
                |r| r.has("email"),
                |s| async move { Ok(Patch::new().set("domain", email_domain(&s))) },
                0,
                Some(Duration::from_millis(200)),
            )
            .unwrap();

        let outcome = run(&leader, json!({"email": "ilya@segment.io"})).await;

        assert!(outcome.is_success());
        assert_eq!(outcome.target["domain"], "segment.io");
        assert!(outcome.report.duration >= Duration::from_millis(200));
    }
}

// =============================================================================
// Failures, timeouts and deadlines
// =============================================================================

mod failures {
    use super::*;

    #[tokio::test]
    async fn test_panicking_action_does_not_stop_siblings() {
        let mut leader = Orchestrator::new();
        leader
            .when("thrower", |_| true, |_| async {
                if true {
                    panic!("Thrown Error!!");
                }
                Ok(Patch::new())
            })
            .unwrap()
            .when("sibling", |_| true, |_| async { Ok(Patch::new().set("sibling", true)) })
            .unwrap();

        let outcome = run(&leader, json!({})).await;

        match &outcome.error {
            Some(RunError::Action {
                plugin,
                source: ActionError::Panicked { message },
            }) => {
                assert_eq!(plugin, "thrower");
                assert!(message.contains("Thrown Error!!"));
            }
            other => panic!("Expected panicked action error, got {:?}", other),
        }
        assert_eq!(outcome.target, json!({"sibling": true}));
        assert_eq!(outcome.report.state, RunState::Complete);
    }

    #[tokio::test]
    async fn test_first_error_is_reported_and_later_ones_dropped() {
        let mut leader = Orchestrator::new();
        leader
            .when("first", |_| true, |_| async { Err(ActionError::failed("first failure")) })
            .unwrap()
            .when("second", |r| r.has("never"), |_| async { Ok(Patch::new()) })
            .unwrap()
            .when_with(
                "third",
                |_| true,
                |_| async {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Err(ActionError::failed("third failure"))
                },
                1,
                None,
            )
            .unwrap();

        let outcome = run(&leader, json!({})).await;

        assert_eq!(outcome.error.as_ref().and_then(|e| e.plugin()), Some("first"));
        assert!(matches!(
            outcome.report.plugin("third").map(|p| &p.outcome),
            Some(PluginOutcome::Failed { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_plugin_timeout_is_reported_and_result_discarded() {
        let mut leader = Orchestrator::new();
        leader
            .when_with(
                "slow",
                |_| true,
                |_| async {
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    Ok(Patch::new().set("late", true))
                },
                0,
                Some(Duration::from_millis(500)),
            )
            .unwrap()
            .when("fast", |_| true, |_| async { Ok(Patch::new().set("fast", true)) })
            .unwrap();

        let outcome = run(&leader, json!({})).await;

        assert_eq!(
            outcome.error,
            Some(RunError::PluginTimeout {
                plugin: "slow".to_string(),
                timeout: Duration::from_millis(500),
            })
        );
        assert_eq!(outcome.target, json!({"fast": true}));
        assert_eq!(
            outcome.report.plugin("slow").map(|p| &p.outcome),
            Some(&PluginOutcome::TimedOut { timeout_ms: 500 })
        );
        assert!(outcome.report.duration >= Duration::from_millis(500));
        assert!(outcome.report.duration <= Duration::from_millis(510));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_wins_and_callback_fires_once() {
        let config = OrchestratorConfig::new().with_max_time(Duration::from_millis(100));
        let mut leader = Orchestrator::with_config(config).unwrap();
        leader
            .when("broken", |_| true, |_| async { Err(ActionError::failed("boom")) })
            .unwrap()
            .when("stuck", |_| true, |_| async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(Patch::new().set("stuck", true))
            })
            .unwrap();

        let calls = counter();
        let seen = calls.clone();
        let reported = Arc::new(Mutex::new(None));
        let sink = reported.clone();
        let handle = leader
            .run_with_callback(json!({}), json!({}), move |error, target, _context| {
                seen.fetch_add(1, Ordering::SeqCst);
                *sink.lock().unwrap() = Some((error, target));
            })
            .unwrap();

        let outcome = handle.wait().await.unwrap();
        tokio::time::sleep(Duration::from_secs(20)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            outcome.error,
            Some(RunError::Deadline {
                max_time: Duration::from_millis(100)
            })
        );
        assert_eq!(outcome.report.state, RunState::TimedOut);
        assert!(outcome.report.duration >= Duration::from_millis(100));
        assert!(outcome.report.duration <= Duration::from_millis(110));
        assert_eq!(
            outcome.report.plugin("stuck").map(|p| &p.outcome),
            Some(&PluginOutcome::Interrupted)
        );

        let (error, target) = reported.lock().unwrap().clone().unwrap();
        assert_eq!(error, outcome.error);
        assert_eq!(target, json!({}));
    }

    #[tokio::test]
    async fn test_cancel_finalizes_once_with_cancelled() {
        let mut leader = Orchestrator::new();
        leader
            .when("stuck", |_| true, |_| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(Patch::new())
            })
            .unwrap();

        let calls = counter();
        let seen = calls.clone();
        let handle = leader
            .run_with_callback(json!({}), json!({}), move |error, _, _| {
                assert_eq!(error, Some(RunError::Cancelled));
                seen.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        handle.cancel();

        let outcome = handle.wait().await.unwrap();

        assert_eq!(outcome.error, Some(RunError::Cancelled));
        assert_eq!(outcome.report.state, RunState::Cancelled);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}

// =============================================================================
// Events
// =============================================================================

mod events {
    use super::*;

    #[tokio::test]
    async fn test_lifecycle_events_in_order() {
        let mut leader = Orchestrator::new();
        leader
            .when("domain", |r| r.has("email"), |s| async move {
                Ok(Patch::new().set("domain", email_domain(&s)))
            })
            .unwrap();

        let names = Arc::new(Mutex::new(Vec::new()));
        let sink = names.clone();
        leader.subscribe_all(move |e: &Event| sink.lock().unwrap().push(e.name.clone()));

        run(&leader, json!({"email": "ilya@segment.io"})).await;

        assert_eq!(
            *names.lock().unwrap(),
            vec!["run:start", "plugin:start", "plugin:done", "run:complete"]
        );
    }

    #[tokio::test]
    async fn test_observable_plugin_events_are_republished() {
        let emitter = Emitter::new();
        let inner = emitter.clone();
        let plugin = FnPlugin::new("FullContact", |r| r.has("email"), move |s| {
            inner.emit("request", json!({"email": s.view().str_field("email")}));
            async { Ok(Patch::new().set("enriched", true)) }
        })
        .with_emitter(emitter);

        let mut leader = Orchestrator::new();
        leader.use_plugin(plugin).unwrap();

        let requests = Arc::new(Mutex::new(Vec::new()));
        let sink = requests.clone();
        leader.subscribe("fullcontact:request", move |e: &Event| {
            sink.lock().unwrap().push(e.payload.clone())
        });

        let outcome = run(&leader, json!({"email": "ilya@segment.io"})).await;

        assert!(outcome.is_success());
        assert_eq!(
            *requests.lock().unwrap(),
            vec![json!({"email": "ilya@segment.io"})]
        );
    }

    #[tokio::test]
    async fn test_plugin_error_event_carries_identity() {
        let mut leader = Orchestrator::new();
        leader
            .when("broken", |_| true, |_| async { Err(ActionError::failed("nope")) })
            .unwrap();

        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = errors.clone();
        leader.subscribe("plugin:error", move |e: &Event| {
            sink.lock().unwrap().push(e.payload["plugin"].clone())
        });

        run(&leader, json!({})).await;

        assert_eq!(*errors.lock().unwrap(), vec![json!("broken")]);
    }

    #[tokio::test]
    async fn test_panicking_handler_does_not_break_run() {
        let mut leader = Orchestrator::new();
        leader
            .when("domain", |r| r.has("email"), |s| async move {
                Ok(Patch::new().set("domain", email_domain(&s)))
            })
            .unwrap();
        leader.subscribe("plugin:done", |_: &Event| panic!("subscriber blew up"));

        let finished = counter();
        let done = finished.clone();
        let handle = leader
            .run_with_callback(json!({"email": "ilya@segment.io"}), json!({}), move |error, _, _| {
                assert!(error.is_none());
                done.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        let outcome = handle.wait().await.unwrap();

        assert!(outcome.is_success());
        assert_eq!(outcome.target["domain"], "segment.io");
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_panicking_resolver_is_reported_against_plugin() {
        let mut leader = Orchestrator::new();
        leader.set_conflict_resolver(
            |_key: &FieldKey,
             _existing: &FieldWrite,
             _candidate: &FieldWrite,
             _prior: &[Resolution],
             _record: RecordView<'_>|
             -> Winner { panic!("resolver blew up") },
        );
        leader
            .when("domain", |r| r.has("email"), |s| async move {
                Ok(Patch::new().set("domain", email_domain(&s)))
            })
            .unwrap();

        let finished = counter();
        let done = finished.clone();
        let handle = leader
            .run_with_callback(
                json!({"email": "ilya@segment.io", "domain": "given.io"}),
                json!({}),
                move |_, _, _| {
                    done.fetch_add(1, Ordering::SeqCst);
                },
            )
            .unwrap();

        let outcome = handle.wait().await.unwrap();

        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.error.as_ref().and_then(|e| e.plugin()), Some("domain"));
        assert!(matches!(
            &outcome.error,
            Some(RunError::Action { source: ActionError::Panicked { message }, .. })
                if message.contains("resolver blew up")
        ));
        assert_eq!(outcome.target["domain"], "segment.io");
    }

    #[tokio::test]
    async fn test_panicking_callback_does_not_break_wait() {
        let leader = Orchestrator::new();
        let handle = leader
            .run_with_callback(json!({}), json!({}), |_, _, _| panic!("callback blew up"))
            .unwrap();

        let outcome = handle.wait().await.unwrap();

        assert!(outcome.is_success());
    }
}

// =============================================================================
// Configuration
// =============================================================================

mod configuration {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
max_time_ms = 2000
concurrency = 3

[plugins.domain]
tier = 2
"#
        )
        .unwrap();

        let config = OrchestratorConfig::load(file.path()).unwrap();
        let mut leader = Orchestrator::with_config(config).unwrap();
        leader
            .when("domain", |_| true, |_| async { Ok(Patch::new()) })
            .unwrap();

        assert_eq!(leader.config().max_time(), Some(Duration::from_secs(2)));
        assert_eq!(leader.registry().get("domain").map(|d| d.tier()), Some(2));
    }

    #[test]
    fn test_env_overrides_beat_file_values() {
        let config = OrchestratorConfig::parse("concurrency = 3")
            .unwrap()
            .with_overrides_from(|name| match name {
                "LEADER_CONCURRENCY" => Some("8".to_string()),
                _ => None,
            })
            .unwrap();
        assert_eq!(config.concurrency, Some(8));
    }

    #[test]
    fn test_zero_concurrency_config_rejected() {
        let err = OrchestratorConfig::parse("concurrency = 0").unwrap_err();
        assert!(format!("{:#}", err).contains("Concurrency limit"));
    }

    #[test]
    fn test_reserved_identity_rejected() {
        let mut leader = Orchestrator::new();
        let err = leader
            .when("input", |_| true, |_| async { Ok(Patch::new()) })
            .unwrap_err();
        assert_eq!(err, ConfigurationError::ReservedIdentity("input".to_string()));
    }
}
