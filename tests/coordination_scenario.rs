//! End-to-end: fifty actors post one near-identical unit each, two seconds
//! apart, inside a single window. Covers ingestion, window closure,
//! clustering, scoring, and queries.

use narrascope_core::model::{
    ActorId, CascadeId, NormalizedObject, PropagationKind, RiskTarget, TimelineEventKind, Timestamp,
};
use narrascope_core::window::WindowId;
use narrascope_core::{CoordinationEngine, EngineConfig, EngineError};

/// Start of an epoch-aligned two-minute window.
const BASE: Timestamp = 14_166_667 * 120_000;
const BOTS: i64 = 50;

fn signature(tilt: f32) -> Vec<f32> {
    let mut v = vec![0.0; 16];
    v[0] = 1.0;
    v[1] = tilt;
    v
}

fn post(id: String, actor: String, ts: Timestamp, parent: Option<&str>, sig: Vec<f32>) -> NormalizedObject {
    NormalizedObject {
        id: Some(id),
        actor_id: Some(actor),
        timestamp: Some(ts),
        signature: Some(sig),
        parent_id: parent.map(str::to_owned),
        relation: PropagationKind::Share,
        platform: Some("x".into()),
        landing_pages: vec!["https://news.example/story".into()],
        ..Default::default()
    }
}

/// One post per bot, 2 s apart, within window `offset`. In window 0 `bot00`
/// roots the story and every other bot shares it; later windows share it again.
fn scenario(offset: i64) -> Vec<NormalizedObject> {
    let t0 = BASE + offset * 120_000;
    (0..BOTS)
        .map(|i| {
            let ts = t0 + 1_000 + i * 2_000;
            let sig = signature(0.001 * i as f32);
            let actor = format!("bot{i:02}");
            if offset == 0 && i == 0 {
                post("root".into(), actor, ts, None, sig)
            } else {
                post(format!("w{offset}-b{i}"), actor, ts, Some("root"), sig)
            }
        })
        .collect()
}

fn run(cfg: EngineConfig, objects: Vec<NormalizedObject>) -> CoordinationEngine {
    let engine = CoordinationEngine::new(cfg).unwrap();
    for o in objects {
        let now = o.timestamp.unwrap_or(BASE);
        engine.ingest(o, now).unwrap();
    }
    engine
}

fn root() -> RiskTarget {
    RiskTarget::Cascade(CascadeId::new("c:root"))
}

#[test]
fn test_botnet_amplification_is_flagged() {
    let engine = run(EngineConfig::default(), scenario(0));

    // not ready until the grace period has passed
    assert!(engine.close_ready_windows(BASE + 149_999).unwrap().is_empty());
    assert!(matches!(engine.window_report(WindowId(14_166_667)), Err(EngineError::WindowNotReady(_))));

    let reports = engine.close_ready_windows(BASE + 150_000).unwrap();
    assert_eq!(reports.len(), 1);
    let report = &reports[0];
    assert_eq!(report.span.start, BASE);
    assert_eq!(report.unit_count, 50);
    assert_eq!(report.actor_count, 50);
    assert!(report.degenerate.is_none());

    assert_eq!(report.clusters.len(), 1);
    let cluster = &report.clusters[0];
    assert_eq!(cluster.size(), 50);
    assert!(cluster.members.contains(&ActorId::new("bot00")));
    assert!(cluster.cascades.contains(&CascadeId::new("c:root")));
    assert!(cluster.predecessors.is_empty());

    let profile = engine.latest_profile(&root()).unwrap().unwrap();
    assert!((profile.factors.density - 1.0).abs() < 1e-6);
    assert!(profile.factors.synchrony > 0.85, "{profile:?}");
    // single posts, no account age: the anomaly comes from the pooled sub-3 s cadence
    assert!(profile.factors.anomaly > 0.6, "{profile:?}");
    assert!(profile.score > 0.8, "{profile:?}");
    assert_eq!(profile.generated_at, report.span.end);
    let total: f32 = profile.factors.contributions.values().sum();
    assert!((total - profile.score).abs() < 1e-5);

    let cluster_target = RiskTarget::Cluster(cluster.id.clone());
    let cluster_timeline = engine.timeline(&cluster_target).unwrap();
    assert!(cluster_timeline
        .iter()
        .any(|e| e.kind == TimelineEventKind::ClusterFormed && e.timestamp == report.span.end));

    let bundle = engine.bundle(&root()).unwrap();
    let labels: Vec<&str> = bundle.events.iter().map(|e| e.kind.label()).collect();
    assert!(labels.contains(&"cluster_formed"));
    let crossings: Vec<f32> = bundle
        .events
        .iter()
        .filter_map(|e| match e.kind {
            TimelineEventKind::ScoreThresholdCrossed { threshold, rising: true, .. } if e.target == root() => {
                Some(threshold)
            }
            _ => None,
        })
        .collect();
    assert_eq!(crossings, vec![0.5, 0.8]);
    let population = bundle.population.unwrap();
    assert_eq!(population.unit_count, 50);
    assert_eq!(population.landing_pages.len(), 1);
}

#[test]
fn test_cluster_continues_into_next_window() {
    let mut objects = scenario(0);
    objects.extend(scenario(1));
    let engine = run(EngineConfig::default(), objects);

    let reports = engine.close_ready_windows(BASE + 270_000).unwrap();
    assert_eq!(reports.len(), 2);
    let (first, second) = (&reports[0].clusters[0], &reports[1].clusters[0]);
    assert_ne!(first.id, second.id);
    assert_eq!(second.predecessors, vec![first.id.clone()]);
    assert!(!reports[1].events.iter().any(|e| e.kind == TimelineEventKind::ClusterFormed));
    assert!(!reports[1].events.iter().any(|e| e.kind == TimelineEventKind::ClusterDissolved));

    // windows are published once
    assert!(engine.close_ready_windows(BASE + 270_000).unwrap().is_empty());
    assert_eq!(engine.window_report(reports[1].span.id).unwrap().span, reports[1].span);
}

#[test]
fn test_same_input_in_any_order_gives_same_report() {
    let forward = run(EngineConfig::default(), scenario(0));
    let mut shuffled = scenario(0);
    shuffled.reverse();
    let backward = run(EngineConfig::default(), shuffled);

    let a = forward.close_ready_windows(BASE + 150_000).unwrap();
    let b = backward.close_ready_windows(BASE + 150_000).unwrap();
    assert_eq!(a[0].clusters, b[0].clusters);
    assert_eq!(a[0].profiles, b[0].profiles);
}

#[test]
fn test_min_size_above_botnet_suppresses_clusters() {
    let mut cfg = EngineConfig::default();
    cfg.cluster.min_size = 60;
    let engine = run(cfg, scenario(0));
    let reports = engine.close_ready_windows(BASE + 150_000).unwrap();
    assert!(reports[0].clusters.is_empty());

    let profile = engine.latest_profile(&root()).unwrap().unwrap();
    assert_eq!(profile.factors.density, 0.0);
    assert_eq!(profile.factors.synchrony, 0.0);
    // no cluster to pool cadence from: only the post count is scored
    assert!(profile.factors.anomaly < 0.2, "{profile:?}");
    assert!(profile.score < 0.5);

    let baseline = run(EngineConfig::default(), scenario(0));
    baseline.close_ready_windows(BASE + 150_000).unwrap();
    assert!(baseline.latest_profile(&root()).unwrap().unwrap().score > profile.score);
}

#[test]
fn test_shutdown_cancels_without_publishing() {
    let engine = run(EngineConfig::default(), scenario(0));
    engine.shutdown();
    let err = engine.close_ready_windows(BASE + 150_000).unwrap_err();
    let w = WindowId(BASE / 120_000);
    assert_eq!(err, EngineError::Cancelled { first: w, last: w });
    assert!(engine.latest_profile(&root()).unwrap().is_none());
    assert!(engine.profiles_since(i64::MIN).is_empty());
    assert!(matches!(engine.window_report(w), Err(EngineError::WindowNotReady(_))));
}

#[test]
fn test_queries_on_unknown_targets_and_profile_feed() {
    let engine = run(EngineConfig::default(), scenario(0));
    let ghost = RiskTarget::Cascade(CascadeId::new("c:ghost"));
    assert!(matches!(engine.latest_profile(&ghost), Err(EngineError::UnknownTarget(_))));
    assert!(matches!(engine.bundle(&ghost), Err(EngineError::UnknownTarget(_))));

    // known but not yet scored
    assert_eq!(engine.latest_profile(&root()).unwrap(), None);

    let reports = engine.close_ready_windows(BASE + 150_000).unwrap();
    let end = reports[0].span.end;
    let feed = engine.profiles_since(end - 1);
    assert_eq!(feed.len(), reports[0].profiles.len());
    assert!(feed.iter().all(|p| p.generated_at == end));
    assert!(engine.profiles_since(end).is_empty());
}
