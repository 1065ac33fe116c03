//! CTI export integration tests.
//!
//! Runs a small cascade through the engine, exports its risk bundle, and
//! checks the JSON shape and identifier stability.

#[cfg(feature = "serde")]
mod tests {
    use narrascope_core::export::{CtiBundle, CtiObject};
    use narrascope_core::model::{CascadeId, NormalizedObject, PropagationKind, RiskTarget};
    use narrascope_core::{CoordinationEngine, EngineConfig};

    fn obj(id: &str, actor: &str, ts: i64, parent: Option<&str>) -> NormalizedObject {
        NormalizedObject {
            id: Some(id.into()),
            actor_id: Some(actor.into()),
            timestamp: Some(ts),
            signature: Some(vec![1.0, 0.0]),
            parent_id: parent.map(str::to_owned),
            relation: PropagationKind::Quote,
            platform: Some("telegram".into()),
            impressions: Some(250.0),
            ..Default::default()
        }
    }

    fn engine_with_window() -> CoordinationEngine {
        let mut cfg = EngineConfig::default();
        cfg.graph.signature_dim = 2;
        let engine = CoordinationEngine::new(cfg).unwrap();
        engine.ingest(obj("r", "origin", 1_000, None), 1_000).unwrap();
        for i in 0..6 {
            let ts = 10_000 + i * 1_000;
            engine.ingest(obj(&format!("q{i}"), &format!("acct{i}"), ts, Some("r")), ts).unwrap();
        }
        engine.close_ready_windows(150_000).unwrap();
        engine
    }

    #[test]
    fn test_engine_bundle_exports_to_cti_json() {
        let engine = engine_with_window();
        let target = RiskTarget::Cascade(CascadeId::new("c:r"));
        let bundle = engine.bundle(&target).unwrap();
        let cti = CtiBundle::from_risk_bundle(&bundle);

        assert_eq!(cti.profiles().count(), bundle.history.len());
        let population = cti.objects.iter().find_map(|o| match o {
            CtiObject::Population(p) => Some(p),
            _ => None,
        });
        let population = population.unwrap();
        assert_eq!(population.unit_count, 7);
        assert_eq!(population.impressions_total, 1_750.0);
        assert_eq!(population.platforms.get("telegram"), Some(&7));
        assert_eq!(population.key_ids.len(), 7);
        assert!(population.key_ids.contains(&"origin".to_owned()));
        assert_eq!(population.impressions_detail.len(), 7);
        assert_eq!(population.impressions_detail[0], ("q0".to_owned(), 250.0));

        let json = serde_json::to_string_pretty(&cti).unwrap();
        assert!(json.contains("\"x-narrative-population\""));
        assert!(json.contains("\"cascade:c:r\""));
        let back: CtiBundle = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, cti.id);
        assert_eq!(back.object_count(), cti.object_count());
    }

    #[test]
    fn test_export_ids_are_stable_across_engines() {
        let target = RiskTarget::Cascade(CascadeId::new("c:r"));
        let a = CtiBundle::from_risk_bundle(&engine_with_window().bundle(&target).unwrap());
        let b = CtiBundle::from_risk_bundle(&engine_with_window().bundle(&target).unwrap());
        assert_eq!(a.id, b.id);
        let ids_a: Vec<&str> = a.objects.iter().map(CtiObject::id).collect();
        let ids_b: Vec<&str> = b.objects.iter().map(CtiObject::id).collect();
        assert_eq!(ids_a, ids_b);
    }
}
