use std::path::PathBuf;

use pmr_core::Confidence;
use pmr_sync::{PipelineSettings, SourceRegistry, SyncConfig};

fn workspace_root() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../..")
}

#[test]
fn checked_in_registry_and_settings_parse() {
    let config = SyncConfig::local(workspace_root());
    let registry = SourceRegistry::load(&config.sources_path()).unwrap();
    let enabled: Vec<_> = registry.enabled().map(|s| s.source_id.as_str()).collect();
    assert_eq!(enabled, vec!["reality", "nehnutelnosti"]);
    for source in registry.enabled() {
        assert!(config.fixtures_root().join(&source.source_id).is_dir());
    }

    let settings = PipelineSettings::load(&config.pipeline_path()).unwrap();
    assert_eq!(settings, PipelineSettings::default());
    assert_eq!(settings.market_gap.notify_min_confidence, Confidence::Medium);
}
