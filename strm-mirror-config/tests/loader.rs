use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use strm_mirror_config::{
    ConfigGuardRailError, ConfigLoad, ConfigLoadError, ConfigLoader, ConfigSource,
};
use strm_mirror_core::RefreshJob;
use tempfile::TempDir;

struct Fixture {
    dir: TempDir,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(dir.path().join("source")).expect("source dir");
        Self { dir }
    }

    fn path(&self, rel: &str) -> PathBuf {
        self.dir.path().join(rel)
    }

    fn write(&self, rel: &str, contents: &str) -> PathBuf {
        let path = self.path(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("parent dir");
        }
        fs::write(&path, contents).expect("write config");
        path
    }

    fn roots_toml(&self) -> String {
        format!(
            "source_root = {:?}\ndest_root = {:?}\n",
            self.path("source").display().to_string(),
            self.path("mirror").display().to_string()
        )
    }

    fn loader(&self, env: &[(&str, String)]) -> ConfigLoader {
        let vars: HashMap<String, String> = env
            .iter()
            .map(|(key, value)| (key.to_string(), value.clone()))
            .collect();
        ConfigLoader::new()
            .with_search_dir(self.dir.path())
            .with_env_lookup(move |name| vars.get(name).cloned())
    }
}

fn load_ok(loader: ConfigLoader) -> ConfigLoad {
    loader.load().expect("configuration should load")
}

fn display(path: &Path) -> String {
    path.display().to_string()
}

#[test]
fn toml_file_applies_values_and_defaults() {
    let fx = Fixture::new();
    let config_path = fx.write(
        "strm-mirror.toml",
        &format!(
            "{}extension = \".STRM\"\n\n[watch]\ndebounce = \"5s\"\n\n[full_sync]\ninterval = \"12h\"\nmax_path_retries = 3\n\n[refresh]\ncommand = [\"true\"]\n\n[identifier]\nexceptions = [\"T28-557\"]\n",
            fx.roots_toml()
        ),
    );

    let ConfigLoad { config, warnings } = load_ok(fx.loader(&[]));

    assert_eq!(config.metadata.source, ConfigSource::File(config_path));
    assert_eq!(config.extension, "strm");
    assert_eq!(config.debounce_window, Duration::from_secs(5));
    assert_eq!(config.full_sync_interval, Duration::from_secs(12 * 3600));
    assert_eq!(config.full_sync_retry_interval, Duration::from_secs(300));
    assert_eq!(config.max_path_retries, 3);
    assert_eq!(config.refresh.interval, Duration::from_secs(30 * 60));
    assert_eq!(config.refresh.command, vec!["true".to_string()]);
    assert_eq!(config.shutdown_timeout, Duration::from_secs(10));
    assert_eq!(config.identifier.exceptions, vec!["T28-557".to_string()]);
    assert!(warnings.is_empty(), "unexpected warnings: {warnings:?}");
}

#[test]
fn json_file_is_parsed_by_extension() {
    let fx = Fixture::new();
    let json = format!(
        r#"{{"src_dir": {:?}, "dst_dir": {:?}, "full_sync": {{"retry_interval": "1m"}}}}"#,
        display(&fx.path("source")),
        display(&fx.path("mirror"))
    );
    let config_path = fx.write("custom/mirror.json", &json);

    let ConfigLoad { config, .. } = load_ok(fx.loader(&[]).with_config_path(&config_path));

    assert_eq!(config.metadata.source, ConfigSource::Explicit(config_path));
    assert_eq!(config.full_sync_retry_interval, Duration::from_secs(60));
    assert!(config.source_root.ends_with("source"));
}

#[test]
fn environment_overrides_file_values() {
    let fx = Fixture::new();
    fx.write(
        "config/strm-mirror.toml",
        &format!("{}[watch]\ndebounce = \"5s\"\n", fx.roots_toml()),
    );
    fs::create_dir_all(fx.path("other-source")).expect("other source");

    let ConfigLoad { config, .. } = load_ok(fx.loader(&[
        ("STRM_MIRROR_SOURCE_ROOT", display(&fx.path("other-source"))),
        ("STRM_MIRROR_DEBOUNCE", "750ms".to_string()),
        ("STRM_MIRROR_MAX_PATH_RETRIES", "0".to_string()),
        ("STRM_MIRROR_REFRESH_COMMAND", "rclone rc vfs/refresh".to_string()),
        ("STRM_MIRROR_EXTENSION", "   ".to_string()),
    ]));

    assert!(config.source_root.ends_with("other-source"));
    assert_eq!(config.debounce_window, Duration::from_millis(750));
    assert_eq!(config.max_path_retries, 0);
    assert_eq!(config.refresh.command, ["rclone", "rc", "vfs/refresh"]);
    assert_eq!(config.extension, "strm", "blank env values count as unset");
}

#[test]
fn env_only_configuration_warns_about_missing_file() {
    let fx = Fixture::new();

    let ConfigLoad { config, warnings } = load_ok(fx.loader(&[
        ("STRM_MIRROR_SOURCE_ROOT", display(&fx.path("source"))),
        ("STRM_MIRROR_DEST_ROOT", display(&fx.path("mirror"))),
    ]));

    assert_eq!(config.metadata.source, ConfigSource::Defaults);
    assert!(warnings.contains("No strm-mirror.toml detected"));
    assert!(warnings.contains("No refresh command configured"));
}

#[test]
fn destination_root_is_created() {
    let fx = Fixture::new();
    fx.write(
        "strm-mirror.toml",
        &format!(
            "source_root = {:?}\ndest_root = {:?}\n",
            display(&fx.path("source")),
            display(&fx.path("deep/nested/mirror"))
        ),
    );

    let ConfigLoad { config, .. } = load_ok(fx.loader(&[]));

    assert!(config.dest_root.is_dir());
    assert!(config.dest_root.ends_with("deep/nested/mirror"));
}

#[test]
fn missing_roots_are_reported_with_their_variable() {
    let fx = Fixture::new();
    fx.write(
        "strm-mirror.toml",
        &format!("source_root = {:?}\n", display(&fx.path("source"))),
    );

    let err = fx.loader(&[]).load().expect_err("dest_root is required");
    assert!(matches!(
        err,
        ConfigLoadError::MissingField {
            field: "dest_root",
            env: "STRM_MIRROR_DEST_ROOT"
        }
    ));
}

#[test]
fn nonexistent_source_root_is_rejected() {
    let fx = Fixture::new();
    fx.write(
        "strm-mirror.toml",
        &format!(
            "source_root = {:?}\ndest_root = {:?}\n",
            display(&fx.path("missing")),
            display(&fx.path("mirror"))
        ),
    );

    let err = fx.loader(&[]).load().expect_err("source must exist");
    assert!(matches!(
        err,
        ConfigLoadError::GuardRail(ConfigGuardRailError::InvalidRoot {
            reason: "does not exist",
            ..
        })
    ));
    assert!(!fx.path("mirror").exists(), "rejected config must not create dest_root");
}

#[test]
fn source_root_that_is_a_file_is_rejected() {
    let fx = Fixture::new();
    let file = fx.write("not-a-dir", "");
    fx.write(
        "strm-mirror.toml",
        &format!(
            "source_root = {:?}\ndest_root = {:?}\n",
            display(&file),
            display(&fx.path("mirror"))
        ),
    );

    let err = fx.loader(&[]).load().expect_err("source must be a directory");
    assert!(matches!(
        err,
        ConfigLoadError::GuardRail(ConfigGuardRailError::InvalidRoot {
            reason: "is not a directory",
            ..
        })
    ));
}

#[test]
fn nested_roots_are_rejected() {
    let fx = Fixture::new();
    fx.write(
        "strm-mirror.toml",
        &format!(
            "source_root = {:?}\ndest_root = {:?}\n",
            display(&fx.path("source")),
            display(&fx.path("source/mirror"))
        ),
    );

    let err = fx.loader(&[]).load().expect_err("overlap must fail");
    assert!(matches!(
        err,
        ConfigLoadError::GuardRail(ConfigGuardRailError::OverlappingRoots { .. })
    ));
    assert!(!fx.path("source/mirror").exists(), "nested dest_root must not be created");
}

#[test]
fn destination_missing_below_source_is_rejected_before_creation() {
    let fx = Fixture::new();
    fx.write(
        "strm-mirror.toml",
        &format!(
            "source_root = {:?}\ndest_root = {:?}\n",
            display(&fx.path("source")),
            display(&fx.path("source/a/b/mirror"))
        ),
    );

    let err = fx.loader(&[]).load().expect_err("overlap must fail");
    assert!(matches!(
        err,
        ConfigLoadError::GuardRail(ConfigGuardRailError::OverlappingRoots { .. })
    ));
    assert!(!fx.path("source/a").exists());
}

#[test]
fn invalid_duration_names_the_field() {
    let fx = Fixture::new();
    fx.write(
        "strm-mirror.toml",
        &format!("{}[full_sync]\ninterval = \"daily\"\n", fx.roots_toml()),
    );

    let err = fx.loader(&[]).load().expect_err("bad duration");
    match err {
        ConfigLoadError::InvalidDuration { field, value, .. } => {
            assert_eq!(field, "full_sync.interval");
            assert_eq!(value, "daily");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn invalid_retry_count_from_env_is_rejected() {
    let fx = Fixture::new();
    fx.write("strm-mirror.toml", &fx.roots_toml());

    let err = fx
        .loader(&[("STRM_MIRROR_MAX_PATH_RETRIES", "many".to_string())])
        .load()
        .expect_err("bad number");
    assert!(matches!(
        err,
        ConfigLoadError::InvalidNumber {
            field: "full_sync.max_path_retries",
            ..
        }
    ));
}

#[test]
fn zero_interval_is_rejected() {
    let fx = Fixture::new();
    fx.write(
        "strm-mirror.toml",
        &format!("{}[refresh]\ninterval = \"0s\"\n", fx.roots_toml()),
    );

    let err = fx.loader(&[]).load().expect_err("zero interval");
    assert!(matches!(
        err,
        ConfigLoadError::GuardRail(ConfigGuardRailError::ZeroInterval {
            field: "refresh.interval"
        })
    ));
}

#[test]
fn soft_findings_become_warnings() {
    let fx = Fixture::new();
    fx.write(
        "strm-mirror.toml",
        &format!(
            "{}[watch]\ndebounce = \"0s\"\n\n[full_sync]\ninterval = \"1m\"\nretry_interval = \"5m\"\n",
            fx.roots_toml()
        ),
    );

    let ConfigLoad { warnings, .. } = load_ok(fx.loader(&[]));

    assert!(warnings.contains("watch.debounce is zero"));
    assert!(warnings.contains("retry_interval is longer"));
    assert!(warnings.contains("No refresh command configured"));
}

#[test]
fn invalid_identifier_pattern_is_rejected() {
    let fx = Fixture::new();
    fx.write(
        "strm-mirror.toml",
        &format!(
            "{}[identifier]\nignored_patterns = [\"(unclosed\"]\n",
            fx.roots_toml()
        ),
    );

    let err = fx.loader(&[]).load().expect_err("bad regex");
    assert!(matches!(
        err,
        ConfigLoadError::GuardRail(ConfigGuardRailError::InvalidIdentifier { .. })
    ));
}

#[test]
fn explicit_path_must_exist() {
    let fx = Fixture::new();
    fx.write("strm-mirror.toml", &fx.roots_toml());

    let missing = fx.path("nowhere.toml");
    let err = fx
        .loader(&[])
        .with_config_path(&missing)
        .load()
        .expect_err("explicit path is not optional");
    assert!(matches!(err, ConfigLoadError::MissingConfig { path } if path == missing));
}

#[test]
fn env_config_path_is_used_before_defaults() {
    let fx = Fixture::new();
    fx.write(
        "strm-mirror.toml",
        &format!("{}extension = \"txt\"\n", fx.roots_toml()),
    );
    let chosen = fx.write(
        "elsewhere.toml",
        &format!("{}extension = \"link\"\n", fx.roots_toml()),
    );

    let ConfigLoad { config, .. } =
        load_ok(fx.loader(&[("STRM_MIRROR_CONFIG", display(&chosen))]));

    assert_eq!(config.metadata.source, ConfigSource::EnvPath(chosen));
    assert_eq!(config.extension, "link");
}

#[test]
fn malformed_toml_is_a_parse_error() {
    let fx = Fixture::new();
    fx.write("strm-mirror.toml", "source_root = [unterminated");

    let err = fx.loader(&[]).load().expect_err("parse failure");
    assert!(matches!(err, ConfigLoadError::Parse { .. }));
}

#[test]
fn resolved_settings_feed_the_core() {
    let fx = Fixture::new();
    fx.write(
        "strm-mirror.toml",
        &format!("{}[full_sync]\nmax_path_retries = 4\n", fx.roots_toml()),
    );

    let ConfigLoad { config, .. } = load_ok(fx.loader(&[]));
    let settings = config.reconcile_settings();
    assert_eq!(settings.max_path_retries, 4);
    assert_eq!(settings.debounce_window, Duration::from_secs(2));
    assert_eq!(config.refresh_job().name(), "noop");
    assert!(config.identifier_extractor().is_ok());

    let rendered = config.to_string();
    assert!(rendered.contains("extension:               .strm"));
    assert!(rendered.contains("refresh command:         <none>"));
}
