use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use tempfile::{Builder, NamedTempFile};

use pathguard_counter::config::AggregatorConfig;
use pathguard_counter::CongestionLevel;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "PATHGUARD_CONFIG",
        "PATHGUARD_CAMERA_URL",
        "PATHGUARD_COLLECTOR_URL",
        "PATHGUARD_API_KEY",
        "PATHGUARD_DEVICE_ID",
        "PATHGUARD_LAT",
        "PATHGUARD_LNG",
        "PATHGUARD_CONF_THRESHOLD",
        "PATHGUARD_REENTRY_GRACE_SECS",
        "PATHGUARD_POST_INTERVAL_SECS",
        "PATHGUARD_POST_TIMEOUT_SECS",
        "PATHGUARD_FALLBACK_PATH",
        "PATHGUARD_OBFUSCATE",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn loads_config_from_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{
        "camera": { "base_url": "http://10.0.0.7" },
        "detection": { "min_confidence": 0.5, "iou_threshold": 0.3 },
        "tracking": { "reentry_grace_secs": 20 },
        "windows": { "short_secs": 120, "long_secs": 900 },
        "congestion": { "low_max": 2, "medium_max": 6 },
        "reporting": {
            "interval_secs": 120,
            "collector_url": "https://collector.example/api/congestion",
            "fallback_path": "/var/lib/pathguard/metrics.csv"
        },
        "site": { "device_id": "gate-north", "lat": 45.5, "lng": -73.6 }
    }"#;
    file.write_all(json.as_bytes()).expect("write config");

    std::env::set_var("PATHGUARD_CONFIG", file.path());
    std::env::set_var("PATHGUARD_DEVICE_ID", "gate-south");
    std::env::set_var("PATHGUARD_API_KEY", "k-123");
    std::env::set_var("PATHGUARD_OBFUSCATE", "yes");

    let cfg = AggregatorConfig::load().expect("load config");

    assert_eq!(cfg.camera.stream_url(), "http://10.0.0.7:81/stream");
    assert_eq!(cfg.detection.min_confidence, 0.5);
    assert_eq!(cfg.detection.iou_threshold, 0.3);
    assert_eq!(cfg.reentry_grace, Duration::from_secs(20));
    assert_eq!(cfg.windows.short, Duration::from_secs(120));
    assert_eq!(cfg.windows.long, Duration::from_secs(900));
    assert_eq!(cfg.reporting.interval, Duration::from_secs(120));
    assert_eq!(
        cfg.reporting.collector_url.as_deref(),
        Some("https://collector.example/api/congestion")
    );
    assert_eq!(cfg.reporting.api_key.as_deref(), Some("k-123"));
    assert_eq!(
        cfg.reporting.fallback_path,
        PathBuf::from("/var/lib/pathguard/metrics.csv")
    );
    assert!(cfg.reporting.obfuscate);
    assert_eq!(cfg.site.device_id, "gate-south");
    assert_eq!(cfg.site.lat, 45.5);

    let thresholds = cfg.thresholds().expect("thresholds");
    assert_eq!(thresholds.classify(2), CongestionLevel::Low);
    assert_eq!(thresholds.classify(6), CongestionLevel::Medium);
    assert_eq!(thresholds.classify(7), CongestionLevel::High);

    clear_env();
}

#[test]
fn loads_toml_config() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = Builder::new().suffix(".toml").tempfile().expect("temp config");
    let toml = r#"
[reporting]
interval_secs = 300
timeout_secs = 4

[site]
device_id = "lobby"
"#;
    file.write_all(toml.as_bytes()).expect("write config");

    let cfg = AggregatorConfig::load_from(Some(file.path())).expect("load config");
    assert_eq!(cfg.reporting.interval, Duration::from_secs(300));
    assert_eq!(cfg.reporting.timeout, Duration::from_secs(4));
    assert_eq!(cfg.site.device_id, "lobby");
    assert_eq!(cfg.windows.short, Duration::from_secs(5 * 60));
    assert_eq!(cfg.windows.long, Duration::from_secs(30 * 60));

    clear_env();
}

#[test]
fn defaults_without_config_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = AggregatorConfig::load().expect("load defaults");
    assert_eq!(cfg.reentry_grace, Duration::from_secs(45));
    assert_eq!(cfg.reporting.interval, Duration::from_secs(60));
    assert!(cfg.reporting.collector_url.is_none());
    assert!(!cfg.reporting.obfuscate);

    clear_env();
}

#[test]
fn rejects_invalid_thresholds_and_windows() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut thresholds = NamedTempFile::new().expect("temp config");
    thresholds
        .write_all(br#"{ "congestion": { "low_max": 4, "medium_max": 4 } }"#)
        .expect("write config");
    assert!(AggregatorConfig::load_from(Some(thresholds.path())).is_err());

    let mut window = NamedTempFile::new().expect("temp config");
    window
        .write_all(br#"{ "windows": { "short_secs": 0 } }"#)
        .expect("write config");
    assert!(AggregatorConfig::load_from(Some(window.path())).is_err());

    let mut unknown = NamedTempFile::new().expect("temp config");
    unknown
        .write_all(br#"{ "retention": { "seconds": 10 } }"#)
        .expect("write config");
    assert!(AggregatorConfig::load_from(Some(unknown.path())).is_err());

    std::env::set_var("PATHGUARD_POST_INTERVAL_SECS", "soon");
    let err = AggregatorConfig::load().unwrap_err();
    assert!(format!("{:#}", err).contains("PATHGUARD_POST_INTERVAL_SECS"));

    clear_env();
}

#[test]
fn rejects_device_id_with_line_break_from_env() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("PATHGUARD_DEVICE_ID", "gate\nnorth");
    let err = AggregatorConfig::load().unwrap_err();
    assert!(format!("{:#}", err).contains("control characters"));

    clear_env();
}
