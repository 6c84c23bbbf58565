use blk_config::{load_layered_yaml_from_strings, report_unused_keys, ConfigConsumer, UnusedKeyPolicy};

const YAML: &str = r#"
reservation:
  timezone: "America/New_York"
sweeper:
  interval_secs: 120
fanout:
  subscriber_buffer: 64
legacy:
  dispatch_zone: 4
"#;

#[test]
fn warn_mode_reports_unused_keys_without_error() {
    let loaded = load_layered_yaml_from_strings(&[YAML]).unwrap();
    let report =
        report_unused_keys(ConfigConsumer::Daemon, &loaded.config_json, UnusedKeyPolicy::Warn)
            .expect("warn mode must not error");

    assert_eq!(report.unused_leaf_pointers, vec!["/legacy/dispatch_zone".to_string()]);
}

#[test]
fn fail_mode_errors_on_unused_keys() {
    let loaded = load_layered_yaml_from_strings(&[YAML]).unwrap();
    let err = report_unused_keys(ConfigConsumer::Daemon, &loaded.config_json, UnusedKeyPolicy::Fail)
        .unwrap_err();
    assert!(err.to_string().contains("CONFIG_UNUSED_KEYS"));
}

#[test]
fn cli_does_not_consume_daemon_sections() {
    let loaded = load_layered_yaml_from_strings(&[YAML]).unwrap();
    let report =
        report_unused_keys(ConfigConsumer::Cli, &loaded.config_json, UnusedKeyPolicy::Warn).unwrap();

    assert!(report.unused_leaf_pointers.contains(&"/sweeper/interval_secs".to_string()));
    assert!(report.unused_leaf_pointers.contains(&"/fanout/subscriber_buffer".to_string()));
    assert!(!report.unused_leaf_pointers.contains(&"/reservation/timezone".to_string()));
}

#[test]
fn clean_config_reports_clean() {
    let loaded = load_layered_yaml_from_strings(&["reservation:\n  timezone: \"UTC\"\n"]).unwrap();
    let report =
        report_unused_keys(ConfigConsumer::Cli, &loaded.config_json, UnusedKeyPolicy::Fail).unwrap();
    assert!(report.is_clean());
}
