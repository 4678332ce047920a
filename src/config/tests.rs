use super::*;

#[test]
fn cli_overrides_take_highest_precedence() {
    let mut raw = RawSettings::default();
    raw.client.stale_time_ms = Some(1_000);
    raw.logging.level = Some("info".to_string());

    let overrides = ClientOverrides {
        stale_time_ms: Some(2_500),
        log_level: Some("debug".to_string()),
        ..Default::default()
    };

    raw.apply_client_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert_eq!(settings.client.stale_time_ms, 2_500);
    assert_eq!(settings.logging.level, LevelFilter::DEBUG);
}

#[test]
fn client_settings_use_engine_defaults() {
    let settings = Settings::from_raw(RawSettings::default()).expect("valid settings");

    assert_eq!(settings.client, ClientConfig::default());
    assert_eq!(settings.logging.level, LevelFilter::INFO);
    assert!(matches!(settings.logging.format, LogFormat::Compact));
}

#[test]
fn cli_json_logging_enforces_format() {
    let mut raw = RawSettings::default();
    let overrides = ClientOverrides {
        log_json: Some(true),
        ..Default::default()
    };

    raw.apply_client_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert!(matches!(settings.logging.format, LogFormat::Json));
}

#[test]
fn network_mode_parses_case_insensitively() {
    let mut raw = RawSettings::default();
    raw.client.network_mode = Some("Always".to_string());

    let settings = Settings::from_raw(raw).expect("valid settings");
    assert_eq!(settings.client.network_mode, NetworkMode::Always);
}

#[test]
fn unknown_network_mode_is_rejected() {
    let mut raw = RawSettings::default();
    raw.client.network_mode = Some("sometimes".to_string());

    let err = Settings::from_raw(raw).expect_err("invalid network mode");
    assert!(matches!(
        err,
        LoadError::Invalid {
            key: "client.network_mode",
            ..
        }
    ));
}

#[test]
fn invalid_log_level_is_rejected() {
    let mut raw = RawSettings::default();
    raw.logging.level = Some("chatty".to_string());

    let err = Settings::from_raw(raw).expect_err("invalid level");
    assert!(matches!(err, LoadError::Invalid { key: "logging.level", .. }));
}

#[test]
fn file_values_merge_with_defaults() {
    let raw: RawSettings = Config::builder()
        .add_source(config::File::from_str(
            "[client]\nretry_count = 0\nrefetch_on_focus = false\n",
            config::FileFormat::Toml,
        ))
        .build()
        .expect("config builds")
        .try_deserialize()
        .expect("raw settings deserialize");

    let settings = Settings::from_raw(raw).expect("valid settings");
    assert_eq!(settings.client.retry_count, 0);
    assert!(!settings.client.refetch_on_focus);
    assert!(settings.client.refetch_on_reconnect);
}

#[test]
fn default_command_is_none() {
    let args = CliArgs::parse_from(["querycache"]);
    assert!(args.command.is_none());
}

#[test]
fn parse_demo_arguments() {
    let args = CliArgs::parse_from([
        "querycache",
        "demo",
        "--consumers",
        "5",
        "--failures",
        "2",
        "--operator",
        "concat",
        "--retry-count",
        "4",
        "--log-json",
        "true",
    ]);

    match args.command.expect("demo command") {
        Command::Demo(demo) => {
            assert_eq!(demo.consumers, 5);
            assert_eq!(demo.failures, 2);
            assert_eq!(demo.operator, MapOperator::Concat);
            assert_eq!(demo.latency_ms, DEFAULT_DEMO_LATENCY_MS);
            assert_eq!(demo.overrides.retry_count, Some(4));
            assert_eq!(demo.overrides.log_json, Some(true));
        }
    }
}
