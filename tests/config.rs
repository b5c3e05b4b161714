/// Configuration integration tests
///
/// Loads container settings from environment variables and in-memory maps,
/// then checks that the loaded defaults reach components that do not set
/// their own pool, session or timeout settings.

use ferrous_container::{
    AccessTimeout, ComponentDescriptor, ConfigError, ConfigProvider, ConfigValue, Container, ContainerConfig,
    ContainerError, EnvironmentConfigSource, MapConfigSource, SessionKey,
};
use serial_test::serial;
use std::env;
use std::thread;
use std::time::Duration;

const VARS: &[&str] = &[
    "FCAPP_ACCESS_TIMEOUT",
    "FCAPP_POOL_MIN",
    "FCAPP_POOL_MAX",
    "FCAPP_POOL_STRICT",
    "FCAPP_POOL_IDLE_TIMEOUT",
    "FCAPP_SESSION_MAX_ACTIVE",
    "FCAPP_SESSION_TIMEOUT",
    "FCAPP_SHUTDOWN_DRAIN_TIMEOUT",
];

fn clear_env() {
    for var in VARS {
        env::remove_var(var);
    }
}

fn slow_pooled() -> ComponentDescriptor {
    ComponentDescriptor::pooled("Report", || ())
        .method("render", |_: &(), _ctx| {
            thread::sleep(Duration::from_millis(120));
            Ok(())
        })
        .build()
}

// ===== Environment =====

#[test]
#[serial]
fn test_env_overrides_every_key() {
    clear_env();
    env::set_var("FCAPP_ACCESS_TIMEOUT", "-1");
    env::set_var("FCAPP_POOL_MIN", "1");
    env::set_var("FCAPP_POOL_MAX", "6");
    env::set_var("FCAPP_POOL_STRICT", "false");
    env::set_var("FCAPP_POOL_IDLE_TIMEOUT", "90 seconds");
    env::set_var("FCAPP_SESSION_MAX_ACTIVE", "25");
    env::set_var("FCAPP_SESSION_TIMEOUT", "1 hour and 30 minutes");
    env::set_var("FCAPP_SHUTDOWN_DRAIN_TIMEOUT", "2500");

    let config = ContainerConfig::from_env("fcapp").unwrap();
    clear_env();

    assert_eq!(config.default_access_timeout, AccessTimeout::Unbounded);
    assert_eq!(config.pool.min, 1);
    assert_eq!(config.pool.max, 6);
    assert!(!config.pool.strict);
    assert_eq!(config.pool.idle_timeout, Some(Duration::from_secs(90)));
    assert_eq!(config.session.max_active, 25);
    assert_eq!(config.session.timeout, Some(Duration::from_secs(5_400)));
    assert_eq!(config.drain_timeout, Duration::from_millis(2_500));
}

#[test]
#[serial]
fn test_env_without_values_gives_defaults() {
    clear_env();
    let config = ContainerConfig::from_env("fcapp").unwrap();
    assert_eq!(config, ContainerConfig::default());
}

#[test]
#[serial]
fn test_env_type_errors_name_the_key() {
    clear_env();
    env::set_var("FCAPP_POOL_STRICT", "sometimes");
    let err = ContainerConfig::from_env("fcapp").unwrap_err();
    clear_env();

    assert!(matches!(err, ConfigError::TypeMismatch { ref key, .. } if key == "pool.strict"));
    assert_eq!(err.to_string(), "config key `pool.strict`: expected a boolean");
}

#[test]
#[serial]
fn test_env_sits_above_file_defaults() {
    clear_env();
    env::set_var("FCAPP_POOL_MAX", "8");

    let provider = ConfigProvider::new()
        .with_source(EnvironmentConfigSource::with_prefix("FCAPP"))
        .with_source(
            MapConfigSource::new()
                .with("pool.max", ConfigValue::Integer(2))
                .with("access_timeout", ConfigValue::String("750ms".into())),
        );
    let config = ContainerConfig::load(&provider).unwrap();
    clear_env();

    assert_eq!(config.pool.max, 8);
    assert_eq!(config.default_access_timeout, AccessTimeout::Bounded(Duration::from_millis(750)));
}

#[test]
fn test_unusable_defaults_are_rejected_on_load() {
    let provider = ConfigProvider::new().with_source(MapConfigSource::new().with("pool.max", ConfigValue::Integer(0)));
    let err = ContainerConfig::load(&provider).unwrap_err();
    assert!(matches!(err, ConfigError::Invalid { key: "pool.max", .. }), "{:?}", err);

    let provider = ConfigProvider::new().with_source(
        MapConfigSource::new()
            .with("pool.min", ConfigValue::Integer(5))
            .with("pool.max", ConfigValue::Integer(2)),
    );
    let err = ContainerConfig::load(&provider).unwrap_err();
    assert_eq!(err.to_string(), "config key `pool.min`: 5 exceeds pool.max 2");

    let provider =
        ConfigProvider::new().with_source(MapConfigSource::new().with("session.max_active", ConfigValue::Integer(0)));
    assert!(ContainerConfig::load(&provider).is_err());
}

#[test]
fn test_unusable_defaults_fail_deployment() {
    let mut config = ContainerConfig::default();
    config.pool.max = 0;

    let err = Container::builder().config(config.clone()).deploy(slow_pooled()).build().unwrap_err();
    assert!(
        matches!(err, ContainerError::InvalidDescriptor { ref component, .. } if component == "Report"),
        "{:?}",
        err
    );

    let container = Container::new(config);
    assert!(container.deploy(slow_pooled()).is_err());
    assert!(!container.is_deployed("Report"));
}

// ===== Defaults Reach Components =====

#[test]
fn test_default_pool_bound_applies_to_components() {
    let provider = ConfigProvider::new().with_source(
        MapConfigSource::new()
            .with("pool.max", ConfigValue::Integer(1))
            .with("access_timeout", ConfigValue::Integer(0)),
    );
    let container = Container::builder()
        .config(ContainerConfig::load(&provider).unwrap())
        .deploy(slow_pooled())
        .build()
        .unwrap();

    crossbeam_utils::thread::scope(|s| {
        s.spawn(|_| container.dispatch("Report", "render", None, ()).unwrap());
        thread::sleep(Duration::from_millis(40));

        let err = container.dispatch("Report", "render", None, ()).unwrap_err();
        assert!(matches!(err, ContainerError::Exhausted { capacity: 1, .. }), "{:?}", err);
    })
    .unwrap();
}

#[test]
fn test_component_timeout_beats_configured_default() {
    let provider = ConfigProvider::new().with_source(
        MapConfigSource::new()
            .with("pool.max", ConfigValue::Integer(1))
            .with("access_timeout", ConfigValue::Integer(0)),
    );
    let descriptor = ComponentDescriptor::pooled("Report", || ())
        .access_timeout(AccessTimeout::from_millis(500))
        .method("render", |_: &(), _ctx| {
            thread::sleep(Duration::from_millis(60));
            Ok(())
        })
        .build();
    let container = Container::builder()
        .config(ContainerConfig::load(&provider).unwrap())
        .deploy(descriptor)
        .build()
        .unwrap();

    crossbeam_utils::thread::scope(|s| {
        s.spawn(|_| container.dispatch("Report", "render", None, ()).unwrap());
        thread::sleep(Duration::from_millis(20));
        container.dispatch("Report", "render", None, ()).unwrap();
    })
    .unwrap();
}

#[test]
fn test_default_session_capacity_applies_to_components() {
    let provider =
        ConfigProvider::new().with_source(MapConfigSource::new().with("session.max_active", ConfigValue::Integer(2)));
    let descriptor = ComponentDescriptor::session("Wizard", || ())
        .method("step", |_: &(), _ctx| Ok(()))
        .build();
    let container = Container::builder()
        .config(ContainerConfig::load(&provider).unwrap())
        .deploy(descriptor)
        .build()
        .unwrap();

    for key in ["a", "b"] {
        container.dispatch("Wizard", "step", Some(&SessionKey::new(key)), ()).unwrap();
    }
    let err = container
        .dispatch("Wizard", "step", Some(&SessionKey::new("c")), ())
        .unwrap_err();
    assert!(matches!(err, ContainerError::Exhausted { capacity: 2, .. }), "{:?}", err);
}

// ===== JSON =====

#[cfg(feature = "config")]
#[test]
fn test_json_file_source_reloads() {
    use ferrous_container::JsonConfigSource;

    let path = env::temp_dir().join(format!("ferrous-container-{}.json", std::process::id()));
    std::fs::write(&path, r#"{"pool": {"max": 3}, "session": {"timeout": "10 minutes"}}"#).unwrap();

    let source = JsonConfigSource::from_file(path.to_string_lossy()).unwrap();
    let provider = ConfigProvider::new().with_source(source);
    let config = ContainerConfig::load(&provider).unwrap();
    assert_eq!(config.pool.max, 3);
    assert_eq!(config.session.timeout, Some(Duration::from_secs(600)));

    std::fs::remove_file(&path).unwrap();
    assert!(JsonConfigSource::from_file(path.to_string_lossy()).is_err());
}
