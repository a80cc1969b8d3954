use shared_utils::config::{Config, ConfigError, ConfigManager};
use std::io::Write;
use std::path::PathBuf;
use tempfile::NamedTempFile;

#[test]
fn test_load_full_router_config() {
    let mut file = NamedTempFile::new().unwrap();

    let config_str = r#"
        log_level = "debug"

        [logging]
        log_to_file = true
        log_dir = "/tmp/osrouter-logs"
        json_format = true

        [router]
        interface = "tun2"
        ifconfig = "/sbin/ifconfig"
        route = "/sbin/route"
        sysctl = "/sbin/sysctl"
        sysctls = ["kern.sbmax=16777216"]
        state_path = "/tmp/osrouter/state.json"
        desired_path = "/etc/osrouter/desired.toml"

        [router.readiness]
        max_attempts = 5
        interval_ms = 10
    "#;

    file.write_all(config_str.as_bytes()).unwrap();

    let config = Config::load(file.path()).unwrap();

    assert_eq!(config.log_level, "debug");
    assert!(config.logging.log_to_file);
    assert!(config.logging.json_format);
    assert_eq!(config.logging.log_dir, "/tmp/osrouter-logs");
    assert_eq!(config.router.interface, "tun2");
    assert_eq!(config.router.route, "/sbin/route");
    assert_eq!(config.router.sysctl, "/sbin/sysctl");
    assert_eq!(config.router.sysctls, vec!["kern.sbmax=16777216".to_string()]);
    assert_eq!(config.router.state_path, PathBuf::from("/tmp/osrouter/state.json"));
    assert_eq!(config.router.readiness.max_attempts, 5);
    assert_eq!(config.router.readiness.interval_ms, 10);
}

#[test]
fn test_empty_file_uses_defaults() {
    let file = NamedTempFile::new().unwrap();

    let config = Config::load(file.path()).unwrap();

    assert_eq!(config, Config::default());
    assert_eq!(config.router.sysctls.len(), 7);
    assert!(config.router.desired_path.is_none());
}

#[test]
fn test_missing_file() {
    let result = Config::load("/nonexistent/osrouter/config.toml");
    assert!(matches!(result, Err(ConfigError::FileNotFound(_))));
}

#[test]
fn test_invalid_toml() {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(b"[router\ninterface = ").unwrap();

    let result = Config::load(file.path());
    assert!(matches!(result, Err(ConfigError::TomlError(_))));
}

#[test]
fn test_invalid_values_are_rejected_on_load() {
    let cases = [
        "[router]\ninterface = \"\"\n",
        "[router]\nifconfig = \" \"\n",
        "[router]\nsysctls = [\"=1\"]\n",
        "[router.readiness]\nmax_attempts = 0\n",
        "log_level = \"verbose\"\n",
    ];

    for case in cases {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(case.as_bytes()).unwrap();
        assert!(Config::load(file.path()).is_err(), "accepted: {case}");
    }
}

#[test]
fn test_manager_with_defaults_for_missing_file() {
    let manager = ConfigManager::with_config(Config::default(), "/nonexistent/config.toml");
    assert_eq!(manager.config().router.interface, "tun0");
    assert_eq!(
        manager.config_path(),
        std::path::Path::new("/nonexistent/config.toml")
    );
}
