//! Integration tests for DiscoveryConfig::from_env()
//!
//! These tests verify configuration loading from environment variables.

use std::env;
use std::sync::Mutex;
use std::time::Duration;

use uuid::Uuid;
use zkdiscovery::config::DiscoveryConfig;

/// Environment variables are process-global, so env-based tests run one at a time.
static ENV_MUTEX: Mutex<()> = Mutex::new(());

/// All environment variables read by DiscoveryConfig::from_env().
const ALL_CONFIG_ENV_VARS: &[&str] = &[
    "ZK_CONNECT_STRING",
    "ZK_SESSION_TIMEOUT_MS",
    "ZK_ROOT_PATH",
    "NODE_ID",
    "CONSISTENT_ID",
    "CLIENT_MODE",
    "JOIN_TIMEOUT_MS",
    "BOOTSTRAP_CLUSTER",
];

/// Run `f` with exactly `vars` set among the config variables, restoring the
/// previous values afterwards.
fn with_env_vars<F, R>(vars: &[(&str, &str)], f: F) -> R
where
    F: FnOnce() -> R,
{
    let _guard = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());

    let all_originals: Vec<_> = ALL_CONFIG_ENV_VARS
        .iter()
        .map(|k| (*k, env::var(*k).ok()))
        .collect();

    for key in ALL_CONFIG_ENV_VARS {
        unsafe { env::remove_var(key) };
    }
    for (key, value) in vars {
        unsafe { env::set_var(key, value) };
    }

    let result = f();

    for (key, original) in all_originals {
        match original {
            Some(v) => unsafe { env::set_var(key, v) },
            None => unsafe { env::remove_var(key) },
        }
    }

    result
}

// ============================================================================
// Defaults
// ============================================================================

#[test]
fn test_from_env_defaults() {
    with_env_vars(&[], || {
        let config = DiscoveryConfig::from_env().expect("Should parse config");
        assert_eq!(config.connect_string, "127.0.0.1:2181");
        assert_eq!(config.session_timeout, Duration::from_millis(5000));
        assert_eq!(config.join_timeout, Duration::from_millis(10000));
        assert_eq!(config.root_path, "/zkdiscovery");
        assert!(config.consistent_id.is_none());
        assert!(!config.client_mode);
        assert!(!config.bootstrap_if_absent);
        assert!(config.validate().is_ok());
    });
}

#[test]
fn test_from_env_generates_distinct_node_ids() {
    with_env_vars(&[], || {
        let a = DiscoveryConfig::from_env().expect("Should parse config");
        let b = DiscoveryConfig::from_env().expect("Should parse config");
        assert_ne!(a.node_id, b.node_id);
        assert_eq!(a.effective_consistent_id(), a.node_id.to_string());
    });
}

// ============================================================================
// Explicit values
// ============================================================================

#[test]
fn test_from_env_ensemble_settings() {
    with_env_vars(
        &[
            ("ZK_CONNECT_STRING", "zk1:2181,zk2:2181,zk3:2181"),
            ("ZK_SESSION_TIMEOUT_MS", "3000"),
            ("ZK_ROOT_PATH", "/grid/prod"),
        ],
        || {
            let config = DiscoveryConfig::from_env().expect("Should parse config");
            assert_eq!(config.connect_string, "zk1:2181,zk2:2181,zk3:2181");
            assert_eq!(config.session_timeout, Duration::from_millis(3000));
            assert_eq!(config.join_timeout, Duration::from_millis(6000));
            assert_eq!(config.root_path, "/grid/prod");
        },
    );
}

#[test]
fn test_from_env_node_identity() {
    let id = Uuid::new_v4();
    let id_text = id.to_string();
    with_env_vars(
        &[("NODE_ID", id_text.as_str()), ("CONSISTENT_ID", "node-a")],
        || {
            let config = DiscoveryConfig::from_env().expect("Should parse config");
            assert_eq!(config.node_id, id);
            assert_eq!(config.consistent_id.as_deref(), Some("node-a"));
            assert_eq!(config.effective_consistent_id(), "node-a");
        },
    );
}

#[test]
fn test_from_env_explicit_join_timeout() {
    with_env_vars(
        &[("ZK_SESSION_TIMEOUT_MS", "1000"), ("JOIN_TIMEOUT_MS", "4500")],
        || {
            let config = DiscoveryConfig::from_env().expect("Should parse config");
            assert_eq!(config.join_timeout, Duration::from_millis(4500));
        },
    );
}

#[test]
fn test_from_env_boolean_spellings() {
    for (raw, expected) in [
        ("true", true),
        ("1", true),
        ("YES", true),
        ("false", false),
        ("0", false),
        ("no", false),
    ] {
        with_env_vars(&[("CLIENT_MODE", raw), ("BOOTSTRAP_CLUSTER", raw)], || {
            let config = DiscoveryConfig::from_env().expect("Should parse config");
            assert_eq!(config.client_mode, expected, "CLIENT_MODE={}", raw);
            assert_eq!(config.bootstrap_if_absent, expected, "BOOTSTRAP_CLUSTER={}", raw);
        });
    }
}

// ============================================================================
// Invalid values
// ============================================================================

#[test]
fn test_from_env_invalid_session_timeout() {
    with_env_vars(&[("ZK_SESSION_TIMEOUT_MS", "soon")], || {
        let err = DiscoveryConfig::from_env().unwrap_err();
        assert!(err.to_string().contains("ZK_SESSION_TIMEOUT_MS"));
    });
}

#[test]
fn test_from_env_invalid_node_id() {
    with_env_vars(&[("NODE_ID", "not-a-uuid")], || {
        let err = DiscoveryConfig::from_env().unwrap_err();
        assert!(err.to_string().contains("NODE_ID"));
    });
}

#[test]
fn test_from_env_invalid_boolean() {
    with_env_vars(&[("CLIENT_MODE", "maybe")], || {
        let err = DiscoveryConfig::from_env().unwrap_err();
        assert!(err.to_string().contains("CLIENT_MODE"));
    });
}

#[test]
fn test_from_env_values_are_validated_separately() {
    with_env_vars(
        &[("ZK_ROOT_PATH", "relative"), ("ZK_SESSION_TIMEOUT_MS", "10")],
        || {
            let config = DiscoveryConfig::from_env().expect("Parsing does not validate");
            let errors = config.validate().unwrap_err();
            assert_eq!(errors.len(), 2, "{:?}", errors);
        },
    );
}
