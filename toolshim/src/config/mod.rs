// Copyright 2026 The Toolshim Project
// SPDX-License-Identifier: Apache-2.0

// Config loader and validator
//
// Loads toolshim.yaml, applies defaults, resolves `${VAR}` interpolation,
// and validates listen, upstream, marker and trace settings.

mod error;
mod interpolation;
mod loader;
mod raw;
mod source;
mod types;

pub use error::ConfigError;
pub use interpolation::resolve_variables;
pub use loader::load_config;
pub use source::{ConfigSource, FileSource, StringSource};
pub use types::*;

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use std::path::PathBuf;
    use std::sync::Mutex;

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    fn with_env<F: FnOnce()>(name: &str, value: &str, f: F) {
        let _guard = ENV_MUTEX.lock().unwrap();
        let previous = std::env::var(name).ok();
        std::env::set_var(name, value);
        f();
        match previous {
            Some(value) => std::env::set_var(name, value),
            None => std::env::remove_var(name),
        }
    }

    const EXAMPLE_YAML: &str = r#"toolshim: v1

listen:
  host: 0.0.0.0
  port: 8080

upstream:
  timeout_ms: 60000
  connect_timeout_ms: 2000
  stream_idle_timeout_ms: 30000
  allowed_hosts: ["API.openai.com", "openrouter.ai"]
  allow_private: true

markers:
  seed: 42

trace:
  enabled: true
  dir: /var/log/toolshim
"#;

    fn make_source(yaml: &str) -> StringSource {
        StringSource::new(yaml)
    }

    #[test]
    fn full_config_parses_all_sections() {
        let config = load_config(&make_source(EXAMPLE_YAML)).unwrap();
        assert_eq!(config.listen.host, IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        assert_eq!(config.listen.port, 8080);
        assert_eq!(config.upstream.timeout_ms, 60_000);
        assert_eq!(config.upstream.connect_timeout_ms, 2_000);
        assert_eq!(config.upstream.stream_idle_timeout_ms, 30_000);
        assert_eq!(
            config.upstream.allowed_hosts,
            vec!["api.openai.com".to_string(), "openrouter.ai".to_string()]
        );
        assert!(config.upstream.allow_private);
        assert_eq!(config.markers.seed, Some(42));
        assert!(config.trace.enabled);
        assert_eq!(config.trace.dir, PathBuf::from("/var/log/toolshim"));
    }

    #[test]
    fn version_only_uses_defaults() {
        let config = load_config(&make_source("toolshim: v1\n")).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.listen.addr().to_string(), "127.0.0.1:9810");
        assert_eq!(config.upstream.timeout_ms, DEFAULT_TIMEOUT_MS);
        assert!(!config.upstream.allow_private);
        assert!(!config.trace.enabled);
    }

    #[test]
    fn partial_sections_fill_defaults() {
        let yaml = "toolshim: v1\nupstream:\n  timeout_ms: 1000\ntrace:\n  enabled: true\n";
        let config = load_config(&make_source(yaml)).unwrap();
        assert_eq!(config.upstream.timeout_ms, 1000);
        assert_eq!(
            config.upstream.stream_idle_timeout_ms,
            DEFAULT_STREAM_IDLE_TIMEOUT_MS
        );
        assert_eq!(config.trace.dir, PathBuf::from(DEFAULT_TRACE_DIR));
    }

    #[test]
    fn missing_version_rejected() {
        let err = load_config(&make_source("listen:\n  port: 1\n")).unwrap_err();
        assert!(matches!(err, ConfigError::YamlError(_)), "{err}");
    }

    #[test]
    fn unsupported_version_rejected() {
        let err = load_config(&make_source("toolshim: v2\n")).unwrap_err();
        assert!(err.to_string().contains("unsupported contract version"));
    }

    #[test]
    fn zero_timeouts_rejected() {
        for field in ["timeout_ms", "connect_timeout_ms", "stream_idle_timeout_ms"] {
            let yaml = format!("toolshim: v1\nupstream:\n  {field}: 0\n");
            let err = load_config(&make_source(&yaml)).unwrap_err();
            assert!(err.to_string().contains(field), "{err}");
        }
    }

    #[test]
    fn zero_port_rejected() {
        let err = load_config(&make_source("toolshim: v1\nlisten:\n  port: 0\n")).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn bad_listen_host_rejected() {
        let yaml = "toolshim: v1\nlisten:\n  host: localhost\n";
        let err = load_config(&make_source(yaml)).unwrap_err();
        assert!(err.to_string().contains("not an IP address"));
    }

    #[test]
    fn empty_allowed_host_rejected() {
        let yaml = "toolshim: v1\nupstream:\n  allowed_hosts: [\"  \"]\n";
        assert!(load_config(&make_source(yaml)).is_err());
    }

    #[test]
    fn variable_interpolation_in_hosts_and_dir() {
        with_env("TOOLSHIM_TEST_UPSTREAM_HOST", "llm.internal", || {
            let yaml = r#"
toolshim: v1
upstream:
  allowed_hosts: ["${TOOLSHIM_TEST_UPSTREAM_HOST}"]
trace:
  dir: "/tmp/${TOOLSHIM_TEST_UPSTREAM_HOST}"
"#;
            let config = load_config(&make_source(yaml)).unwrap();
            assert_eq!(config.upstream.allowed_hosts, vec!["llm.internal".to_string()]);
            assert_eq!(config.trace.dir, PathBuf::from("/tmp/llm.internal"));
        });
    }

    #[test]
    fn undefined_variable_fails_with_clear_error() {
        std::env::remove_var("TOOLSHIM_TEST_UNDEFINED_12345");
        let yaml = "toolshim: v1\ntrace:\n  dir: \"${TOOLSHIM_TEST_UNDEFINED_12345}\"\n";
        let msg = load_config(&make_source(yaml)).unwrap_err().to_string();
        assert!(msg.contains("TOOLSHIM_TEST_UNDEFINED_12345"), "{msg}");
        assert!(msg.contains("undefined variable"), "{msg}");
    }

    #[test]
    fn interpolation_fallback_and_literals() {
        std::env::remove_var("TOOLSHIM_TEST_UNSET_FALLBACK");
        assert_eq!(
            resolve_variables("${TOOLSHIM_TEST_UNSET_FALLBACK:-./traces}").unwrap(),
            "./traces"
        );
        assert_eq!(resolve_variables("plain text").unwrap(), "plain text");
        assert_eq!(resolve_variables("cost ${}").unwrap(), "cost ${}");
        assert_eq!(resolve_variables("open ${NAME").unwrap(), "open ${NAME");
    }

    #[test]
    fn multiple_variables_in_one_string() {
        with_env("TOOLSHIM_TEST_A", "x", || {
            assert_eq!(
                resolve_variables("${TOOLSHIM_TEST_A}/${TOOLSHIM_TEST_A}").unwrap(),
                "x/x"
            );
        });
    }

    #[test]
    fn file_source_reads_disk() {
        let path = std::env::temp_dir().join(format!("toolshim-{}.yaml", uuid::Uuid::new_v4()));
        std::fs::write(&path, "toolshim: v1\nlisten:\n  port: 9999\n").unwrap();
        let config = load_config(&FileSource::new(&path)).unwrap();
        assert_eq!(config.listen.port, 9999);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = load_config(&FileSource::new("/nonexistent/toolshim.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::IoError(_)));
    }
}
