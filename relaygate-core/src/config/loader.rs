//! Configuration loading and validation.
//!
//! ```text
//! find_config_file ─► read ─► ${env:VAR} substitution ─► YAML parse ─► validate
//! ```
//!
//! Validation separates hard errors (startup refused) from warnings (the
//! setting degrades to its default and a log line is emitted).

use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use super::error::{ConfigError, ValidationResult, ValidationWarning};
use super::schema::{Config, HttpRouteConfig, NodeConfig, QueueRouteConfig};
use crate::failover::StrategyKind;
use crate::policy::Outcome;
use crate::routing::SecurityHeaderAction;
use crate::routing::endpoint::check_static_url;
use crate::routing::http::client::HttpVersionPref;
use crate::routing::queue::OutboundMessageType;
use crate::routing::queue::provider::NamingRetryPolicy;

/// Configuration file search paths (in priority order).
pub fn default_config_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    if let Ok(path) = std::env::var("RELAYGATE_CONFIG") {
        paths.push(PathBuf::from(path));
    }

    paths.push(PathBuf::from("/etc/relaygate/config.yaml"));
    paths.push(PathBuf::from("./config.yaml"));

    paths
}

/// Find the first existing config file. An explicit path (CLI flag) is the
/// only candidate when given.
pub fn find_config_file(explicit_path: Option<&Path>) -> Result<PathBuf, ConfigError> {
    if let Some(path) = explicit_path {
        if path.exists() {
            return Ok(path.to_path_buf());
        }
        return Err(ConfigError::ConfigFileNotFound {
            searched: vec![path.to_path_buf()],
        });
    }

    let paths = default_config_paths();
    for path in &paths {
        if path.exists() {
            return Ok(path.clone());
        }
    }

    Err(ConfigError::ConfigFileNotFound { searched: paths })
}

/// Load configuration from a file path.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    parse_config(&contents)
}

/// Parse configuration text, substituting environment references first.
pub fn parse_config(contents: &str) -> Result<Config, ConfigError> {
    if contents.trim().is_empty() {
        return Err(ConfigError::EmptyConfigFile);
    }
    let contents = substitute_env_vars(contents)?;
    let config: Config = serde_saphyr::from_str(&contents)?;
    Ok(config)
}

/// Load and validate configuration.
pub fn load_and_validate(path: &Path) -> Result<(Config, ValidationResult), ConfigError> {
    let config = load_config(path)?;
    let result = validate(&config)?;
    Ok((config, result))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Environment Variable Substitution
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

// SAFETY: .expect() on LazyLock with a compile-time literal regex pattern.
// The pattern is known-valid and tested by test_env_var_pattern_compiles().
static ENV_VAR_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{env:([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}")
        .expect("BUG: ENV_VAR_PATTERN regex is invalid")
});

/// Substitute environment variables in a string.
///
/// # Syntax
/// - `${env:VAR}` - Required, fail if not set
/// - `${env:VAR:-default}` - Optional with default
///
/// Plain `${name}` references are exchange variables and pass through
/// untouched.
pub fn substitute_env_vars(content: &str) -> Result<String, ConfigError> {
    let mut missing: Option<String> = None;
    let result = ENV_VAR_PATTERN.replace_all(content, |cap: &regex::Captures<'_>| {
        let var_name = &cap[1];
        match (std::env::var(var_name), cap.get(2)) {
            (Ok(value), _) => value,
            (Err(_), Some(default)) => default.as_str().to_string(),
            (Err(_), None) => {
                missing.get_or_insert_with(|| var_name.to_string());
                String::new()
            }
        }
    });

    if let Some(var) = missing {
        return Err(ConfigError::MissingEnvVar {
            var,
            field: "configuration".to_string(),
        });
    }

    Ok(result.into_owned())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Validate a parsed configuration.
///
/// # Errors
///
/// Returns the first hard error: bad schema version, no services, bad or
/// duplicate service paths, undefined or cyclic fragments, routing nodes
/// without endpoints, unknown outcome names in a remap.
pub fn validate(config: &Config) -> Result<ValidationResult, ConfigError> {
    let mut warnings = Vec::new();

    if config.schema != 1 {
        return Err(ConfigError::UnsupportedSchemaVersion {
            version: config.schema,
        });
    }

    if config.services.is_empty() {
        return Err(ConfigError::NoServicesDefined);
    }

    let mut paths = HashSet::new();
    for service in &config.services {
        if !service.path.starts_with('/') {
            return Err(ConfigError::InvalidServicePath {
                path: service.path.clone(),
            });
        }
        let normalized = service.path.trim_end_matches('/');
        if !paths.insert(normalized.to_string()) {
            return Err(ConfigError::DuplicateServicePath {
                path: service.path.clone(),
            });
        }
    }

    let mut included = HashSet::new();
    for service in &config.services {
        check_node(&service.policy, &service.name, config, &mut included, &mut warnings)?;
    }
    for (name, fragment) in &config.fragments {
        check_node(fragment, name, config, &mut included, &mut warnings)?;
    }

    check_fragment_cycles(config)?;

    let mut unused: Vec<_> = config
        .fragments
        .keys()
        .filter(|name| !included.contains(name.as_str()))
        .collect();
    unused.sort();
    for fragment in unused {
        warnings.push(ValidationWarning::UnusedFragment {
            fragment: fragment.clone(),
        });
    }

    Ok(ValidationResult::with_warnings(warnings))
}

fn check_node<'a>(
    node: &'a NodeConfig,
    owner: &str,
    config: &Config,
    included: &mut HashSet<&'a str>,
    warnings: &mut Vec<ValidationWarning>,
) -> Result<(), ConfigError> {
    match node {
        NodeConfig::All { children, .. } | NodeConfig::OneOf { children, .. } => {
            for child in children {
                check_node(child, owner, config, included, warnings)?;
            }
        }
        NodeConfig::Include {
            fragment, remap, ..
        } => {
            if config.get_fragment(fragment).is_none() {
                return Err(ConfigError::UnknownFragment {
                    fragment: fragment.clone(),
                });
            }
            included.insert(fragment.as_str());
            for (from, to) in remap {
                for outcome in [from, to] {
                    if Outcome::parse(outcome).is_none() {
                        return Err(ConfigError::NodeBuild {
                            node: format!("include:{fragment}"),
                            message: format!("unknown outcome '{outcome}' in remap"),
                        });
                    }
                }
            }
        }
        NodeConfig::HttpRoute(route) => check_http_route(route, owner, warnings)?,
        NodeConfig::QueueRoute(route) => check_queue_route(route, owner, warnings)?,
        NodeConfig::SetVariable { .. }
        | NodeConfig::RequireVariable { .. }
        | NodeConfig::SizeLimit { .. } => {}
    }
    Ok(())
}

fn check_strategy(node: &str, strategy: Option<&str>, warnings: &mut Vec<ValidationWarning>) {
    if let Some(strategy) = strategy
        && StrategyKind::parse(strategy).is_err()
    {
        warnings.push(ValidationWarning::UnknownFailoverStrategy {
            node: node.to_string(),
            strategy: strategy.to_string(),
        });
    }
}

fn check_http_route(
    route: &HttpRouteConfig,
    owner: &str,
    warnings: &mut Vec<ValidationWarning>,
) -> Result<(), ConfigError> {
    let node = route.name.as_deref().unwrap_or(owner);
    if route.urls.is_empty() {
        return Err(ConfigError::EmptyEndpoints {
            node: node.to_string(),
        });
    }
    check_strategy(node, route.failover.as_deref(), warnings);

    for url in &route.urls {
        if let Some(problem) = check_static_url(url) {
            warnings.push(ValidationWarning::InvalidStaticUrl {
                node: node.to_string(),
                url: url.clone(),
                problem,
            });
        }
    }

    if let Some(version) = &route.http_version
        && HttpVersionPref::parse(version).is_none()
    {
        warnings.push(ValidationWarning::UnknownSetting {
            node: node.to_string(),
            setting: "http_version",
            value: version.clone(),
        });
    }

    if let Some(header) = &route.security_header
        && SecurityHeaderAction::parse(&header.action, header.actor.as_deref()).is_none()
    {
        warnings.push(ValidationWarning::UnknownSetting {
            node: node.to_string(),
            setting: "security_header action",
            value: header.action.clone(),
        });
    }
    Ok(())
}

fn check_queue_route(
    route: &QueueRouteConfig,
    owner: &str,
    warnings: &mut Vec<ValidationWarning>,
) -> Result<(), ConfigError> {
    let node = route.name.as_deref().unwrap_or(owner);
    if route.destinations.is_empty() {
        return Err(ConfigError::EmptyEndpoints {
            node: node.to_string(),
        });
    }
    check_strategy(node, route.failover.as_deref(), warnings);

    if let Some(kind) = &route.message_type
        && OutboundMessageType::parse(kind).is_none()
    {
        warnings.push(ValidationWarning::UnknownSetting {
            node: node.to_string(),
            setting: "message_type",
            value: kind.clone(),
        });
    }

    if let Some(policy) = &route.naming_retry
        && NamingRetryPolicy::parse(policy).is_none()
    {
        warnings.push(ValidationWarning::UnknownSetting {
            node: node.to_string(),
            setting: "naming_retry",
            value: policy.clone(),
        });
    }
    Ok(())
}

/// Fragments referenced by `include` anywhere below `node`.
pub(crate) fn included_fragments(node: &NodeConfig) -> Vec<&str> {
    let mut out = Vec::new();
    collect_includes(node, &mut out);
    out
}

fn collect_includes<'a>(node: &'a NodeConfig, out: &mut Vec<&'a str>) {
    match node {
        NodeConfig::Include { fragment, .. } => out.push(fragment),
        other => {
            for child in other.children() {
                collect_includes(child, out);
            }
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

fn check_fragment_cycles(config: &Config) -> Result<(), ConfigError> {
    let mut marks: HashMap<&str, Mark> = HashMap::new();
    let mut names: Vec<&str> = config.fragments.keys().map(String::as_str).collect();
    names.sort_unstable();
    for name in names {
        visit_fragment(name, config, &mut marks)?;
    }
    Ok(())
}

fn visit_fragment<'a>(
    name: &'a str,
    config: &'a Config,
    marks: &mut HashMap<&'a str, Mark>,
) -> Result<(), ConfigError> {
    match marks.get(name) {
        Some(Mark::Done) => return Ok(()),
        Some(Mark::Visiting) => {
            return Err(ConfigError::FragmentCycle {
                fragment: name.to_string(),
            });
        }
        None => {}
    }
    let Some(body) = config.get_fragment(name) else {
        return Ok(());
    };
    marks.insert(name, Mark::Visiting);
    for next in included_fragments(body) {
        visit_fragment(next, config, marks)?;
    }
    marks.insert(name, Mark::Done);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    struct EnvVarGuard {
        vars: Vec<(&'static str, Option<String>)>,
    }

    impl EnvVarGuard {
        fn new(var_names: &[&'static str]) -> Self {
            let vars = var_names
                .iter()
                .map(|&name| (name, std::env::var(name).ok()))
                .collect();
            Self { vars }
        }
    }

    impl Drop for EnvVarGuard {
        fn drop(&mut self) {
            for (name, original) in &self.vars {
                // SAFETY: single-threaded test context (enforced by #[serial])
                unsafe {
                    match original {
                        Some(val) => std::env::set_var(name, val),
                        None => std::env::remove_var(name),
                    }
                }
            }
        }
    }

    const MINIMAL_CONFIG: &str = r#"
schema: 1
services:
  - name: echo
    path: /echo
    policy:
      kind: http_route
      urls: ["http://backend:8080${request.http.uri}"]
"#;

    fn parse(yaml: &str) -> Config {
        serde_saphyr::from_str(yaml).unwrap()
    }

    #[test]
    fn test_env_var_pattern_compiles() {
        assert!(ENV_VAR_PATTERN.is_match("${env:HOME}"));
        assert!(!ENV_VAR_PATTERN.is_match("${request.http.uri}"));
    }

    #[test]
    fn test_validate_minimal_config() {
        let result = validate(&parse(MINIMAL_CONFIG)).unwrap();
        assert!(result.is_clean(), "{:?}", result.warnings);
    }

    #[test]
    fn test_empty_config_rejected() {
        assert!(matches!(parse_config("  \n"), Err(ConfigError::EmptyConfigFile)));
    }

    #[test]
    fn test_unsupported_schema_version() {
        let config = parse(&MINIMAL_CONFIG.replace("schema: 1", "schema: 2"));
        assert!(matches!(
            validate(&config),
            Err(ConfigError::UnsupportedSchemaVersion { version: 2 })
        ));
    }

    #[test]
    fn test_validate_no_services() {
        let config = parse("schema: 1\nservices: []\n");
        assert!(matches!(validate(&config), Err(ConfigError::NoServicesDefined)));
    }

    #[test]
    fn test_validate_duplicate_path() {
        let yaml = r#"
schema: 1
services:
  - name: a
    path: /orders
    policy: { kind: size_limit, limit: 10 }
  - name: b
    path: /orders/
    policy: { kind: size_limit, limit: 10 }
"#;
        assert!(matches!(
            validate(&parse(yaml)),
            Err(ConfigError::DuplicateServicePath { .. })
        ));
    }

    #[test]
    fn test_validate_relative_path() {
        let config = parse(&MINIMAL_CONFIG.replace("path: /echo", "path: echo"));
        assert!(matches!(
            validate(&config),
            Err(ConfigError::InvalidServicePath { .. })
        ));
    }

    #[test]
    fn test_validate_undefined_fragment() {
        let yaml = r#"
schema: 1
services:
  - name: a
    path: /a
    policy: { kind: include, fragment: missing }
"#;
        assert!(matches!(
            validate(&parse(yaml)),
            Err(ConfigError::UnknownFragment { fragment }) if fragment == "missing"
        ));
    }

    #[test]
    fn test_validate_fragment_cycle() {
        let yaml = r#"
schema: 1
fragments:
  first:
    kind: all
    children:
      - { kind: include, fragment: second }
  second:
    kind: include
    fragment: first
services:
  - name: a
    path: /a
    policy: { kind: include, fragment: first }
"#;
        assert!(matches!(
            validate(&parse(yaml)),
            Err(ConfigError::FragmentCycle { .. })
        ));
    }

    #[test]
    fn test_validate_bad_remap_outcome() {
        let yaml = r#"
schema: 1
fragments:
  check: { kind: require_variable, variable: tenant }
services:
  - name: a
    path: /a
    policy:
      kind: include
      fragment: check
      remap: { falsified: teapot }
"#;
        assert!(matches!(
            validate(&parse(yaml)),
            Err(ConfigError::NodeBuild { .. })
        ));
    }

    #[test]
    fn test_validate_empty_endpoints() {
        let yaml = r#"
schema: 1
services:
  - name: q
    path: /q
    policy: { kind: queue_route, destinations: [] }
"#;
        assert!(matches!(
            validate(&parse(yaml)),
            Err(ConfigError::EmptyEndpoints { node }) if node == "q"
        ));
    }

    #[test]
    fn test_validate_warnings() {
        let yaml = r#"
schema: 1
fragments:
  spare: { kind: size_limit, limit: 1 }
services:
  - name: a
    path: /a
    policy:
      kind: all
      children:
        - kind: http_route
          name: backend
          urls: ["ftp://files", "http://ok:80"]
          failover: weighted
          http_version: "3"
        - kind: queue_route
          name: jobs
          destinations: [jobs]
          message_type: map
          naming_retry: sometimes
"#;
        let result = validate(&parse(yaml)).unwrap();
        let warnings = result.warnings;
        assert!(warnings.contains(&ValidationWarning::UnknownFailoverStrategy {
            node: "backend".to_string(),
            strategy: "weighted".to_string(),
        }));
        assert!(warnings.iter().any(|w| matches!(
            w,
            ValidationWarning::InvalidStaticUrl { url, .. } if url == "ftp://files"
        )));
        assert!(warnings.iter().any(|w| matches!(
            w,
            ValidationWarning::UnknownSetting { setting: "http_version", .. }
        )));
        assert!(warnings.iter().any(|w| matches!(
            w,
            ValidationWarning::UnknownSetting { setting: "message_type", .. }
        )));
        assert!(warnings.iter().any(|w| matches!(
            w,
            ValidationWarning::UnknownSetting { setting: "naming_retry", .. }
        )));
        assert!(warnings.contains(&ValidationWarning::UnusedFragment {
            fragment: "spare".to_string(),
        }));
    }

    #[test]
    #[serial]
    fn test_env_var_substitution_required() {
        let _guard = EnvVarGuard::new(&["RELAYGATE_TEST_BACKEND"]);
        // SAFETY: single-threaded test context (enforced by #[serial])
        unsafe { std::env::set_var("RELAYGATE_TEST_BACKEND", "orders") };
        let out = substitute_env_vars("http://${env:RELAYGATE_TEST_BACKEND}${request.http.uri}")
            .unwrap();
        assert_eq!(out, "http://orders${request.http.uri}");
    }

    #[test]
    #[serial]
    fn test_env_var_substitution_with_default() {
        let _guard = EnvVarGuard::new(&["RELAYGATE_TEST_PORT"]);
        // SAFETY: single-threaded test context (enforced by #[serial])
        unsafe { std::env::remove_var("RELAYGATE_TEST_PORT") };
        let out = substitute_env_vars("port: ${env:RELAYGATE_TEST_PORT:-9090}").unwrap();
        assert_eq!(out, "port: 9090");
    }

    #[test]
    #[serial]
    fn test_env_var_substitution_missing_required() {
        let _guard = EnvVarGuard::new(&["RELAYGATE_TEST_MISSING"]);
        // SAFETY: single-threaded test context (enforced by #[serial])
        unsafe { std::env::remove_var("RELAYGATE_TEST_MISSING") };
        let err = substitute_env_vars("x: ${env:RELAYGATE_TEST_MISSING}").unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar { var, .. } if var == "RELAYGATE_TEST_MISSING"));
    }

    #[test]
    fn test_load_and_validate_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, MINIMAL_CONFIG).unwrap();

        let (config, result) = load_and_validate(&path).unwrap();
        assert_eq!(config.services[0].name, "echo");
        assert!(result.is_clean());
    }

    #[test]
    fn test_find_config_file_explicit_missing() {
        let err = find_config_file(Some(Path::new("/nonexistent/relaygate.yaml"))).unwrap_err();
        assert!(matches!(err, ConfigError::ConfigFileNotFound { searched } if searched.len() == 1));
    }
}
