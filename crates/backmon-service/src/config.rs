// Copyright (c) Walrus Foundation
// SPDX-License-Identifier: Apache-2.0

//! Service configuration.
//!
//! The configuration file is searched in the working directory, then under
//! `~/.backmon/`, then `/etc/backmon/`, unless an explicit path is given.
//! A configuration that cannot be loaded at process start is fatal; invalid
//! individual environments are skipped with an error.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context as _};
use backmon_core::units::{self, RawDuration};
use regex::Regex;
use serde::Deserialize;

/// Name of the configuration file.
pub const CONFIG_FILE_NAME: &str = "config.yaml";

const DEFAULT_DEFINITIONS_FILE: &str = "backup_definitions.yaml";
const DEFAULT_REGION: &str = "eu-central-1";

/// The fully parsed service configuration.
#[derive(Debug, Clone)]
pub struct Configuration {
    /// Process-wide settings.
    pub global: GlobalConfig,
    /// HTTP server settings.
    pub http: HttpConfig,
    /// Download endpoint settings.
    pub downloads: DownloadsConfig,
    /// The monitored environments.
    pub environments: Vec<EnvironmentConfig>,
}

/// Process-wide settings.
#[derive(Debug, Clone)]
pub struct GlobalConfig {
    /// Log level from the configuration file, if any.
    pub log_level: Option<String>,
    /// Port the HTTP server listens on.
    pub http_port: u16,
    /// Interval between refresh cycles.
    pub update_interval: Duration,
}

/// HTTP server settings.
#[derive(Debug, Clone, Default)]
pub struct HttpConfig {
    /// When set, `/api` requests require HTTP Basic Auth.
    pub basic_auth: Option<BasicAuthConfig>,
}

/// Credentials gating the `/api` routes.
#[derive(Debug, Clone)]
pub struct BasicAuthConfig {
    /// The expected user name.
    pub username: String,
    /// The expected password.
    pub password: String,
}

/// Download endpoint settings.
#[derive(Debug, Clone, Default)]
pub struct DownloadsConfig {
    /// Whether the artifact download endpoint is registered.
    pub enabled: bool,
}

/// One monitored environment.
#[derive(Debug, Clone)]
pub struct EnvironmentConfig {
    /// The environment name from the configuration file.
    pub name: String,
    /// Path of the manifest file on each of the environment's disks.
    pub definitions: String,
    /// How to reach the environment's storage.
    pub client: ClientConfig,
    /// Which disks to monitor.
    pub disks: DisksPolicy,
}

/// Storage back-end settings of an environment.
#[derive(Debug, Clone)]
pub enum ClientConfig {
    /// A directory tree on the local filesystem.
    Local {
        /// The directory serving as the environment's single disk.
        directory: String,
    },
    /// An S3-compatible object store.
    S3 {
        /// The region to address.
        region: String,
        /// Custom endpoint; `None` addresses AWS.
        endpoint: Option<String>,
        /// Static access key.
        access_key_id: Option<String>,
        /// Static secret key.
        secret_access_key: Option<String>,
        /// Optional session token.
        token: Option<String>,
        /// Use path-style addressing.
        force_path_style: bool,
        /// Allow plain HTTP.
        insecure: bool,
        /// Skip TLS certificate verification.
        tls_skip_verify: bool,
        /// Whether the operator asked for bucket auto-discovery.
        auto_discover_disks: bool,
    },
}

/// Include/exclude behaviour for a disk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DiskBehaviour {
    /// Monitor the disk.
    #[default]
    Include,
    /// Skip the disk.
    Exclude,
}

/// Which rule of the disk policy decided a disk's fate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppliedPolicy {
    /// The disk is listed literally under `include`.
    ExplicitInclude,
    /// An `include` regex matched.
    IncludeByRegex,
    /// The disk is listed literally under `exclude`.
    ExplicitExclude,
    /// An `exclude` regex matched.
    ExcludeByRegex,
    /// The disk is listed literally on both sides.
    Conflicting,
    /// Regexes on both sides matched.
    ConflictingByRegex,
    /// No rule matched; `all_others` applies.
    NoMatchFallback,
}

impl AppliedPolicy {
    fn as_str(&self) -> &'static str {
        match self {
            Self::ExplicitInclude => "explicit_include_policy",
            Self::IncludeByRegex => "explicit_include_by_regex_policy",
            Self::ExplicitExclude => "explicit_exclude_policy",
            Self::ExcludeByRegex => "explicit_exclude_by_regex_policy",
            Self::Conflicting => "unallowed_definition_in_include_and_exclude_policy",
            Self::ConflictingByRegex => {
                "unallowed_definition_in_include_or_exclude_and_contradicting_regexp"
            }
            Self::NoMatchFallback => "not_matching_fallback_to_all_others",
        }
    }
}

/// The transformed outcome of an environment's `disks:` section.
#[derive(Debug, Clone, Default)]
pub struct DisksPolicy {
    include: HashSet<String>,
    include_patterns: Vec<Regex>,
    exclude: HashSet<String>,
    exclude_patterns: Vec<Regex>,
    all_others: DiskBehaviour,
}

impl DisksPolicy {
    fn parse(raw: &RawDisks) -> Self {
        let all_others = match raw.all_others.as_deref() {
            None | Some("include") => DiskBehaviour::Include,
            Some("exclude") => DiskBehaviour::Exclude,
            Some(other) => {
                tracing::warn!(
                    value = other,
                    "unknown value for 'all_others', using 'include' as default"
                );
                DiskBehaviour::Include
            }
        };

        Self::from_entries(&raw.include, &raw.exclude, all_others)
    }

    /// Builds a policy from raw entry lists; entries wrapped in `/…/` are
    /// regexes, everything else is a literal disk name.
    pub fn from_entries(
        include: &[String],
        exclude: &[String],
        all_others: DiskBehaviour,
    ) -> Self {
        let (include, include_patterns) = parse_disk_entries(include);
        let (exclude, exclude_patterns) = parse_disk_entries(exclude);

        Self {
            include,
            include_patterns,
            exclude,
            exclude_patterns,
            all_others,
        }
    }

    /// Evaluates the policy for a disk name. First matching rule wins:
    /// explicit rules beat regexes, unopposed rules apply directly, and
    /// conflicts fall back to `all_others`.
    pub fn status(&self, disk: &str) -> (DiskBehaviour, AppliedPolicy) {
        let explicitly_included = self.include.contains(disk);
        let included_by_regex = self.include_patterns.iter().any(|re| re.is_match(disk));
        let included = explicitly_included || included_by_regex;

        let explicitly_excluded = self.exclude.contains(disk);
        let excluded_by_regex = self.exclude_patterns.iter().any(|re| re.is_match(disk));
        let excluded = explicitly_excluded || excluded_by_regex;

        if explicitly_included && !excluded {
            return (DiskBehaviour::Include, AppliedPolicy::ExplicitInclude);
        }
        if included_by_regex && !excluded {
            return (DiskBehaviour::Include, AppliedPolicy::IncludeByRegex);
        }
        if explicitly_excluded && !included {
            return (DiskBehaviour::Exclude, AppliedPolicy::ExplicitExclude);
        }
        if excluded_by_regex && !included {
            return (DiskBehaviour::Exclude, AppliedPolicy::ExcludeByRegex);
        }
        if explicitly_included && explicitly_excluded {
            return (self.all_others, AppliedPolicy::Conflicting);
        }
        if included && excluded {
            return (self.all_others, AppliedPolicy::ConflictingByRegex);
        }

        (self.all_others, AppliedPolicy::NoMatchFallback)
    }

    /// Whether the disk should be monitored.
    pub fn is_included(&self, disk: &str) -> bool {
        let (behaviour, applied_policy) = self.status(disk);
        if behaviour == DiskBehaviour::Exclude {
            tracing::debug!(disk, policy = applied_policy.as_str(), "disk is excluded");
            return false;
        }
        true
    }

    /// The literally named include entries, used as the bucket list for
    /// object-store environments.
    pub fn explicit_includes(&self) -> Vec<String> {
        let mut names: Vec<String> = self.include.iter().cloned().collect();
        names.sort();
        names
    }
}

fn parse_disk_entries(entries: &[String]) -> (HashSet<String>, Vec<Regex>) {
    let mut names = HashSet::new();
    let mut patterns = Vec::new();

    for entry in entries {
        let entry = units::interpolate_env(entry);
        let is_pattern = entry.len() >= 2 && entry.starts_with('/') && entry.ends_with('/');
        if is_pattern {
            match Regex::new(&entry[1..entry.len() - 1]) {
                Ok(pattern) => patterns.push(pattern),
                Err(error) => tracing::warn!(disk = %entry, %error, "ignoring disk entry"),
            }
        } else {
            names.insert(entry);
        }
    }

    (names, patterns)
}

#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    log_level: Option<String>,
    port: Option<u16>,
    update_interval: Option<RawDuration>,
    #[serde(default)]
    http: RawHttp,
    #[serde(default)]
    downloads: RawDownloads,
    #[serde(default)]
    environments: BTreeMap<String, RawEnvironment>,
}

#[derive(Debug, Default, Deserialize)]
struct RawHttp {
    basic_auth: Option<RawBasicAuth>,
}

#[derive(Debug, Default, Deserialize)]
struct RawBasicAuth {
    username: Option<String>,
    password: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawDownloads {
    enabled: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct RawEnvironment {
    path: Option<String>,
    region: Option<String>,
    endpoint: Option<String>,
    access_key_id: Option<String>,
    secret_access_key: Option<String>,
    token: Option<String>,
    force_path_style: Option<bool>,
    insecure: Option<bool>,
    tls_skip_verify: Option<bool>,
    auto_discover_disks: Option<bool>,
    definitions: Option<String>,
    #[serde(default)]
    disks: RawDisks,
}

#[derive(Debug, Default, Deserialize)]
struct RawDisks {
    #[serde(default)]
    include: Vec<String>,
    #[serde(default)]
    exclude: Vec<String>,
    all_others: Option<String>,
}

impl Configuration {
    /// Loads the configuration from `explicit` or the default search paths.
    pub fn load(explicit: Option<&Path>) -> anyhow::Result<Self> {
        let path = match explicit {
            Some(path) => path.to_path_buf(),
            None => find_config_file().context("could not find any configuration file")?,
        };
        tracing::info!(path = %path.display(), "found configuration file");

        let raw: RawConfig = backmon_utils::load_from_yaml(&path)?;
        Self::from_raw(raw)
    }

    /// Parses a configuration document from a string.
    pub fn from_yaml(content: &str) -> anyhow::Result<Self> {
        Self::from_raw(serde_yaml::from_str(content)?)
    }

    fn from_raw(raw: RawConfig) -> anyhow::Result<Self> {
        let mut update_interval = match &raw.update_interval {
            None => units::HOUR,
            Some(value) => value.resolve().unwrap_or_else(|error| {
                tracing::warn!(%error, "cannot parse update interval, defaulting to 1 hour");
                units::HOUR
            }),
        };
        if update_interval < units::MINUTE {
            tracing::warn!("update interval must not be less than 1 minute, defaulting to 1 hour");
            update_interval = units::HOUR;
        }

        let basic_auth = raw.http.basic_auth.as_ref().and_then(|auth| {
            let username = units::interpolate_env(auth.username.as_deref()?);
            let password = units::interpolate_env(auth.password.as_deref()?);
            (!username.is_empty() && !password.is_empty())
                .then_some(BasicAuthConfig { username, password })
        });
        tracing::info!(enabled = basic_auth.is_some(), "using HTTP basic auth");

        let downloads = DownloadsConfig {
            enabled: raw.downloads.enabled.unwrap_or(false),
        };
        tracing::info!(enabled = downloads.enabled, "downloads");

        let mut environments = Vec::with_capacity(raw.environments.len());
        for (name, raw_env) in &raw.environments {
            match parse_environment(name, raw_env) {
                Ok(environment) => environments.push(environment),
                Err(error) => {
                    tracing::error!(environment = %name, %error, "environment could not be parsed");
                }
            }
        }
        if environments.is_empty() {
            bail!(
                "no valid environments defined in configuration file; \
                 did you miss the 'environments' section?"
            );
        }

        Ok(Self {
            global: GlobalConfig {
                log_level: raw.log_level.clone(),
                http_port: raw.port.unwrap_or(80),
                update_interval,
            },
            http: HttpConfig { basic_auth },
            downloads,
            environments,
        })
    }
}

fn parse_environment(name: &str, raw: &RawEnvironment) -> anyhow::Result<EnvironmentConfig> {
    if name.is_empty() {
        bail!("missing environment name");
    }

    let disks = DisksPolicy::parse(&raw.disks);

    let client = if let Some(path) = &raw.path {
        let directory = units::interpolate_env(path);
        if directory.is_empty() {
            bail!("parameter 'path' has been set, but is empty");
        }
        ClientConfig::Local { directory }
    } else {
        ClientConfig::S3 {
            region: raw
                .region
                .as_deref()
                .map(units::interpolate_env)
                .unwrap_or_else(|| DEFAULT_REGION.to_owned()),
            endpoint: raw.endpoint.as_deref().map(units::interpolate_env),
            access_key_id: raw.access_key_id.as_deref().map(units::interpolate_env),
            secret_access_key: raw
                .secret_access_key
                .as_deref()
                .map(units::interpolate_env),
            token: raw.token.as_deref().map(units::interpolate_env),
            force_path_style: raw.force_path_style.unwrap_or(false),
            insecure: raw.insecure.unwrap_or(false),
            tls_skip_verify: raw.tls_skip_verify.unwrap_or(false),
            auto_discover_disks: raw.auto_discover_disks.unwrap_or(true),
        }
    };

    Ok(EnvironmentConfig {
        name: name.to_owned(),
        definitions: raw
            .definitions
            .as_deref()
            .map(units::interpolate_env)
            .unwrap_or_else(|| DEFAULT_DEFINITIONS_FILE.to_owned()),
        client,
        disks,
    })
}

fn find_config_file() -> Option<PathBuf> {
    let mut candidates = vec![PathBuf::from(".")];
    if let Some(home) = std::env::var_os("HOME") {
        candidates.push(PathBuf::from(home).join(".backmon"));
    }
    candidates.push(PathBuf::from("/etc/backmon"));

    for directory in candidates {
        let candidate = directory.join(CONFIG_FILE_NAME);
        tracing::debug!(path = %candidate.display(), "checking for configuration file");
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use backmon_test_utils::param_test;

    use super::*;

    const SAMPLE: &str = r#"
log_level: debug
port: 8080
update_interval: 5m
http:
  basic_auth:
    username: monitor
    password: hunter2
downloads:
  enabled: true
environments:
  local-env:
    path: /var/backups
  object-env:
    endpoint: https://minio.internal
    access_key_id: key
    secret_access_key: secret
    force_path_style: true
    definitions: defs.yaml
    disks:
      include: [bucket-a, bucket-b]
      exclude: ["/tmp-.*/"]
      all_others: exclude
"#;

    #[test]
    fn parses_full_configuration() {
        let config = Configuration::from_yaml(SAMPLE).expect("configuration is valid");

        assert_eq!(config.global.http_port, 8080);
        assert_eq!(config.global.update_interval, Duration::from_secs(300));
        assert_eq!(config.global.log_level.as_deref(), Some("debug"));
        assert!(config.downloads.enabled);

        let auth = config.http.basic_auth.as_ref().expect("basic auth is set");
        assert_eq!(auth.username, "monitor");
        assert_eq!(auth.password, "hunter2");

        assert_eq!(config.environments.len(), 2);
        let local = &config.environments[0];
        assert_eq!(local.name, "local-env");
        assert_eq!(local.definitions, "backup_definitions.yaml");
        assert!(matches!(
            &local.client,
            ClientConfig::Local { directory } if directory == "/var/backups"
        ));

        let object = &config.environments[1];
        assert_eq!(object.definitions, "defs.yaml");
        match &object.client {
            ClientConfig::S3 {
                region,
                endpoint,
                force_path_style,
                ..
            } => {
                assert_eq!(region, DEFAULT_REGION);
                assert_eq!(endpoint.as_deref(), Some("https://minio.internal"));
                assert!(force_path_style);
            }
            other => panic!("expected an object-store client, got {other:?}"),
        }
        assert_eq!(
            object.disks.explicit_includes(),
            vec!["bucket-a", "bucket-b"]
        );
    }

    #[test]
    fn missing_environments_are_fatal() {
        assert!(Configuration::from_yaml("port: 80\n").is_err());
    }

    #[test]
    fn empty_path_invalidates_the_environment() {
        let config = Configuration::from_yaml(
            "environments:\n  broken:\n    path: \"\"\n  ok:\n    path: /data\n",
        )
        .expect("one environment remains valid");
        assert_eq!(config.environments.len(), 1);
        assert_eq!(config.environments[0].name, "ok");
    }

    param_test! {
        update_interval_is_validated: [
            below_minimum: ("update_interval: 30s", Duration::from_secs(3600)),
            unparseable: ("update_interval: soon", Duration::from_secs(3600)),
            integer_days: ("update_interval: 1", Duration::from_secs(86_400)),
            missing: ("", Duration::from_secs(3600)),
        ]
    }
    fn update_interval_is_validated(snippet: &str, expected: Duration) {
        let content = format!("{snippet}\nenvironments:\n  env:\n    path: /data\n");
        let config = Configuration::from_yaml(&content).expect("configuration is valid");
        assert_eq!(config.global.update_interval, expected);
    }

    #[test]
    fn partial_basic_auth_is_disabled() {
        let content =
            "http:\n  basic_auth:\n    username: monitor\nenvironments:\n  env:\n    path: /d\n";
        let config = Configuration::from_yaml(content).expect("configuration is valid");
        assert!(config.http.basic_auth.is_none());
    }

    fn policy(include: &[&str], exclude: &[&str], all_others: Option<&str>) -> DisksPolicy {
        DisksPolicy::parse(&RawDisks {
            include: include.iter().map(|s| (*s).to_owned()).collect(),
            exclude: exclude.iter().map(|s| (*s).to_owned()).collect(),
            all_others: all_others.map(str::to_owned),
        })
    }

    param_test! {
        applies_disk_policy: [
            explicit_include: (&["a"], &[], None, "a", DiskBehaviour::Include, AppliedPolicy::ExplicitInclude),
            explicit_include_beats_regex_exclude: (&["a"], &["/a.*/"], None, "a", DiskBehaviour::Include, AppliedPolicy::ExplicitInclude),
            regex_include: (&["/prod-.*/"], &[], None, "prod-db", DiskBehaviour::Include, AppliedPolicy::IncludeByRegex),
            explicit_exclude: (&[], &["a"], None, "a", DiskBehaviour::Exclude, AppliedPolicy::ExplicitExclude),
            regex_exclude: (&[], &["/tmp-.*/"], None, "tmp-1", DiskBehaviour::Exclude, AppliedPolicy::ExcludeByRegex),
            conflicting_explicit_falls_back: (&["a"], &["a"], Some("exclude"), "a", DiskBehaviour::Exclude, AppliedPolicy::Conflicting),
            conflicting_regex_falls_back: (&["/a.*/"], &["/.*a/"], None, "aa", DiskBehaviour::Include, AppliedPolicy::ConflictingByRegex),
            no_match_default_include: (&["x"], &[], None, "other", DiskBehaviour::Include, AppliedPolicy::NoMatchFallback),
            no_match_exclude_fallback: (&["x"], &[], Some("exclude"), "other", DiskBehaviour::Exclude, AppliedPolicy::NoMatchFallback),
        ]
    }
    fn applies_disk_policy(
        include: &[&str],
        exclude: &[&str],
        all_others: Option<&str>,
        disk: &str,
        expected: DiskBehaviour,
        expected_policy: AppliedPolicy,
    ) {
        let policy = policy(include, exclude, all_others);
        assert_eq!(policy.status(disk), (expected, expected_policy));
        assert_eq!(policy.is_included(disk), expected == DiskBehaviour::Include);
    }

    #[test]
    fn invalid_regex_entries_are_skipped() {
        let policy = policy(&["/([/"], &[], None);
        assert!(policy.explicit_includes().is_empty());
        // The broken entry must not exclude anything either.
        assert!(policy.is_included("anything"));
    }

    #[test]
    fn interpolates_credentials_from_environment() {
        std::env::set_var("BACKMON_CONFIG_TEST_SECRET", "s3cr3t");
        let content = "environments:\n  env:\n    access_key_id: plain\n    \
                       secret_access_key: \"__${BACKMON_CONFIG_TEST_SECRET}__\"\n";
        let config = Configuration::from_yaml(content).expect("configuration is valid");
        match &config.environments[0].client {
            ClientConfig::S3 {
                access_key_id,
                secret_access_key,
                ..
            } => {
                assert_eq!(access_key_id.as_deref(), Some("plain"));
                assert_eq!(secret_access_key.as_deref(), Some("s3cr3t"));
            }
            other => panic!("expected an object-store client, got {other:?}"),
        }
    }
}
