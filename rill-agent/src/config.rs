use crate::parsers::route_parser;
use crate::supervisor::command::shell_quote;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub node: NodeConfig,
    #[serde(default)]
    pub credentials: CredentialsConfig,
    pub tail: TailConfig,
    #[serde(default)]
    pub processes: ProcessConfig,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub accumulator: AccumulatorConfig,
    pub store: StoreConfig,
    #[serde(default)]
    pub reconcile: ReconcileConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct NodeConfig {
    /// Remote host whose log is shipped. Also the liveness topic.
    pub host: String,
    /// Short name of the log on that host, e.g. `messages` or `ep`.
    pub log_source: String,
    /// Parser format; defaults to `log_source`.
    #[serde(default)]
    pub format: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct CredentialsConfig {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TailConfig {
    /// Path of the log on the remote host.
    #[serde(default)]
    pub log_path: Option<String>,
    /// Explicit tail command; built from `log_path` when absent.
    #[serde(default)]
    pub command: Option<String>,
    /// The tail command reopens the file after a rename, so no rotation watchdog is needed.
    #[serde(default)]
    pub follows_renames: bool,
    #[serde(default = "default_restart_jitter_min_secs")]
    pub restart_jitter_min_secs: u64,
    #[serde(default = "default_restart_jitter_max_secs")]
    pub restart_jitter_max_secs: u64,
    #[serde(default = "default_start_immediately")]
    pub start_immediately: bool,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ParserPolicy {
    /// Leave the parser running so it can publish what it already buffered.
    #[default]
    Drain,
    /// Stop the parser whenever the tail session ends or the host goes away.
    TerminateWithTail,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// The supervisor batches and inserts parsed records itself.
    #[default]
    Inline,
    /// A separate `deliver` child owns the accumulator.
    Process,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProcessConfig {
    /// Binary substituted for `{exe}`; defaults to the running executable.
    #[serde(default)]
    pub executable: Option<String>,
    #[serde(default = "default_tap_template")]
    pub tap_template: String,
    #[serde(default = "default_parser_template")]
    pub parser_template: String,
    #[serde(default = "default_delivery_template")]
    pub delivery_template: String,
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,
    #[serde(default)]
    pub parser_policy: ParserPolicy,
    #[serde(default)]
    pub delivery: DeliveryMode,
    /// Inherit stdout/stderr of children instead of discarding them.
    #[serde(default)]
    pub verbose: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BusConfig {
    #[serde(default = "default_tap_addr")]
    pub tap_addr: String,
    #[serde(default = "default_watchdog_addr")]
    pub watchdog_addr: String,
    #[serde(default = "default_parser_addr")]
    pub parser_addr: String,
    /// Liveness feed; without it the host is always considered alive.
    #[serde(default)]
    pub liveness_addr: Option<String>,
    #[serde(default = "default_high_water_mark")]
    pub high_water_mark: usize,
    #[serde(default = "default_spill_dir")]
    pub spill_dir: String,
    #[serde(default = "default_max_spill_bytes")]
    pub max_spill_bytes: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_liveness_stale_after_ms")]
    pub liveness_stale_after_ms: u64,
    #[serde(default = "default_host_down_warn_after_secs")]
    pub host_down_warn_after_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AccumulatorConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_insert_interval_ms")]
    pub insert_interval_ms: u64,
    #[serde(default = "default_max_age_days")]
    pub max_age_days: i64,
    #[serde(default = "default_max_future_days")]
    pub max_future_days: i64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    pub db_path: String,
    /// Collection name; defaults to `<host>_<log_source>`.
    #[serde(default)]
    pub collection: Option<String>,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_retry_factor")]
    pub retry_factor: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReconcileConfig {
    /// Bulk extraction command; defaults to replaying every rotated copy of `log_path`.
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default = "default_reconcile_interval_min_secs")]
    pub interval_min_secs: u64,
    #[serde(default = "default_reconcile_interval_max_secs")]
    pub interval_max_secs: u64,
    #[serde(default)]
    pub run_on_start: bool,
    /// Remote `nice` level for the bulk command.
    #[serde(default = "default_niceness")]
    pub niceness: Option<i32>,
    #[serde(default = "default_reconcile_tap_addr")]
    pub tap_addr: String,
    #[serde(default = "default_reconcile_parser_addr")]
    pub parser_addr: String,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct MetricsConfig {
    #[serde(default)]
    pub addr: Option<String>,
}

const DEFAULT_RESTART_JITTER_MIN_SECS: u64 = 60;
const DEFAULT_RESTART_JITTER_MAX_SECS: u64 = 120;
const DEFAULT_GRACE_PERIOD_MS: u64 = 1_000;
const DEFAULT_TAP_ADDR: &str = "tcp://127.0.0.1:5601";
const DEFAULT_WATCHDOG_ADDR: &str = "tcp://127.0.0.1:5602";
const DEFAULT_PARSER_ADDR: &str = "tcp://127.0.0.1:5603";
const DEFAULT_RECONCILE_TAP_ADDR: &str = "tcp://127.0.0.1:5611";
const DEFAULT_RECONCILE_PARSER_ADDR: &str = "tcp://127.0.0.1:5613";
pub const DEFAULT_HIGH_WATER_MARK: usize = 1_000;
pub const DEFAULT_SPILL_DIR: &str = "~/.rill/spill";
pub const DEFAULT_MAX_SPILL_BYTES: u64 = 500 * 1024 * 1024;
const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;
const DEFAULT_LIVENESS_STALE_AFTER_MS: u64 = 5_000;
const DEFAULT_HOST_DOWN_WARN_AFTER_SECS: u64 = 600;
const DEFAULT_CHUNK_SIZE: usize = 1_000;
const DEFAULT_INSERT_INTERVAL_MS: u64 = 60_000;
const DEFAULT_MAX_AGE_DAYS: i64 = 5;
const DEFAULT_MAX_FUTURE_DAYS: i64 = 1;
const DEFAULT_RETRY_ATTEMPTS: u32 = 5;
const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 100;
const DEFAULT_RETRY_FACTOR: u32 = 2;
const DEFAULT_RECONCILE_INTERVAL_MIN_SECS: u64 = 60 * 60;
const DEFAULT_RECONCILE_INTERVAL_MAX_SECS: u64 = 120 * 60;
const DEFAULT_NICENESS: i32 = 19;

fn default_restart_jitter_min_secs() -> u64 {
    DEFAULT_RESTART_JITTER_MIN_SECS
}

fn default_restart_jitter_max_secs() -> u64 {
    DEFAULT_RESTART_JITTER_MAX_SECS
}

fn default_start_immediately() -> bool {
    true
}

fn default_tap_template() -> String {
    "{exe} tap --host {host} --command {command} --username {username} --password {password} --bind {bind}".to_string()
}

fn default_parser_template() -> String {
    "{exe} parse --format {format} --input {input} --output {output}".to_string()
}

fn default_delivery_template() -> String {
    "{exe} deliver --config {config} --input {input}".to_string()
}

fn default_grace_period_ms() -> u64 {
    DEFAULT_GRACE_PERIOD_MS
}

fn default_tap_addr() -> String {
    DEFAULT_TAP_ADDR.to_string()
}

fn default_watchdog_addr() -> String {
    DEFAULT_WATCHDOG_ADDR.to_string()
}

fn default_parser_addr() -> String {
    DEFAULT_PARSER_ADDR.to_string()
}

fn default_reconcile_tap_addr() -> String {
    DEFAULT_RECONCILE_TAP_ADDR.to_string()
}

fn default_reconcile_parser_addr() -> String {
    DEFAULT_RECONCILE_PARSER_ADDR.to_string()
}

fn default_high_water_mark() -> usize {
    DEFAULT_HIGH_WATER_MARK
}

fn default_spill_dir() -> String {
    DEFAULT_SPILL_DIR.to_string()
}

fn default_max_spill_bytes() -> u64 {
    DEFAULT_MAX_SPILL_BYTES
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

fn default_liveness_stale_after_ms() -> u64 {
    DEFAULT_LIVENESS_STALE_AFTER_MS
}

fn default_host_down_warn_after_secs() -> u64 {
    DEFAULT_HOST_DOWN_WARN_AFTER_SECS
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn default_insert_interval_ms() -> u64 {
    DEFAULT_INSERT_INTERVAL_MS
}

fn default_max_age_days() -> i64 {
    DEFAULT_MAX_AGE_DAYS
}

fn default_max_future_days() -> i64 {
    DEFAULT_MAX_FUTURE_DAYS
}

fn default_retry_attempts() -> u32 {
    DEFAULT_RETRY_ATTEMPTS
}

fn default_retry_base_delay_ms() -> u64 {
    DEFAULT_RETRY_BASE_DELAY_MS
}

fn default_retry_factor() -> u32 {
    DEFAULT_RETRY_FACTOR
}

fn default_reconcile_interval_min_secs() -> u64 {
    DEFAULT_RECONCILE_INTERVAL_MIN_SECS
}

fn default_reconcile_interval_max_secs() -> u64 {
    DEFAULT_RECONCILE_INTERVAL_MAX_SECS
}

fn default_niceness() -> Option<i32> {
    Some(DEFAULT_NICENESS)
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            executable: None,
            tap_template: default_tap_template(),
            parser_template: default_parser_template(),
            delivery_template: default_delivery_template(),
            grace_period_ms: DEFAULT_GRACE_PERIOD_MS,
            parser_policy: ParserPolicy::default(),
            delivery: DeliveryMode::default(),
            verbose: false,
        }
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            tap_addr: default_tap_addr(),
            watchdog_addr: default_watchdog_addr(),
            parser_addr: default_parser_addr(),
            liveness_addr: None,
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
            spill_dir: default_spill_dir(),
            max_spill_bytes: DEFAULT_MAX_SPILL_BYTES,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            liveness_stale_after_ms: DEFAULT_LIVENESS_STALE_AFTER_MS,
            host_down_warn_after_secs: DEFAULT_HOST_DOWN_WARN_AFTER_SECS,
        }
    }
}

impl Default for AccumulatorConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            insert_interval_ms: DEFAULT_INSERT_INTERVAL_MS,
            max_age_days: DEFAULT_MAX_AGE_DAYS,
            max_future_days: DEFAULT_MAX_FUTURE_DAYS,
        }
    }
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            command: None,
            interval_min_secs: DEFAULT_RECONCILE_INTERVAL_MIN_SECS,
            interval_max_secs: DEFAULT_RECONCILE_INTERVAL_MAX_SECS,
            run_on_start: false,
            niceness: default_niceness(),
            tap_addr: default_reconcile_tap_addr(),
            parser_addr: default_reconcile_parser_addr(),
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path.as_ref())?;
        let config: Config = toml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.node.host.trim().is_empty() {
            anyhow::bail!("node.host cannot be empty");
        }
        if self.node.log_source.trim().is_empty() {
            anyhow::bail!("node.log_source cannot be empty");
        }
        route_parser(self.format()).context("node.format does not name a known parser")?;

        let has_log_path = self
            .tail
            .log_path
            .as_ref()
            .map(|s| !s.trim().is_empty())
            .unwrap_or(false);
        let has_command = self
            .tail
            .command
            .as_ref()
            .map(|s| !s.trim().is_empty())
            .unwrap_or(false);
        if !has_log_path && !has_command {
            anyhow::bail!("tail configuration requires either log_path or command");
        }
        if !has_log_path && !self.tail.follows_renames {
            anyhow::bail!("tail.log_path is required for the rotation watchdog unless follows_renames is set");
        }
        if self.tail.restart_jitter_min_secs > self.tail.restart_jitter_max_secs {
            anyhow::bail!("tail.restart_jitter_min_secs cannot exceed restart_jitter_max_secs");
        }
        if self.reconcile.interval_min_secs > self.reconcile.interval_max_secs {
            anyhow::bail!("reconcile.interval_min_secs cannot exceed interval_max_secs");
        }
        if self.reconcile.command.is_none() && !has_log_path {
            anyhow::bail!("reconcile.command is required when tail.log_path is not set");
        }
        if self.accumulator.chunk_size == 0 {
            anyhow::bail!("accumulator.chunk_size must be positive");
        }
        if self.accumulator.max_age_days <= 0 || self.accumulator.max_future_days < 0 {
            anyhow::bail!("accumulator acceptance window must cover a positive range");
        }
        if self.bus.high_water_mark == 0 {
            anyhow::bail!("bus.high_water_mark must be positive");
        }
        if self.bus.max_spill_bytes == 0 {
            anyhow::bail!("bus.max_spill_bytes must be positive");
        }
        if self.bus.poll_interval_ms == 0 {
            anyhow::bail!("bus.poll_interval_ms must be positive");
        }
        if self.store.retry_attempts == 0 {
            anyhow::bail!("store.retry_attempts must be at least 1");
        }
        if self.store.db_path.trim().is_empty() {
            anyhow::bail!("store.db_path cannot be empty");
        }
        Ok(())
    }

    pub fn format(&self) -> &str {
        self.node.format.as_deref().unwrap_or(&self.node.log_source)
    }

    pub fn collection(&self) -> String {
        let raw = self
            .store
            .collection
            .clone()
            .unwrap_or_else(|| format!("{}_{}", self.node.host, self.node.log_source));
        sanitize_component(&raw)
    }

    pub fn store_db_path(&self) -> PathBuf {
        expand_path(&self.store.db_path)
    }

    pub fn spill_dir(&self) -> PathBuf {
        expand_path(&self.bus.spill_dir)
    }

    pub fn tail_command(&self) -> String {
        if let Some(command) = self.tail.command.as_ref().filter(|c| !c.trim().is_empty()) {
            return command.clone();
        }
        let log_path = shell_quote(self.tail.log_path.as_deref().unwrap_or_default());
        if self.tail.follows_renames {
            format!("tail -n 0 --follow=name {log_path}")
        } else {
            format!("tail -n 0 -f {log_path}")
        }
    }

    /// Remote command printing a timestamp and the inode of the tailed file every second.
    pub fn watchdog_command(&self) -> Option<String> {
        if self.tail.follows_renames {
            return None;
        }
        let log_path = shell_quote(self.tail.log_path.as_deref()?);
        Some(format!(
            "while [ 1 ]; do date +\"%Y-%m-%dT%H:%M:%S\"; ls -i {log_path} 2>&1 | awk '{{print $1}}'; sleep 1; done"
        ))
    }

    /// Bulk command replaying the current log and every rotated copy, oldest first.
    pub fn reconcile_command(&self) -> String {
        let command = match self.reconcile.command.as_ref() {
            Some(command) => command.clone(),
            None => {
                // The glob stays outside the quotes so rotated copies still match.
                let log_path = shell_quote(self.tail.log_path.as_deref().unwrap_or_default());
                format!(
                    "for f in $(ls -tr {log_path}*); do case \"$f\" in *.gz) zcat \"$f\";; *) cat \"$f\";; esac; done"
                )
            }
        };
        match self.reconcile.niceness {
            Some(level) => format!("nice -n {level} sh -c '{}'", command.replace('\'', r"'\''")),
            None => command,
        }
    }

    /// Program substituted for `{exe}`; failing to find it is fatal at startup.
    pub fn executable(&self) -> Result<PathBuf> {
        let path = match self.processes.executable.as_ref() {
            Some(configured) => expand_path(configured),
            None => std::env::current_exe().context("failed to resolve current executable")?,
        };
        if !path.exists() {
            anyhow::bail!("missing required executable {}", path.display());
        }
        Ok(path)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.processes.grace_period_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.bus.poll_interval_ms)
    }
}

pub fn expand_path(raw: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(raw).as_ref())
}

pub(crate) fn sanitize_component(component: &str) -> String {
    component
        .chars()
        .map(|ch| match ch {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '_' => ch,
            _ => '_',
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [node]
        host = "jabbah2"
        log_source = "ep"

        [tail]
        log_path = "/var/log/ep.log"

        [store]
        db_path = "/tmp/rill.db"
    "#;

    fn parse(raw: &str) -> Result<Config> {
        let config: Config = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    #[test]
    fn minimal_config_fills_defaults() {
        let config = parse(MINIMAL).expect("should parse");
        assert_eq!(config.format(), "ep");
        assert_eq!(config.collection(), "jabbah2_ep");
        assert_eq!(config.accumulator.chunk_size, 1_000);
        assert_eq!(config.accumulator.max_age_days, 5);
        assert_eq!(config.bus.high_water_mark, 1_000);
        assert_eq!(config.bus.liveness_stale_after_ms, 5_000);
        assert_eq!(config.processes.parser_policy, ParserPolicy::Drain);
        assert_eq!(config.processes.delivery, DeliveryMode::Inline);
        assert_eq!(config.tail_command(), "tail -n 0 -f /var/log/ep.log");
        assert!(config.watchdog_command().is_some());
    }

    #[test]
    fn follows_renames_disables_the_watchdog() {
        let raw = MINIMAL.replace(
            "log_path = \"/var/log/ep.log\"",
            "log_path = \"/var/log/ep.log\"\nfollows_renames = true",
        );
        let config = parse(&raw).expect("should parse");
        assert!(config.watchdog_command().is_none());
        assert!(config.tail_command().contains("--follow=name"));
    }

    #[test]
    fn log_paths_are_quoted_in_generated_commands() {
        let raw = MINIMAL.replace("/var/log/ep.log", "/var/log/ep log;rm -rf x");
        let mut config = parse(&raw).expect("should parse");
        config.reconcile.niceness = None;
        assert_eq!(config.tail_command(), "tail -n 0 -f '/var/log/ep log;rm -rf x'");
        let watchdog = config.watchdog_command().expect("watchdog");
        assert!(watchdog.contains("ls -i '/var/log/ep log;rm -rf x' 2>&1"));
        assert!(config
            .reconcile_command()
            .contains("$(ls -tr '/var/log/ep log;rm -rf x'*)"));
    }

    #[test]
    fn unknown_format_is_fatal() {
        let raw = MINIMAL.replace("log_source = \"ep\"", "log_source = \"ep\"\nformat = \"apache\"");
        assert!(parse(&raw).is_err());
    }

    #[test]
    fn inverted_jitter_is_fatal() {
        let raw = MINIMAL.replace(
            "log_path = \"/var/log/ep.log\"",
            "log_path = \"/var/log/ep.log\"\nrestart_jitter_min_secs = 10\nrestart_jitter_max_secs = 5",
        );
        let err = parse(&raw).expect_err("should reject");
        assert!(err.to_string().contains("restart_jitter"));
    }

    #[test]
    fn parser_policy_reads_snake_case() {
        let raw = format!("{MINIMAL}\n[processes]\nparser_policy = \"terminate_with_tail\"\n");
        let config = parse(&raw).expect("should parse");
        assert_eq!(config.processes.parser_policy, ParserPolicy::TerminateWithTail);
    }

    #[test]
    fn reconcile_command_is_niced_and_quoted() {
        let config = parse(MINIMAL).expect("should parse");
        let command = config.reconcile_command();
        assert!(command.starts_with("nice -n 19 sh -c '"));
        assert!(command.contains("zcat"));
    }

    #[test]
    fn collection_names_are_sanitized() {
        let mut config = parse(MINIMAL).expect("should parse");
        config.store.collection = Some("box-1.ep log".to_string());
        assert_eq!(config.collection(), "box_1_ep_log");
    }

    #[test]
    fn missing_executable_is_fatal() {
        let mut config = parse(MINIMAL).expect("should parse");
        config.processes.executable = Some("/definitely/not/here/rill-agent".to_string());
        assert!(config.executable().is_err());
    }
}
