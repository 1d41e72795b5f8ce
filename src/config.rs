//! The `key=value` / `key+=value` / `key-=value` configuration grammar of §6,
//! plus the typed views (`GlobalConfig`, `TargetConfig`, `MonitorConfig`,
//! `StrategyConfig`) component construction reads from it.
//!
//! Unknown keys are kept verbatim — `Config` is a faithful superset so that
//! `parse(render(c)) == c` (Testable Property 5) holds even for keys no
//! component currently interprets.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use crate::error::{errors, AutopinError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigValue {
    Scalar(String),
    /// Order of first insertion is preserved; `+=` is a unique append.
    List(Vec<String>),
}

impl ConfigValue {
    pub fn as_scalar(&self) -> Option<&str> {
        match self {
            ConfigValue::Scalar(s) => Some(s),
            ConfigValue::List(_) => None,
        }
    }

    pub fn as_list(&self) -> Vec<&str> {
        match self {
            ConfigValue::Scalar(s) => vec![s.as_str()],
            ConfigValue::List(v) => v.iter().map(String::as_str).collect(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Config {
    entries: BTreeMap<String, ConfigValue>,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&ConfigValue> {
        self.entries.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.entries.get(key).and_then(ConfigValue::as_scalar)
    }

    pub fn get_list(&self, key: &str) -> Vec<String> {
        self.entries
            .get(key)
            .map(|v| v.as_list().into_iter().map(str::to_owned).collect())
            .unwrap_or_default()
    }

    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.get_str(key) {
            Some("true") | Some("1") | Some("yes") => true,
            Some("false") | Some("0") | Some("no") => false,
            _ => default,
        }
    }

    pub fn get_int(&self, key: &str, default: i64) -> i64 {
        self.get_str(key)
            .and_then(|s| s.parse::<i64>().ok())
            .unwrap_or(default)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries
            .insert(key.into(), ConfigValue::Scalar(value.into()));
    }

    /// `+=`: append `value` to `key`'s list if not already present. A
    /// pre-existing scalar is promoted to a one-element list first.
    pub fn append_unique(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        let entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| ConfigValue::List(Vec::new()));
        let list = match entry {
            ConfigValue::List(v) => v,
            ConfigValue::Scalar(s) => {
                let prior = std::mem::take(s);
                *entry = ConfigValue::List(vec![prior]);
                match entry {
                    ConfigValue::List(v) => v,
                    _ => unreachable!(),
                }
            }
        };
        if !list.contains(&value) {
            list.push(value);
        }
    }

    /// `-=`: remove a value equal to `value` from `key`'s list (or clear a
    /// scalar equal to it). Removing the last element drops the key.
    pub fn remove_value(&mut self, key: &str, value: &str) {
        let Some(entry) = self.entries.get_mut(key) else {
            return;
        };
        match entry {
            ConfigValue::Scalar(s) if s == value => {
                self.entries.remove(key);
            }
            ConfigValue::List(v) => {
                v.retain(|x| x != value);
                if v.is_empty() {
                    self.entries.remove(key);
                }
            }
            _ => {}
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Merges `other` in, later values overriding earlier ones key-by-key.
    /// Used to fold `-c`'s repeated config files together in order (§6).
    pub fn merge(&mut self, other: Config) {
        for (key, value) in other.entries {
            self.entries.insert(key, value);
        }
    }

    /// Parses the §6 grammar: one assignment per line, `#` at column 0 is a
    /// whole-line comment, blank lines are ignored.
    pub fn parse(text: &str) -> Result<Self, AutopinError> {
        let mut cfg = Self::new();
        for (lineno, raw_line) in text.lines().enumerate() {
            if raw_line.starts_with('#') || raw_line.trim().is_empty() {
                continue;
            }
            let line = raw_line.trim_end();
            let (key, op, value) = split_assignment(line).ok_or_else(|| {
                errors::bad_config(
                    "parse",
                    format!("line {}: not an assignment: {line:?}", lineno + 1),
                )
            })?;
            match op {
                "=" => cfg.set(key, value),
                "+=" => cfg.append_unique(key, value),
                "-=" => cfg.remove_value(key, value),
                _ => unreachable!(),
            }
        }
        Ok(cfg)
    }

    /// Renders back to the §6 grammar: one `key=value` per scalar, one
    /// `key+=value` per list element, in key order.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (key, value) in &self.entries {
            match value {
                ConfigValue::Scalar(s) => {
                    let _ = writeln!(out, "{key}={s}");
                }
                ConfigValue::List(items) => {
                    for item in items {
                        let _ = writeln!(out, "{key}+={item}");
                    }
                }
            }
        }
        out
    }
}

/// Splits `key<op>value` trying the two-character operators before `=`, so
/// `+=`/`-=` aren't mistaken for `=` with a leading `+`/`-` in the value.
fn split_assignment(line: &str) -> Option<(&str, &str, &str)> {
    for op in ["+=", "-="] {
        if let Some(idx) = line.find(op) {
            return Some((line[..idx].trim(), op, line[idx + op.len()..].trim()));
        }
    }
    let idx = line.find('=')?;
    Some((line[..idx].trim(), "=", line[idx + 1..].trim()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogTarget {
    Stdout,
    File,
    Syslog,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GlobalConfig {
    pub log_type: LogTarget,
    pub log_file: Option<String>,
    pub log_level: Option<String>,
    pub mqtt_hostname: Option<String>,
    pub mqtt_port: Option<u16>,
}

impl GlobalConfig {
    pub fn from_config(cfg: &Config) -> Self {
        let log_type = match cfg.get_str("log.type") {
            Some("file") => LogTarget::File,
            Some("syslog") => LogTarget::Syslog,
            _ => LogTarget::Stdout,
        };
        Self {
            log_type,
            log_file: cfg.get_str("log.file").map(str::to_owned),
            log_level: cfg.get_str("log.level").map(str::to_owned),
            mqtt_hostname: cfg.get_str("mqtt.hostname").map(str::to_owned),
            mqtt_port: cfg
                .get_str("mqtt.port")
                .and_then(|s| s.parse::<u16>().ok()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorType {
    ClustSafe,
    GPerf,
    Perf,
    Random,
}

impl MonitorType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "clustsafe" => Some(MonitorType::ClustSafe),
            "gperf" => Some(MonitorType::GPerf),
            "perf" => Some(MonitorType::Perf),
            "random" => Some(MonitorType::Random),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MonitorConfig {
    pub name: String,
    pub monitor_type: MonitorType,
    pub options: Config,
}

impl MonitorConfig {
    /// Reads `<name>.type` plus every `<name>.*` key as that monitor's options.
    pub fn from_config(name: &str, cfg: &Config) -> Result<Self, AutopinError> {
        let type_key = format!("{name}.type");
        let type_str = cfg
            .get_str(&type_key)
            .ok_or_else(|| errors::bad_config("monitor_type", format!("missing {type_key}")))?;
        let monitor_type = MonitorType::parse(type_str)
            .ok_or_else(|| errors::bad_config("monitor_type", format!("unknown type {type_str}")))?;

        let prefix = format!("{name}.");
        let mut options = Config::new();
        for key in cfg.keys() {
            if let Some(rest) = key.strip_prefix(&prefix) {
                if rest == "type" {
                    continue;
                }
                if let Some(v) = cfg.get(key) {
                    match v {
                        ConfigValue::Scalar(s) => options.set(rest, s.clone()),
                        ConfigValue::List(items) => {
                            for item in items {
                                options.append_unique(rest, item.clone());
                            }
                        }
                    }
                }
            }
        }
        Ok(Self {
            name: name.to_string(),
            monitor_type,
            options,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyType {
    Autopin1,
    History,
    Compact,
    Scatter,
    Noop,
}

impl StrategyType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "autopin1" => Some(StrategyType::Autopin1),
            "history" => Some(StrategyType::History),
            "compact" => Some(StrategyType::Compact),
            "scatter" => Some(StrategyType::Scatter),
            "noop" => Some(StrategyType::Noop),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StrategyConfig {
    pub strategy_type: StrategyType,
    pub options: Config,
}

impl StrategyConfig {
    pub fn from_config(cfg: &Config) -> Result<Self, AutopinError> {
        let type_str = cfg
            .get_str("ControlStrategy")
            .ok_or_else(|| errors::bad_config("strategy_type", "missing ControlStrategy"))?;
        let strategy_type = StrategyType::parse(type_str).ok_or_else(|| {
            errors::bad_config("strategy_type", format!("unknown strategy {type_str}"))
        })?;
        Ok(Self {
            strategy_type,
            options: cfg.clone(),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AttachOrExec {
    Attach(String),
    Exec(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TargetConfig {
    pub trace: bool,
    pub comm_chan: Option<String>,
    pub comm_chan_timeout: i64,
    pub target: Option<AttachOrExec>,
    pub performance_monitors: Vec<String>,
    pub strategy: StrategyConfig,
    pub pinning_history_load: Option<String>,
    pub pinning_history_save: Option<String>,
    pub data_loggers: Vec<String>,
    /// Enables the NUMA sampling engine and migration controller (§4.6/§4.7).
    pub sampling: bool,
    pub sensing_period_secs: u64,
    pub significance_threshold: Option<u64>,
    /// §5: the controller sends a terminating signal at the end of phase 1
    /// instead of leaving the observed process to terminate naturally.
    pub only_sample: bool,
}

impl TargetConfig {
    pub fn from_config(cfg: &Config) -> Result<Self, AutopinError> {
        let target = match (cfg.get_str("Attach"), cfg.get_str("Exec")) {
            (Some(a), _) => Some(AttachOrExec::Attach(a.to_string())),
            (None, Some(e)) => Some(AttachOrExec::Exec(e.to_string())),
            (None, None) => None,
        };
        Ok(Self {
            trace: cfg.get_bool("Trace", false),
            comm_chan: cfg.get_str("CommChan").map(str::to_owned),
            comm_chan_timeout: cfg.get_int("CommChanTimeout", 60),
            target,
            performance_monitors: cfg.get_list("PerformanceMonitors"),
            strategy: StrategyConfig::from_config(cfg)?,
            pinning_history_load: cfg.get_str("PinningHistory.load").map(str::to_owned),
            pinning_history_save: cfg.get_str("PinningHistory.save").map(str::to_owned),
            data_loggers: cfg.get_list("DataLoggers"),
            sampling: cfg.get_bool("Sampling", false),
            sensing_period_secs: cfg.get_int("SensingPeriod", 10).max(1) as u64,
            significance_threshold: cfg
                .get_str("SignificanceThreshold")
                .and_then(|s| s.parse::<u64>().ok()),
            only_sample: cfg.get_bool("OnlySample", false),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_assignment_round_trips() {
        let text = "log.type=syslog\nmqtt.port=1883\n";
        let cfg = Config::parse(text).unwrap();
        assert_eq!(cfg.get_str("log.type"), Some("syslog"));
        let rendered = cfg.render();
        let reparsed = Config::parse(&rendered).unwrap();
        assert_eq!(cfg, reparsed);
    }

    #[test]
    fn comment_lines_are_ignored() {
        let cfg = Config::parse("#a comment\nTrace=true\n").unwrap();
        assert!(cfg.get_bool("Trace", false));
    }

    #[test]
    fn append_unique_builds_a_list() {
        let cfg = Config::parse("DataLoggers+=external\nDataLoggers+=external\n").unwrap();
        assert_eq!(cfg.get_list("DataLoggers"), vec!["external".to_string()]);
    }

    #[test]
    fn remove_value_drops_from_list() {
        let mut cfg = Config::new();
        cfg.append_unique("skip", "1");
        cfg.append_unique("skip", "2");
        cfg.remove_value("skip", "1");
        assert_eq!(cfg.get_list("skip"), vec!["2".to_string()]);
    }

    #[test]
    fn property_5_round_trip_with_lists_and_scalars() {
        let text = "\
Trace=true
CommChanTimeout=30
PerformanceMonitors+=cpu0
PerformanceMonitors+=cpu1
ControlStrategy=compact
";
        let cfg = Config::parse(text).unwrap();
        let rendered = cfg.render();
        let reparsed = Config::parse(&rendered).unwrap();
        assert_eq!(cfg, reparsed);
    }

    #[test]
    fn monitor_config_extracts_prefixed_options() {
        let text = "cpu0.type=perf\ncpu0.event_type=cache-misses\ncpu0.processors+=0\ncpu0.processors+=1\n";
        let cfg = Config::parse(text).unwrap();
        let mc = MonitorConfig::from_config("cpu0", &cfg).unwrap();
        assert_eq!(mc.monitor_type, MonitorType::Perf);
        assert_eq!(mc.options.get_str("event_type"), Some("cache-misses"));
        assert_eq!(mc.options.get_list("processors"), vec!["0", "1"]);
    }

    #[test]
    fn unknown_strategy_type_is_bad_config() {
        let cfg = Config::parse("ControlStrategy=not_a_real_strategy\n").unwrap();
        assert!(StrategyConfig::from_config(&cfg).is_err());
    }

    #[test]
    fn target_config_prefers_attach_over_exec() {
        let cfg = Config::parse("Attach=1234\nExec=/bin/true\nControlStrategy=noop\n").unwrap();
        let t = TargetConfig::from_config(&cfg).unwrap();
        assert_eq!(t.target, Some(AttachOrExec::Attach("1234".to_string())));
    }

    #[test]
    fn merge_overrides_earlier_keys_and_keeps_untouched_ones() {
        let mut base = Config::parse("Trace=true\nControlStrategy=compact\n").unwrap();
        let override_cfg = Config::parse("ControlStrategy=scatter\n").unwrap();
        base.merge(override_cfg);
        assert!(base.get_bool("Trace", false));
        assert_eq!(base.get_str("ControlStrategy"), Some("scatter"));
    }

    #[test]
    fn target_config_reads_sampling_and_migration_keys() {
        let cfg = Config::parse(
            "ControlStrategy=noop\nSampling=true\nSensingPeriod=5\nSignificanceThreshold=100\nOnlySample=true\n",
        )
        .unwrap();
        let t = TargetConfig::from_config(&cfg).unwrap();
        assert!(t.sampling);
        assert_eq!(t.sensing_period_secs, 5);
        assert_eq!(t.significance_threshold, Some(100));
        assert!(t.only_sample);
    }

    #[test]
    fn plus_minus_operators_are_not_confused_with_signed_values() {
        // a scalar value that happens to start with '+' or '-' must not be
        // mistaken for the += / -= operators themselves.
        let cfg = Config::parse("threshold=-5\n").unwrap();
        assert_eq!(cfg.get_str("threshold"), Some("-5"));
    }
}
