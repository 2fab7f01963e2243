//! Configuration store: parses the fault-rule text file and environment
//! overrides into an immutable [`RuntimePolicy`].
//!
//! The file format is a small hand-rolled `key = value` grammar, not
//! TOML/YAML — recognized keys are enumerated explicitly and anything else
//! is a validation error. Grounded in spirit on the declarative
//! rule-plus-preset shape of `FaultConfig` in the orange-dot-mapf-het
//! harness, adapted to this project's plain-text, blank-line-delimited
//! block syntax.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::fault::{FaultKind, FaultOp, FaultRule};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn to_filter(self) -> log::LevelFilter {
        match self {
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Error => log::LevelFilter::Error,
        }
    }

    fn from_numeric(n: u8) -> Option<LogLevel> {
        Some(match n {
            0 => LogLevel::Debug,
            1 => LogLevel::Info,
            2 => LogLevel::Warn,
            3 => LogLevel::Error,
            _ => return None,
        })
    }

    fn parse(s: &str) -> Option<LogLevel> {
        if let Ok(n) = s.trim().parse::<u8>() {
            return LogLevel::from_numeric(n);
        }
        Some(match s.trim().to_ascii_uppercase().as_str() {
            "DEBUG" => LogLevel::Debug,
            "INFO" => LogLevel::Info,
            "WARN" | "WARNING" => LogLevel::Warn,
            "ERROR" => LogLevel::Error,
            _ => return None,
        })
    }
}

/// The fully validated, immutable configuration the driver runs with.
#[derive(Clone, Debug)]
pub struct RuntimePolicy {
    pub backing_root: PathBuf,
    pub mount_point: PathBuf,
    pub log_path: PathBuf,
    pub log_level: LogLevel,
    pub fault_rules: Vec<FaultRule>,
    pub global_seed: u64,
    pub foreground: bool,
    pub threads: usize,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config line {line}: unknown key `{key}`")]
    UnknownKey { line: usize, key: String },
    #[error("config line {line}: malformed numeric value `{value}` for `{key}`")]
    MalformedNumeric {
        line: usize,
        key: String,
        value: String,
    },
    #[error("config line {line}: probability `{value}` out of range [0,1]")]
    ProbabilityOutOfRange { line: usize, value: f64 },
    #[error("config line {line}: unknown operation name `{name}`")]
    UnknownOperation { line: usize, name: String },
    #[error("rule ending at line {line}: probability must be set for a rule that injects")]
    MissingProbability { line: usize },
    #[error("rule ending at line {line}: {kind} is not meaningful for operation {op:?}")]
    ContradictoryKindAndOp {
        line: usize,
        kind: &'static str,
        op: FaultOp,
    },
    #[error("rule ending at line {line}: a rule must declare at least one target operation")]
    MissingTargetOperations { line: usize },
    #[error("rule ending at line {line}: rule kind could not be determined from its parameters")]
    IndeterminateKind { line: usize },
    #[error("config line {line}: invalid path_glob pattern `{pattern}`")]
    InvalidGlob { line: usize, pattern: String },
    #[error("rule ending at line {line}: probability must be greater than 0 (a rule that never injects is not meaningful)")]
    ZeroProbability { line: usize },
    #[error("config line {line}: `{key}` value `{value}` is outside the valid range {min}..={max}")]
    ValueOutOfRange {
        line: usize,
        key: String,
        value: f64,
        min: f64,
        max: f64,
    },
    #[error("could not read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// One in-progress rule block while scanning the config file.
#[derive(Default)]
struct RuleBuilder {
    ops: HashSet<FaultOp>,
    path_glob: Option<String>,
    min_size: Option<u64>,
    max_size: Option<u64>,
    probability: Option<f64>,
    error_code: Option<i32>,
    delay_ms_min: Option<u64>,
    delay_ms_max: Option<u64>,
    data_corruption_percent: Option<f64>,
    short_write_ratio: Option<f64>,
    disk_full_threshold_bytes: Option<u64>,
    slow_ns_per_byte: Option<u64>,
    seed: Option<u64>,
    start_line: usize,
    touched: bool,
}

impl RuleBuilder {
    fn is_empty(&self) -> bool {
        !self.touched
    }

    fn finish(self) -> Result<FaultRule, ConfigError> {
        let line = self.start_line;
        if self.ops.is_empty() {
            return Err(ConfigError::MissingTargetOperations { line });
        }
        let probability = self
            .probability
            .ok_or(ConfigError::MissingProbability { line })?;
        if probability == 0.0 {
            return Err(ConfigError::ZeroProbability { line });
        }
        if !(0.0..=1.0).contains(&probability) {
            return Err(ConfigError::ProbabilityOutOfRange {
                line,
                value: probability,
            });
        }

        let kind = if let Some(errno) = self.error_code {
            FaultKind::Error { errno }
        } else if self.delay_ms_min.is_some() || self.delay_ms_max.is_some() {
            let min = self.delay_ms_min.unwrap_or(0);
            let max = self.delay_ms_max.unwrap_or(min);
            FaultKind::Delay {
                min_ms: min,
                max_ms: max,
            }
        } else if let Some(percent) = self.data_corruption_percent {
            if percent <= 0.0 {
                return Err(ConfigError::IndeterminateKind { line });
            }
            FaultKind::CorruptData { percent }
        } else if let Some(ratio) = self.short_write_ratio {
            FaultKind::ShortIo { ratio }
        } else if let Some(ns_per_byte) = self.slow_ns_per_byte {
            FaultKind::Slow { ns_per_byte }
        } else if let Some(threshold) = self.disk_full_threshold_bytes {
            FaultKind::SpaceExhaustion {
                threshold_bytes: threshold,
            }
        } else {
            return Err(ConfigError::IndeterminateKind { line });
        };

        for op in &self.ops {
            if !kind.applies_to(*op) {
                return Err(ConfigError::ContradictoryKindAndOp {
                    line,
                    kind: kind_name(&kind),
                    op: *op,
                });
            }
        }

        let path_glob = match self.path_glob {
            Some(pattern) => Some(
                glob::Pattern::new(&pattern)
                    .map_err(|_| ConfigError::InvalidGlob { line, pattern })?,
            ),
            None => None,
        };

        Ok(FaultRule {
            ops: self.ops,
            path_glob,
            min_size: self.min_size,
            max_size: self.max_size,
            probability,
            kind,
            seed: self.seed,
        })
    }
}

fn kind_name(kind: &FaultKind) -> &'static str {
    match kind {
        FaultKind::Error { .. } => "ERROR",
        FaultKind::Delay { .. } => "DELAY",
        FaultKind::CorruptData { .. } => "CORRUPT_DATA",
        FaultKind::ShortIo { .. } => "SHORT_IO",
        FaultKind::SpaceExhaustion { .. } => "SPACE_EXHAUSTION",
        FaultKind::Slow { .. } => "SLOW",
    }
}

/// Top-level keys that configure [`RuntimePolicy`] fields rather than a
/// fault rule, when they appear before the first rule block begins.
#[derive(Default)]
struct TopLevel {
    backing_root: Option<PathBuf>,
    mount_point: Option<PathBuf>,
    log_path: Option<PathBuf>,
    log_level: Option<LogLevel>,
    seed: Option<u64>,
    threads: Option<usize>,
    foreground: Option<bool>,
}

fn parse_f64(line: usize, key: &str, value: &str) -> Result<f64, ConfigError> {
    value
        .trim()
        .parse::<f64>()
        .map_err(|_| ConfigError::MalformedNumeric {
            line,
            key: key.to_string(),
            value: value.to_string(),
        })
}

fn parse_u64(line: usize, key: &str, value: &str) -> Result<u64, ConfigError> {
    value
        .trim()
        .parse::<u64>()
        .map_err(|_| ConfigError::MalformedNumeric {
            line,
            key: key.to_string(),
            value: value.to_string(),
        })
}

fn parse_errno(line: usize, value: &str) -> Result<i32, ConfigError> {
    let trimmed = value.trim();
    if let Ok(n) = trimmed.parse::<i32>() {
        return Ok(n);
    }
    Ok(match trimmed.to_ascii_uppercase().as_str() {
        "EIO" => libc::EIO,
        "ENOSPC" => libc::ENOSPC,
        "EACCES" => libc::EACCES,
        "EPERM" => libc::EPERM,
        "ENOENT" => libc::ENOENT,
        "EEXIST" => libc::EEXIST,
        "EINVAL" => libc::EINVAL,
        "EROFS" => libc::EROFS,
        "ENOTEMPTY" => libc::ENOTEMPTY,
        _ => {
            return Err(ConfigError::MalformedNumeric {
                line,
                key: "error_code".into(),
                value: trimmed.to_string(),
            })
        }
    })
}

/// Parses the fault-rule config text into a rule list plus whatever
/// top-level policy fields were present. Does not apply environment or CLI
/// overrides; see [`RuntimePolicy::load`].
fn parse_source(text: &str) -> Result<(TopLevel, Vec<FaultRule>), ConfigError> {
    let mut top = TopLevel::default();
    let mut rules = Vec::new();
    let mut current = RuleBuilder::default();
    let mut seen_rule_key = false;

    for (idx, raw_line) in text.lines().enumerate() {
        let line = idx + 1;
        let trimmed = raw_line.trim();
        if trimmed.is_empty() {
            if !current.is_empty() {
                rules.push(current.finish()?);
                current = RuleBuilder::default();
            }
            continue;
        }
        if trimmed.starts_with('#') {
            continue;
        }
        let Some((key, value)) = trimmed.split_once('=') else {
            return Err(ConfigError::UnknownKey {
                line,
                key: trimmed.to_string(),
            });
        };
        let key = key.trim();
        let value = value.trim();

        if !seen_rule_key {
            match key {
                "backing_root" => {
                    top.backing_root = Some(PathBuf::from(value));
                    continue;
                }
                "mount_point" => {
                    top.mount_point = Some(PathBuf::from(value));
                    continue;
                }
                "log_path" => {
                    top.log_path = Some(PathBuf::from(value));
                    continue;
                }
                "log_level" => {
                    top.log_level = Some(LogLevel::parse(value).ok_or_else(|| {
                        ConfigError::MalformedNumeric {
                            line,
                            key: "log_level".into(),
                            value: value.to_string(),
                        }
                    })?);
                    continue;
                }
                "seed" if current.is_empty() => {
                    top.seed = Some(parse_u64(line, "seed", value)?);
                    continue;
                }
                "threads" => {
                    top.threads = Some(parse_u64(line, "threads", value)? as usize);
                    continue;
                }
                "foreground" => {
                    top.foreground = Some(value.trim() == "true" || value.trim() == "1");
                    continue;
                }
                _ => {}
            }
        }

        current.touched = true;
        if current.start_line == 0 {
            current.start_line = line;
        }
        seen_rule_key = true;

        match key {
            "probability" => {
                let p = parse_f64(line, key, value)?;
                if !(0.0..=1.0).contains(&p) {
                    return Err(ConfigError::ProbabilityOutOfRange { line, value: p });
                }
                current.probability = Some(p);
            }
            "error_code" => current.error_code = Some(parse_errno(line, value)?),
            "delay_ms_min" => current.delay_ms_min = Some(parse_u64(line, key, value)?),
            "delay_ms_max" => current.delay_ms_max = Some(parse_u64(line, key, value)?),
            "data_corruption_percent" => {
                let v = parse_f64(line, key, value)?;
                if !(0.0..=100.0).contains(&v) {
                    return Err(ConfigError::ValueOutOfRange {
                        line,
                        key: key.to_string(),
                        value: v,
                        min: 0.0,
                        max: 100.0,
                    });
                }
                current.data_corruption_percent = Some(v);
            }
            "short_write_ratio" => {
                let v = parse_f64(line, key, value)?;
                if !(v > 0.0 && v <= 1.0) {
                    return Err(ConfigError::ValueOutOfRange {
                        line,
                        key: key.to_string(),
                        value: v,
                        min: 0.0,
                        max: 1.0,
                    });
                }
                current.short_write_ratio = Some(v);
            }
            "disk_full_threshold_bytes" => {
                current.disk_full_threshold_bytes = Some(parse_u64(line, key, value)?)
            }
            "slow_ns_per_byte" => current.slow_ns_per_byte = Some(parse_u64(line, key, value)?),
            "target_operations" => {
                for name in value.split(',') {
                    let name = name.trim();
                    if name.is_empty() {
                        continue;
                    }
                    let op = FaultOp::parse(name).ok_or_else(|| ConfigError::UnknownOperation {
                        line,
                        name: name.to_string(),
                    })?;
                    current.ops.insert(op);
                }
            }
            "path_glob" => current.path_glob = Some(value.to_string()),
            "min_size" => current.min_size = Some(parse_u64(line, key, value)?),
            "max_size" => current.max_size = Some(parse_u64(line, key, value)?),
            "seed" => current.seed = Some(parse_u64(line, key, value)?),
            _ => {
                return Err(ConfigError::UnknownKey {
                    line,
                    key: key.to_string(),
                })
            }
        }
    }

    if !current.is_empty() {
        rules.push(current.finish()?);
    }

    Ok((top, rules))
}

impl RuntimePolicy {
    /// Loads and validates the policy from `config_path`, applying CLI
    /// values and then environment variable overrides on top, in that
    /// precedence order (CLI/env beat the config file; the config file
    /// fills in whatever CLI left unset).
    pub fn load(
        config_path: &Path,
        cli_mount_point: Option<PathBuf>,
        cli_backing_root: Option<PathBuf>,
        cli_log_path: Option<PathBuf>,
        cli_log_level: Option<LogLevel>,
        cli_foreground: bool,
    ) -> Result<RuntimePolicy, ConfigError> {
        let text = std::fs::read_to_string(config_path).map_err(|source| ConfigError::Io {
            path: config_path.to_path_buf(),
            source,
        })?;
        let (top, fault_rules) = parse_source(&text)?;

        let backing_root = cli_backing_root.or(top.backing_root).unwrap_or_default();
        let mount_point = cli_mount_point.or(top.mount_point).unwrap_or_default();
        let log_path = cli_log_path.or(top.log_path).unwrap_or_default();
        let log_level = cli_log_level.or(top.log_level).unwrap_or(LogLevel::Info);

        let backing_root = env_path_override("NAS_STORAGE_PATH").unwrap_or(backing_root);
        let mount_point = env_path_override("NAS_MOUNT_POINT").unwrap_or(mount_point);
        let log_path = env_path_override("NAS_LOG_FILE").unwrap_or(log_path);
        let log_level = std::env::var("NAS_LOG_LEVEL")
            .ok()
            .and_then(|v| LogLevel::parse(&v))
            .unwrap_or(log_level);

        Ok(RuntimePolicy {
            backing_root,
            mount_point,
            log_path,
            log_level,
            fault_rules,
            global_seed: top.seed.unwrap_or(0),
            foreground: cli_foreground || top.foreground.unwrap_or(false),
            threads: top.threads.unwrap_or(1),
        })
    }
}

fn env_path_override(var: &str) -> Option<PathBuf> {
    std::env::var_os(var).map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_error_rule() {
        let text = "target_operations = write\nprobability = 1.0\nerror_code = EIO\n";
        let (_, rules) = parse_source(text).unwrap();
        assert_eq!(rules.len(), 1);
        assert!(rules[0].ops.contains(&FaultOp::Write));
        assert!(matches!(rules[0].kind, FaultKind::Error { errno } if errno == libc::EIO));
    }

    #[test]
    fn rejects_unknown_key() {
        let text = "bogus_key = 1\n";
        assert!(matches!(
            parse_source(text),
            Err(ConfigError::UnknownKey { .. })
        ));
    }

    #[test]
    fn rejects_probability_out_of_range() {
        let text = "target_operations = read\nprobability = 1.5\nerror_code = EIO\n";
        assert!(matches!(
            parse_source(text),
            Err(ConfigError::ProbabilityOutOfRange { .. })
        ));
    }

    #[test]
    fn rejects_contradictory_kind_and_op() {
        let text = "target_operations = chmod\nprobability = 1.0\nshort_write_ratio = 0.5\n";
        assert!(matches!(
            parse_source(text),
            Err(ConfigError::ContradictoryKindAndOp { .. })
        ));
    }

    #[test]
    fn rejects_zero_probability() {
        let text = "target_operations = write\nprobability = 0\nerror_code = EIO\n";
        assert!(matches!(
            parse_source(text),
            Err(ConfigError::ZeroProbability { .. })
        ));
    }

    #[test]
    fn rejects_corruption_percent_above_100() {
        let text = "target_operations = write\nprobability = 1.0\ndata_corruption_percent = 250\n";
        assert!(matches!(
            parse_source(text),
            Err(ConfigError::ValueOutOfRange { .. })
        ));
    }

    #[test]
    fn rejects_negative_short_write_ratio() {
        let text = "target_operations = write\nprobability = 1.0\nshort_write_ratio = -1\n";
        assert!(matches!(
            parse_source(text),
            Err(ConfigError::ValueOutOfRange { .. })
        ));
    }

    #[test]
    fn parses_slow_rule() {
        let text = "target_operations = read\nprobability = 1.0\nslow_ns_per_byte = 500\n";
        let (_, rules) = parse_source(text).unwrap();
        assert_eq!(rules.len(), 1);
        assert!(matches!(rules[0].kind, FaultKind::Slow { ns_per_byte } if ns_per_byte == 500));
    }

    #[test]
    fn parses_per_rule_seed_override() {
        let text = "target_operations = write\nprobability = 0.5\nerror_code = EIO\nseed = 77\n";
        let (_, rules) = parse_source(text).unwrap();
        assert_eq!(rules[0].seed, Some(77));
    }

    #[test]
    fn two_blank_separated_blocks_parse_as_two_rules() {
        let text = "target_operations = write\nprobability = 1.0\nerror_code = EIO\n\ntarget_operations = write\nprobability = 0.5\nshort_write_ratio = 0.3\n";
        let (_, rules) = parse_source(text).unwrap();
        assert_eq!(rules.len(), 2);
    }

    #[test]
    fn top_level_keys_populate_policy_fields() {
        let text = "backing_root = /tmp/backing\nmount_point = /tmp/mnt\nseed = 42\n";
        let (top, rules) = parse_source(text).unwrap();
        assert_eq!(top.backing_root, Some(PathBuf::from("/tmp/backing")));
        assert_eq!(top.seed, Some(42));
        assert!(rules.is_empty());
    }
}
