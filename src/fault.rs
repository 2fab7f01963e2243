//! Fault injection policy and the runtime decision engine.
//!
//! Grounded on the `FaultOp`/`FaultRule`/`FaultInjector` design in
//! agentfs-core's `fault.rs`, with probability sampling and delay ranges
//! adapted from the `FaultInjector` in the orange-dot-mapf-het consensus
//! harness, and counters modeled on kimberlite's attempted/applied
//! instrumentation registry.

use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Every filesystem verb the injector can be asked to rule on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FaultOp {
    Lookup,
    Getattr,
    Setattr,
    Readlink,
    Mknod,
    Mkdir,
    Unlink,
    Rmdir,
    Symlink,
    Rename,
    Link,
    Open,
    Read,
    Write,
    Flush,
    Release,
    Fsync,
    Opendir,
    Readdir,
    Releasedir,
    Fsyncdir,
    Statfs,
    Create,
    Chmod,
    Chown,
    Utimens,
    Truncate,
}

impl FaultOp {
    pub fn parse(name: &str) -> Option<FaultOp> {
        use FaultOp::*;
        Some(match name.trim().to_ascii_lowercase().as_str() {
            "lookup" => Lookup,
            "getattr" => Getattr,
            "setattr" => Setattr,
            "readlink" => Readlink,
            "mknod" => Mknod,
            "mkdir" => Mkdir,
            "unlink" => Unlink,
            "rmdir" => Rmdir,
            "symlink" => Symlink,
            "rename" => Rename,
            "link" => Link,
            "open" => Open,
            "read" => Read,
            "write" => Write,
            "flush" => Flush,
            "release" => Release,
            "fsync" => Fsync,
            "opendir" => Opendir,
            "readdir" => Readdir,
            "releasedir" => Releasedir,
            "fsyncdir" => Fsyncdir,
            "statfs" => Statfs,
            "create" => Create,
            "chmod" => Chmod,
            "chown" => Chown,
            "utimens" => Utimens,
            "truncate" => Truncate,
            _ => return None,
        })
    }
}

/// The kind-specific behavior of a rule once it fires.
#[derive(Clone, Debug)]
pub enum FaultKind {
    Error {
        errno: i32,
    },
    Delay {
        min_ms: u64,
        max_ms: u64,
    },
    CorruptData {
        percent: f64,
    },
    ShortIo {
        ratio: f64,
    },
    SpaceExhaustion {
        threshold_bytes: u64,
    },
    /// Delay proportional to the operation's byte count.
    Slow {
        ns_per_byte: u64,
    },
}

impl FaultKind {
    /// Kinds for which CORRUPT_DATA/SHORT_IO/SPACE_EXHAUSTION are meaningless,
    /// per the metadata-operation contract in the operation layer design.
    pub fn applies_to(&self, op: FaultOp) -> bool {
        match self {
            FaultKind::CorruptData { .. } => matches!(op, FaultOp::Read | FaultOp::Write),
            FaultKind::ShortIo { .. } => matches!(op, FaultOp::Write),
            FaultKind::SpaceExhaustion { .. } => matches!(
                op,
                FaultOp::Write
                    | FaultOp::Create
                    | FaultOp::Mknod
                    | FaultOp::Setattr
                    | FaultOp::Truncate
            ),
            FaultKind::Error { .. } | FaultKind::Delay { .. } | FaultKind::Slow { .. } => true,
        }
    }
}

/// A single entry from the configuration's fault-rule list.
#[derive(Clone, Debug)]
pub struct FaultRule {
    pub ops: HashSet<FaultOp>,
    pub path_glob: Option<glob::Pattern>,
    pub min_size: Option<u64>,
    pub max_size: Option<u64>,
    pub probability: f64,
    pub kind: FaultKind,
    /// Overrides the injector's global seed for this rule's own PRNG draws
    /// when set; `None` means the rule draws from the shared stream.
    pub seed: Option<u64>,
}

impl FaultRule {
    fn matches(&self, op: FaultOp, path: &std::path::Path, size: u64) -> bool {
        if !self.ops.contains(&op) {
            return false;
        }
        if !self.kind.applies_to(op) {
            return false;
        }
        if let Some(glob) = &self.path_glob {
            if !glob.matches_path(path) {
                return false;
            }
        }
        if let Some(min) = self.min_size {
            if size < min {
                return false;
            }
        }
        if let Some(max) = self.max_size {
            if size > max {
                return false;
            }
        }
        true
    }
}

/// The verdict `decide` hands back to the operation layer for one call.
#[derive(Clone, Debug, PartialEq)]
pub enum FaultDecision {
    Pass,
    Fail(i32),
    Delay(Duration),
    /// Corrupt roughly `percent` of the buffer's bytes, in place.
    Mutate { percent: f64 },
    /// Truncate a write to `n` bytes.
    Shorten(usize),
}

#[derive(Clone, Copy, Debug, Default)]
struct RuleCounters {
    invocations: u64,
    faults: u64,
}

/// Process-wide fault injection state: the rule set, the seeded PRNG
/// stream, and per-rule observability counters.
pub struct FaultInjector {
    rules: Vec<FaultRule>,
    rng: Mutex<StdRng>,
    /// One private PRNG per rule that declared its own `seed`; `None` for
    /// rules that draw from the shared `rng` stream instead.
    rule_rngs: Vec<Option<Mutex<StdRng>>>,
    counters: Mutex<Vec<RuleCounters>>,
}

impl FaultInjector {
    pub fn new(rules: Vec<FaultRule>, seed: u64) -> Self {
        let counters = vec![RuleCounters::default(); rules.len()];
        let rule_rngs = rules
            .iter()
            .map(|r| r.seed.map(|s| Mutex::new(StdRng::seed_from_u64(s))))
            .collect();
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            rule_rngs,
            rules,
            counters: Mutex::new(counters),
        }
    }

    /// Ask whether `op` against `path` (with the operation's natural byte
    /// count `size`) should be interfered with. `used_bytes` is the current
    /// backing-tree usage and is only consulted for SPACE_EXHAUSTION rules;
    /// pass 0 when the caller has no meaningful figure.
    ///
    /// Every matching rule except SPACE_EXHAUSTION advances the PRNG stream
    /// by exactly one probability draw, so a fixed seed and a fixed,
    /// serialized workload reproduce identical decision traces.
    /// SPACE_EXHAUSTION is a deterministic function of `used_bytes` rather
    /// than a probability roll, matching its "iff" testable property.
    pub fn decide(&self, op: FaultOp, path: &std::path::Path, size: u64, used_bytes: u64) -> FaultDecision {
        let Some(idx) = self.rules.iter().position(|r| r.matches(op, path, size)) else {
            return FaultDecision::Pass;
        };
        let rule = &self.rules[idx];

        if let FaultKind::SpaceExhaustion { threshold_bytes } = rule.kind {
            let mut counters = self.counters.lock().unwrap();
            counters[idx].invocations = counters[idx].invocations.saturating_add(1);
            return if used_bytes >= threshold_bytes {
                counters[idx].faults = counters[idx].faults.saturating_add(1);
                FaultDecision::Fail(libc::ENOSPC)
            } else {
                FaultDecision::Pass
            };
        }

        let mut rng = match &self.rule_rngs[idx] {
            Some(rule_rng) => rule_rng.lock().unwrap(),
            None => self.rng.lock().unwrap(),
        };
        let roll: f64 = rng.gen_range(0.0..1.0);
        let mut counters = self.counters.lock().unwrap();
        counters[idx].invocations = counters[idx].invocations.saturating_add(1);

        if roll >= rule.probability {
            return FaultDecision::Pass;
        }
        counters[idx].faults = counters[idx].faults.saturating_add(1);

        match &rule.kind {
            FaultKind::Error { errno } => FaultDecision::Fail(*errno),
            FaultKind::Delay { min_ms, max_ms } => {
                let ms = if min_ms == max_ms {
                    *min_ms
                } else {
                    rng.gen_range(*min_ms..=*max_ms)
                };
                FaultDecision::Delay(Duration::from_millis(ms))
            }
            FaultKind::Slow { ns_per_byte } => {
                FaultDecision::Delay(Duration::from_nanos(ns_per_byte.saturating_mul(size.max(1))))
            }
            FaultKind::CorruptData { percent } => FaultDecision::Mutate { percent: *percent },
            FaultKind::ShortIo { ratio } => {
                FaultDecision::Shorten((size as f64 * ratio).floor() as usize)
            }
            FaultKind::SpaceExhaustion { .. } => unreachable!("handled above"),
        }
    }

    /// Corrupt `buf` in place, returning the number of bytes actually
    /// changed. Indices are chosen by reservoir sampling (Algorithm R): one
    /// PRNG draw per candidate index, not a collision-dependent number of
    /// draws, so the index set and XOR masks are both reproducible under a
    /// fixed seed.
    pub fn corrupt(&self, buf: &mut [u8], percent: f64) -> usize {
        if buf.is_empty() || percent <= 0.0 {
            return 0;
        }
        let k = ((buf.len() as f64 * percent / 100.0).round() as usize).min(buf.len());
        if k == 0 {
            return 0;
        }
        let mut rng = self.rng.lock().unwrap();
        let mut reservoir: Vec<usize> = (0..k).collect();
        for i in k..buf.len() {
            let j = rng.gen_range(0..=i);
            if j < k {
                reservoir[j] = i;
            }
        }
        for idx in &reservoir {
            let mut mask: u8 = 0;
            while mask == 0 {
                mask = rng.gen();
            }
            buf[*idx] ^= mask;
        }
        reservoir.len()
    }

    /// Free-space ceiling implied by the first active SPACE_EXHAUSTION rule,
    /// used to clamp `statfs` output.
    pub fn space_threshold(&self) -> Option<u64> {
        self.rules.iter().find_map(|rule| match rule.kind {
            FaultKind::SpaceExhaustion { threshold_bytes } => Some(threshold_bytes),
            _ => None,
        })
    }

    pub fn counters_snapshot(&self) -> Vec<(u64, u64)> {
        self.counters
            .lock()
            .unwrap()
            .iter()
            .map(|c| (c.invocations, c.faults))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn single_rule(ops: &[FaultOp], probability: f64, kind: FaultKind) -> FaultRule {
        FaultRule {
            ops: ops.iter().copied().collect(),
            path_glob: None,
            min_size: None,
            max_size: None,
            probability,
            kind,
            seed: None,
        }
    }

    #[test]
    fn empty_ruleset_always_passes() {
        let injector = FaultInjector::new(vec![], 1234);
        assert_eq!(
            injector.decide(FaultOp::Write, Path::new("/a"), 10, 0),
            FaultDecision::Pass
        );
    }

    #[test]
    fn deterministic_error_injection() {
        let rule = single_rule(&[FaultOp::Write], 1.0, FaultKind::Error { errno: libc::EIO });
        let injector = FaultInjector::new(vec![rule], 42);
        assert_eq!(
            injector.decide(FaultOp::Write, Path::new("/b.txt"), 1, 0),
            FaultDecision::Fail(libc::EIO)
        );
    }

    #[test]
    fn short_io_computes_floor() {
        let rule = single_rule(&[FaultOp::Write], 1.0, FaultKind::ShortIo { ratio: 0.5 });
        let injector = FaultInjector::new(vec![rule], 1);
        assert_eq!(
            injector.decide(FaultOp::Write, Path::new("/c.bin"), 1024, 0),
            FaultDecision::Shorten(512)
        );
    }

    #[test]
    fn corrupt_changes_exact_byte_count() {
        let injector = FaultInjector::new(vec![], 99);
        let mut buf = vec![0u8; 200];
        let changed = injector.corrupt(&mut buf, 30.0);
        assert_eq!(changed, 60);
        assert_eq!(buf.iter().filter(|&&b| b != 0).count(), 60);
    }

    #[test]
    fn corrupt_zero_percent_changes_nothing() {
        let injector = FaultInjector::new(vec![], 7);
        let mut buf = vec![0u8; 50];
        assert_eq!(injector.corrupt(&mut buf, 0.0), 0);
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn reproducible_decision_trace_for_fixed_seed() {
        let make = || {
            let rule = single_rule(
                &[FaultOp::Write],
                0.5,
                FaultKind::CorruptData { percent: 30.0 },
            );
            FaultInjector::new(vec![rule], 1234)
        };
        let a = make();
        let b = make();
        let path = Path::new("/trace.bin");
        for _ in 0..10 {
            assert_eq!(a.decide(FaultOp::Write, path, 64, 0), b.decide(FaultOp::Write, path, 64, 0));
        }
    }

    #[test]
    fn rule_does_not_match_wrong_op() {
        let rule = single_rule(&[FaultOp::Read], 1.0, FaultKind::Error { errno: libc::EIO });
        let injector = FaultInjector::new(vec![rule], 1);
        assert_eq!(
            injector.decide(FaultOp::Write, Path::new("/d"), 1, 0),
            FaultDecision::Pass
        );
    }

    #[test]
    fn space_exhaustion_fires_iff_used_bytes_at_or_above_threshold() {
        let rule = single_rule(
            &[FaultOp::Write],
            1.0,
            FaultKind::SpaceExhaustion { threshold_bytes: 1000 },
        );
        let injector = FaultInjector::new(vec![rule], 1);
        let path = Path::new("/e.bin");
        assert_eq!(injector.decide(FaultOp::Write, path, 1, 999), FaultDecision::Pass);
        assert_eq!(
            injector.decide(FaultOp::Write, path, 1, 1000),
            FaultDecision::Fail(libc::ENOSPC)
        );
    }

    #[test]
    fn path_glob_restricts_matches() {
        let rule = FaultRule {
            ops: [FaultOp::Write].into_iter().collect(),
            path_glob: Some(glob::Pattern::new("*.log").unwrap()),
            min_size: None,
            max_size: None,
            probability: 1.0,
            kind: FaultKind::Error { errno: libc::EIO },
            seed: None,
        };
        let injector = FaultInjector::new(vec![rule], 1);
        assert_eq!(
            injector.decide(FaultOp::Write, Path::new("/var/app.log"), 1, 0),
            FaultDecision::Fail(libc::EIO)
        );
        assert_eq!(
            injector.decide(FaultOp::Write, Path::new("/var/app.txt"), 1, 0),
            FaultDecision::Pass
        );
    }

    #[test]
    fn rule_local_seed_overrides_global_stream() {
        let rule_a = FaultRule {
            ops: [FaultOp::Write].into_iter().collect(),
            path_glob: None,
            min_size: None,
            max_size: None,
            probability: 0.5,
            kind: FaultKind::CorruptData { percent: 30.0 },
            seed: Some(999),
        };
        let rule_b = rule_a.clone();
        let injector_a = FaultInjector::new(vec![rule_a], 1);
        let injector_b = FaultInjector::new(vec![rule_b], 2);
        let path = Path::new("/seeded.bin");
        for _ in 0..10 {
            assert_eq!(
                injector_a.decide(FaultOp::Write, path, 64, 0),
                injector_b.decide(FaultOp::Write, path, 64, 0)
            );
        }
    }
}
