//! Disk filter rule resolution.
//!
//! Rules are evaluated in a fixed order independent of how they were given:
//! descending priority id, with every storage-level rule (datastore URI or
//! repository) moved to the front. Each rule sees only the disks no earlier
//! rule matched. Evaluation stops as soon as every disk is excluded.

use glob::{MatchOptions, Pattern};
use std::collections::BTreeSet;
use tracing::debug;

use crate::model::disk::STORAGE_RULE_PRIORITY;
use crate::model::{ControllerSlot, Disk, DiskFilterRule, RuleType};
use crate::utils::errors::{EngineError, Result};

const GLOB_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: false,
    require_literal_separator: false,
    require_literal_leading_dot: false,
};

/// Evaluates a single rule against the live disk inventory.
pub trait RuleMatcher {
    /// Ids of the disks in `disks` matched by `rule`.
    fn matching(&self, rule: &DiskFilterRule, disks: &[Disk]) -> Result<Vec<String>>;
}

/// Glob based matcher over the disk attributes each rule type selects.
#[derive(Debug, Clone, Copy, Default)]
pub struct GlobMatcher;

impl GlobMatcher {
    fn matches(rule: &DiskFilterRule, disk: &Disk) -> Result<bool> {
        match rule.rule_type {
            RuleType::DatastoreUri => glob_match(&rule.pattern, &disk.datastore),
            RuleType::Repository => match &disk.repository {
                Some(repo) => glob_match(&rule.pattern, repo),
                None => Ok(false),
            },
            RuleType::DiskPath => {
                let target = if disk.path.is_empty() { &disk.id } else { &disk.path };
                glob_match(&rule.pattern, target)
            }
            RuleType::ControllerSlot => {
                let range = SlotRange::parse(&rule.pattern)?;
                Ok(disk.controller.as_ref().is_some_and(|slot| range.contains(slot)))
            }
            RuleType::DiskLabel => glob_match(&rule.pattern, &disk.label),
            RuleType::OsType => {
                let kind = if rule.value.is_empty() { &rule.pattern } else { &rule.value };
                match kind.to_ascii_lowercase().as_str() {
                    "os" => Ok(disk.os_disk),
                    "data" => Ok(!disk.os_disk),
                    other => Err(EngineError::InvalidRequest(format!(
                        "os_type rule expects 'os' or 'data', got '{other}'"
                    ))),
                }
            }
            RuleType::DiskTag => Ok(disk.tags.iter().any(|(name, value)| {
                name.eq_ignore_ascii_case(&rule.pattern) && (rule.value.is_empty() || value.eq_ignore_ascii_case(&rule.value))
            })),
        }
    }
}

impl RuleMatcher for GlobMatcher {
    fn matching(&self, rule: &DiskFilterRule, disks: &[Disk]) -> Result<Vec<String>> {
        let mut matched = Vec::new();
        for disk in disks {
            if Self::matches(rule, disk)? {
                matched.push(disk.id.clone());
            }
        }
        Ok(matched)
    }
}

fn glob_match(pattern: &str, value: &str) -> Result<bool> {
    if value.is_empty() {
        return Ok(false);
    }
    let pattern = Pattern::new(pattern)
        .map_err(|e| EngineError::InvalidRequest(format!("bad disk filter pattern '{pattern}': {e}")))?;
    Ok(pattern.matches_with(value, GLOB_OPTIONS))
}

/// `controller-bus-unit` or `controller-bus-start-end`, e.g. `scsi-0-1-3`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct SlotRange {
    controller: String,
    bus: u32,
    first: u32,
    last: u32,
}

impl SlotRange {
    fn parse(pattern: &str) -> Result<Self> {
        let invalid = || {
            EngineError::InvalidRequest(format!(
                "controller slot rule '{pattern}' must be controller-bus-unit or controller-bus-start-end"
            ))
        };
        let number = |s: &&str| s.parse::<u32>().map_err(|_| invalid());

        let parts: Vec<&str> = pattern.split('-').collect();
        let (controller, bus, first, last) = match parts.as_slice() {
            [c, b, u] => (*c, number(b)?, number(u)?, number(u)?),
            [c, b, s, e] => (*c, number(b)?, number(s)?, number(e)?),
            _ => return Err(invalid()),
        };
        if controller.is_empty() || first > last {
            return Err(invalid());
        }

        Ok(Self {
            controller: controller.to_ascii_lowercase(),
            bus,
            first,
            last,
        })
    }

    fn contains(&self, slot: &ControllerSlot) -> bool {
        slot.controller.eq_ignore_ascii_case(&self.controller)
            && slot.bus == self.bus
            && (self.first..=self.last).contains(&slot.unit)
    }
}

/// Evaluation order for a rule set.
pub fn resolve_order(rules: &[DiskFilterRule]) -> Vec<DiskFilterRule> {
    let mut sorted = rules.to_vec();
    sorted.sort_by(|a, b| b.rule_type.priority_id().cmp(&a.rule_type.priority_id()));

    let (storage, rest): (Vec<_>, Vec<_>) = sorted
        .into_iter()
        .partition(|r| r.rule_type.priority_id() == STORAGE_RULE_PRIORITY);
    storage.into_iter().chain(rest).collect()
}

/// Combine VM-group and VM-level rules.
///
/// An empty VM list counts as unset and the group list applies. A non-empty
/// VM list replaces the group list unless `include_group_filters` is set, in
/// which case both are unioned (duplicates dropped) and re-ordered.
pub fn merge_rules(
    group: &[DiskFilterRule],
    vm: Option<&[DiskFilterRule]>,
    include_group_filters: bool,
) -> Vec<DiskFilterRule> {
    match vm {
        Some(own) if !own.is_empty() => {
            if !include_group_filters {
                return own.to_vec();
            }
            let mut union: Vec<DiskFilterRule> = Vec::with_capacity(group.len() + own.len());
            for rule in group.iter().chain(own) {
                if !union.contains(rule) {
                    union.push(rule.clone());
                }
            }
            resolve_order(&union)
        }
        _ => group.to_vec(),
    }
}

/// Result of resolving a rule set against one VM's disks.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterOutcome {
    /// Rules in the order they were (or would have been) evaluated
    pub order: Vec<DiskFilterRule>,
    /// Number of rules actually evaluated before early exit
    pub evaluated: usize,
    pub excluded: BTreeSet<String>,
    /// Disks that will be backed up
    pub remaining: Vec<Disk>,
}

impl FilterOutcome {
    pub fn excluded_ids(&self) -> Vec<String> {
        self.excluded.iter().cloned().collect()
    }
}

/// Computes which disks a rule set excludes.
#[derive(Debug, Clone, Default)]
pub struct DiskFilterResolver<M = GlobMatcher> {
    matcher: M,
}

impl DiskFilterResolver<GlobMatcher> {
    pub fn new() -> Self {
        Self { matcher: GlobMatcher }
    }
}

impl<M: RuleMatcher> DiskFilterResolver<M> {
    pub fn with_matcher(matcher: M) -> Self {
        Self { matcher }
    }

    pub fn resolve(&self, disks: &[Disk], rules: &[DiskFilterRule]) -> Result<FilterOutcome> {
        let order = resolve_order(rules);
        let total = disks.len();
        let mut live: Vec<Disk> = disks.to_vec();
        let mut excluded = BTreeSet::new();
        let mut evaluated = 0;

        for rule in &order {
            if excluded.len() == total {
                debug!(skipped = order.len() - evaluated, "All disks filtered, skipping remaining rules");
                break;
            }

            evaluated += 1;
            let matched = self.matcher.matching(rule, &live)?;
            if matched.is_empty() {
                debug!(rule = %rule, "Disk filter rule matched nothing");
                continue;
            }

            debug!(rule = %rule, matched = ?matched, "Disk filter rule matched");
            live.retain(|d| !matched.contains(&d.id));
            excluded.extend(matched);
        }

        Ok(FilterOutcome {
            order,
            evaluated,
            excluded,
            remaining: live,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    fn inventory() -> Vec<Disk> {
        vec![
            Disk::new("d1").with_datastore("ds-fast").with_controller("scsi", 0, 0).with_os_disk(true),
            Disk::new("d2").with_datastore("ds-slow").with_controller("scsi", 0, 1).with_label("Hard disk 2"),
            Disk::new("d3")
                .with_datastore("ds-slow")
                .with_controller("scsi", 0, 2)
                .with_tag("backup", "skip"),
        ]
    }

    /// Matches by explicit id list and records which rules it saw.
    struct SpyMatcher {
        targets: Vec<(DiskFilterRule, Vec<&'static str>)>,
        calls: RefCell<Vec<DiskFilterRule>>,
    }

    impl RuleMatcher for SpyMatcher {
        fn matching(&self, rule: &DiskFilterRule, disks: &[Disk]) -> Result<Vec<String>> {
            self.calls.borrow_mut().push(rule.clone());
            let targets = self
                .targets
                .iter()
                .find(|(r, _)| r == rule)
                .map(|(_, ids)| ids.clone())
                .unwrap_or_default();
            Ok(disks
                .iter()
                .filter(|d| targets.iter().any(|t| *t == d.id))
                .map(|d| d.id.clone())
                .collect())
        }
    }

    #[test]
    fn test_datastore_rule_promoted_to_front() {
        let rules = vec![
            DiskFilterRule::new(RuleType::ControllerSlot, "scsi-0-1"),
            DiskFilterRule::new(RuleType::DatastoreUri, "ds-fast"),
        ];

        let outcome = DiskFilterResolver::new().resolve(&inventory(), &rules).unwrap();

        let order: Vec<RuleType> = outcome.order.iter().map(|r| r.rule_type).collect();
        assert_eq!(order, vec![RuleType::DatastoreUri, RuleType::ControllerSlot]);
        assert_eq!(outcome.excluded_ids(), vec!["d1".to_string(), "d2".to_string()]);
        assert_eq!(outcome.remaining.len(), 1);
        assert_eq!(outcome.remaining[0].id, "d3");
    }

    #[test]
    fn test_order_is_descending_priority() {
        let rules = vec![
            DiskFilterRule::new(RuleType::DiskPath, "*.vmdk"),
            DiskFilterRule::new(RuleType::Repository, "sr-*"),
            DiskFilterRule::new(RuleType::DiskTag, "backup"),
            DiskFilterRule::new(RuleType::DatastoreUri, "ds-*"),
            DiskFilterRule::new(RuleType::DiskLabel, "*"),
        ];
        let order: Vec<RuleType> = resolve_order(&rules).iter().map(|r| r.rule_type).collect();
        assert_eq!(
            order,
            vec![
                RuleType::Repository,
                RuleType::DatastoreUri,
                RuleType::DiskTag,
                RuleType::DiskLabel,
                RuleType::DiskPath,
            ]
        );
    }

    #[test]
    fn test_early_exit_skips_remaining_rules() {
        let covers_all = DiskFilterRule::new(RuleType::DiskTag, "all");
        let nothing_new = DiskFilterRule::new(RuleType::DiskPath, "none");
        let spy = SpyMatcher {
            targets: vec![(covers_all.clone(), vec!["d1", "d2"]), (nothing_new.clone(), vec!["d1"])],
            calls: RefCell::new(Vec::new()),
        };
        let disks = vec![Disk::new("d1"), Disk::new("d2")];

        let resolver = DiskFilterResolver::with_matcher(spy);
        let outcome = resolver.resolve(&disks, &[covers_all.clone(), nothing_new]).unwrap();

        assert_eq!(outcome.evaluated, 1);
        assert_eq!(*resolver.matcher.calls.borrow(), vec![covers_all]);
        assert!(outcome.remaining.is_empty());
        assert_eq!(outcome.excluded.len(), 2);
    }

    #[test]
    fn test_filtering_is_idempotent() {
        let rules = vec![
            DiskFilterRule::new(RuleType::DiskTag, "backup").with_value("skip"),
            DiskFilterRule::new(RuleType::OsType, "").with_value("os"),
        ];
        let resolver = DiskFilterResolver::new();
        let once = resolver.resolve(&inventory(), &rules).unwrap();
        let twice = resolver.resolve(&inventory(), &rules).unwrap();
        assert_eq!(once.excluded, twice.excluded);
        assert_eq!(once.excluded_ids(), vec!["d1".to_string(), "d3".to_string()]);

        // Re-filtering the survivors excludes nothing further
        let again = resolver.resolve(&once.remaining, &rules).unwrap();
        assert!(again.excluded.is_empty());
    }

    #[test]
    fn test_rule_matching_nothing_is_noop() {
        let rules = vec![DiskFilterRule::new(RuleType::DatastoreUri, "missing-*")];
        let outcome = DiskFilterResolver::new().resolve(&inventory(), &rules).unwrap();
        assert!(outcome.excluded.is_empty());
        assert_eq!(outcome.remaining.len(), 3);
    }

    #[test]
    fn test_rule_may_exclude_every_disk() {
        let rules = vec![DiskFilterRule::new(RuleType::DatastoreUri, "DS-*")];
        let outcome = DiskFilterResolver::new().resolve(&inventory(), &rules).unwrap();
        assert!(outcome.remaining.is_empty());
        assert_eq!(outcome.excluded.len(), 3);
    }

    #[test]
    fn test_controller_slot_range() {
        let rules = vec![DiskFilterRule::new(RuleType::ControllerSlot, "scsi-0-1-2")];
        let outcome = DiskFilterResolver::new().resolve(&inventory(), &rules).unwrap();
        assert_eq!(outcome.excluded_ids(), vec!["d2".to_string(), "d3".to_string()]);

        let bad = vec![DiskFilterRule::new(RuleType::ControllerSlot, "scsi-0-3-1")];
        assert!(DiskFilterResolver::new().resolve(&inventory(), &bad).is_err());
    }

    #[test]
    fn test_merge_rules() {
        let group = vec![DiskFilterRule::new(RuleType::DiskLabel, "Hard disk 2")];
        let own = vec![
            DiskFilterRule::new(RuleType::DiskPath, "*.vmdk"),
            DiskFilterRule::new(RuleType::DatastoreUri, "ds-slow"),
        ];

        assert_eq!(merge_rules(&group, None, false), group);
        assert_eq!(merge_rules(&group, Some(&[][..]), false), group);
        assert_eq!(merge_rules(&group, Some(own.as_slice()), false), own);

        let merged = merge_rules(&group, Some(own.as_slice()), true);
        let order: Vec<RuleType> = merged.iter().map(|r| r.rule_type).collect();
        assert_eq!(order, vec![RuleType::DatastoreUri, RuleType::DiskLabel, RuleType::DiskPath]);

        let duplicated = merge_rules(&group, Some(group.as_slice()), true);
        assert_eq!(duplicated.len(), 1);
    }
}
