//! Label selector evaluation.
//!
//! Converts Kubernetes [`LabelSelector`]s into kube [`Selector`]s, which
//! render the list-query syntax and evaluate locally against label maps.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::core::{Selector, SelectorExt};

use crate::error::{Result, SnapschedError};
use crate::provisioner::short_hash;

/// Label placed on every snapshot identifying the schedule that created it.
pub const SCHEDULE_LABEL: &str = "snapscheduler.backube/schedule";

/// Annotation carrying the full schedule name, which the label may shorten.
pub const SCHEDULE_ANNOTATION: &str = "snapscheduler.backube/schedule-name";

/// Label recording the cycle time a snapshot was taken for.
pub const WHEN_LABEL: &str = "snapscheduler.backube/when";

/// Maximum length of a Kubernetes label value.
pub const MAX_LABEL_VALUE_LENGTH: usize = 63;

/// Value of [`SCHEDULE_LABEL`] for `schedule`.
///
/// Names longer than a label value allows are cut short and suffixed with a
/// hash of the full name.
pub fn schedule_label_value(schedule: &str) -> String {
    if schedule.len() <= MAX_LABEL_VALUE_LENGTH {
        return schedule.to_string();
    }

    let hash = short_hash(schedule);
    let mut prefix: String = schedule
        .chars()
        .take(MAX_LABEL_VALUE_LENGTH - hash.len() - 1)
        .collect();
    // Label values must end alphanumeric
    while prefix.ends_with(['-', '.']) {
        prefix.pop();
    }
    format!("{}-{}", prefix, hash)
}

/// Selector matching the snapshots owned by `schedule`.
pub fn schedule_selector(schedule: &str) -> LabelSelector {
    LabelSelector {
        match_labels: Some(BTreeMap::from([(
            SCHEDULE_LABEL.to_string(),
            schedule_label_value(schedule),
        )])),
        match_expressions: None,
    }
}

/// Parse a selector, rejecting unknown operators.
pub fn parse(selector: &LabelSelector) -> Result<Selector> {
    Selector::try_from(selector.clone())
        .map_err(|e| SnapschedError::InvalidSelector(e.to_string()))
}

/// Check whether `labels` satisfy `selector`.
pub fn matches(selector: &LabelSelector, labels: &BTreeMap<String, String>) -> Result<bool> {
    Ok(parse(selector)?.matches(labels))
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelectorRequirement;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn requirement(key: &str, operator: &str, values: &[&str]) -> LabelSelectorRequirement {
        LabelSelectorRequirement {
            key: key.to_string(),
            operator: operator.to_string(),
            values: if values.is_empty() {
                None
            } else {
                Some(values.iter().map(|v| v.to_string()).collect())
            },
        }
    }

    #[test]
    fn test_empty_selector_matches_everything() {
        let selector = LabelSelector::default();
        assert!(matches(&selector, &labels(&[])).unwrap());
        assert!(matches(&selector, &labels(&[("app", "db")])).unwrap());
        assert!(parse(&selector).unwrap().selects_all());
    }

    #[test]
    fn test_match_labels() {
        let selector = LabelSelector {
            match_labels: Some(labels(&[("app", "db"), ("tier", "gold")])),
            match_expressions: None,
        };
        assert!(matches(&selector, &labels(&[("app", "db"), ("tier", "gold"), ("x", "y")])).unwrap());
        assert!(!matches(&selector, &labels(&[("app", "db")])).unwrap());
    }

    #[test]
    fn test_match_expressions() {
        let selector = LabelSelector {
            match_labels: None,
            match_expressions: Some(vec![
                requirement("env", "In", &["prod", "staging"]),
                requirement("skip", "DoesNotExist", &[]),
                requirement("team", "Exists", &[]),
                requirement("zone", "NotIn", &["us-east-1a"]),
            ]),
        };

        let good = labels(&[("env", "prod"), ("team", "a"), ("zone", "us-west-2b")]);
        assert!(matches(&selector, &good).unwrap());

        let skipped = labels(&[("env", "prod"), ("team", "a"), ("skip", "true")]);
        assert!(!matches(&selector, &skipped).unwrap());

        let wrong_env = labels(&[("env", "dev"), ("team", "a")]);
        assert!(!matches(&selector, &wrong_env).unwrap());

        let wrong_zone = labels(&[("env", "prod"), ("team", "a"), ("zone", "us-east-1a")]);
        assert!(!matches(&selector, &wrong_zone).unwrap());
    }

    #[test]
    fn test_invalid_operator() {
        let unknown = LabelSelector {
            match_labels: None,
            match_expressions: Some(vec![requirement("env", "Near", &["prod"])]),
        };
        assert!(matches!(parse(&unknown), Err(SnapschedError::InvalidSelector(_))));
        assert!(matches(&unknown, &labels(&[("env", "prod")])).is_err());
    }

    #[test]
    fn test_schedule_selector() {
        let selector = parse(&schedule_selector("hourly")).unwrap();
        assert_eq!(selector.to_string(), "snapscheduler.backube/schedule=hourly");
    }

    #[test]
    fn test_schedule_label_value_fits_label_limit() {
        assert_eq!(schedule_label_value("hourly"), "hourly");
        let exact = "s".repeat(MAX_LABEL_VALUE_LENGTH);
        assert_eq!(schedule_label_value(&exact), exact);

        let a = schedule_label_value(&format!("{}-a", "nightly-backup".repeat(6)));
        let b = schedule_label_value(&format!("{}-b", "nightly-backup".repeat(6)));
        assert!(a.len() <= MAX_LABEL_VALUE_LENGTH);
        assert!(a.starts_with("nightly-backup"));
        assert!(a.chars().last().is_some_and(|c| c.is_ascii_alphanumeric()));
        assert_ne!(a, b);
        assert_eq!(a, schedule_label_value(&format!("{}-a", "nightly-backup".repeat(6))));
    }
}
