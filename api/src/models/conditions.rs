//! Condition tracking for node groups

use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use schemars::JsonSchema;
use std::fmt;

/// The condition types tracked on a node group
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum ConditionKind {
    /// All instances in the group are Ready
    Ready,
    /// The group is actively scaling up or down
    Scaling,
    /// The last reconcile hit an error
    Error,
    /// The group is at its minimum size
    AtMinCapacity,
    /// The group is at its maximum size
    AtMaxCapacity,
}

impl fmt::Display for ConditionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConditionKind::Ready => write!(f, "Ready"),
            ConditionKind::Scaling => write!(f, "Scaling"),
            ConditionKind::Error => write!(f, "Error"),
            ConditionKind::AtMinCapacity => write!(f, "AtMinCapacity"),
            ConditionKind::AtMaxCapacity => write!(f, "AtMaxCapacity"),
        }
    }
}

/// A single condition on a node group
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeGroupCondition {
    /// The type of this condition
    #[serde(rename = "type")]
    pub kind: ConditionKind,
    /// Whether this condition currently holds (True/False)
    pub status: String,
    /// A machine readable reason for the latest update
    pub reason: String,
    /// A human readable message for the latest update
    pub message: String,
    /// When this conditions status last flipped
    pub last_transition_time: Option<Time>,
    /// When this condition was last written
    pub last_update_time: Option<Time>,
}

/// Set a condition in a condition list keeping at most one per type
///
/// The transition timestamp only moves when the status actually flips so
/// repeated reconciles of a steady group do not churn it.
///
/// # Arguments
///
/// * `conditions` - The condition list to update
/// * `kind` - The type of condition to set
/// * `status` - Whether this condition currently holds
/// * `reason` - A machine readable reason
/// * `message` - A human readable message
pub fn set<R: Into<String>, M: Into<String>>(
    conditions: &mut Vec<NodeGroupCondition>,
    kind: ConditionKind,
    status: bool,
    reason: R,
    message: M,
) {
    let now = Time(Utc::now());
    let status = if status { "True" } else { "False" };
    // update the existing condition of this type if one exists
    if let Some(existing) = conditions.iter_mut().find(|cond| cond.kind == kind) {
        // only bump the transition time when the status flips
        if existing.status != status {
            existing.last_transition_time = Some(now.clone());
        }
        existing.status = status.to_owned();
        existing.reason = reason.into();
        existing.message = message.into();
        existing.last_update_time = Some(now);
        return;
    }
    // this is the first time we have seen this condition type
    conditions.push(NodeGroupCondition {
        kind,
        status: status.to_owned(),
        reason: reason.into(),
        message: message.into(),
        last_transition_time: Some(now.clone()),
        last_update_time: Some(now),
    });
}

/// Check whether a condition currently holds
///
/// # Arguments
///
/// * `conditions` - The condition list to read
/// * `kind` - The type of condition to check
pub fn holds(conditions: &[NodeGroupCondition], kind: ConditionKind) -> bool {
    conditions
        .iter()
        .find(|cond| cond.kind == kind)
        .map(|cond| cond.status == "True")
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn at_most_one_condition_per_type() {
        let mut conditions = Vec::new();
        set(&mut conditions, ConditionKind::Scaling, true, "ScalingUp", "1 -> 3");
        set(&mut conditions, ConditionKind::Scaling, true, "ScalingUp", "2 -> 3");
        set(&mut conditions, ConditionKind::Ready, false, "Scaling", "waiting");
        assert_eq!(conditions.len(), 2);
        assert_eq!(conditions[0].message, "2 -> 3");
    }

    #[test]
    fn transition_time_only_moves_on_status_flip() {
        let mut conditions = Vec::new();
        set(&mut conditions, ConditionKind::Ready, true, "AllReady", "3/3");
        let first = conditions[0].last_transition_time.clone().unwrap();
        // same status should keep the transition time
        set(&mut conditions, ConditionKind::Ready, true, "AllReady", "3/3");
        assert_eq!(conditions[0].last_transition_time.as_ref().unwrap().0, first.0);
        // a flip should move it
        set(&mut conditions, ConditionKind::Ready, false, "Scaling", "2/3");
        assert_eq!(conditions[0].status, "False");
        assert!(conditions[0].last_transition_time.as_ref().unwrap().0 >= first.0);
    }

    #[test]
    fn min_and_max_capacity_can_hold_together() {
        let mut conditions = Vec::new();
        set(&mut conditions, ConditionKind::AtMinCapacity, true, "AtMin", "");
        set(&mut conditions, ConditionKind::AtMaxCapacity, true, "AtMax", "");
        assert!(holds(&conditions, ConditionKind::AtMinCapacity));
        assert!(holds(&conditions, ConditionKind::AtMaxCapacity));
    }

    #[test]
    fn missing_conditions_do_not_hold() {
        assert!(!holds(&[], ConditionKind::Error));
    }
}
