use crate::types::TaskCategory;
use std::collections::BTreeMap;

/// Default agent pool for every task category.
pub fn default_agents() -> BTreeMap<String, Vec<String>> {
    let mut agents = BTreeMap::new();
    for category in TaskCategory::ALL {
        let members: &[&str] = match category {
            TaskCategory::LeadGen => LEAD_GEN_AGENTS,
            TaskCategory::Pipeline => PIPELINE_AGENTS,
            TaskCategory::Scheduling => SCHEDULING_AGENTS,
            TaskCategory::Research => RESEARCH_AGENTS,
            TaskCategory::Approval => APPROVAL_AGENTS,
            TaskCategory::System => SYSTEM_AGENTS,
        };
        agents.insert(
            category.as_str().to_string(),
            members.iter().map(|a| (*a).to_string()).collect(),
        );
    }
    agents
}

/// Consensus weight carried by each voter role.
pub fn default_role_weights() -> BTreeMap<String, f64> {
    ROLE_WEIGHTS
        .iter()
        .map(|(role, weight)| ((*role).to_string(), *weight))
        .collect()
}

/// Default voters as `(name, role)` pairs.
pub fn default_voters() -> Vec<(String, String)> {
    VOTERS
        .iter()
        .map(|(name, role)| ((*name).to_string(), (*role).to_string()))
        .collect()
}

const LEAD_GEN_AGENTS: &[&str] = &["prospector", "enricher"];
const PIPELINE_AGENTS: &[&str] = &["pipeline_manager", "deal_tracker"];
const SCHEDULING_AGENTS: &[&str] = &["calendar"];
const RESEARCH_AGENTS: &[&str] = &["researcher", "analyst"];
const APPROVAL_AGENTS: &[&str] = &["approver"];
const SYSTEM_AGENTS: &[&str] = &["maintainer"];

const ROLE_WEIGHTS: &[(&str, f64)] = &[("lead", 3.0), ("specialist", 2.0), ("observer", 1.0)];

const VOTERS: &[(&str, &str)] = &[
    ("orchestrator", "lead"),
    ("compliance", "specialist"),
    ("analyst", "observer"),
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_category_has_agents() {
        let agents = default_agents();
        assert_eq!(agents.len(), TaskCategory::ALL.len());
        assert!(agents.values().all(|members| !members.is_empty()));
    }

    #[test]
    fn test_default_voters_have_weights() {
        let weights = default_role_weights();
        for (_, role) in default_voters() {
            assert!(weights.contains_key(&role), "missing weight for {role}");
        }
        let total: f64 = default_voters().iter().map(|(_, r)| weights[r]).sum();
        assert!((total - 6.0).abs() < f64::EPSILON);
    }
}
