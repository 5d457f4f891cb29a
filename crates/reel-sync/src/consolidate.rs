//! Consolidation planning: group duplicate participants and pick survivors.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use reel_core::{slugify, ConsolidationGroup, GroupKey, Participant};
use serde::{Deserialize, Serialize};

use crate::report::{Category, ReportBuilder, ReportEntry, Stage};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeepPolicy {
    #[default]
    MostRecent,
    Oldest,
}

impl KeepPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeepPolicy::MostRecent => "most_recent",
            KeepPolicy::Oldest => "oldest",
        }
    }
}

impl fmt::Display for KeepPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KeepPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "most_recent" | "newest" | "recent" => Ok(KeepPolicy::MostRecent),
            "oldest" | "first" => Ok(KeepPolicy::Oldest),
            other => Err(format!("unknown keep policy {other:?}")),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConsolidationPlan {
    pub groups: Vec<ConsolidationGroup>,
    pub singletons: usize,
}

impl ConsolidationPlan {
    pub fn delete_count(&self) -> usize {
        self.groups.iter().map(|g| g.delete_ids.len()).sum()
    }
}

pub struct Planner {
    policy: KeepPolicy,
    keep_names: Vec<String>,
}

impl Planner {
    pub fn new(policy: KeepPolicy, keep_names: &[String]) -> Self {
        Self {
            policy,
            keep_names: keep_names.iter().map(|n| n.trim().to_string()).collect(),
        }
    }

    /// Linked groups form on exact linking keys; participants without one group
    /// by the slug of their display name. The two kinds never mix.
    pub fn plan(&self, participants: &[Participant], report: &mut ReportBuilder) -> ConsolidationPlan {
        let mut buckets: BTreeMap<GroupKey, Vec<Participant>> = BTreeMap::new();
        for participant in participants {
            let key = match participant
                .linking_key
                .as_deref()
                .map(str::trim)
                .filter(|k| !k.is_empty())
            {
                Some(linking_key) => GroupKey::LinkingKey(linking_key.to_string()),
                None => {
                    let slug = slugify(&participant.display_name);
                    GroupKey::NameSlug(if slug.is_empty() {
                        participant.slug.clone()
                    } else {
                        slug
                    })
                }
            };
            buckets.entry(key).or_default().push(participant.clone());
        }

        let mut plan = ConsolidationPlan::default();
        for (key, mut members) in buckets {
            members.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
            if members.len() == 1 {
                let only = &members[0];
                report.record(
                    Category::NoActionNeeded,
                    ReportEntry::new(Stage::Plan, key.to_string())
                        .raw_name(only.display_name.clone())
                        .slug(only.slug.clone()),
                );
                plan.singletons += 1;
                continue;
            }

            let keep_id = self.choose_keep(&members);
            let delete_ids = members
                .iter()
                .map(|m| m.id)
                .filter(|id| *id != keep_id)
                .collect();
            plan.groups.push(ConsolidationGroup {
                key,
                keep_id,
                delete_ids,
                members,
            });
        }
        plan
    }

    /// `members` is sorted newest first.
    fn choose_keep(&self, members: &[Participant]) -> uuid::Uuid {
        let preferred = members
            .iter()
            .filter(|m| self.keep_names.iter().any(|n| n == m.display_name.trim()))
            .collect::<Vec<_>>();
        let pool = if preferred.is_empty() {
            members.iter().collect()
        } else {
            preferred
        };
        let chosen = match self.policy {
            KeepPolicy::MostRecent => pool.first(),
            KeepPolicy::Oldest => pool
                .iter()
                .min_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id))),
        };
        chosen.map(|m| m.id).unwrap_or(members[0].id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use uuid::Uuid;

    fn participant(id: u128, name: &str, slug: &str, day: u32, link: Option<&str>) -> Participant {
        Participant {
            id: Uuid::from_u128(id),
            display_name: name.to_string(),
            slug: slug.to_string(),
            linking_key: link.map(str::to_string),
            created_at: Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap(),
        }
    }

    #[test]
    fn unlinked_name_collision_keeps_most_recent() {
        let a = participant(1, "A", "a", 1, None);
        let b = participant(2, "A", "a-1", 2, None);
        let mut report = ReportBuilder::new();
        let plan = Planner::new(KeepPolicy::MostRecent, &[]).plan(&[a, b], &mut report);

        assert_eq!(plan.groups.len(), 1);
        let group = &plan.groups[0];
        assert_eq!(group.key, GroupKey::NameSlug("a".into()));
        assert_eq!(group.keep_id, Uuid::from_u128(2));
        assert_eq!(group.delete_ids, vec![Uuid::from_u128(1)]);
        assert_eq!(report.count(Category::NoActionNeeded), 0);
    }

    #[test]
    fn linked_and_unlinked_records_never_mix() {
        let participants = [
            participant(1, "Juan Pérez", "juan-perez", 1, Some("acct-9")),
            participant(2, "JP", "jp", 3, Some("acct-9")),
            participant(3, "Juan Perez", "juan-perez-1", 2, None),
        ];
        let mut report = ReportBuilder::new();
        let plan = Planner::new(KeepPolicy::Oldest, &[]).plan(&participants, &mut report);

        assert_eq!(plan.groups.len(), 1);
        assert_eq!(plan.groups[0].key, GroupKey::LinkingKey("acct-9".into()));
        assert_eq!(plan.groups[0].keep_id, Uuid::from_u128(1));
        assert_eq!(plan.singletons, 1);
        assert_eq!(report.entries(Category::NoActionNeeded)[0].key, "name:juan-perez");
    }

    #[test]
    fn keep_names_take_precedence_over_policy() {
        let participants = [
            participant(1, "Juan Pérez", "juan-perez", 1, None),
            participant(2, "Juan Perez", "juan-perez-1", 5, None),
        ];
        let keep = vec!["Juan Pérez".to_string()];
        let mut report = ReportBuilder::new();
        let plan = Planner::new(KeepPolicy::MostRecent, &keep).plan(&participants, &mut report);
        assert_eq!(plan.groups[0].keep_id, Uuid::from_u128(1));
        assert_eq!(plan.delete_count(), 1);
    }

    #[test]
    fn creation_ties_break_by_id() {
        let participants = [
            participant(9, "Kim", "kim-1", 1, None),
            participant(4, "KIM", "kim", 1, None),
        ];
        let mut report = ReportBuilder::new();
        let plan = Planner::new(KeepPolicy::MostRecent, &[]).plan(&participants, &mut report);
        assert_eq!(plan.groups[0].keep_id, Uuid::from_u128(4));
        assert_eq!(
            plan.groups[0].members.iter().map(|m| m.id).collect::<Vec<_>>(),
            vec![Uuid::from_u128(4), Uuid::from_u128(9)]
        );
    }
}
