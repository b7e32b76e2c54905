//! Post-migration integrity checks against the target database.
//!
//! Read-only. Findings are collected as plain issue strings; a check that
//! cannot run is itself reported as an issue so the remaining checks still
//! complete.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::Result;
use crate::mapper::Entity;
use crate::target::{TargetInspector, RELATIONS};

/// Maximum offending keys listed per check; the rest are summarized.
const MAX_LISTED: usize = 20;

/// Validation findings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub checked_at: DateTime<Utc>,
    /// Human-readable findings. Empty means no problems were found.
    pub issues: Vec<String>,
    /// Row count per target table.
    pub entity_counts: BTreeMap<String, i64>,
}

impl ValidationReport {
    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }
}

/// Runs integrity checks through a [`TargetInspector`].
pub struct ValidationEngine {
    inspector: Arc<dyn TargetInspector>,
}

impl ValidationEngine {
    pub fn new(inspector: Arc<dyn TargetInspector>) -> Self {
        Self { inspector }
    }

    /// Run every check. Fails only if the target cannot be counted at all.
    pub async fn validate(&self) -> Result<ValidationReport> {
        info!("Validating target data");
        let entity_counts = self.inspector.table_counts().await?;
        let mut issues = Vec::new();

        for relation in RELATIONS {
            let label = format!("{}.{}", relation.child, relation.fk_column);

            match self.inspector.orphaned_references(relation).await {
                Ok(keys) => list(
                    &mut issues,
                    &keys,
                    |k| format!("{} '{}' references a missing {} row", relation.child, k, relation.parent),
                ),
                Err(e) => issues.push(format!("orphan check on {} could not run: {}", label, e)),
            }

            match self.inspector.missing_references(relation).await {
                Ok(keys) => list(
                    &mut issues,
                    &keys,
                    |k| format!("{} '{}' has no {} ({} is NULL)", relation.child, k, relation.parent, label),
                ),
                Err(e) => issues.push(format!("missing-reference check on {} could not run: {}", label, e)),
            }
        }

        for entity in Entity::MIGRATION_ORDER {
            match self.inspector.duplicate_natural_keys(entity).await {
                Ok(dups) => list(&mut issues, &dups, |(key, n)| {
                    format!(
                        "{} {} '{}' appears {} times",
                        entity,
                        entity.natural_key_column(),
                        key,
                        n
                    )
                }),
                Err(e) => issues.push(format!("duplicate check on {} could not run: {}", entity, e)),
            }
        }

        match self.inspector.families_without_head().await {
            Ok(keys) => list(&mut issues, &keys, |k| {
                format!("family '{}' has no head of family", k)
            }),
            Err(e) => issues.push(format!("head-of-family check could not run: {}", e)),
        }

        if issues.is_empty() {
            info!("Validation passed: no issues found");
        } else {
            for issue in &issues {
                warn!("Validation: {}", issue);
            }
            warn!("Validation found {} issues", issues.len());
        }

        Ok(ValidationReport {
            checked_at: Utc::now(),
            issues,
            entity_counts,
        })
    }
}

fn list<T>(issues: &mut Vec<String>, items: &[T], describe: impl Fn(&T) -> String) {
    issues.extend(items.iter().take(MAX_LISTED).map(&describe));
    if items.len() > MAX_LISTED {
        issues.push(format!("... and {} more like the above", items.len() - MAX_LISTED));
    }
}
