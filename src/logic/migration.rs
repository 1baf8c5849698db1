use chrono::Utc;

use crate::error::VcsResult;
use crate::logic::diff::SchemaDiff;
use crate::model::{
    ChangeCategory, ChangeType, DiffDocument, Feasibility, MigrationPlan, MigrationStep, RiskLevel,
    SchemaChange,
};
use crate::store::traits::Store;

pub struct MigrationPlanner;

impl MigrationPlanner {
    /// Steps that bring `target` to the schema of `source`.
    pub async fn plan_migration<S: Store>(
        store: &S,
        source: &str,
        target: &str,
    ) -> VcsResult<MigrationPlan> {
        let diff = SchemaDiff::compare_schemas(store, target, source).await?;
        Ok(Self::plan_from_diff(&diff))
    }

    /// Additions first, then modifications, then removals. Within a phase,
    /// objects others depend on come first, except for removals where
    /// dependents go first.
    pub fn plan_from_diff(diff: &DiffDocument) -> MigrationPlan {
        let mut ordered: Vec<&SchemaChange> = diff.changes.iter().collect();
        ordered.sort_by(|a, b| {
            phase(a.change_type)
                .cmp(&phase(b.change_type))
                .then_with(|| {
                    let (ra, rb) = (
                        a.identity.object_type.dependency_rank(),
                        b.identity.object_type.dependency_rank(),
                    );
                    if a.change_type == ChangeType::Removed {
                        rb.cmp(&ra)
                    } else {
                        ra.cmp(&rb)
                    }
                })
                .then_with(|| a.identity.cmp(&b.identity))
        });

        let steps: Vec<MigrationStep> = ordered
            .into_iter()
            .enumerate()
            .map(|(idx, change)| {
                let categorized = SchemaDiff::categorize_change(
                    change.identity.object_type,
                    change.change_type,
                    change.old_definition.as_deref(),
                    change.new_definition.as_deref(),
                );
                MigrationStep {
                    order: idx + 1,
                    identity: change.identity.clone(),
                    change_type: change.change_type,
                    category: categorized.category,
                    description: categorized.description,
                    definition: change.new_definition.clone(),
                }
            })
            .collect();

        let highest = steps.iter().map(|s| s.category).max();
        let risk_level = highest.map(RiskLevel::from).unwrap_or(RiskLevel::Low);
        let feasibility = if highest == Some(ChangeCategory::Breaking) {
            Feasibility::ManualReview
        } else {
            Feasibility::Automatic
        };

        MigrationPlan {
            source_branch: diff.to_branch.clone(),
            target_branch: diff.from_branch.clone(),
            steps,
            feasibility,
            risk_level,
            summary: diff.summary.clone(),
            generated_at: Utc::now(),
        }
    }
}

fn phase(change_type: ChangeType) -> u8 {
    match change_type {
        ChangeType::Added => 0,
        ChangeType::Modified => 1,
        ChangeType::Removed => 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DiffSummary, ObjectIdentity, ObjectType};

    fn change(object_type: ObjectType, name: &str, change_type: ChangeType) -> SchemaChange {
        let definition = format!("CREATE {} {}", object_type, name);
        SchemaChange {
            identity: ObjectIdentity::new(object_type, "public", name),
            change_type,
            old_hash: (change_type != ChangeType::Added).then(|| "old".to_string()),
            new_hash: (change_type != ChangeType::Removed).then(|| "new".to_string()),
            old_definition: (change_type != ChangeType::Added).then(|| definition.clone()),
            new_definition: (change_type != ChangeType::Removed).then(|| definition),
        }
    }

    fn diff(changes: Vec<SchemaChange>) -> DiffDocument {
        DiffDocument {
            from_branch: "main".into(),
            to_branch: "feature".into(),
            from_commit: None,
            to_commit: None,
            summary: DiffSummary::from_changes(&changes),
            changes,
        }
    }

    #[test]
    fn test_steps_are_ordered_by_phase_and_dependency() {
        let plan = MigrationPlanner::plan_from_diff(&diff(vec![
            change(ObjectType::View, "v_old", ChangeType::Removed),
            change(ObjectType::Table, "t_old", ChangeType::Removed),
            change(ObjectType::View, "v_new", ChangeType::Added),
            change(ObjectType::Table, "t_new", ChangeType::Added),
            change(ObjectType::Function, "f", ChangeType::Modified),
        ]));

        let names: Vec<&str> = plan
            .steps
            .iter()
            .map(|s| s.identity.object_name.as_str())
            .collect();
        assert_eq!(names, vec!["t_new", "v_new", "f", "v_old", "t_old"]);
        assert_eq!(plan.steps[0].order, 1);
        assert_eq!(plan.source_branch, "feature");
        assert_eq!(plan.target_branch, "main");
    }

    #[test]
    fn test_breaking_step_requires_review() {
        let plan = MigrationPlanner::plan_from_diff(&diff(vec![
            change(ObjectType::Table, "t_new", ChangeType::Added),
            change(ObjectType::Table, "t_old", ChangeType::Removed),
        ]));
        assert_eq!(plan.risk_level, RiskLevel::High);
        assert_eq!(plan.feasibility, Feasibility::ManualReview);
        assert_eq!(plan.breaking_steps().count(), 1);
    }

    #[test]
    fn test_empty_plan_is_low_risk() {
        let plan = MigrationPlanner::plan_from_diff(&diff(vec![]));
        assert!(plan.steps.is_empty());
        assert_eq!(plan.risk_level, RiskLevel::Low);
        assert_eq!(plan.feasibility, Feasibility::Automatic);
    }

    #[test]
    fn test_additive_plan_is_automatic() {
        let plan = MigrationPlanner::plan_from_diff(&diff(vec![
            change(ObjectType::Table, "t", ChangeType::Added),
            change(ObjectType::Index, "i", ChangeType::Added),
        ]));
        assert_eq!(plan.risk_level, RiskLevel::Low);
        assert_eq!(plan.feasibility, Feasibility::Automatic);
        assert_eq!(plan.count_by_type(ObjectType::Index), 1);
    }
}
