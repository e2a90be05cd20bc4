//! Treatment plan domain types
//!
//! These are the caller-facing shapes: partial snapshots relayed while a
//! response streams in, and the reconciled plan handed to persistence.
//! Model output uses French keys; everything here serializes in camelCase.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single billable act within a group, e.g. a crown on teeth 11-13.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Act {
    pub label: String,
    /// FDI tooth numbers
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub teeth: Vec<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit_cost: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_cost: Option<f64>,
}

impl Act {
    /// Best known amount billed for this act.
    pub fn effective_cost(&self) -> Option<f64> {
        self.total_cost.or(self.cost).or_else(|| {
            self.unit_cost
                .map(|unit| unit * self.teeth.len().max(1) as f64)
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActGroup {
    #[serde(rename = "type")]
    pub group_type: String,
    pub acts: Vec<Act>,
    pub subtotal: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Phase {
    pub number: u32,
    pub name: String,
    pub description: String,
    pub estimated_session_count: u32,
    pub act_groups: Vec<ActGroup>,
    pub phase_total: f64,
}

impl Phase {
    /// Sum of the group subtotals.
    pub fn computed_total(&self) -> f64 {
        self.act_groups.iter().map(|g| g.subtotal).sum()
    }

    pub fn act_count(&self) -> usize {
        self.act_groups.iter().map(|g| g.acts.len()).sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DurationUnit {
    Hour,
    Day,
    Week,
    Month,
}

impl DurationUnit {
    /// Parse a unit as written by the model, French or English, singular or plural.
    pub fn parse(raw: &str) -> Option<Self> {
        let unit = raw.trim().to_lowercase();
        let unit = unit.trim_end_matches('s');
        match unit {
            "h" | "hour" | "heure" => Some(Self::Hour),
            "d" | "j" | "day" | "jour" => Some(Self::Day),
            "w" | "week" | "semaine" | "sem" => Some(Self::Week),
            "m" | "month" | "moi" | "mois" => Some(Self::Month),
            _ => None,
        }
    }

    /// Length of one unit in calendar days.
    pub fn days(self) -> f64 {
        match self {
            Self::Hour => 1.0 / 24.0,
            Self::Day => 1.0,
            Self::Week => 7.0,
            Self::Month => 30.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TaskDuration {
    pub value: f64,
    pub unit: DurationUnit,
}

impl TaskDuration {
    pub fn in_days(&self) -> f64 {
        self.value * self.unit.days()
    }
}

/// One step of a task-based plan. Dependencies reference other task ids.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub name: String,
    pub phase: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<TaskDuration>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub teeth: Option<String>,
    /// Section name when the model grouped tasks into named sections
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
}

/// Best-effort knowledge about a plan while the response is still streaming.
///
/// A later snapshot never forgets a field an earlier one resolved; values
/// themselves may still be corrected until the stream completes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartialPlanSnapshot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patient: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_quote: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub general_state: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plain_summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phases: Option<Vec<Phase>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tasks: Option<Vec<Task>>,
}

impl PartialPlanSnapshot {
    /// Number of top-level fields with a resolved value.
    pub fn known_field_count(&self) -> usize {
        [
            self.patient.is_some(),
            self.date_quote.is_some(),
            self.general_state.is_some(),
            self.plain_summary.is_some(),
            self.phases.is_some(),
            self.tasks.is_some(),
        ]
        .into_iter()
        .filter(|known| *known)
        .count()
    }

    pub fn is_empty(&self) -> bool {
        self.known_field_count() == 0
    }

    /// Whether at least one phase or task has been resolved.
    pub fn has_plan_content(&self) -> bool {
        self.phases.as_ref().is_some_and(|p| !p.is_empty())
            || self.tasks.as_ref().is_some_and(|t| !t.is_empty())
    }

    /// Combine a fresh extraction with what was already known.
    ///
    /// Fields resolved in `previous` but missing from `self` are carried over.
    /// Lists keep the fresh items and fall back to earlier items past the end
    /// of the fresh list, so a list never shrinks.
    pub fn merged_over(self, previous: &PartialPlanSnapshot) -> PartialPlanSnapshot {
        PartialPlanSnapshot {
            patient: self.patient.or_else(|| previous.patient.clone()),
            date_quote: self.date_quote.or_else(|| previous.date_quote.clone()),
            general_state: merge_list(self.general_state, previous.general_state.as_ref()),
            plain_summary: self.plain_summary.or_else(|| previous.plain_summary.clone()),
            phases: merge_list(self.phases, previous.phases.as_ref()),
            tasks: merge_list(self.tasks, previous.tasks.as_ref()),
        }
    }

    /// Field-by-field comparison against an earlier snapshot.
    ///
    /// A newly resolved field, a changed value, or a list whose length
    /// changed all count as new information.
    pub fn has_new_information_since(&self, previous: &PartialPlanSnapshot) -> bool {
        fn changed<T: PartialEq>(now: &Option<T>, before: &Option<T>) -> bool {
            match (now, before) {
                (Some(now), Some(before)) => now != before,
                (Some(_), None) => true,
                _ => false,
            }
        }
        fn list_changed<T: PartialEq>(now: &Option<Vec<T>>, before: &Option<Vec<T>>) -> bool {
            match (now, before) {
                (Some(now), Some(before)) => now.len() != before.len() || now != before,
                (Some(_), None) => true,
                _ => false,
            }
        }

        changed(&self.patient, &previous.patient)
            || changed(&self.date_quote, &previous.date_quote)
            || changed(&self.plain_summary, &previous.plain_summary)
            || list_changed(&self.general_state, &previous.general_state)
            || list_changed(&self.phases, &previous.phases)
            || list_changed(&self.tasks, &previous.tasks)
    }
}

fn merge_list<T: Clone>(fresh: Option<Vec<T>>, previous: Option<&Vec<T>>) -> Option<Vec<T>> {
    match (fresh, previous) {
        (Some(mut fresh), Some(previous)) => {
            if previous.len() > fresh.len() {
                fresh.extend(previous[fresh.len()..].iter().cloned());
            }
            Some(fresh)
        }
        (Some(fresh), None) => Some(fresh),
        (None, previous) => previous.cloned(),
    }
}

/// Which of the known model output shapes a plan was reconciled from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanShape {
    /// `phases[].groupes_actes[].actes[]`
    LegacyPhases,
    /// Flat `taches[]` with dependency edges
    Tasks,
    /// `sections { name: task[] }`
    Sections,
}

impl PlanShape {
    pub fn is_task_based(self) -> bool {
        matches!(self, Self::Tasks | Self::Sections)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatientInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quote_date: Option<String>,
    #[serde(default)]
    pub general_state: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plain_summary: Option<String>,
}

/// Soft inconsistencies found while reconciling. Never fatal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PlanWarning {
    PhaseTotalMismatch {
        phase: u32,
        declared: f64,
        computed: f64,
    },
    SubtotalMismatch {
        phase: u32,
        group: String,
        declared: f64,
        computed: f64,
    },
    CostDisagreement {
        phase: u32,
        act: String,
        unit_cost: f64,
        total_cost: f64,
        teeth: usize,
    },
    DuplicateTaskId {
        id: String,
    },
    UnknownDependency {
        task: String,
        dependency: String,
    },
    DependencyCycle {
        tasks: Vec<String>,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanStatistics {
    pub phase_count: usize,
    pub act_group_count: usize,
    pub act_count: usize,
    pub task_count: usize,
    pub total_cost: f64,
    pub total_estimated_sessions: u32,
    /// Distinct FDI tooth numbers touched by any act, ascending
    pub teeth_treated: Vec<u32>,
    /// Longest dependency chain in days, task-based plans only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub critical_path_days: Option<f64>,
    pub warning_count: usize,
}

/// The single canonical plan shape handed to persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciledTreatmentPlan {
    pub title: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub referring_doctor_id: Option<String>,
    pub patient_info: PatientInfo,
    pub phases: Vec<Phase>,
    /// Parsed task list for task-based shapes; empty for legacy plans
    #[serde(default)]
    pub tasks: Vec<Task>,
    pub source_shape: PlanShape,
    /// Model output exactly as received, kept for audit and debugging
    pub raw_model_output: serde_json::Value,
    /// Response text as streamed, kept when `raw_model_output` had to be
    /// repaired or rebuilt from partial knowledge
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_model_text: Option<String>,
    pub statistics: PlanStatistics,
    #[serde(default)]
    pub warnings: Vec<PlanWarning>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_fingerprint: Option<String>,
    pub created_at: DateTime<Utc>,
}
