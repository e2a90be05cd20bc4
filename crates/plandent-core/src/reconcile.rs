//! Reconciliation of heterogeneous model output into the persisted plan shape
//!
//! Three shapes are recognized by their distinguishing key, searched
//! anywhere in the document:
//! - `phases[].groupes_actes[].actes[]` (legacy prompt)
//! - `taches[]` (task prompt)
//! - `sections { name: task[] }` (Mermaid-style grouping)
//!
//! Task-based shapes are wrapped into a single placeholder phase; their
//! dependency semantics are kept on the task list and in the raw output,
//! never translated into phases or acts.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use chrono::Utc;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::ReconcileError;
use crate::fields::{self, keys};
use crate::plan::{
    Act, ActGroup, DurationUnit, PartialPlanSnapshot, PatientInfo, Phase, PlanShape,
    PlanStatistics, PlanWarning, ReconciledTreatmentPlan, Task, TaskDuration,
};

/// Amounts closer than this are considered equal.
const COST_TOLERANCE: f64 = 0.01;

/// Name of the single phase wrapping a task-based plan.
const PLACEHOLDER_PHASE_NAME: &str = "Plan de traitement";

/// Caller-supplied context that the model output cannot provide.
#[derive(Debug, Clone, Default)]
pub struct PlanContext {
    pub referring_doctor_id: Option<String>,
    /// Overrides the title derived from the model output
    pub title: Option<String>,
    pub source_fingerprint: Option<String>,
}

/// Maps raw model output into a [`ReconciledTreatmentPlan`].
#[derive(Debug, Clone, Default)]
pub struct PlanReconciler {
    context: PlanContext,
}

impl PlanReconciler {
    pub fn new(context: PlanContext) -> Self {
        Self { context }
    }

    pub fn reconcile(&self, raw: &Value) -> Result<ReconciledTreatmentPlan, ReconcileError> {
        let Some((shape, root)) = locate_plan_root(raw) else {
            warn!("Model output matches no known plan shape");
            return Err(ReconcileError::UnrecognizedPlanShape { raw: raw.clone() });
        };
        debug!(?shape, "Reconciling model output");

        let mut diagnostics = Diagnostics::logging();
        let header = header_from(root, raw);

        let (phases, tasks) = match shape {
            PlanShape::LegacyPhases => {
                let phases = fields::array_field(root, keys::PHASES)
                    .map(|items| map_phases(items, &mut diagnostics))
                    .unwrap_or_default();
                (phases, Vec::new())
            }
            PlanShape::Tasks => {
                let tasks = fields::array_field(root, keys::TASKS)
                    .map(|items| map_tasks(items, None))
                    .unwrap_or_default();
                let title = self.title_for(root, &header);
                (vec![placeholder_phase(&title, &tasks)], tasks)
            }
            PlanShape::Sections => {
                let tasks = fields::lookup(root, keys::SECTIONS)
                    .map(|sections| map_sections(sections))
                    .unwrap_or_default();
                let title = self.title_for(root, &header);
                (vec![placeholder_phase(&title, &tasks)], tasks)
            }
        };

        let critical_path_days = if shape.is_task_based() {
            analyze_task_graph(&tasks, &mut diagnostics)
        } else {
            None
        };

        let title = self.title_for(root, &header);
        let description = fields::str_field(root, keys::DESCRIPTION)
            .or_else(|| header.plain_summary.clone())
            .unwrap_or_else(|| describe(&phases, &tasks));

        let warnings = diagnostics.into_warnings();
        let statistics = compute_statistics(&phases, &tasks, critical_path_days, warnings.len());

        Ok(ReconciledTreatmentPlan {
            title,
            description,
            referring_doctor_id: self.context.referring_doctor_id.clone(),
            patient_info: header,
            phases,
            tasks,
            source_shape: shape,
            raw_model_output: raw.clone(),
            raw_model_text: None,
            statistics,
            warnings,
            source_fingerprint: self.context.source_fingerprint.clone(),
            created_at: Utc::now(),
        })
    }

    fn title_for(&self, root: &Map<String, Value>, header: &PatientInfo) -> String {
        if let Some(title) = &self.context.title {
            return title.clone();
        }
        if let Some(title) = fields::str_field(root, keys::TITLE) {
            return title;
        }
        match &header.name {
            Some(patient) => format!("{PLACEHOLDER_PHASE_NAME} - {patient}"),
            None => PLACEHOLDER_PHASE_NAME.to_string(),
        }
    }
}

/// Reconcile without caller context.
pub fn reconcile(raw: &Value) -> Result<ReconciledTreatmentPlan, ReconcileError> {
    PlanReconciler::default().reconcile(raw)
}

/// Collects soft warnings; optionally logs them as they are found.
pub(crate) struct Diagnostics {
    warnings: Vec<PlanWarning>,
    log: bool,
}

impl Diagnostics {
    pub(crate) fn logging() -> Self {
        Self {
            warnings: Vec::new(),
            log: true,
        }
    }

    /// For intermediate mapping where warnings would only repeat.
    pub(crate) fn silent() -> Self {
        Self {
            warnings: Vec::new(),
            log: false,
        }
    }

    fn push(&mut self, warning: PlanWarning) {
        if self.log {
            warn!(?warning, "Plan inconsistency");
        }
        self.warnings.push(warning);
    }

    fn into_warnings(self) -> Vec<PlanWarning> {
        self.warnings
    }
}

/// Find the object carrying a shape's distinguishing key, breadth-first.
pub(crate) fn locate_plan_root(value: &Value) -> Option<(PlanShape, &Map<String, Value>)> {
    let mut queue = VecDeque::from([value]);
    while let Some(current) = queue.pop_front() {
        match current {
            Value::Object(obj) => {
                if let Some(shape) = shape_of(obj) {
                    return Some((shape, obj));
                }
                queue.extend(obj.values());
            }
            Value::Array(items) => queue.extend(items.iter()),
            _ => {}
        }
    }
    None
}

fn shape_of(obj: &Map<String, Value>) -> Option<PlanShape> {
    if fields::array_field(obj, keys::PHASES).is_some() {
        Some(PlanShape::LegacyPhases)
    } else if fields::array_field(obj, keys::TASKS).is_some() {
        Some(PlanShape::Tasks)
    } else if matches!(
        fields::lookup(obj, keys::SECTIONS),
        Some(Value::Object(_) | Value::Array(_))
    ) {
        Some(PlanShape::Sections)
    } else {
        None
    }
}

/// Patient header fields, read from the plan root and then the document root.
fn header_from(root: &Map<String, Value>, raw: &Value) -> PatientInfo {
    let outer = raw.as_object();
    let read = |keys: &[&str]| {
        fields::str_field(root, keys).or_else(|| outer.and_then(|o| fields::str_field(o, keys)))
    };
    let general_state = fields::array_field(root, keys::GENERAL_STATE)
        .or_else(|| outer.and_then(|o| fields::array_field(o, keys::GENERAL_STATE)))
        .map(|items| items.iter().filter_map(fields::as_text).collect())
        .unwrap_or_default();

    PatientInfo {
        name: read(keys::PATIENT),
        quote_date: read(keys::DATE_QUOTE),
        general_state,
        plain_summary: read(keys::PLAIN_SUMMARY),
    }
}

/// Typed view of a complete model answer, in the same shape as streaming snapshots.
pub fn snapshot_from_value(raw: &Value) -> PartialPlanSnapshot {
    let mut diagnostics = Diagnostics::silent();
    let Some((shape, root)) = locate_plan_root(raw) else {
        let header = raw.as_object().map(|obj| header_from(obj, raw)).unwrap_or_default();
        return snapshot_with_header(header);
    };
    let header = header_from(root, raw);
    let mut snapshot = snapshot_with_header(header);
    match shape {
        PlanShape::LegacyPhases => {
            snapshot.phases = fields::array_field(root, keys::PHASES)
                .map(|items| map_phases(items, &mut diagnostics));
        }
        PlanShape::Tasks => {
            snapshot.tasks = fields::array_field(root, keys::TASKS)
                .map(|items| map_tasks(items, None));
        }
        PlanShape::Sections => {
            snapshot.tasks = fields::lookup(root, keys::SECTIONS)
                .map(|sections| map_sections(sections));
        }
    }
    snapshot
}

fn snapshot_with_header(header: PatientInfo) -> PartialPlanSnapshot {
    PartialPlanSnapshot {
        patient: header.name,
        date_quote: header.quote_date,
        general_state: (!header.general_state.is_empty()).then_some(header.general_state),
        plain_summary: header.plain_summary,
        phases: None,
        tasks: None,
    }
}

// ============================================================================
// Legacy shape
// ============================================================================

pub(crate) fn map_phases(items: &[Value], diagnostics: &mut Diagnostics) -> Vec<Phase> {
    items
        .iter()
        .enumerate()
        .filter_map(|(index, item)| map_phase(item, index, diagnostics))
        .collect()
}

/// Map one phase object. `index` numbers phases that omit their number.
pub(crate) fn map_phase(value: &Value, index: usize, diagnostics: &mut Diagnostics) -> Option<Phase> {
    let obj = value.as_object()?;
    let number = fields::uint_field(obj, keys::NUMBER).unwrap_or(index as u32 + 1);

    let act_groups: Vec<ActGroup> = fields::array_field(obj, keys::ACT_GROUPS)
        .map(|groups| {
            groups
                .iter()
                .filter_map(|group| map_act_group(group, number, diagnostics))
                .collect()
        })
        .unwrap_or_default();

    let computed: f64 = act_groups.iter().map(|g| g.subtotal).sum();
    let phase_total = match fields::num_field(obj, keys::PHASE_TOTAL) {
        Some(declared) => {
            if !act_groups.is_empty() && !amounts_match(declared, computed) {
                diagnostics.push(PlanWarning::PhaseTotalMismatch {
                    phase: number,
                    declared,
                    computed,
                });
            }
            declared
        }
        None => computed,
    };

    Some(Phase {
        number,
        name: fields::str_field(obj, keys::NAME).unwrap_or_else(|| format!("Phase {number}")),
        description: fields::str_field(obj, keys::DESCRIPTION).unwrap_or_default(),
        estimated_session_count: fields::uint_field(obj, keys::SESSIONS).unwrap_or(0),
        act_groups,
        phase_total,
    })
}

fn map_act_group(value: &Value, phase: u32, diagnostics: &mut Diagnostics) -> Option<ActGroup> {
    let obj = value.as_object()?;
    let group_type = fields::str_field(obj, keys::GROUP_TYPE).unwrap_or_else(|| "autre".to_string());

    let acts: Vec<Act> = fields::array_field(obj, keys::ACTS)
        .map(|acts| {
            acts.iter()
                .filter_map(|act| map_act(act, phase, diagnostics))
                .collect()
        })
        .unwrap_or_default();

    let computed: f64 = acts.iter().filter_map(Act::effective_cost).sum();
    let subtotal = match fields::num_field(obj, keys::SUBTOTAL) {
        Some(declared) => {
            if acts.iter().any(|a| a.effective_cost().is_some()) && !amounts_match(declared, computed) {
                diagnostics.push(PlanWarning::SubtotalMismatch {
                    phase,
                    group: group_type.clone(),
                    declared,
                    computed,
                });
            }
            declared
        }
        None => computed,
    };

    Some(ActGroup {
        group_type,
        acts,
        subtotal,
    })
}

/// Map one act, inferring the missing side of unit/total cost from the tooth count.
pub(crate) fn map_act(value: &Value, phase: u32, diagnostics: &mut Diagnostics) -> Option<Act> {
    let obj = match value {
        Value::Object(obj) => obj,
        Value::String(label) if !label.trim().is_empty() => {
            return Some(Act {
                label: label.trim().to_string(),
                ..Default::default()
            })
        }
        _ => return None,
    };

    let teeth = fields::lookup(obj, keys::TEETH)
        .map(fields::teeth_from)
        .unwrap_or_default();
    let cost = fields::num_field(obj, keys::COST);
    let mut unit_cost = fields::num_field(obj, keys::UNIT_COST);
    let mut total_cost = fields::num_field(obj, keys::TOTAL_COST);
    let label = fields::str_field(obj, keys::LABEL).unwrap_or_default();

    let tooth_count = teeth.len() as f64;
    match (unit_cost, total_cost) {
        (Some(unit), None) if !teeth.is_empty() => total_cost = Some(unit * tooth_count),
        (None, Some(total)) if !teeth.is_empty() => unit_cost = Some(total / tooth_count),
        (Some(unit), Some(total)) if teeth.len() > 1 => {
            // Trust the input; only flag the disagreement
            if !amounts_match(unit * tooth_count, total) {
                diagnostics.push(PlanWarning::CostDisagreement {
                    phase,
                    act: label.clone(),
                    unit_cost: unit,
                    total_cost: total,
                    teeth: teeth.len(),
                });
            }
        }
        _ => {}
    }

    if label.is_empty() && cost.is_none() && unit_cost.is_none() && total_cost.is_none() {
        return None;
    }

    Some(Act {
        label,
        teeth,
        cost,
        unit_cost,
        total_cost,
    })
}

fn amounts_match(a: f64, b: f64) -> bool {
    (a - b).abs() <= COST_TOLERANCE
}

// ============================================================================
// Task-based shapes
// ============================================================================

pub(crate) fn map_tasks(items: &[Value], section: Option<&str>) -> Vec<Task> {
    items
        .iter()
        .enumerate()
        .filter_map(|(index, item)| map_task(item, index, section))
        .collect()
}

/// Map one task. Accepts both the `dependances` list and the single `apres` edge.
pub(crate) fn map_task(value: &Value, index: usize, section: Option<&str>) -> Option<Task> {
    let obj = value.as_object()?;

    let id = fields::str_field(obj, keys::TASK_ID);
    let name = fields::str_field(obj, keys::NAME);
    if id.is_none() && name.is_none() {
        return None;
    }

    let mut dependencies: Vec<String> = fields::lookup(obj, keys::DEPENDENCIES)
        .map(fields::id_list)
        .unwrap_or_default();
    for after in fields::lookup(obj, keys::AFTER).map(fields::id_list).unwrap_or_default() {
        if !dependencies.contains(&after) {
            dependencies.push(after);
        }
    }

    let teeth = fields::lookup(obj, keys::TEETH).and_then(|value| match value {
        Value::Array(items) => {
            let parts: Vec<String> = items.iter().filter_map(fields::as_text).collect();
            (!parts.is_empty()).then(|| parts.join(", "))
        }
        other => fields::as_text(other),
    });

    Some(Task {
        id: id.unwrap_or_else(|| format!("T{}", index + 1)),
        name: name.unwrap_or_default(),
        phase: fields::uint_field(obj, keys::TASK_PHASE).unwrap_or(1),
        duration: fields::lookup(obj, keys::DURATION).and_then(parse_duration),
        dependencies,
        teeth,
        section: section.map(str::to_string),
    })
}

/// `{"valeur": 2, "unite": "semaine"}`, `"2 semaines"` or a bare number of days.
fn parse_duration(value: &Value) -> Option<TaskDuration> {
    match value {
        Value::Object(obj) => {
            let value = fields::num_field(obj, keys::DURATION_VALUE)?;
            let unit = fields::str_field(obj, keys::DURATION_UNIT)
                .and_then(|u| DurationUnit::parse(&u))
                .unwrap_or(DurationUnit::Day);
            Some(TaskDuration { value, unit })
        }
        Value::Number(n) => Some(TaskDuration {
            value: n.as_f64()?,
            unit: DurationUnit::Day,
        }),
        Value::String(text) => {
            let text = text.trim();
            let split = text
                .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == ','))
                .unwrap_or(text.len());
            let value = fields::parse_amount(&text[..split])?;
            let unit = DurationUnit::parse(text[split..].trim()).unwrap_or(DurationUnit::Day);
            Some(TaskDuration { value, unit })
        }
        _ => None,
    }
}

/// Flatten `sections` into tasks. Sections are numbered as phases in order.
fn map_sections(sections: &Value) -> Vec<Task> {
    let mut tasks = Vec::new();
    let mut push_section = |name: &str, items: &[Value], phase: u32| {
        for mut task in map_tasks(items, Some(name)) {
            if task.phase <= 1 {
                task.phase = phase;
            }
            task.id = if tasks.iter().any(|t: &Task| t.id == task.id) {
                format!("{}-{}", name, task.id)
            } else {
                task.id
            };
            tasks.push(task);
        }
    };

    match sections {
        Value::Object(map) => {
            for (position, (name, items)) in map.iter().enumerate() {
                if let Some(items) = items.as_array() {
                    push_section(name, items, position as u32 + 1);
                }
            }
        }
        Value::Array(entries) => {
            for (position, entry) in entries.iter().enumerate() {
                let Some(obj) = entry.as_object() else { continue };
                let name = fields::str_field(obj, keys::NAME)
                    .unwrap_or_else(|| format!("Section {}", position + 1));
                if let Some(items) = fields::array_field(obj, keys::TASKS) {
                    push_section(&name, items, position as u32 + 1);
                }
            }
        }
        _ => {}
    }
    tasks
}

/// Wrap a task list into the single phase the persisted schema expects.
///
/// Each task becomes a label-only act; costs and dependencies stay out of it.
fn placeholder_phase(title: &str, tasks: &[Task]) -> Phase {
    let acts = tasks
        .iter()
        .map(|task| Act {
            label: if task.name.is_empty() {
                task.id.clone()
            } else {
                task.name.clone()
            },
            teeth: task
                .teeth
                .as_deref()
                .map(|t| fields::teeth_from(&Value::String(t.to_string())))
                .unwrap_or_default(),
            ..Default::default()
        })
        .collect();

    Phase {
        number: 1,
        name: title.to_string(),
        description: format!("{} tâche(s) planifiée(s)", tasks.len()),
        estimated_session_count: tasks.len() as u32,
        act_groups: vec![ActGroup {
            group_type: "taches".to_string(),
            acts,
            subtotal: 0.0,
        }],
        phase_total: 0.0,
    }
}

/// Validate dependency edges and return the longest chain duration in days.
///
/// Unknown dependencies are reported and ignored; a cycle is reported and
/// leaves the critical path undefined.
fn analyze_task_graph(tasks: &[Task], diagnostics: &mut Diagnostics) -> Option<f64> {
    if tasks.is_empty() {
        return None;
    }

    let mut index_of: HashMap<&str, usize> = HashMap::new();
    for (index, task) in tasks.iter().enumerate() {
        if index_of.insert(task.id.as_str(), index).is_some() {
            diagnostics.push(PlanWarning::DuplicateTaskId {
                id: task.id.clone(),
            });
        }
    }

    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); tasks.len()];
    let mut in_degree = vec![0usize; tasks.len()];
    for (index, task) in tasks.iter().enumerate() {
        let mut seen = HashSet::new();
        for dependency in &task.dependencies {
            match index_of.get(dependency.as_str()) {
                Some(&dep) if dep != index && seen.insert(dep) => {
                    dependents[dep].push(index);
                    in_degree[index] += 1;
                }
                Some(_) => {}
                None => diagnostics.push(PlanWarning::UnknownDependency {
                    task: task.id.clone(),
                    dependency: dependency.clone(),
                }),
            }
        }
    }

    // Kahn's algorithm, accumulating earliest finish times
    let duration = |task: &Task| task.duration.map(|d| d.in_days()).unwrap_or(0.0);
    let mut finish: Vec<f64> = tasks.iter().map(duration).collect();
    let mut ready: VecDeque<usize> = (0..tasks.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut visited = 0;

    while let Some(current) = ready.pop_front() {
        visited += 1;
        for &next in &dependents[current] {
            finish[next] = finish[next].max(finish[current] + duration(&tasks[next]));
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                ready.push_back(next);
            }
        }
    }

    if visited < tasks.len() {
        let cyclic: Vec<String> = (0..tasks.len())
            .filter(|&i| in_degree[i] > 0)
            .map(|i| tasks[i].id.clone())
            .collect();
        diagnostics.push(PlanWarning::DependencyCycle { tasks: cyclic });
        return None;
    }

    finish.into_iter().reduce(f64::max)
}

fn compute_statistics(
    phases: &[Phase],
    tasks: &[Task],
    critical_path_days: Option<f64>,
    warning_count: usize,
) -> PlanStatistics {
    let teeth: BTreeSet<u32> = phases
        .iter()
        .flat_map(|p| &p.act_groups)
        .flat_map(|g| &g.acts)
        .flat_map(|a| a.teeth.iter().copied())
        .collect();

    PlanStatistics {
        phase_count: phases.len(),
        act_group_count: phases.iter().map(|p| p.act_groups.len()).sum(),
        act_count: phases.iter().map(Phase::act_count).sum(),
        task_count: tasks.len(),
        total_cost: phases.iter().map(|p| p.phase_total).sum(),
        total_estimated_sessions: phases.iter().map(|p| p.estimated_session_count).sum(),
        teeth_treated: teeth.into_iter().collect(),
        critical_path_days,
        warning_count,
    }
}

fn describe(phases: &[Phase], tasks: &[Task]) -> String {
    if tasks.is_empty() {
        let acts: usize = phases.iter().map(Phase::act_count).sum();
        format!("{} phase(s), {} acte(s)", phases.len(), acts)
    } else {
        format!("{} tâche(s)", tasks.len())
    }
}
