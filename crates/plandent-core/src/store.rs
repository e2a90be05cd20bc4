//! Persistence boundary for reconciled plans
//!
//! `PlanStore` is the contract the pipeline saves through. Two
//! implementations ship here: an in-memory map for tests and short-lived
//! runs, and a directory of one JSON file per plan.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::StoreError;
use crate::plan::ReconciledTreatmentPlan;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlanId(Uuid);

impl PlanId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PlanId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PlanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for PlanId {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|_| StoreError::NotFound(s.to_string()))
    }
}

/// A saved plan with its store-assigned identity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredPlan {
    pub id: PlanId,
    pub saved_at: DateTime<Utc>,
    pub plan: ReconciledTreatmentPlan,
}

/// Summary of a stored plan for listing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanSummary {
    pub id: PlanId,
    pub title: String,
    pub patient: Option<String>,
    pub phase_count: usize,
    pub total_cost: f64,
    pub saved_at: DateTime<Utc>,
}

impl From<&StoredPlan> for PlanSummary {
    fn from(stored: &StoredPlan) -> Self {
        Self {
            id: stored.id,
            title: stored.plan.title.clone(),
            patient: stored.plan.patient_info.name.clone(),
            phase_count: stored.plan.statistics.phase_count,
            total_cost: stored.plan.statistics.total_cost,
            saved_at: stored.saved_at,
        }
    }
}

#[async_trait]
pub trait PlanStore: Send + Sync {
    /// Persist a plan and return its new id. Plans are never updated in place.
    async fn save(&self, plan: &ReconciledTreatmentPlan) -> Result<PlanId, StoreError>;

    async fn get(&self, id: PlanId) -> Result<StoredPlan, StoreError>;

    /// All plans, most recently saved first
    async fn list(&self) -> Result<Vec<PlanSummary>, StoreError>;
}

fn sort_recent_first(summaries: &mut [PlanSummary]) {
    summaries.sort_by(|a, b| b.saved_at.cmp(&a.saved_at));
}

#[derive(Default)]
pub struct MemoryPlanStore {
    plans: RwLock<HashMap<PlanId, StoredPlan>>,
}

impl MemoryPlanStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.plans.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.plans.read().await.is_empty()
    }
}

#[async_trait]
impl PlanStore for MemoryPlanStore {
    async fn save(&self, plan: &ReconciledTreatmentPlan) -> Result<PlanId, StoreError> {
        let stored = StoredPlan {
            id: PlanId::new(),
            saved_at: Utc::now(),
            plan: plan.clone(),
        };
        let id = stored.id;
        self.plans.write().await.insert(id, stored);
        Ok(id)
    }

    async fn get(&self, id: PlanId) -> Result<StoredPlan, StoreError> {
        self.plans
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn list(&self) -> Result<Vec<PlanSummary>, StoreError> {
        let mut summaries: Vec<PlanSummary> =
            self.plans.read().await.values().map(PlanSummary::from).collect();
        sort_recent_first(&mut summaries);
        Ok(summaries)
    }
}

/// One `<id>.json` file per plan in a directory
pub struct JsonFilePlanStore {
    dir: PathBuf,
}

impl JsonFilePlanStore {
    /// Open a store rooted at `dir`, creating it if needed
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Get the path for a specific plan
    pub fn plan_path(&self, id: PlanId) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    async fn load(path: &Path) -> Result<StoredPlan, StoreError> {
        let content = tokio::fs::read_to_string(path).await?;
        Ok(serde_json::from_str(&content)?)
    }
}

#[async_trait]
impl PlanStore for JsonFilePlanStore {
    async fn save(&self, plan: &ReconciledTreatmentPlan) -> Result<PlanId, StoreError> {
        let stored = StoredPlan {
            id: PlanId::new(),
            saved_at: Utc::now(),
            plan: plan.clone(),
        };
        let path = self.plan_path(stored.id);
        let content = serde_json::to_string_pretty(&stored)?;

        // Write then rename so a crash never leaves a half-written plan
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &path).await?;

        tracing::info!(id = %stored.id, path = ?path, "Saved plan");
        Ok(stored.id)
    }

    async fn get(&self, id: PlanId) -> Result<StoredPlan, StoreError> {
        let path = self.plan_path(id);
        if !tokio::fs::try_exists(&path).await? {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Self::load(&path).await
    }

    async fn list(&self) -> Result<Vec<PlanSummary>, StoreError> {
        let mut summaries = Vec::new();
        if !tokio::fs::try_exists(&self.dir).await? {
            return Ok(summaries);
        }

        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                match Self::load(&path).await {
                    Ok(stored) => summaries.push(PlanSummary::from(&stored)),
                    Err(e) => {
                        tracing::warn!("Failed to load plan {:?}: {}", path, e);
                    }
                }
            }
        }

        sort_recent_first(&mut summaries);
        Ok(summaries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn plan(patient: &str) -> ReconciledTreatmentPlan {
        crate::reconcile::reconcile(&json!({
            "patient": patient,
            "phases": [{
                "numero": 1,
                "nom": "Soins",
                "groupes_actes": [{
                    "type": "soins",
                    "actes": [{"libelle": "Détartrage", "cout": 60}]
                }]
            }]
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_memory_store_round_trip() {
        let store = MemoryPlanStore::new();
        let id = store.save(&plan("Jean")).await.unwrap();

        let stored = store.get(id).await.unwrap();
        assert_eq!(stored.id, id);
        assert_eq!(stored.plan.patient_info.name.as_deref(), Some("Jean"));
        assert_eq!(store.len().await, 1);

        let missing = store.get(PlanId::new()).await;
        assert!(matches!(missing, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_file_store_round_trip_and_listing() {
        let dir = tempdir().unwrap();
        let store = JsonFilePlanStore::open(dir.path().join("plans")).unwrap();

        let first = store.save(&plan("Jean")).await.unwrap();
        let second = store.save(&plan("Marie")).await.unwrap();
        assert!(store.plan_path(first).exists());

        let stored = store.get(second).await.unwrap();
        assert_eq!(stored.plan.patient_info.name.as_deref(), Some("Marie"));
        assert_eq!(stored.plan.statistics.total_cost, 60.0);

        let listed = store.list().await.unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed[0].saved_at >= listed[1].saved_at);
    }

    #[tokio::test]
    async fn test_file_store_skips_corrupt_files() {
        let dir = tempdir().unwrap();
        let store = JsonFilePlanStore::open(dir.path()).unwrap();
        store.save(&plan("Jean")).await.unwrap();
        std::fs::write(dir.path().join("broken.json"), "{not json").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let listed = store.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].patient.as_deref(), Some("Jean"));
    }

    #[test]
    fn test_plan_id_parse() {
        let id = PlanId::new();
        assert_eq!(id.to_string().parse::<PlanId>().unwrap(), id);
        assert!("plan-42".parse::<PlanId>().is_err());
    }
}
