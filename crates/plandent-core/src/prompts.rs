//! Versioned extraction prompts and the output schemas they request
//!
//! Two variants are kept side by side:
//! - `Legacy`: nested phases / act groups / acts with costs
//! - `TaskBased`: a flat task list with dependency edges

use serde::{Deserialize, Serialize};
use serde_json::json;

/// Which prompt (and therefore which output shape) to request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptVariant {
    #[default]
    Legacy,
    TaskBased,
}

impl PromptVariant {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Legacy => "legacy",
            Self::TaskBased => "task_based",
        }
    }
}

impl std::fmt::Display for PromptVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

const LEGACY_PROMPT_VERSION: &str = "legacy-v4";
const TASK_PROMPT_VERSION: &str = "tasks-v2";

const LEGACY_PROMPT: &str = r#"Tu es un assistant spécialisé en odontologie. Le document joint est un devis dentaire.
Analyse-le et produis un plan de traitement structuré.

Réponds UNIQUEMENT avec un objet JSON valide, sans texte autour, avec exactement ces clés :
{
  "patient": "nom complet du patient",
  "date_devis": "date du devis au format AAAA-MM-JJ",
  "etat_general": ["constat clinique 1", "constat clinique 2"],
  "resume_langage_clair": "résumé du plan en langage simple pour le patient",
  "phases": [
    {
      "numero": 1,
      "nom": "nom court de la phase",
      "description": "objectif de la phase",
      "nombre_seances": 2,
      "groupes_actes": [
        {
          "type": "soins | chirurgie | prothèse | parodontologie | orthodontie | implantologie",
          "actes": [
            {
              "libelle": "intitulé de l'acte",
              "dents": [11, 12],
              "cout_unitaire": 100.0,
              "cout_total": 200.0
            }
          ],
          "sous_total": 200.0
        }
      ],
      "total_phase": 200.0
    }
  ]
}

Règles :
- Numérote les dents en notation FDI (11 à 48, 51 à 85).
- Les montants sont des nombres en euros, sans symbole.
- Si un acte concerne plusieurs dents, cout_total = cout_unitaire × nombre de dents.
- total_phase est la somme des sous_total de la phase.
- Ordonne les phases dans l'ordre clinique : urgences et assainissement, puis soins conservateurs, puis prothèse.
- N'invente aucune information absente du devis ; omets la clé si elle est inconnue."#;

const TASK_PROMPT: &str = r#"Tu es un assistant spécialisé en odontologie. Le document joint est un devis dentaire.
Transforme-le en liste de tâches planifiables.

Réponds UNIQUEMENT avec un objet JSON valide :
{
  "titre": "titre court du plan",
  "patient": "nom complet du patient",
  "taches": [
    {
      "id": "T1",
      "nom": "intitulé de la tâche",
      "phase": 1,
      "duree": {"valeur": 1, "unite": "heure | jour | semaine | mois"},
      "dependances": [],
      "dents": "11, 12"
    }
  ]
}

Règles :
- Les identifiants sont T1, T2, T3... dans l'ordre chronologique.
- dependances liste les id des tâches qui doivent être terminées avant celle-ci.
- Les dépendances ne forment jamais de cycle.
- La durée inclut le temps de cicatrisation ou de laboratoire nécessaire avant la tâche suivante.
- Sois concis : pas de texte hors du JSON."#;

/// Instructions sent with the document.
pub fn extraction_prompt(variant: PromptVariant) -> &'static str {
    match variant {
        PromptVariant::Legacy => LEGACY_PROMPT,
        PromptVariant::TaskBased => TASK_PROMPT,
    }
}

pub fn prompt_version(variant: PromptVariant) -> &'static str {
    match variant {
        PromptVariant::Legacy => LEGACY_PROMPT_VERSION,
        PromptVariant::TaskBased => TASK_PROMPT_VERSION,
    }
}

/// Output schema hint in the OpenAPI subset accepted by the model API.
pub fn output_schema(variant: PromptVariant) -> serde_json::Value {
    match variant {
        PromptVariant::Legacy => json!({
            "type": "object",
            "properties": {
                "patient": {"type": "string"},
                "date_devis": {"type": "string"},
                "etat_general": {"type": "array", "items": {"type": "string"}},
                "resume_langage_clair": {"type": "string"},
                "phases": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "numero": {"type": "integer"},
                            "nom": {"type": "string"},
                            "description": {"type": "string"},
                            "nombre_seances": {"type": "integer"},
                            "groupes_actes": {
                                "type": "array",
                                "items": {
                                    "type": "object",
                                    "properties": {
                                        "type": {"type": "string"},
                                        "actes": {
                                            "type": "array",
                                            "items": {
                                                "type": "object",
                                                "properties": {
                                                    "libelle": {"type": "string"},
                                                    "dents": {"type": "array", "items": {"type": "integer"}},
                                                    "cout": {"type": "number"},
                                                    "cout_unitaire": {"type": "number"},
                                                    "cout_total": {"type": "number"}
                                                },
                                                "required": ["libelle"]
                                            }
                                        },
                                        "sous_total": {"type": "number"}
                                    },
                                    "required": ["type", "actes"]
                                }
                            },
                            "total_phase": {"type": "number"}
                        },
                        "required": ["numero", "nom", "groupes_actes"]
                    }
                }
            },
            "required": ["phases"]
        }),
        PromptVariant::TaskBased => json!({
            "type": "object",
            "properties": {
                "titre": {"type": "string"},
                "patient": {"type": "string"},
                "taches": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "id": {"type": "string"},
                            "nom": {"type": "string"},
                            "phase": {"type": "integer"},
                            "duree": {
                                "type": "object",
                                "properties": {
                                    "valeur": {"type": "number"},
                                    "unite": {"type": "string", "enum": ["heure", "jour", "semaine", "mois"]}
                                },
                                "required": ["valeur", "unite"]
                            },
                            "dependances": {"type": "array", "items": {"type": "string"}},
                            "dents": {"type": "string"}
                        },
                        "required": ["id", "nom", "phase"]
                    }
                }
            },
            "required": ["taches"]
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompts_mention_their_shape_keys() {
        let legacy = extraction_prompt(PromptVariant::Legacy);
        assert!(legacy.contains("groupes_actes"));
        assert!(legacy.contains("total_phase"));

        let tasks = extraction_prompt(PromptVariant::TaskBased);
        assert!(tasks.contains("taches"));
        assert!(tasks.contains("dependances"));
    }

    #[test]
    fn test_schemas_require_shape_root() {
        assert_eq!(output_schema(PromptVariant::Legacy)["required"][0], "phases");
        assert_eq!(output_schema(PromptVariant::TaskBased)["required"][0], "taches");
    }

    #[test]
    fn test_variant_display() {
        assert_eq!(PromptVariant::Legacy.to_string(), "legacy");
        assert_eq!(PromptVariant::TaskBased.to_string(), "task_based");
    }

    #[test]
    fn test_prompt_versions_differ() {
        assert_ne!(
            prompt_version(PromptVariant::Legacy),
            prompt_version(PromptVariant::TaskBased)
        );
    }
}
