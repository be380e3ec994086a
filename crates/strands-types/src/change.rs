//! Typed change records produced by the post-conversation extractors.
//!
//! A `ChangeRecord` is a proposed mutation to a Life Strand. The payload is
//! a discriminated union keyed by `change_type` so that the applier can
//! admit changes structurally instead of probing dictionaries.

use serde::{Deserialize, Serialize};

use crate::life_strand::{
    EmotionalTone, Knowledge, Memory, RelationKind, RelationStatus,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    #[serde(flatten)]
    pub kind: ChangeKind,
    /// Extractor confidence in [0, 1]; clamped where values enter.
    pub confidence: f64,
    pub summary: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "change_type", content = "change_data", rename_all = "snake_case")]
pub enum ChangeKind {
    MemoryAdded(Memory),
    RelationshipUpdated(RelationshipChange),
    PersonalityChanged(PersonalityChange),
    KnowledgeLearned(Knowledge),
    StatusUpdated(StatusChange),
    EmotionalImpact(EmotionalImpactChange),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipChange {
    pub person: String,
    #[serde(rename = "type", default)]
    pub kind: RelationKind,
    #[serde(default)]
    pub status: RelationStatus,
    #[serde(default = "default_rel_intensity")]
    pub intensity: i32,
    #[serde(default)]
    pub notes: String,
}

fn default_rel_intensity() -> i32 {
    5
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersonalityField {
    TraitAdded,
    MotivationAdded,
    FearAdded,
    ValueAdded,
    QuirkAdded,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonalityChange {
    pub field: PersonalityField,
    pub item: String,
    #[serde(default)]
    pub reasoning: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusChange {
    pub field: String,
    #[serde(default)]
    pub old_value: Option<String>,
    pub new_value: String,
    #[serde(default)]
    pub reasoning: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmotionalImpactChange {
    pub tone: EmotionalTone,
    /// Intensity in [1, 10].
    pub intensity: i32,
    #[serde(default)]
    pub lasting_effect: String,
}

impl ChangeRecord {
    pub fn new(kind: ChangeKind, confidence: f64, summary: impl Into<String>) -> Self {
        Self {
            kind,
            confidence: confidence.clamp(0.0, 1.0),
            summary: summary.into(),
        }
    }

    pub fn change_type(&self) -> &'static str {
        match &self.kind {
            ChangeKind::MemoryAdded(_) => "memory_added",
            ChangeKind::RelationshipUpdated(_) => "relationship_updated",
            ChangeKind::PersonalityChanged(_) => "personality_changed",
            ChangeKind::KnowledgeLearned(_) => "knowledge_learned",
            ChangeKind::StatusUpdated(_) => "status_updated",
            ChangeKind::EmotionalImpact(_) => "emotional_impact",
        }
    }

    /// Structural admission check: the payload carries the per-type minimum
    /// fields the applier requires.
    pub fn has_required_fields(&self) -> bool {
        match &self.kind {
            ChangeKind::MemoryAdded(memory) => !memory.content.trim().is_empty(),
            ChangeKind::RelationshipUpdated(change) => !change.person.trim().is_empty(),
            ChangeKind::PersonalityChanged(change) => !change.item.trim().is_empty(),
            ChangeKind::KnowledgeLearned(knowledge) => {
                !knowledge.topic.trim().is_empty() && !knowledge.content.trim().is_empty()
            }
            ChangeKind::StatusUpdated(change) => {
                !change.field.trim().is_empty() && !change.new_value.trim().is_empty()
            }
            ChangeKind::EmotionalImpact(change) => (1..=10).contains(&change.intensity),
        }
    }
}
