//! The Life Strand: the full persistent record of an NPC.
//!
//! Validation and merge semantics live next to the data so that the store
//! and the summary worker agree on them. Unknown top-level fields are kept
//! verbatim in `extras` to stay forward-compatible with older writers.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StrandError;

pub const SCHEMA_VERSION: &str = "1.0";

pub const MAX_TRAITS: usize = 10;
pub const MAX_MOTIVATIONS: usize = 5;
pub const MAX_FEARS: usize = 5;
pub const MAX_VALUES: usize = 5;
pub const MAX_QUIRKS: usize = 3;
pub const MAX_KNOWLEDGE: usize = 100;
pub const MAX_MEMORIES: usize = 50;
pub const MAX_RELATIONSHIP_HISTORY: usize = 10;

const MAX_NAME_CHARS: usize = 100;
const MAX_HISTORY_CHARS: usize = 2000;
const MAX_EDUCATION_CHARS: usize = 500;
const MAX_ACTIVITY_CHARS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    #[default]
    Active,
    Inactive,
    Archived,
}

impl RecordStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::Archived => "archived",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EmotionalTone {
    Positive,
    Negative,
    #[default]
    Neutral,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Background {
    #[serde(default)]
    pub age: Option<u32>,
    #[serde(default)]
    pub occupation: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub history: Option<String>,
    #[serde(default)]
    pub family: Vec<String>,
    #[serde(default)]
    pub education: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Personality {
    #[serde(default)]
    pub traits: Vec<String>,
    #[serde(default)]
    pub motivations: Vec<String>,
    #[serde(default)]
    pub fears: Vec<String>,
    #[serde(default)]
    pub values: Vec<String>,
    #[serde(default)]
    pub quirks: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CurrentStatus {
    #[serde(default)]
    pub mood: Option<String>,
    #[serde(default)]
    pub health: Option<String>,
    #[serde(default)]
    pub energy: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub activity: Option<String>,
}

impl CurrentStatus {
    /// Shallow merge: fields present in `update` overwrite, absent fields
    /// are left alone.
    pub fn apply(&mut self, update: &CurrentStatus) {
        if update.mood.is_some() {
            self.mood.clone_from(&update.mood);
        }
        if update.health.is_some() {
            self.health.clone_from(&update.health);
        }
        if update.energy.is_some() {
            self.energy.clone_from(&update.energy);
        }
        if update.location.is_some() {
            self.location.clone_from(&update.location);
        }
        if update.activity.is_some() {
            self.activity.clone_from(&update.activity);
        }
    }

    /// Set a single named field. Unknown field names are rejected.
    pub fn set_field(&mut self, field: &str, value: &str) -> Result<(), StrandError> {
        match field {
            "mood" => self.mood = Some(value.to_string()),
            "health" => self.health = Some(value.to_string()),
            "energy" => self.energy = Some(value.to_string()),
            "location" => self.location = Some(value.to_string()),
            "activity" => self.activity = Some(value.to_string()),
            other => {
                return Err(StrandError::ValidationFailed(format!(
                    "unknown status field: {other}"
                )))
            }
        }
        Ok(())
    }
}

/// Relationship type vocabulary. Unknown values deserialize to `Other`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RelationKind {
    Family,
    Friend,
    Enemy,
    #[default]
    Acquaintance,
    Romantic,
    Colleague,
    Mentor,
    Student,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RelationStatus {
    Positive,
    Negative,
    #[default]
    Neutral,
    Complicated,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    #[serde(rename = "type", default)]
    pub kind: RelationKind,
    #[serde(default)]
    pub status: RelationStatus,
    #[serde(default = "default_intensity")]
    pub intensity: i32,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub history: Vec<String>,
}

impl Default for Relationship {
    fn default() -> Self {
        Self {
            kind: RelationKind::default(),
            status: RelationStatus::default(),
            intensity: default_intensity(),
            notes: String::new(),
            history: Vec::new(),
        }
    }
}

fn default_intensity() -> i32 {
    5
}

fn default_confidence() -> i32 {
    5
}

fn default_importance() -> i32 {
    5
}

fn default_schema_version() -> String {
    SCHEMA_VERSION.to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Knowledge {
    pub topic: String,
    pub content: String,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default = "default_confidence")]
    pub confidence: i32,
    #[serde(default)]
    pub acquired_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Memory {
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default = "default_importance")]
    pub importance: i32,
    #[serde(default)]
    pub emotional_impact: EmotionalTone,
    #[serde(default)]
    pub people_involved: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl Memory {
    /// Retention score: importance plus a recency boost (up to 2, decaying
    /// over 30 days) plus 1 for an emotionally charged memory.
    pub fn retention_score(&self, now: DateTime<Utc>) -> f64 {
        let days_old = (now - self.timestamp).num_days().max(0) as f64;
        let recency_boost = (2.0 - days_old / 15.0).max(0.0);
        let emotion_boost = match self.emotional_impact {
            EmotionalTone::Positive | EmotionalTone::Negative => 1.0,
            EmotionalTone::Neutral => 0.0,
        };
        f64::from(self.importance) + recency_boost + emotion_boost
    }
}

/// The persistent character record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifeStrand {
    #[serde(default)]
    pub id: Option<Uuid>,
    #[serde(default = "default_schema_version")]
    pub schema_version: String,
    pub name: String,
    #[serde(default)]
    pub faction: Option<String>,
    #[serde(default)]
    pub status: RecordStatus,
    #[serde(default)]
    pub background: Background,
    #[serde(default)]
    pub personality: Personality,
    #[serde(default)]
    pub current_status: CurrentStatus,
    #[serde(default)]
    pub relationships: BTreeMap<String, Relationship>,
    #[serde(default)]
    pub knowledge: Vec<Knowledge>,
    #[serde(default)]
    pub memories: Vec<Memory>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    /// Fields outside the closed schema, preserved verbatim.
    #[serde(flatten)]
    pub extras: serde_json::Map<String, serde_json::Value>,
}

impl LifeStrand {
    /// Minimal valid record: a name and one personality trait.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: None,
            schema_version: SCHEMA_VERSION.to_string(),
            name: name.into(),
            faction: None,
            status: RecordStatus::Active,
            background: Background::default(),
            personality: Personality {
                traits: vec!["friendly".to_string()],
                ..Personality::default()
            },
            current_status: CurrentStatus::default(),
            relationships: BTreeMap::new(),
            knowledge: Vec::new(),
            memories: Vec::new(),
            created_at: None,
            updated_at: None,
            extras: serde_json::Map::new(),
        }
    }

    /// Validate schema invariants beyond what the type system enforces.
    pub fn validate(&self) -> Result<(), StrandError> {
        if self.name.trim().is_empty() {
            return Err(StrandError::ValidationFailed("name must not be empty".into()));
        }
        if self.name.chars().count() > MAX_NAME_CHARS {
            return Err(StrandError::ValidationFailed(format!(
                "name exceeds {MAX_NAME_CHARS} characters"
            )));
        }
        if self.personality.traits.is_empty() {
            return Err(StrandError::ValidationFailed(
                "personality.traits must not be empty".into(),
            ));
        }
        if let Some(age) = self.background.age {
            if age > 200 {
                return Err(StrandError::ValidationFailed("age out of range".into()));
            }
        }
        for (person, rel) in &self.relationships {
            if !(1..=10).contains(&rel.intensity) {
                return Err(StrandError::ValidationFailed(format!(
                    "relationship intensity for {person} must be 1-10"
                )));
            }
        }
        for item in &self.knowledge {
            if !(1..=10).contains(&item.confidence) {
                return Err(StrandError::ValidationFailed(format!(
                    "knowledge confidence for '{}' must be 1-10",
                    item.topic
                )));
            }
        }
        for memory in &self.memories {
            if !(1..=10).contains(&memory.importance) {
                return Err(StrandError::ValidationFailed(
                    "memory importance must be 1-10".into(),
                ));
            }
        }
        Ok(())
    }

    /// Clamp text fields and array sizes to their storage caps.
    pub fn sanitize(&mut self) {
        truncate_chars(&mut self.name, MAX_NAME_CHARS);
        if let Some(history) = self.background.history.as_mut() {
            truncate_chars(history, MAX_HISTORY_CHARS);
        }
        if let Some(education) = self.background.education.as_mut() {
            truncate_chars(education, MAX_EDUCATION_CHARS);
        }
        if let Some(activity) = self.current_status.activity.as_mut() {
            truncate_chars(activity, MAX_ACTIVITY_CHARS);
        }
        self.personality.traits.truncate(MAX_TRAITS);
        self.personality.motivations.truncate(MAX_MOTIVATIONS);
        self.personality.fears.truncate(MAX_FEARS);
        self.personality.values.truncate(MAX_VALUES);
        self.personality.quirks.truncate(MAX_QUIRKS);
        self.knowledge.truncate(MAX_KNOWLEDGE);
        self.memories.truncate(MAX_MEMORIES);
        for rel in self.relationships.values_mut() {
            rel.intensity = rel.intensity.clamp(1, 10);
        }
    }

    /// Merge an update document into this record. Identity fields (`id`,
    /// `schema_version`, `created_at`) never change; `updated_at` is set by
    /// the store when it persists the result.
    pub fn merge(&mut self, update: &LifeStrandUpdate, now: DateTime<Utc>) {
        if let Some(name) = &update.name {
            self.name.clone_from(name);
        }
        if let Some(faction) = &update.faction {
            self.faction = Some(faction.clone());
        }
        if let Some(status) = update.status {
            self.status = status;
        }
        if let Some(background) = &update.background {
            self.background = background.clone();
        }
        if let Some(personality) = &update.personality {
            merge_trait_list(&mut self.personality.traits, &personality.traits, MAX_TRAITS);
            merge_trait_list(
                &mut self.personality.motivations,
                &personality.motivations,
                MAX_MOTIVATIONS,
            );
            merge_trait_list(&mut self.personality.fears, &personality.fears, MAX_FEARS);
            merge_trait_list(&mut self.personality.values, &personality.values, MAX_VALUES);
            merge_trait_list(&mut self.personality.quirks, &personality.quirks, MAX_QUIRKS);
        }
        if let Some(current_status) = &update.current_status {
            self.current_status.apply(current_status);
        }
        for (person, rel_update) in &update.relationships {
            let entry = self.relationships.entry(person.clone()).or_default();
            entry.apply(rel_update);
        }
        for item in &update.knowledge {
            self.upsert_knowledge(item.clone());
        }
        for memory in &update.memories {
            self.add_memory(memory.clone(), now);
        }
        for (key, value) in &update.extras {
            // Identity and bookkeeping fields never travel through extras.
            if matches!(
                key.as_str(),
                "id" | "schema_version" | "created_at" | "updated_at"
            ) {
                continue;
            }
            self.extras.insert(key.clone(), value.clone());
        }
    }

    /// Upsert by topic, case-insensitive; a duplicate topic replaces the
    /// existing item.
    pub fn upsert_knowledge(&mut self, item: Knowledge) {
        let topic = item.topic.to_lowercase();
        if let Some(existing) = self
            .knowledge
            .iter_mut()
            .find(|k| k.topic.to_lowercase() == topic)
        {
            *existing = item;
        } else {
            self.knowledge.push(item);
            self.knowledge.truncate(MAX_KNOWLEDGE);
        }
    }

    /// Append a memory (skipping exact duplicates), re-sort newest first,
    /// and prune to the cap by retention score.
    pub fn add_memory(&mut self, memory: Memory, now: DateTime<Utc>) {
        let duplicate = self
            .memories
            .iter()
            .any(|m| m.timestamp == memory.timestamp && m.content == memory.content);
        if !duplicate {
            self.memories.push(memory);
        }
        self.prune_memories(now);
    }

    /// Enforce the retention invariant: at most [`MAX_MEMORIES`] entries,
    /// sorted by timestamp descending. When over the cap, the entries with
    /// the lowest retention score are dropped.
    pub fn prune_memories(&mut self, now: DateTime<Utc>) {
        if self.memories.len() > MAX_MEMORIES {
            self.memories.sort_by(|a, b| {
                b.retention_score(now)
                    .partial_cmp(&a.retention_score(now))
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            self.memories.truncate(MAX_MEMORIES);
        }
        self.memories.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    }

    /// Canonical textual projection used to produce the record embedding.
    pub fn embedding_text(&self) -> String {
        let mut parts = Vec::new();
        parts.push(format!("Name: {}", self.name));
        if let Some(occupation) = &self.background.occupation {
            parts.push(format!("Occupation: {occupation}"));
        }
        if let Some(history) = &self.background.history {
            parts.push(format!("History: {history}"));
        }
        if let Some(education) = &self.background.education {
            parts.push(format!("Education: {education}"));
        }
        if !self.personality.traits.is_empty() {
            parts.push(format!("Traits: {}", self.personality.traits.join(", ")));
        }
        if !self.personality.motivations.is_empty() {
            parts.push(format!(
                "Motivations: {}",
                self.personality.motivations.join(", ")
            ));
        }
        if !self.personality.values.is_empty() {
            parts.push(format!("Values: {}", self.personality.values.join(", ")));
        }
        if let Some(location) = &self.current_status.location {
            parts.push(format!("Location: {location}"));
        }
        if let Some(activity) = &self.current_status.activity {
            parts.push(format!("Activity: {activity}"));
        }
        parts.join(" | ")
    }

    /// The location used for queryable columns: current status wins over
    /// background.
    pub fn effective_location(&self) -> Option<&str> {
        self.current_status
            .location
            .as_deref()
            .or(self.background.location.as_deref())
    }

    /// Trimmed projection for prompt building: top traits, a truncated
    /// history, recent memories.
    pub fn prompt_view(&self) -> LifeStrand {
        let mut view = self.clone();
        view.personality.traits.truncate(5);
        view.personality.motivations.truncate(3);
        view.personality.fears.truncate(2);
        if let Some(history) = view.background.history.as_mut() {
            truncate_chars(history, 500);
        }
        view.knowledge.truncate(10);
        if view.memories.len() > 5 {
            view.memories.truncate(5);
        }
        view
    }
}

impl Relationship {
    /// Per-person deep merge. History entries are append-only, capped to
    /// the last [`MAX_RELATIONSHIP_HISTORY`]; re-applying the same entry is
    /// a no-op.
    pub fn apply(&mut self, update: &RelationshipUpdate) {
        if let Some(kind) = update.kind {
            self.kind = kind;
        }
        if let Some(status) = update.status {
            self.status = status;
        }
        if let Some(intensity) = update.intensity {
            self.intensity = intensity.clamp(1, 10);
        }
        if let Some(notes) = &update.notes {
            self.notes.clone_from(notes);
        }
        for entry in &update.history {
            if !self.history.contains(entry) {
                self.history.push(entry.clone());
            }
        }
        if self.history.len() > MAX_RELATIONSHIP_HISTORY {
            let drop = self.history.len() - MAX_RELATIONSHIP_HISTORY;
            self.history.drain(..drop);
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RelationshipUpdate {
    #[serde(rename = "type", default)]
    pub kind: Option<RelationKind>,
    #[serde(default)]
    pub status: Option<RelationStatus>,
    #[serde(default)]
    pub intensity: Option<i32>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub history: Vec<String>,
}

/// A partial update document merged into a record, never assigned over it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LifeStrandUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub faction: Option<String>,
    #[serde(default)]
    pub status: Option<RecordStatus>,
    #[serde(default)]
    pub background: Option<Background>,
    #[serde(default)]
    pub personality: Option<Personality>,
    #[serde(default)]
    pub current_status: Option<CurrentStatus>,
    #[serde(default)]
    pub relationships: BTreeMap<String, RelationshipUpdate>,
    #[serde(default)]
    pub knowledge: Vec<Knowledge>,
    #[serde(default)]
    pub memories: Vec<Memory>,
    #[serde(flatten)]
    pub extras: serde_json::Map<String, serde_json::Value>,
}

impl LifeStrandUpdate {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.faction.is_none()
            && self.status.is_none()
            && self.background.is_none()
            && self.personality.is_none()
            && self.current_status.is_none()
            && self.relationships.is_empty()
            && self.knowledge.is_empty()
            && self.memories.is_empty()
            && self.extras.is_empty()
    }
}

fn merge_trait_list(existing: &mut Vec<String>, additions: &[String], cap: usize) {
    for item in additions {
        if !existing.contains(item) {
            existing.push(item.clone());
        }
    }
    existing.truncate(cap);
}

fn truncate_chars(text: &mut String, max_chars: usize) {
    if text.chars().count() > max_chars {
        let truncated: String = text.chars().take(max_chars).collect();
        // Back off to a word boundary so we never cut mid-word.
        match truncated.rsplit_once(' ') {
            Some((head, _)) if !head.is_empty() => *text = head.to_string(),
            _ => *text = truncated,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, day, 12, 0, 0).unwrap()
    }

    fn memory(content: &str, day: u32, importance: i32) -> Memory {
        Memory {
            content: content.to_string(),
            timestamp: ts(day),
            importance,
            emotional_impact: EmotionalTone::Neutral,
            people_involved: vec![],
            tags: vec![],
        }
    }

    #[test]
    fn validate_requires_traits() {
        let mut strand = LifeStrand::new("Alice");
        strand.personality.traits.clear();
        assert!(strand.validate().is_err());
    }

    #[test]
    fn validate_rejects_out_of_range_intensity() {
        let mut strand = LifeStrand::new("Alice");
        strand.relationships.insert(
            "Bob".to_string(),
            Relationship {
                intensity: 11,
                ..Relationship::default()
            },
        );
        assert!(strand.validate().is_err());
    }

    #[test]
    fn merge_is_idempotent() {
        let mut strand = LifeStrand::new("Alice");
        strand.personality.traits = vec!["analytical".to_string()];

        let update = LifeStrandUpdate {
            personality: Some(Personality {
                traits: vec!["curious".to_string()],
                ..Personality::default()
            }),
            memories: vec![memory("met a traveler", 10, 6)],
            knowledge: vec![Knowledge {
                topic: "Weather".to_string(),
                content: "It rains in spring".to_string(),
                source: None,
                confidence: 7,
                acquired_at: None,
            }],
            ..LifeStrandUpdate::default()
        };

        let now = ts(15);
        let mut once = strand.clone();
        once.merge(&update, now);
        let mut twice = once.clone();
        twice.merge(&update, now);
        assert_eq!(once, twice);
    }

    #[test]
    fn merge_preserves_identity_fields() {
        let mut strand = LifeStrand::new("Alice");
        strand.id = Some(Uuid::new_v4());
        strand.created_at = Some(ts(1));
        let id = strand.id;
        let created = strand.created_at;

        let mut update = LifeStrandUpdate::default();
        update
            .extras
            .insert("id".to_string(), serde_json::json!("override"));
        update
            .extras
            .insert("created_at".to_string(), serde_json::json!("override"));
        strand.merge(&update, ts(2));

        assert_eq!(strand.id, id);
        assert_eq!(strand.created_at, created);
        assert!(!strand.extras.contains_key("id"));
    }

    #[test]
    fn knowledge_upsert_is_case_insensitive() {
        let mut strand = LifeStrand::new("Alice");
        strand.upsert_knowledge(Knowledge {
            topic: "Harvest".to_string(),
            content: "old".to_string(),
            source: None,
            confidence: 5,
            acquired_at: None,
        });
        strand.upsert_knowledge(Knowledge {
            topic: "harvest".to_string(),
            content: "new".to_string(),
            source: None,
            confidence: 6,
            acquired_at: None,
        });
        assert_eq!(strand.knowledge.len(), 1);
        assert_eq!(strand.knowledge[0].content, "new");
    }

    #[test]
    fn memories_capped_and_sorted_descending() {
        let mut strand = LifeStrand::new("Alice");
        for i in 0..49 {
            strand
                .memories
                .push(memory(&format!("event {i}"), 1 + (i % 28) as u32, 5));
        }
        let now = ts(28);
        strand.add_memory(memory("m1", 27, 8), now);
        strand.add_memory(memory("m2", 28, 8), now);

        assert_eq!(strand.memories.len(), MAX_MEMORIES);
        assert!(strand.memories.iter().any(|m| m.content == "m1"));
        assert!(strand.memories.iter().any(|m| m.content == "m2"));
        for pair in strand.memories.windows(2) {
            assert!(pair[0].timestamp >= pair[1].timestamp);
        }
    }

    #[test]
    fn merge_into_a_nearly_full_record_evicts_the_oldest_memory() {
        let mut strand = LifeStrand::new("Alice");
        // 49 existing memories, one hour apart, oldest first.
        for i in 0..49u32 {
            strand.memories.push(Memory {
                content: format!("event {i}"),
                timestamp: ts(1) + chrono::Duration::hours(i64::from(i)),
                importance: 5,
                emotional_impact: EmotionalTone::Neutral,
                people_involved: vec![],
                tags: vec![],
            });
        }
        let oldest = strand.memories[0].content.clone();

        let update = LifeStrandUpdate {
            memories: vec![memory("m1", 20, 6), memory("m2", 21, 6)],
            ..LifeStrandUpdate::default()
        };
        strand.merge(&update, ts(22));

        assert_eq!(strand.memories.len(), MAX_MEMORIES);
        assert!(strand.memories.iter().any(|m| m.content == "m1"));
        assert!(strand.memories.iter().any(|m| m.content == "m2"));
        assert!(
            !strand.memories.iter().any(|m| m.content == oldest),
            "the oldest previous entry is evicted"
        );
        for pair in strand.memories.windows(2) {
            assert!(pair[0].timestamp >= pair[1].timestamp);
        }
    }

    #[test]
    fn no_op_merge_leaves_the_record_equal() {
        let mut strand = LifeStrand::new("Alice");
        strand.upsert_knowledge(Knowledge {
            topic: "weather".to_string(),
            content: "rainy springs".to_string(),
            source: None,
            confidence: 6,
            acquired_at: None,
        });
        let before = strand.clone();
        strand.merge(&LifeStrandUpdate::default(), ts(2));
        assert_eq!(strand, before);
    }

    #[test]
    fn relationship_history_keeps_last_ten() {
        let mut rel = Relationship::default();
        let update = RelationshipUpdate {
            history: (0..12).map(|i| format!("entry {i}")).collect(),
            ..RelationshipUpdate::default()
        };
        rel.apply(&update);
        assert_eq!(rel.history.len(), MAX_RELATIONSHIP_HISTORY);
        assert_eq!(rel.history.last().unwrap(), "entry 11");
    }

    #[test]
    fn trait_union_respects_caps() {
        let mut traits = vec!["a".to_string(), "b".to_string()];
        let additions: Vec<String> = (0..12).map(|i| format!("t{i}")).collect();
        merge_trait_list(&mut traits, &additions, MAX_TRAITS);
        assert_eq!(traits.len(), MAX_TRAITS);
        assert_eq!(traits[0], "a");
    }

    #[test]
    fn unknown_fields_round_trip() {
        let json = serde_json::json!({
            "name": "Alice",
            "personality": {"traits": ["kind"]},
            "custom_field": {"nested": true}
        });
        let strand: LifeStrand = serde_json::from_value(json).unwrap();
        assert!(strand.extras.contains_key("custom_field"));
        let back = serde_json::to_value(&strand).unwrap();
        assert_eq!(back["custom_field"]["nested"], serde_json::json!(true));
    }

    #[test]
    fn truncation_never_cuts_mid_word() {
        let mut text = "alpha beta gamma delta".to_string();
        truncate_chars(&mut text, 12);
        assert!(text.len() <= 12);
        assert!(!text.ends_with(' '));
        assert!("alpha beta gamma delta".starts_with(&text));
    }
}
