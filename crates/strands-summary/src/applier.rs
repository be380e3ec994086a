//! Admission and application of extracted changes.
//!
//! A change is auto-applied only when its type is in the applier's
//! vocabulary, its payload carries the per-type minimum fields, and its
//! confidence meets the threshold. Everything applied goes through the
//! store's merge rules; the rest is recorded as pending for review.

use std::collections::BTreeMap;
use std::sync::Arc;

use uuid::Uuid;

use strands_types::{
    change::{ChangeKind, PersonalityField},
    ChangeRecord, LifeStrandUpdate, Personality, RelationshipUpdate, StrandError,
};

use crate::client::NpcStore;

pub const DEFAULT_AUTO_THRESHOLD: f64 = 0.6;

#[derive(Debug, Clone)]
pub struct ChangeApplier {
    pub auto_threshold: f64,
}

impl Default for ChangeApplier {
    fn default() -> Self {
        Self {
            auto_threshold: DEFAULT_AUTO_THRESHOLD,
        }
    }
}

#[derive(Debug, Default)]
pub struct AppliedOutcome {
    pub applied: Vec<ChangeRecord>,
    pub pending: Vec<ChangeRecord>,
}

impl ChangeApplier {
    pub fn new(auto_threshold: f64) -> Self {
        Self {
            auto_threshold: auto_threshold.clamp(0.0, 1.0),
        }
    }

    /// Whether a single change qualifies for auto-application.
    pub fn is_auto_applicable(&self, change: &ChangeRecord) -> bool {
        change.has_required_fields() && change.confidence >= self.auto_threshold
    }

    /// Split changes into auto-applied and pending, apply the former (plus
    /// the memory entry, unconditionally) in one merged update.
    pub async fn apply(
        &self,
        store: &Arc<dyn NpcStore>,
        npc_id: Uuid,
        changes: Vec<ChangeRecord>,
        memory_entry: Option<strands_types::Memory>,
    ) -> Result<AppliedOutcome, StrandError> {
        let mut outcome = AppliedOutcome::default();
        for change in changes {
            if self.is_auto_applicable(&change) {
                outcome.applied.push(change);
            } else {
                outcome.pending.push(change);
            }
        }

        let mut update = build_update(&outcome.applied);
        if let Some(memory) = memory_entry {
            update.memories.push(memory);
        }
        if !update.is_empty() {
            let found = store.apply_update(npc_id, &update).await?;
            if !found {
                return Err(StrandError::NotFound);
            }
            tracing::info!(
                %npc_id,
                applied = outcome.applied.len(),
                pending = outcome.pending.len(),
                "applied character changes"
            );
        }
        Ok(outcome)
    }
}

/// Project change records into one update document for the merge rules.
pub fn build_update(changes: &[ChangeRecord]) -> LifeStrandUpdate {
    let mut update = LifeStrandUpdate::default();
    let mut relationships: BTreeMap<String, RelationshipUpdate> = BTreeMap::new();
    let mut personality = Personality::default();
    let mut touched_personality = false;

    for change in changes {
        match &change.kind {
            ChangeKind::MemoryAdded(memory) => update.memories.push(memory.clone()),
            ChangeKind::KnowledgeLearned(knowledge) => update.knowledge.push(knowledge.clone()),
            ChangeKind::RelationshipUpdated(rel) => {
                let entry = relationships.entry(rel.person.clone()).or_default();
                entry.kind = Some(rel.kind);
                entry.status = Some(rel.status);
                entry.intensity = Some(rel.intensity.clamp(1, 10));
                if !rel.notes.is_empty() {
                    entry.notes = Some(rel.notes.clone());
                    entry.history.push(rel.notes.clone());
                }
            }
            ChangeKind::PersonalityChanged(personality_change) => {
                touched_personality = true;
                let item = personality_change.item.clone();
                match personality_change.field {
                    PersonalityField::TraitAdded => personality.traits.push(item),
                    PersonalityField::MotivationAdded => personality.motivations.push(item),
                    PersonalityField::FearAdded => personality.fears.push(item),
                    PersonalityField::ValueAdded => personality.values.push(item),
                    PersonalityField::QuirkAdded => personality.quirks.push(item),
                }
            }
            ChangeKind::StatusUpdated(status_change) => {
                let current = update.current_status.get_or_insert_with(Default::default);
                if let Err(e) = current.set_field(&status_change.field, &status_change.new_value)
                {
                    tracing::warn!(error = %e, "skipping status change with unknown field");
                }
            }
            ChangeKind::EmotionalImpact(_) => {
                // Emotional impact is recorded on the summary, not merged
                // into the record directly.
            }
        }
    }

    if touched_personality {
        update.personality = Some(personality);
    }
    update.relationships = relationships;
    update
}
