//! Typed change extraction from a transcript.
//!
//! Each extractor formats a prompt around the current record, asks the
//! summary model for JSON, and projects the reply into `ChangeRecord`s.
//! Unparseable replies yield no changes rather than failing the job.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;

use strands_types::{
    change::{
        EmotionalImpactChange, PersonalityChange, PersonalityField, RelationshipChange,
        StatusChange,
    },
    ChangeKind, ChangeRecord, ChatMessage, EmotionalTone, Knowledge, LifeStrand, StrandError,
};

use crate::client::CompletionClient;
use crate::generator::format_transcript;

const EXTRACTION_MAX_TOKENS: u32 = 400;

/// Changes below this confidence are dropped at extraction time.
const MIN_CONFIDENCE: f64 = 0.4;

pub struct ChangeExtractor {
    model: Arc<dyn CompletionClient>,
}

impl std::fmt::Debug for ChangeExtractor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeExtractor").finish_non_exhaustive()
    }
}

impl ChangeExtractor {
    pub fn new(model: Arc<dyn CompletionClient>) -> Self {
        Self { model }
    }

    /// Run every extractor over the transcript and keep the confident
    /// results.
    pub async fn analyze_conversation(
        &self,
        transcript: &[ChatMessage],
        strand: &LifeStrand,
    ) -> Result<Vec<ChangeRecord>, StrandError> {
        if transcript.is_empty() {
            return Ok(Vec::new());
        }
        let formatted = format_transcript(transcript);
        let mut changes = Vec::new();
        changes.extend(self.personality_changes(&formatted, strand).await);
        changes.extend(self.relationship_changes(&formatted, strand).await);
        changes.extend(self.knowledge_learned(&formatted, strand).await);
        changes.extend(self.status_updates(&formatted, strand).await);
        if let Some(impact) = self.emotional_impact(&formatted, &strand.name).await {
            changes.push(impact);
        }
        let confident: Vec<ChangeRecord> = changes
            .into_iter()
            .filter(|c| c.confidence >= MIN_CONFIDENCE)
            .collect();
        tracing::info!(count = confident.len(), "extracted changes from conversation");
        Ok(confident)
    }

    async fn complete_json(&self, prompt: &str) -> Option<Value> {
        let raw = match self.model.complete(prompt, EXTRACTION_MAX_TOKENS).await {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(error = %e, "extraction completion failed");
                return None;
            }
        };
        match serde_json::from_str(raw.trim()) {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::debug!("extraction reply was not valid JSON");
                None
            }
        }
    }

    async fn personality_changes(
        &self,
        transcript: &str,
        strand: &LifeStrand,
    ) -> Vec<ChangeRecord> {
        let prompt = format!(
            "Analyze this conversation to identify changes to the NPC's personality traits, \
             motivations, or fears.\n\nCurrent NPC Profile:\nName: {}\nTraits: {:?}\n\
             Motivations: {:?}\nFears: {:?}\n\nConversation:\n{transcript}\n\nRespond with JSON \
             format:\n{{\"changes\": [{{\"type\": \
             \"trait_added|motivation_added|fear_added\", \"item\": \"specific item\", \
             \"confidence\": 0.0, \"reasoning\": \"brief explanation\"}}]}}",
            strand.name,
            strand.personality.traits,
            strand.personality.motivations,
            strand.personality.fears,
        );
        let Some(value) = self.complete_json(&prompt).await else {
            return Vec::new();
        };
        let Some(items) = value["changes"].as_array() else {
            return Vec::new();
        };
        items
            .iter()
            .filter_map(|item| {
                let field = match item["type"].as_str()? {
                    "trait_added" | "trait_modified" => PersonalityField::TraitAdded,
                    "motivation_added" => PersonalityField::MotivationAdded,
                    "fear_added" => PersonalityField::FearAdded,
                    "value_added" => PersonalityField::ValueAdded,
                    "quirk_added" => PersonalityField::QuirkAdded,
                    _ => return None,
                };
                let item_text = item["item"].as_str()?.trim().to_string();
                if item_text.is_empty() {
                    return None;
                }
                Some(ChangeRecord::new(
                    ChangeKind::PersonalityChanged(PersonalityChange {
                        field,
                        item: item_text.clone(),
                        reasoning: item["reasoning"].as_str().unwrap_or_default().to_string(),
                    }),
                    item["confidence"].as_f64().unwrap_or(0.5),
                    format!("Personality change: {item_text}"),
                ))
            })
            .collect()
    }

    async fn relationship_changes(
        &self,
        transcript: &str,
        strand: &LifeStrand,
    ) -> Vec<ChangeRecord> {
        let current = serde_json::to_string(&strand.relationships).unwrap_or_default();
        let prompt = format!(
            "Analyze this conversation for relationship changes or new relationships \
             formed.\n\nCurrent Relationships: {current}\nNPC Name: {}\n\n\
             Conversation:\n{transcript}\n\nRespond with JSON format:\n{{\"changes\": \
             [{{\"person\": \"person name\", \"relationship_type\": \
             \"friend|family|colleague|enemy|acquaintance|romantic|mentor|student\", \"status\": \
             \"positive|negative|neutral|complicated\", \"intensity\": 5, \"reasoning\": \
             \"explanation\"}}]}}",
            strand.name,
        );
        let Some(value) = self.complete_json(&prompt).await else {
            return Vec::new();
        };
        let Some(items) = value["changes"].as_array() else {
            return Vec::new();
        };
        items
            .iter()
            .filter_map(|item| {
                let person = item["person"].as_str()?.trim().to_string();
                if person.is_empty() {
                    return None;
                }
                let kind = serde_json::from_value(item["relationship_type"].clone())
                    .unwrap_or_default();
                let status = serde_json::from_value(item["status"].clone()).unwrap_or_default();
                let intensity = item["intensity"].as_i64().unwrap_or(5) as i32;
                Some(ChangeRecord::new(
                    ChangeKind::RelationshipUpdated(RelationshipChange {
                        person: person.clone(),
                        kind,
                        status,
                        intensity: intensity.clamp(1, 10),
                        notes: item["reasoning"].as_str().unwrap_or_default().to_string(),
                    }),
                    0.7,
                    format!("Relationship with {person} updated"),
                ))
            })
            .collect()
    }

    async fn knowledge_learned(&self, transcript: &str, strand: &LifeStrand) -> Vec<ChangeRecord> {
        let topics: Vec<&str> = strand.knowledge.iter().map(|k| k.topic.as_str()).collect();
        let prompt = format!(
            "Extract any new information, facts, or knowledge the NPC learned during this \
             conversation.\n\nNPC Name: {}\nCurrent Knowledge Topics: {topics:?}\n\n\
             Conversation:\n{transcript}\n\nRespond with JSON format:\n{{\"knowledge\": \
             [{{\"topic\": \"topic name\", \"content\": \"what was learned\", \"confidence\": 5, \
             \"source\": \"user\"}}]}}",
            strand.name,
        );
        let Some(value) = self.complete_json(&prompt).await else {
            return Vec::new();
        };
        let Some(items) = value["knowledge"].as_array() else {
            return Vec::new();
        };
        items
            .iter()
            .take(10)
            .filter_map(|item| {
                let topic = item["topic"].as_str()?.trim();
                let content = item["content"].as_str()?.trim();
                if topic.is_empty() || content.len() <= 10 {
                    return None;
                }
                let confidence = item["confidence"].as_i64().unwrap_or(5).clamp(1, 10) as i32;
                Some(ChangeRecord::new(
                    ChangeKind::KnowledgeLearned(Knowledge {
                        topic: topic.chars().take(100).collect(),
                        content: content.chars().take(500).collect(),
                        source: Some(
                            item["source"].as_str().unwrap_or("conversation").to_string(),
                        ),
                        confidence,
                        acquired_at: Some(Utc::now()),
                    }),
                    0.7,
                    format!("Learned about {topic}"),
                ))
            })
            .collect()
    }

    async fn status_updates(&self, transcript: &str, strand: &LifeStrand) -> Vec<ChangeRecord> {
        let status = &strand.current_status;
        let prompt = format!(
            "Analyze if the NPC's current status (mood, health, energy, location, activity) \
             should be updated based on this conversation.\n\nCurrent Status:\nMood: {}\nHealth: \
             {}\nEnergy: {}\nLocation: {}\nActivity: {}\n\nConversation:\n{transcript}\n\nOnly \
             suggest changes if clearly indicated. Respond with JSON \
             format:\n{{\"status_changes\": [{{\"field\": \
             \"mood|health|energy|location|activity\", \"new_value\": \"new value\", \
             \"confidence\": 0.0, \"reasoning\": \"explanation\"}}]}}",
            status.mood.as_deref().unwrap_or("neutral"),
            status.health.as_deref().unwrap_or("good"),
            status.energy.as_deref().unwrap_or("normal"),
            status.location.as_deref().unwrap_or("unknown"),
            status.activity.as_deref().unwrap_or("none"),
        );
        let Some(value) = self.complete_json(&prompt).await else {
            return Vec::new();
        };
        let Some(items) = value["status_changes"].as_array() else {
            return Vec::new();
        };
        items
            .iter()
            .filter_map(|item| {
                let field = item["field"].as_str()?.trim().to_string();
                let new_value = item["new_value"].as_str()?.trim().to_string();
                if field.is_empty() || new_value.is_empty() {
                    return None;
                }
                let old_value = match field.as_str() {
                    "mood" => status.mood.clone(),
                    "health" => status.health.clone(),
                    "energy" => status.energy.clone(),
                    "location" => status.location.clone(),
                    "activity" => status.activity.clone(),
                    _ => None,
                };
                Some(ChangeRecord::new(
                    ChangeKind::StatusUpdated(StatusChange {
                        field: field.clone(),
                        old_value,
                        new_value: new_value.clone(),
                        reasoning: item["reasoning"].as_str().unwrap_or_default().to_string(),
                    }),
                    item["confidence"].as_f64().unwrap_or(0.6),
                    format!("Status update: {field} -> {new_value}"),
                ))
            })
            .collect()
    }

    async fn emotional_impact(&self, transcript: &str, npc_name: &str) -> Option<ChangeRecord> {
        let prompt = format!(
            "Analyze the overall emotional impact this conversation had on the NPC \
             character.\n\nNPC Name: {npc_name}\nConversation:\n{transcript}\n\nRespond with \
             JSON format:\n{{\"emotional_impact\": {{\"tone\": \
             \"positive|negative|neutral\", \"intensity\": 5, \"lasting_effect\": \"brief \
             description\", \"confidence\": 0.0}}}}"
        );
        let value = self.complete_json(&prompt).await?;
        let impact = &value["emotional_impact"];
        let tone: EmotionalTone = serde_json::from_value(impact["tone"].clone()).ok()?;
        let intensity = impact["intensity"].as_i64().unwrap_or(5).clamp(1, 10) as i32;
        Some(ChangeRecord::new(
            ChangeKind::EmotionalImpact(EmotionalImpactChange {
                tone,
                intensity,
                lasting_effect: impact["lasting_effect"]
                    .as_str()
                    .unwrap_or_default()
                    .to_string(),
            }),
            impact["confidence"].as_f64().unwrap_or(0.5),
            format!("Emotional impact: {tone:?}"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use strands_types::MessageRole;

    /// Routes each extractor prompt to a canned JSON reply by a marker
    /// substring.
    struct RoutedModel;

    #[async_trait]
    impl CompletionClient for RoutedModel {
        async fn complete(&self, prompt: &str, _max_tokens: u32) -> Result<String, StrandError> {
            if prompt.contains("personality traits") {
                Ok(r#"{"changes": [{"type": "trait_added", "item": "generous", "confidence": 0.8, "reasoning": "shared food"}]}"#.to_string())
            } else if prompt.contains("relationship changes") {
                Ok(r#"{"changes": [{"person": "Bob", "relationship_type": "friend", "status": "positive", "intensity": 7, "reasoning": "helped out"}]}"#.to_string())
            } else if prompt.contains("new information") {
                Ok(r#"{"knowledge": [{"topic": "harvest", "content": "the harvest starts next week", "confidence": 8, "source": "user"}]}"#.to_string())
            } else if prompt.contains("current status") {
                Ok(r#"{"status_changes": [{"field": "mood", "new_value": "hopeful", "confidence": 0.7, "reasoning": "good news"}]}"#.to_string())
            } else {
                Ok(r#"{"emotional_impact": {"tone": "positive", "intensity": 6, "lasting_effect": "renewed optimism", "confidence": 0.75}}"#.to_string())
            }
        }
    }

    struct GarbageModel;

    #[async_trait]
    impl CompletionClient for GarbageModel {
        async fn complete(&self, _prompt: &str, _max_tokens: u32) -> Result<String, StrandError> {
            Ok("I'm sorry, I can't produce JSON today.".to_string())
        }
    }

    fn transcript() -> Vec<ChatMessage> {
        let at = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        vec![
            ChatMessage::new(MessageRole::User, "the harvest starts next week", at),
            ChatMessage::new(MessageRole::Assistant, "that is wonderful news", at),
        ]
    }

    #[tokio::test]
    async fn all_extractors_contribute_typed_changes() {
        let extractor = ChangeExtractor::new(Arc::new(RoutedModel));
        let strand = LifeStrand::new("Alice");
        let changes = extractor
            .analyze_conversation(&transcript(), &strand)
            .await
            .unwrap();

        let types: Vec<&str> = changes.iter().map(ChangeRecord::change_type).collect();
        assert!(types.contains(&"personality_changed"));
        assert!(types.contains(&"relationship_updated"));
        assert!(types.contains(&"knowledge_learned"));
        assert!(types.contains(&"status_updated"));
        assert!(types.contains(&"emotional_impact"));

        for change in &changes {
            assert!(change.confidence >= MIN_CONFIDENCE);
            assert!(change.has_required_fields());
        }
    }

    #[tokio::test]
    async fn non_json_replies_yield_no_changes() {
        let extractor = ChangeExtractor::new(Arc::new(GarbageModel));
        let strand = LifeStrand::new("Alice");
        let changes = extractor
            .analyze_conversation(&transcript(), &strand)
            .await
            .unwrap();
        assert!(changes.is_empty());
    }

    #[tokio::test]
    async fn empty_transcript_short_circuits() {
        let extractor = ChangeExtractor::new(Arc::new(RoutedModel));
        let strand = LifeStrand::new("Alice");
        let changes = extractor.analyze_conversation(&[], &strand).await.unwrap();
        assert!(changes.is_empty());
    }
}
