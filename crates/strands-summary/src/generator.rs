//! Summary, key-point, and memory-entry generation from a transcript.

use std::sync::Arc;

use chrono::Utc;

use strands_types::{ChatMessage, EmotionalTone, Memory, MessageRole, StrandError};

use crate::client::CompletionClient;

const SUMMARY_MAX_TOKENS: u32 = 200;
const KEY_POINTS_MAX_TOKENS: u32 = 300;
const MEMORY_MAX_TOKENS: u32 = 150;
const MAX_KEY_POINTS: usize = 5;
const MAX_SUMMARY_CHARS: usize = 500;

const EMOTIONAL_WORDS: [&str; 11] = [
    "excited", "worried", "happy", "sad", "angry", "surprised", "grateful", "frustrated", "proud",
    "disappointed", "nervous",
];
const PERSONAL_WORDS: [&str; 12] = [
    "personal", "private", "family", "childhood", "dream", "goal", "fear", "hope", "secret",
    "relationship", "love", "hate",
];
const CONFLICT_WORDS: [&str; 10] = [
    "conflict", "argument", "decision", "choice", "problem", "challenge", "crisis", "important",
    "urgent", "critical",
];
const LEARNING_WORDS: [&str; 8] = [
    "learned", "discovered", "realized", "understood", "explained", "taught", "revelation",
    "insight",
];
const POSITIVE_WORDS: [&str; 11] = [
    "happy", "excited", "pleased", "satisfied", "grateful", "proud", "successful", "achieved",
    "wonderful", "great", "excellent",
];
const NEGATIVE_WORDS: [&str; 11] = [
    "sad", "angry", "frustrated", "worried", "disappointed", "upset", "failed", "problem",
    "difficult", "challenging", "concerning",
];

pub struct SummaryGenerator {
    model: Arc<dyn CompletionClient>,
}

impl std::fmt::Debug for SummaryGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SummaryGenerator").finish_non_exhaustive()
    }
}

impl SummaryGenerator {
    pub fn new(model: Arc<dyn CompletionClient>) -> Self {
        Self { model }
    }

    /// A 2-3 sentence objective summary of the conversation.
    pub async fn generate_summary(
        &self,
        transcript: &[ChatMessage],
    ) -> Result<String, StrandError> {
        let formatted = format_transcript(transcript);
        if formatted.trim().is_empty() {
            return Ok("Brief conversation with no substantial content.".to_string());
        }
        let prompt = format!(
            "You are an expert conversation analyst. Create a concise summary of the following \
             conversation between a user and an NPC character.\n\nFocus on:\n- Key topics \
             discussed\n- Important information exchanged\n- Emotional tone and mood changes\n- \
             Any significant moments or revelations\n\nConversation:\n{formatted}\n\nProvide a \
             clear, objective summary in 2-3 sentences:"
        );
        let raw = self.model.complete(&prompt, SUMMARY_MAX_TOKENS).await?;
        Ok(clean_summary(&raw))
    }

    /// Up to five key points, parsed from a JSON array with a line-based
    /// fallback.
    pub async fn extract_key_points(
        &self,
        transcript: &[ChatMessage],
    ) -> Result<Vec<String>, StrandError> {
        if transcript.len() < 2 {
            return Ok(Vec::new());
        }
        let formatted = format_transcript(transcript);
        let prompt = format!(
            "Analyze the following conversation and extract the most important key points and \
             moments.\n\nConversation:\n{formatted}\n\nList the top 3-5 key points as a JSON \
             array of strings:"
        );
        let raw = self.model.complete(&prompt, KEY_POINTS_MAX_TOKENS).await?;
        Ok(parse_key_points(&raw))
    }

    /// Project the summary into a first-person memory entry with computed
    /// importance, emotional impact, and tags.
    pub async fn generate_memory_entry(
        &self,
        summary: &str,
        npc_name: &str,
    ) -> Result<Option<Memory>, StrandError> {
        if summary.trim().is_empty() {
            return Ok(None);
        }
        let prompt = format!(
            "Convert this conversation summary into a memory entry for the NPC \
             character.\n\nSummary: {summary}\nNPC Name: {npc_name}\nContext: This was a \
             conversation with a user.\n\nCreate a natural memory entry that the character would \
             have about this interaction. Write it from the NPC's perspective in first person:"
        );
        let content = self.model.complete(&prompt, MEMORY_MAX_TOKENS).await?;
        let content = content.trim().to_string();
        if content.is_empty() {
            return Ok(None);
        }
        Ok(Some(Memory {
            content,
            timestamp: Utc::now(),
            importance: memory_importance(summary),
            emotional_impact: emotional_tone(summary),
            people_involved: vec!["user".to_string()],
            tags: extract_tags(summary),
        }))
    }
}

pub fn format_transcript(transcript: &[ChatMessage]) -> String {
    transcript
        .iter()
        .filter(|m| !m.content.trim().is_empty())
        .map(|m| match m.role {
            MessageRole::User => format!("User: {}", m.content.trim()),
            MessageRole::Assistant => format!("NPC: {}", m.content.trim()),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn clean_summary(raw: &str) -> String {
    let mut summary = raw.trim().to_string();
    if let Some(stripped) = summary.strip_prefix("Summary:").or_else(|| summary.strip_prefix("summary:")) {
        summary = stripped.trim().to_string();
    }
    if summary.len() >= 2 && summary.starts_with('"') && summary.ends_with('"') {
        summary = summary[1..summary.len() - 1].to_string();
    }
    if summary.chars().count() > MAX_SUMMARY_CHARS {
        let mut kept = String::new();
        for sentence in summary.split_inclusive(['.', '!', '?']) {
            if kept.chars().count() + sentence.chars().count() > MAX_SUMMARY_CHARS - 50 {
                break;
            }
            kept.push_str(sentence);
        }
        summary = if kept.is_empty() {
            summary.chars().take(MAX_SUMMARY_CHARS).collect()
        } else {
            kept.trim().to_string()
        };
    }
    if summary.is_empty() {
        "Conversation occurred but content was not substantial.".to_string()
    } else {
        summary
    }
}

fn parse_key_points(raw: &str) -> Vec<String> {
    if let Ok(serde_json::Value::Array(items)) = serde_json::from_str(raw.trim()) {
        return items
            .into_iter()
            .filter_map(|v| v.as_str().map(str::trim).map(ToString::to_string))
            .filter(|s| !s.is_empty() && s.chars().count() <= 200)
            .take(MAX_KEY_POINTS)
            .collect();
    }
    // Fallback: one point per line, bullets and numbering stripped.
    raw.lines()
        .map(|line| {
            line.trim()
                .trim_start_matches(|c: char| {
                    c.is_ascii_digit() || matches!(c, '-' | '*' | '.' | ')' | ' ')
                })
                .trim()
        })
        .filter(|line| {
            !line.is_empty()
                && !line.starts_with('[')
                && !line.starts_with(']')
                && line.chars().count() <= 200
        })
        .take(MAX_KEY_POINTS)
        .map(ToString::to_string)
        .collect()
}

/// Importance heuristic: baseline 5, boosted by the emotional, personal,
/// conflict, and learning lexicons; short summaries lose a point.
pub fn memory_importance(summary: &str) -> i32 {
    let lower = summary.to_lowercase();
    let mut importance = 5;
    if EMOTIONAL_WORDS.iter().any(|w| lower.contains(w)) {
        importance += 1;
    }
    if PERSONAL_WORDS.iter().any(|w| lower.contains(w)) {
        importance += 1;
    }
    if CONFLICT_WORDS.iter().any(|w| lower.contains(w)) {
        importance += 1;
    }
    if LEARNING_WORDS.iter().any(|w| lower.contains(w)) {
        importance += 1;
    }
    if summary.chars().count() < 50 {
        importance -= 1;
    }
    importance.clamp(1, 10)
}

pub fn emotional_tone(summary: &str) -> EmotionalTone {
    let lower = summary.to_lowercase();
    let positive = POSITIVE_WORDS.iter().filter(|w| lower.contains(*w)).count();
    let negative = NEGATIVE_WORDS.iter().filter(|w| lower.contains(*w)).count();
    if positive > negative {
        EmotionalTone::Positive
    } else if negative > positive {
        EmotionalTone::Negative
    } else {
        EmotionalTone::Neutral
    }
}

pub fn extract_tags(summary: &str) -> Vec<String> {
    let lower = summary.to_lowercase();
    let topic_lexicon: [(&str, &[&str]); 9] = [
        ("work", &["work", "job", "career", "professional", "business"]),
        ("family", &["family", "parent", "child", "sibling", "relative"]),
        ("relationship", &["friend", "relationship", "partner", "dating"]),
        ("health", &["health", "medical", "doctor", "sick", "wellness"]),
        ("education", &["school", "study", "learn", "education", "knowledge"]),
        ("hobby", &["hobby", "interest", "passion", "recreation"]),
        ("travel", &["travel", "trip", "vacation", "journey", "visit"]),
        ("technology", &["technology", "computer", "software", "digital"]),
        ("personal_growth", &["growth", "improvement", "development"]),
    ];
    topic_lexicon
        .iter()
        .filter(|(_, keywords)| keywords.iter().any(|k| lower.contains(k)))
        .map(|(tag, _)| (*tag).to_string())
        .take(5)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;

    struct CannedModel(&'static str);

    #[async_trait]
    impl CompletionClient for CannedModel {
        async fn complete(&self, _prompt: &str, _max_tokens: u32) -> Result<String, StrandError> {
            Ok(self.0.to_string())
        }
    }

    fn message(role: MessageRole, content: &str) -> ChatMessage {
        ChatMessage::new(
            role,
            content,
            Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap(),
        )
    }

    #[tokio::test]
    async fn summary_is_cleaned() {
        let generator = SummaryGenerator::new(Arc::new(CannedModel(
            "Summary: \"They talked about the town market.\"",
        )));
        let transcript = vec![
            message(MessageRole::User, "how is the market?"),
            message(MessageRole::Assistant, "busy as ever"),
        ];
        let summary = generator.generate_summary(&transcript).await.unwrap();
        assert_eq!(summary, "They talked about the town market.");
    }

    #[tokio::test]
    async fn empty_transcript_short_circuits() {
        let generator = SummaryGenerator::new(Arc::new(CannedModel("ignored")));
        let summary = generator.generate_summary(&[]).await.unwrap();
        assert_eq!(summary, "Brief conversation with no substantial content.");
    }

    #[tokio::test]
    async fn key_points_parse_json_arrays() {
        let generator = SummaryGenerator::new(Arc::new(CannedModel(
            r#"["Met at the market", "Discussed grain prices", "Agreed to meet again"]"#,
        )));
        let transcript = vec![
            message(MessageRole::User, "a"),
            message(MessageRole::Assistant, "b"),
        ];
        let points = generator.extract_key_points(&transcript).await.unwrap();
        assert_eq!(points.len(), 3);
        assert_eq!(points[0], "Met at the market");
    }

    #[tokio::test]
    async fn key_points_fall_back_to_lines() {
        let generator = SummaryGenerator::new(Arc::new(CannedModel(
            "1. First point\n2. Second point\n- Third point",
        )));
        let transcript = vec![
            message(MessageRole::User, "a"),
            message(MessageRole::Assistant, "b"),
        ];
        let points = generator.extract_key_points(&transcript).await.unwrap();
        assert_eq!(
            points,
            vec!["First point", "Second point", "Third point"]
        );
    }

    #[test]
    fn importance_heuristic_boosts_by_lexicon() {
        let plain = "They exchanged routine pleasantries about the weather today in town.";
        assert_eq!(memory_importance(plain), 5);

        let charged = "She was excited to share a personal secret and learned an important lesson.";
        // emotional + personal + conflict(important) + learning = 9
        assert_eq!(memory_importance(charged), 9);

        assert_eq!(memory_importance("Short chat."), 4);
    }

    #[test]
    fn emotional_tone_counts_lexicon_words() {
        assert_eq!(
            emotional_tone("A wonderful and happy reunion, she was proud."),
            EmotionalTone::Positive
        );
        assert_eq!(
            emotional_tone("A difficult, frustrating argument left her upset."),
            EmotionalTone::Negative
        );
        assert_eq!(emotional_tone("They talked about bread."), EmotionalTone::Neutral);
    }

    #[test]
    fn tags_come_from_the_topic_lexicon() {
        let tags = extract_tags("They discussed her job and an upcoming trip to the coast.");
        assert!(tags.contains(&"work".to_string()));
        assert!(tags.contains(&"travel".to_string()));
    }

    #[tokio::test]
    async fn memory_entry_carries_computed_fields() {
        let generator = SummaryGenerator::new(Arc::new(CannedModel(
            "I met a traveler who asked about my family.",
        )));
        let memory = generator
            .generate_memory_entry("A happy talk about family and childhood.", "Alice")
            .await
            .unwrap()
            .unwrap();
        assert!(memory.content.starts_with("I met a traveler"));
        assert_eq!(memory.emotional_impact, EmotionalTone::Positive);
        assert!(memory.importance > 5);
        assert_eq!(memory.people_involved, vec!["user".to_string()]);
        assert!(memory.tags.contains(&"family".to_string()));
    }
}
