//! Prompt construction from a Life Strand and recent history, bounded by a
//! token budget.
//!
//! Token counts are estimated at four characters per token unless a real
//! tokenizer is injected. Truncation prefers sentence boundaries and never
//! cuts mid-word.

use std::collections::HashSet;

use strands_types::{ChatMessage, LifeStrand, Memory, MessageRole};

/// Knowledge items below this Jaccard score are not worth including.
const RELEVANCE_THRESHOLD: f64 = 0.1;
const RELEVANT_KNOWLEDGE_LIMIT: usize = 3;
const MEMORY_CONTEXT_LIMIT: usize = 3;
const HISTORY_MESSAGE_LIMIT: usize = 10;
const QUERY_MESSAGE_LIMIT: usize = 5;

/// Pluggable token estimator; the default is chars/4.
pub trait TokenEstimator: Send + Sync {
    fn estimate(&self, text: &str) -> usize;
}

#[derive(Debug, Default)]
pub struct CharsPerFour;

impl TokenEstimator for CharsPerFour {
    fn estimate(&self, text: &str) -> usize {
        text.chars().count() / 4
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ContextBudgets {
    pub max_context_tokens: usize,
    pub system_prompt_tokens: usize,
    pub history_tokens: usize,
    pub knowledge_tokens: usize,
}

impl Default for ContextBudgets {
    fn default() -> Self {
        Self {
            max_context_tokens: 8192,
            system_prompt_tokens: 2048,
            history_tokens: 4096,
            knowledge_tokens: 2048,
        }
    }
}

pub struct ContextBuilder {
    budgets: ContextBudgets,
    estimator: Box<dyn TokenEstimator>,
}

impl std::fmt::Debug for ContextBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextBuilder")
            .field("budgets", &self.budgets)
            .finish_non_exhaustive()
    }
}

impl Default for ContextBuilder {
    fn default() -> Self {
        Self::new(ContextBudgets::default())
    }
}

impl ContextBuilder {
    pub fn new(budgets: ContextBudgets) -> Self {
        Self {
            budgets,
            estimator: Box::new(CharsPerFour),
        }
    }

    pub fn with_estimator(budgets: ContextBudgets, estimator: Box<dyn TokenEstimator>) -> Self {
        Self { budgets, estimator }
    }

    /// Deterministic system prompt from the character record. An empty
    /// record yields the single-sentence default persona.
    pub fn build_system_prompt(&self, strand: &LifeStrand) -> String {
        if strand.name.trim().is_empty() && strand.personality.traits.is_empty() {
            return "You are a helpful AI assistant.".to_string();
        }

        let mut parts = Vec::new();
        parts.push(format!(
            "You are {}, a character in a dynamic world.",
            strand.name
        ));

        let mut background_bits = Vec::new();
        if let Some(age) = strand.background.age {
            background_bits.push(format!("You are {age} years old"));
        }
        if let Some(occupation) = &strand.background.occupation {
            background_bits.push(format!("working as {occupation}"));
        }
        if let Some(location) = &strand.background.location {
            background_bits.push(format!("currently in {location}"));
        }
        if !background_bits.is_empty() {
            parts.push(format!("{}.", background_bits.join(", ")));
        }

        if !strand.personality.traits.is_empty() {
            let traits: Vec<&str> = strand
                .personality
                .traits
                .iter()
                .take(5)
                .map(String::as_str)
                .collect();
            parts.push(format!(
                "Your personality is characterized by being {}.",
                traits.join(", ")
            ));
        }
        if !strand.personality.motivations.is_empty() {
            let motivations: Vec<&str> = strand
                .personality
                .motivations
                .iter()
                .take(3)
                .map(String::as_str)
                .collect();
            parts.push(format!("You are motivated by: {}.", motivations.join("; ")));
        }
        if !strand.personality.fears.is_empty() {
            let fears: Vec<&str> = strand
                .personality
                .fears
                .iter()
                .take(2)
                .map(String::as_str)
                .collect();
            parts.push(format!("You have concerns about: {}.", fears.join("; ")));
        }

        let mut status_bits = Vec::new();
        if let Some(mood) = &strand.current_status.mood {
            status_bits.push(format!("feeling {mood}"));
        }
        if let Some(health) = &strand.current_status.health {
            if health != "normal" {
                status_bits.push(format!("your health is {health}"));
            }
        }
        if let Some(energy) = &strand.current_status.energy {
            if energy != "normal" {
                status_bits.push(format!("your energy level is {energy}"));
            }
        }
        if !status_bits.is_empty() {
            parts.push(format!("Currently, you are {}.", status_bits.join(", ")));
        }

        parts.push(
            "Respond naturally as this character would, staying true to your personality, \
             background, and current state. Keep responses conversational and in-character."
                .to_string(),
        );

        let prompt = parts.join(" ");
        self.truncate_to_budget(&prompt, self.budgets.system_prompt_tokens)
    }

    /// Ordered history context: relevant knowledge, salient relationships,
    /// recent memories, then the last ten messages.
    pub fn build_history_context(&self, strand: &LifeStrand, history: &[ChatMessage]) -> String {
        let mut sections = Vec::new();

        let knowledge_block = self.relevant_knowledge_block(strand, history);
        if !knowledge_block.is_empty() {
            sections.push(knowledge_block);
        }

        let relationships = relationship_context(strand, history);
        if !relationships.is_empty() {
            sections.push(relationships);
        }

        let memories = memory_context(&strand.memories);
        if !memories.is_empty() {
            sections.push(memories);
        }

        let formatted_history = format_history(history);
        if !formatted_history.is_empty() {
            sections.push(formatted_history);
        }

        let context = sections.join("\n\n");
        let budget = self.budgets.history_tokens.min(
            self.budgets
                .max_context_tokens
                .saturating_sub(self.budgets.system_prompt_tokens),
        );
        self.truncate_to_budget(&context, budget)
    }

    /// The full prompt as sent to the model service.
    pub fn build_prompt(
        &self,
        strand: &LifeStrand,
        history: &[ChatMessage],
        user_message: &str,
    ) -> String {
        let system_prompt = self.build_system_prompt(strand);
        let context = self.build_history_context(strand, history);
        if context.is_empty() {
            format!("{system_prompt}\n\nUser: {user_message}\nAssistant:")
        } else {
            format!("{system_prompt}\n\n{context}\n\nUser: {user_message}\nAssistant:")
        }
    }

    fn relevant_knowledge_block(&self, strand: &LifeStrand, history: &[ChatMessage]) -> String {
        let relevant = relevant_knowledge(strand, history);
        if relevant.is_empty() {
            return String::new();
        }
        let block = relevant
            .into_iter()
            .map(|content| format!("Relevant knowledge: {content}"))
            .collect::<Vec<_>>()
            .join("\n");
        self.truncate_to_budget(&block, self.budgets.knowledge_tokens)
    }

    /// Truncate at sentence boundaries to fit the token budget; fall back
    /// to the nearest word boundary. Never returns a mid-word cut.
    pub fn truncate_to_budget(&self, text: &str, token_limit: usize) -> String {
        let estimated = self.estimator.estimate(text);
        if estimated <= token_limit {
            return text.to_string();
        }
        // Scale the character target by the estimator's observed density so
        // a custom tokenizer still lands under the budget.
        let total_chars = text.chars().count();
        let target_chars = (total_chars * token_limit / estimated.max(1)).max(1);

        let mut kept = String::new();
        for sentence in split_sentences(text) {
            if kept.chars().count() + sentence.chars().count() + 1 > target_chars {
                break;
            }
            if !kept.is_empty() {
                kept.push(' ');
            }
            kept.push_str(sentence.trim());
        }

        if kept.is_empty() {
            // No whole sentence fits; cut at a word boundary instead.
            let hard: String = text.chars().take(target_chars).collect();
            kept = match hard.rsplit_once(' ') {
                Some((head, _)) if !head.is_empty() => head.to_string(),
                _ => hard,
            };
        }
        kept.trim_end().to_string()
    }
}

fn split_sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;
    let bytes = text.char_indices().collect::<Vec<_>>();
    for (i, (offset, c)) in bytes.iter().enumerate() {
        if matches!(c, '.' | '!' | '?') {
            let next_is_space = bytes
                .get(i + 1)
                .map(|(_, next)| next.is_whitespace())
                .unwrap_or(true);
            if next_is_space {
                let end = offset + c.len_utf8();
                sentences.push(text[start..end].trim());
                start = end;
            }
        }
    }
    if start < text.len() {
        let tail = text[start..].trim();
        if !tail.is_empty() {
            sentences.push(tail);
        }
    }
    sentences
}

fn word_set(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(ToString::to_string)
        .collect()
}

fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.union(b).count();
    if union == 0 {
        0.0
    } else {
        intersection as f64 / union as f64
    }
}

/// Top knowledge items by Jaccard similarity between the last user messages
/// and each item's topic plus content. Empty query history yields nothing.
fn relevant_knowledge(strand: &LifeStrand, history: &[ChatMessage]) -> Vec<String> {
    let query_text: String = history
        .iter()
        .rev()
        .filter(|m| m.role == MessageRole::User)
        .take(QUERY_MESSAGE_LIMIT)
        .map(|m| m.content.as_str())
        .collect::<Vec<_>>()
        .join(" ");
    if query_text.is_empty() || strand.knowledge.is_empty() {
        return Vec::new();
    }
    let query_words = word_set(&query_text);

    let mut scored: Vec<(f64, &str)> = strand
        .knowledge
        .iter()
        .filter_map(|item| {
            let item_words = word_set(&format!("{} {}", item.topic, item.content));
            let score = jaccard(&query_words, &item_words);
            (score >= RELEVANCE_THRESHOLD).then_some((score, item.content.as_str()))
        })
        .collect();
    scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
    scored
        .into_iter()
        .take(RELEVANT_KNOWLEDGE_LIMIT)
        .map(|(_, content)| content.to_string())
        .collect()
}

/// Relationships worth mentioning: anyone named in the conversation, padded
/// with the first couple of entries otherwise.
fn relationship_context(strand: &LifeStrand, history: &[ChatMessage]) -> String {
    if strand.relationships.is_empty() {
        return String::new();
    }
    let mentioned: HashSet<&str> = history
        .iter()
        .flat_map(|m| {
            m.content.split_whitespace().filter(|w| {
                w.chars().next().is_some_and(char::is_uppercase)
                    && w.chars().all(char::is_alphanumeric)
            })
        })
        .collect();

    let mut described = Vec::new();
    for (name, rel) in &strand.relationships {
        if mentioned.contains(name.as_str()) || described.len() < 2 {
            let kind = format!("{:?}", rel.kind).to_lowercase();
            let status = format!("{:?}", rel.status).to_lowercase();
            let mut line = format!("{name} ({kind}, {status})");
            if !rel.notes.is_empty() {
                line.push_str(&format!(": {}", rel.notes));
            }
            described.push(line);
        }
    }
    if described.is_empty() {
        String::new()
    } else {
        format!("Relationships: {}", described.join("; "))
    }
}

fn memory_context(memories: &[Memory]) -> String {
    if memories.is_empty() {
        return String::new();
    }
    let now = chrono::Utc::now();
    let mut sorted: Vec<&Memory> = memories.iter().collect();
    sorted.sort_by(|a, b| {
        b.retention_score(now)
            .partial_cmp(&a.retention_score(now))
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    let contents: Vec<&str> = sorted
        .into_iter()
        .take(MEMORY_CONTEXT_LIMIT)
        .map(|m| m.content.as_str())
        .collect();
    format!("Recent memories: {}", contents.join("; "))
}

fn format_history(history: &[ChatMessage]) -> String {
    let start = history.len().saturating_sub(HISTORY_MESSAGE_LIMIT);
    history[start..]
        .iter()
        .map(|m| match m.role {
            MessageRole::User => format!("User: {}", m.content),
            MessageRole::Assistant => format!("You: {}", m.content),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use strands_types::{Knowledge, Memory};

    fn message(role: MessageRole, content: &str) -> ChatMessage {
        ChatMessage::new(
            role,
            content,
            Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap(),
        )
    }

    fn knowledge(topic: &str, content: &str) -> Knowledge {
        Knowledge {
            topic: topic.to_string(),
            content: content.to_string(),
            source: None,
            confidence: 7,
            acquired_at: None,
        }
    }

    #[test]
    fn empty_record_gets_default_persona() {
        let builder = ContextBuilder::default();
        let mut strand = LifeStrand::new("");
        strand.personality.traits.clear();
        assert_eq!(
            builder.build_system_prompt(&strand),
            "You are a helpful AI assistant."
        );
        assert!(builder.build_history_context(&strand, &[]).is_empty());
    }

    #[test]
    fn system_prompt_includes_identity_background_and_traits() {
        let builder = ContextBuilder::default();
        let mut strand = LifeStrand::new("Alice");
        strand.background.age = Some(28);
        strand.background.occupation = Some("engineer".to_string());
        strand.background.location = Some("Tech District".to_string());
        strand.personality.traits = vec!["analytical".to_string(), "curious".to_string()];
        strand.current_status.mood = Some("cheerful".to_string());
        strand.current_status.health = Some("normal".to_string());

        let prompt = builder.build_system_prompt(&strand);
        assert!(prompt.starts_with("You are Alice"));
        assert!(prompt.contains("28 years old"));
        assert!(prompt.contains("Tech District"));
        assert!(prompt.contains("analytical, curious"));
        assert!(prompt.contains("feeling cheerful"));
        // Default-valued health is not worth a mention.
        assert!(!prompt.contains("health is normal"));
        assert!(prompt.ends_with("conversational and in-character."));
    }

    #[test]
    fn relevance_scoring_filters_and_ranks() {
        let builder = ContextBuilder::default();
        let mut strand = LifeStrand::new("Alice");
        strand.knowledge = vec![
            knowledge("harvest festival", "the harvest festival happens each autumn"),
            knowledge("blacksmithing", "iron must be heated before shaping"),
        ];
        let history = vec![message(
            MessageRole::User,
            "tell me about the harvest festival",
        )];
        let context = builder.build_history_context(&strand, &history);
        assert!(context.contains("harvest festival happens"));
        assert!(!context.contains("iron must be heated"));
    }

    #[test]
    fn empty_query_history_yields_empty_knowledge_block() {
        let mut strand = LifeStrand::new("Alice");
        strand.knowledge = vec![knowledge("topic", "content words here")];
        // Only assistant messages: no user query to score against.
        let history = vec![message(MessageRole::Assistant, "hello there")];
        assert!(relevant_knowledge(&strand, &history).is_empty());
    }

    #[test]
    fn history_keeps_only_last_ten_messages() {
        let messages: Vec<ChatMessage> = (0..15)
            .map(|i| message(MessageRole::User, &format!("message number {i}")))
            .collect();
        let formatted = format_history(&messages);
        assert!(!formatted.contains("message number 4"));
        assert!(formatted.contains("message number 5"));
        assert!(formatted.contains("message number 14"));
    }

    #[test]
    fn memories_ranked_by_importance_and_recency() {
        let now = Utc::now();
        let memories = vec![
            Memory {
                content: "minor errand".to_string(),
                timestamp: now - chrono::Duration::days(40),
                importance: 2,
                emotional_impact: Default::default(),
                people_involved: vec![],
                tags: vec![],
            },
            Memory {
                content: "life changing event".to_string(),
                timestamp: now - chrono::Duration::days(1),
                importance: 9,
                emotional_impact: Default::default(),
                people_involved: vec![],
                tags: vec![],
            },
        ];
        let context = memory_context(&memories);
        assert!(context.starts_with("Recent memories: life changing event"));
    }

    #[test]
    fn truncation_prefers_sentence_boundaries() {
        let builder = ContextBuilder::default();
        let text = "First sentence here. Second sentence follows. Third sentence is longer still.";
        // 10 tokens = 40 chars; only the first sentence fits.
        let truncated = builder.truncate_to_budget(text, 10);
        assert_eq!(truncated, "First sentence here.");
    }

    #[test]
    fn truncation_falls_back_to_word_boundary() {
        let builder = ContextBuilder::default();
        let text = "one two three four five six seven eight nine ten eleven twelve";
        let truncated = builder.truncate_to_budget(text, 5);
        assert!(truncated.chars().count() <= 20);
        assert!(!truncated.ends_with(' '));
        // Every output word is a whole input word.
        for word in truncated.split_whitespace() {
            assert!(text.split_whitespace().any(|w| w == word));
        }
    }

    #[test]
    fn prompt_combines_system_and_history() {
        let builder = ContextBuilder::default();
        let strand = LifeStrand::new("Alice");
        let history = vec![
            message(MessageRole::User, "hi"),
            message(MessageRole::Assistant, "hello"),
        ];
        let prompt = builder.build_prompt(&strand, &history, "how are you?");
        assert!(prompt.contains("You are Alice"));
        assert!(prompt.contains("User: hi"));
        assert!(prompt.contains("You: hello"));
        assert!(prompt.ends_with("User: how are you?\nAssistant:"));
    }

    #[test]
    fn custom_estimator_is_honored() {
        struct OneTokenPerChar;
        impl TokenEstimator for OneTokenPerChar {
            fn estimate(&self, text: &str) -> usize {
                text.chars().count()
            }
        }
        let builder = ContextBuilder::with_estimator(
            ContextBudgets::default(),
            Box::new(OneTokenPerChar),
        );
        let text = "abcdefghij klmnop";
        // With 1 token per char the text exceeds a 10-token budget.
        let truncated = builder.truncate_to_budget(text, 10);
        assert!(truncated.chars().count() <= 40);
        assert_ne!(truncated, text);
    }
}
