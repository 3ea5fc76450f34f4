//! Five-signal routing scorer.
//!
//! Maps an inbound message against each agent profile:
//!
//! 1. Keyword score   (40%) — matched keyword weight / total keyword weight
//! 2. Intent score    (30%) — Jaccard similarity of pre-classified intents
//! 3. Direct mention  (20%) — whole-word id/name/alias match
//! 4. Division        (10%) — explicit division hint equals the agent's
//! 5. Negative keywords      — 0.2 penalty per distinct hit, capped at 1.0
//!
//! `final = (0.4·kw + 0.3·intent + 0.2·mention + 0.1·division − penalty) · multiplier`
//! with the outcome multiplier clamped to [0.7, 1.3].

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::routing::profile::AgentProfile;

const KEYWORD_WEIGHT: f64 = 0.4;
const INTENT_WEIGHT: f64 = 0.3;
const MENTION_WEIGHT: f64 = 0.2;
const DIVISION_WEIGHT: f64 = 0.1;
const NEGATIVE_PENALTY_STEP: f64 = 0.2;

pub const MULTIPLIER_MIN: f64 = 0.7;
pub const MULTIPLIER_MAX: f64 = 1.3;

/// An inbound message to be routed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutingMessage {
    pub text: String,
    /// Pre-classified intents, when an upstream classifier supplied them.
    #[serde(default)]
    pub intents: Vec<String>,
    /// Explicit division hint, when present.
    #[serde(default)]
    pub division: Option<String>,
}

impl RoutingMessage {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }
}

/// Per-agent score with the full signal breakdown.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredAgent {
    pub agent_id: String,
    pub keyword_score: f64,
    pub intent_score: f64,
    pub mention_score: f64,
    pub division_score: f64,
    pub negative_penalty: f64,
    pub raw_score: f64,
    pub outcome_multiplier: f64,
    pub final_score: f64,
}

/// Result of routing a message against a profile pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingResult {
    /// Top-scored agent, present only when its final score is positive.
    pub best_agent: Option<ScoredAgent>,
    /// Every agent's score, sorted descending by final score.
    pub all_scores: Vec<ScoredAgent>,
}

fn keyword_score(message: &str, agent: &AgentProfile) -> f64 {
    if agent.keywords.is_empty() {
        return 0.0;
    }
    let message_lower = message.to_lowercase();
    let mut matched = 0.0;
    let mut total = 0.0;
    for entry in &agent.keywords {
        total += entry.weight;
        // Substring match, so multi-word keywords work too.
        if message_lower.contains(&entry.word.to_lowercase()) {
            matched += entry.weight;
        }
    }
    if total == 0.0 {
        return 0.0;
    }
    matched / total
}

fn intent_score(message_intents: &[String], agent: &AgentProfile) -> f64 {
    if message_intents.is_empty() || agent.intents.is_empty() {
        return 0.0;
    }
    let message_set: HashSet<String> = message_intents.iter().map(|i| i.to_lowercase()).collect();
    let agent_set: HashSet<String> = agent.intents.iter().map(|i| i.to_lowercase()).collect();
    let intersection = message_set.intersection(&agent_set).count();
    let union = message_set.union(&agent_set).count();
    if union == 0 {
        return 0.0;
    }
    intersection as f64 / union as f64
}

fn mention_score(message: &str, agent: &AgentProfile) -> f64 {
    let names = std::iter::once(agent.id.as_str())
        .chain(std::iter::once(agent.name.as_str()))
        .chain(agent.aliases.iter().map(String::as_str));
    for name in names {
        if name.is_empty() {
            continue;
        }
        // Whole-word, case-insensitive.
        let pattern = format!(r"(?i)\b{}\b", regex::escape(name));
        if let Ok(re) = regex::Regex::new(&pattern) {
            if re.is_match(message) {
                return 1.0;
            }
        }
    }
    0.0
}

fn division_score(message_division: Option<&str>, agent: &AgentProfile) -> f64 {
    match message_division {
        Some(division) if !agent.division.is_empty() => {
            if division.eq_ignore_ascii_case(&agent.division) {
                1.0
            } else {
                0.0
            }
        }
        _ => 0.0,
    }
}

fn negative_penalty(message: &str, agent: &AgentProfile) -> f64 {
    if agent.negative_keywords.is_empty() {
        return 0.0;
    }
    let message_lower = message.to_lowercase();
    let mut penalty = 0.0;
    for word in &agent.negative_keywords {
        if message_lower.contains(&word.to_lowercase()) {
            penalty += NEGATIVE_PENALTY_STEP;
        }
    }
    penalty.min(1.0)
}

/// Score a single agent against a message.
pub fn score_agent(message: &RoutingMessage, agent: &AgentProfile) -> ScoredAgent {
    let keyword_score = keyword_score(&message.text, agent);
    let intent_score = intent_score(&message.intents, agent);
    let mention_score = mention_score(&message.text, agent);
    let division_score = division_score(message.division.as_deref(), agent);
    let negative_penalty = negative_penalty(&message.text, agent);

    let raw_score = keyword_score * KEYWORD_WEIGHT
        + intent_score * INTENT_WEIGHT
        + mention_score * MENTION_WEIGHT
        + division_score * DIVISION_WEIGHT
        - negative_penalty;

    let multiplier = agent.outcome_multiplier.clamp(MULTIPLIER_MIN, MULTIPLIER_MAX);
    ScoredAgent {
        agent_id: agent.id.clone(),
        keyword_score,
        intent_score,
        mention_score,
        division_score,
        negative_penalty,
        raw_score,
        outcome_multiplier: multiplier,
        final_score: raw_score * multiplier,
    }
}

/// Route a message against a pool of profiles.
///
/// Scores are sorted descending; the sort is stable, so ties keep the
/// profile input order. `best_agent` is `None` unless the top final score
/// is strictly positive — the caller falls back in that case.
pub fn route_message(message: &RoutingMessage, agents: &[AgentProfile]) -> RoutingResult {
    let mut all_scores: Vec<ScoredAgent> =
        agents.iter().map(|a| score_agent(message, a)).collect();
    all_scores.sort_by(|a, b| {
        b.final_score
            .partial_cmp(&a.final_score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let best_agent = all_scores
        .first()
        .filter(|s| s.final_score > 0.0)
        .cloned();

    RoutingResult {
        best_agent,
        all_scores,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fleet() -> Vec<AgentProfile> {
        vec![
            AgentProfile::named("daneel")
                .with_keywords(&[("disk", 0.8), ("backup", 0.6), ("server", 0.5)])
                .with_intents(&["ops", "infrastructure"])
                .with_division("operations"),
            AgentProfile::named("hari")
                .with_keywords(&[("market", 0.9), ("forecast", 0.7)])
                .with_intents(&["analysis"])
                .with_division("research"),
        ]
    }

    #[test]
    fn mention_signal_dominates() {
        let result = route_message(&RoutingMessage::text("@daneel check disk usage"), &fleet());
        let best = result.best_agent.unwrap();
        assert_eq!(best.agent_id, "daneel");
        assert_eq!(best.mention_score, 1.0);
    }

    #[test]
    fn mention_requires_whole_word() {
        let profile = AgentProfile::named("ada");
        let hit = score_agent(&RoutingMessage::text("ask ada about it"), &profile);
        assert_eq!(hit.mention_score, 1.0);
        let miss = score_agent(&RoutingMessage::text("the cicada sang"), &profile);
        assert_eq!(miss.mention_score, 0.0);
    }

    #[test]
    fn small_talk_scores_below_threshold() {
        let result = route_message(&RoutingMessage::text("Hi, how's it going?"), &fleet());
        match result.best_agent {
            None => {}
            Some(best) => assert!(best.final_score < 0.15),
        }
    }

    #[test]
    fn keyword_score_is_weight_normalized() {
        let fleet = fleet();
        let scored = score_agent(&RoutingMessage::text("the disk is full"), &fleet[0]);
        // 0.8 matched out of 1.9 total weight.
        assert!((scored.keyword_score - 0.8 / 1.9).abs() < 1e-9);
    }

    #[test]
    fn intent_score_is_jaccard() {
        let message = RoutingMessage {
            text: String::new(),
            intents: vec!["Ops".to_string(), "billing".to_string()],
            division: None,
        };
        let scored = score_agent(&message, &fleet()[0]);
        // intersection {ops} = 1, union {ops, billing, infrastructure} = 3
        assert!((scored.intent_score - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn division_hint_matches_case_insensitively() {
        let message = RoutingMessage {
            text: String::new(),
            intents: Vec::new(),
            division: Some("Operations".to_string()),
        };
        assert_eq!(score_agent(&message, &fleet()[0]).division_score, 1.0);
        assert_eq!(score_agent(&message, &fleet()[1]).division_score, 0.0);
    }

    #[test]
    fn negative_keywords_penalize_and_cap() {
        let mut profile = AgentProfile::named("hari");
        profile.negative_keywords = vec![
            "gossip".to_string(),
            "memes".to_string(),
            "weather".to_string(),
            "sports".to_string(),
            "lottery".to_string(),
            "horoscope".to_string(),
        ];
        let text = "gossip memes weather sports lottery horoscope";
        let scored = score_agent(&RoutingMessage::text(text), &profile);
        assert_eq!(scored.negative_penalty, 1.0);
    }

    #[test]
    fn multiplier_is_clamped_at_scoring_time() {
        let mut profile = AgentProfile::named("daneel").with_keywords(&[("disk", 1.0)]);
        profile.outcome_multiplier = 2.5;
        let scored = score_agent(&RoutingMessage::text("disk"), &profile);
        assert_eq!(scored.outcome_multiplier, 1.3);
        assert!((scored.final_score - scored.raw_score * 1.3).abs() < 1e-9);
    }

    #[test]
    fn ties_break_by_input_order() {
        let a = AgentProfile::named("first").with_keywords(&[("ping", 1.0)]);
        let b = AgentProfile::named("second").with_keywords(&[("ping", 1.0)]);
        let result = route_message(&RoutingMessage::text("ping"), &[a, b]);
        assert_eq!(result.best_agent.unwrap().agent_id, "first");
    }

    #[test]
    fn empty_pool_selects_nobody() {
        let result = route_message(&RoutingMessage::text("anything"), &[]);
        assert!(result.best_agent.is_none());
        assert!(result.all_scores.is_empty());
    }
}
