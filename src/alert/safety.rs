//! Content safety gate applied before an alert leaves the engine.
//!
//! Item texts are screened as they are ingested, so a single offending item
//! flags its entity's bucket no matter how many other items share it. The
//! gate checks the entity id and the bucket's flag again at dispatch.

use regex::Regex;
use tracing::debug;

use crate::config::{EngineConfig, SafetyConfig};

/// Outcome of a safety check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SafetyVerdict {
    Pass,
    /// Human-readable reason, stored with the suppressed record.
    Violation(String),
}

impl SafetyVerdict {
    pub fn is_violation(&self) -> bool {
        matches!(self, SafetyVerdict::Violation(_))
    }
}

/// A pluggable content classifier, run over every item text.
pub trait SafetyClassifier: Send + Sync {
    fn name(&self) -> &str;

    fn classify(&self, text: &str) -> SafetyVerdict;
}

// ---------------------------------------------------------------------------
// Spam
// ---------------------------------------------------------------------------

const SPAM_PATTERNS: &[&str] = &[
    r"(?i)\b(buy now|click here|free money|make money fast)\b",
    r"(?i)\b(viagra|cialis|weight loss|debt relief)\b",
    r"(?i)\b(nigerian prince|lottery winner|inheritance)\b",
    r"(?i)\b(crypto|bitcoin|investment opportunity)\b.*guaranteed",
    r"(?i)follow me @\w+",
    r"(?i)check out my (profile|link|website)",
    r"(?i)(subscribe|like and share|smash that button)",
    r"https?://\S+\.(tk|ml|ga|cf)/",
    r"(?i)\b(download|install).*(app|software).*(free|now)\b",
    r"(?i)\b(limited time|act now|don't miss out)\b",
];

/// Scores a text on spam signals; two or more signals flag it.
#[derive(Debug, Clone)]
pub struct SpamHeuristic {
    patterns: Vec<Regex>,
}

impl SpamHeuristic {
    pub const FLAG_SCORE: u32 = 2;

    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            patterns: compile(SPAM_PATTERNS)?,
        })
    }

    /// Number of spam signals found in `text`: one per matching pattern,
    /// plus one each for more than two links, a capital-letter ratio above
    /// 0.3 and more than five exclamation marks.
    pub fn score(&self, text: &str) -> u32 {
        let mut score = self.patterns.iter().filter(|p| p.is_match(text)).count() as u32;

        let urls = text.matches("http://").count() + text.matches("https://").count();
        if urls > 2 {
            score += 1;
        }

        let chars = text.chars().count().max(1);
        let caps = text.chars().filter(|c| c.is_uppercase()).count();
        if caps as f64 / chars as f64 > 0.3 {
            score += 1;
        }

        if text.matches('!').count() > 5 {
            score += 1;
        }
        score
    }
}

impl SafetyClassifier for SpamHeuristic {
    fn name(&self) -> &str {
        "spam_heuristic"
    }

    fn classify(&self, text: &str) -> SafetyVerdict {
        let score = self.score(text);
        if score >= Self::FLAG_SCORE {
            SafetyVerdict::Violation(format!("spam_heuristic: text scored {}", score))
        } else {
            SafetyVerdict::Pass
        }
    }
}

// ---------------------------------------------------------------------------
// Term and pattern lists
// ---------------------------------------------------------------------------

const PROFANITY_TERMS: &[&str] = &[
    "damn", "hell", "shit", "fuck", "fucking", "bitch", "bastard", "ass", "asshole", "crap",
    "piss", "cock", "dick", "pussy", "whore", "slut", "fag", "faggot", "nigga", "nigger",
    "retard", "dyke", "tranny", "chink", "spic", "wetback", "kike", "gook", "raghead",
    "towelhead", "sandnigger",
];

const HATE_SPEECH_TERMS: &[&str] = &[
    "kill all", "burn them", "gas chamber", "lynch", "hang them", "subhuman", "vermin",
    "send them back", "deport them all", "white power", "blood and soil", "race war",
    "final solution", "jews will not replace us", "white genocide", "great replacement",
    "helicopter ride", "day of the rope", "remove kebab", "1488", "14 words",
];

const HATE_SPEECH_PATTERNS: &[&str] = &[
    r"\b13\s*%",
    r"\b13\s*50\b",
    r"(?i)\b6\s*million\b",
    // Echo parentheses: (((name)))
    r"\(\(\(\s*\w+\s*\)\)\)",
];

const MISINFORMATION_TERMS: &[&str] = &[
    "fake news", "hoax", "conspiracy", "deep state", "false flag", "crisis actor", "plandemic",
    "scamdemic", "sheeple", "do your research", "mainstream media lies",
    "they don't want you to know", "hidden truth", "big pharma", "globalist", "illuminati",
    "new world order", "agenda 21", "population control",
];

const MISINFORMATION_PATTERNS: &[&str] = &[
    r"(?i)\b(they|them)\s+(control|want|don't want)",
    r"(?i)\b(cover.?up|suppressing)\b",
    r"(?i)\b(follow the money|cui bono)\b",
    r"(?i)\b(question everything|think for yourself)\b.*\b(sheep|sheeple)\b",
];

const NSFW_TERMS: &[&str] = &[
    "sex", "porn", "nude", "naked", "orgasm", "masturbate", "dildo", "vibrator", "bondage",
    "bdsm", "fetish", "stripper", "escort", "prostitute", "hooker", "onlyfans", "premium snap",
    "sugar daddy", "sugar baby",
];

const NSFW_PATTERNS: &[&str] = &[
    r"(?i)\b(send|show).*\b(nudes?|pics?)\b",
    r"(?i)\b(hook\s*up|netflix and chill)\b",
    r"(?i)(\b18\+|\bnsfw\b|\bnot safe for work\b)",
    r"(?i)\b(xxx|adult content)\b",
];

/// Counts matches of a term list and extra patterns; flags a text once the
/// count reaches `min_hits`.
#[derive(Debug, Clone)]
pub struct PatternClassifier {
    name: &'static str,
    patterns: Vec<Regex>,
    min_hits: usize,
}

impl PatternClassifier {
    /// Terms match case-insensitively on word boundaries, with any run of
    /// whitespace between the words of a phrase.
    pub fn new(
        name: &'static str,
        terms: &[&str],
        patterns: &[&str],
        min_hits: usize,
    ) -> Result<Self, regex::Error> {
        let mut compiled = Vec::with_capacity(patterns.len() + 1);
        if !terms.is_empty() {
            let alternation = terms
                .iter()
                .map(|t| regex::escape(t).replace(' ', r"\s+"))
                .collect::<Vec<_>>()
                .join("|");
            compiled.push(Regex::new(&format!(r"(?i)\b(?:{})\b", alternation))?);
        }
        compiled.extend(compile(patterns)?);
        Ok(Self {
            name,
            patterns: compiled,
            min_hits: min_hits.max(1),
        })
    }

    /// Profanity and slurs; four or more occurrences flag a text.
    pub fn profanity() -> Result<Self, regex::Error> {
        Self::new("profanity", PROFANITY_TERMS, &[], 4)
    }

    /// Hate speech phrases and coded references; two indicators flag a text.
    pub fn hate_speech() -> Result<Self, regex::Error> {
        Self::new("hate_speech", HATE_SPEECH_TERMS, HATE_SPEECH_PATTERNS, 2)
    }

    /// Conspiracy and misinformation markers; three indicators flag a text.
    pub fn misinformation() -> Result<Self, regex::Error> {
        Self::new(
            "misinformation",
            MISINFORMATION_TERMS,
            MISINFORMATION_PATTERNS,
            3,
        )
    }

    /// Sexual content; three indicators flag a text.
    pub fn nsfw() -> Result<Self, regex::Error> {
        Self::new("nsfw", NSFW_TERMS, NSFW_PATTERNS, 3)
    }

    pub fn hits(&self, text: &str) -> usize {
        self.patterns.iter().map(|p| p.find_iter(text).count()).sum()
    }
}

impl SafetyClassifier for PatternClassifier {
    fn name(&self) -> &str {
        self.name
    }

    fn classify(&self, text: &str) -> SafetyVerdict {
        let hits = self.hits(text);
        if hits >= self.min_hits {
            SafetyVerdict::Violation(format!("{}: {} indicators in item text", self.name, hits))
        } else {
            SafetyVerdict::Pass
        }
    }
}

fn compile(patterns: &[&str]) -> Result<Vec<Regex>, regex::Error> {
    patterns.iter().map(|p| Regex::new(p)).collect()
}

// ---------------------------------------------------------------------------
// Gate
// ---------------------------------------------------------------------------

/// Blocklist plus any number of classifiers. The first failing check wins.
pub struct SafetyGate {
    /// Lower-cased terms.
    blocklist: Vec<String>,
    classifiers: Vec<Box<dyn SafetyClassifier>>,
}

impl std::fmt::Debug for SafetyGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SafetyGate")
            .field("blocklist", &self.blocklist.len())
            .field(
                "classifiers",
                &self.classifiers.iter().map(|c| c.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl SafetyGate {
    pub fn new(blocklist: &[String]) -> Self {
        Self {
            blocklist: blocklist
                .iter()
                .map(|t| t.trim().to_lowercase())
                .filter(|t| !t.is_empty())
                .collect(),
            classifiers: Vec::new(),
        }
    }

    /// Blocklist from the engine section, classifiers as toggled in `[safety]`.
    pub fn from_config(engine: &EngineConfig, safety: &SafetyConfig) -> Result<Self, regex::Error> {
        let mut gate = Self::new(&engine.safety_blocklist);
        if safety.spam_heuristic {
            gate = gate.with_classifier(Box::new(SpamHeuristic::new()?));
        }
        if safety.profanity {
            gate = gate.with_classifier(Box::new(PatternClassifier::profanity()?));
        }
        if safety.hate_speech {
            gate = gate.with_classifier(Box::new(PatternClassifier::hate_speech()?));
        }
        if safety.misinformation {
            gate = gate.with_classifier(Box::new(PatternClassifier::misinformation()?));
        }
        if safety.nsfw {
            gate = gate.with_classifier(Box::new(PatternClassifier::nsfw()?));
        }
        Ok(gate)
    }

    pub fn with_classifier(mut self, classifier: Box<dyn SafetyClassifier>) -> Self {
        self.classifiers.push(classifier);
        self
    }

    /// True when screening texts can flag anything at all.
    pub fn screens_text(&self) -> bool {
        !self.blocklist.is_empty() || !self.classifiers.is_empty()
    }

    /// Screen one item text: blocklist first, then each classifier.
    pub fn screen(&self, text: &str) -> SafetyVerdict {
        if let Some(term) = self.blocked_term(text) {
            return SafetyVerdict::Violation(format!("blocklist term '{}' in item text", term));
        }
        for classifier in &self.classifiers {
            let verdict = classifier.classify(text);
            if verdict.is_violation() {
                debug!(classifier = classifier.name(), "classifier flagged item text");
                return verdict;
            }
        }
        SafetyVerdict::Pass
    }

    /// Check an alert's entity id, then screen the given texts.
    pub fn check(&self, entity: &str, texts: &[String]) -> SafetyVerdict {
        if let Some(term) = self.blocked_term(entity) {
            return SafetyVerdict::Violation(format!("blocklist term '{}' in entity id", term));
        }
        texts
            .iter()
            .map(|text| self.screen(text))
            .find(SafetyVerdict::is_violation)
            .unwrap_or(SafetyVerdict::Pass)
    }

    /// Single words match whole words; phrases match as substrings.
    fn blocked_term(&self, text: &str) -> Option<&str> {
        if self.blocklist.is_empty() {
            return None;
        }
        let lower = text.to_lowercase();
        let words: Vec<&str> = lower
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .collect();

        self.blocklist
            .iter()
            .find(|term| {
                if term.contains(char::is_whitespace) {
                    lower.contains(term.as_str())
                } else {
                    words.contains(&term.as_str())
                }
            })
            .map(String::as_str)
    }
}
