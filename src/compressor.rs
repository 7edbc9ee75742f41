use crate::models::{IntelligenceContext, LayerMap};
use serde::{Deserialize, Serialize};

// ============================================================
// Intelligence Compressor
// ============================================================
//
// Turns the four-layer behavioral context into a compact tagged string
// that fits a computed token budget, e.g.:
//
//   MICRO{e:joy,ei:7} TOPIC{ct:work,mc:6} CORE{pt:anl,cs:dir}
//
// The abbreviation dictionary is part of the wire contract with the
// downstream prompt: changing it changes what the model sees. v1 is
// frozen; additions go behind a new version tag.
// ============================================================

pub const ABBREV_VERSION: &str = "v1";

/// Frozen key/value abbreviation dictionary, v1.
const ABBREV_V1: &[(&str, &str)] = &[
    // keys
    ("messageComplexity", "mc"),
    ("primaryEmotion", "e"),
    ("emotionalIntensity", "ei"),
    ("emotionalTrend", "et"),
    ("currentEnergy", "en"),
    ("currentTopic", "ct"),
    ("recentTopics", "rt"),
    ("communicationStyle", "cs"),
    ("personalityType", "pt"),
    ("coreValues", "cv"),
    ("cognitiveStyle", "cog"),
    ("learningStyle", "ls"),
    ("decisionStyle", "ds"),
    ("interactionPattern", "ip"),
    ("engagementLevel", "eng"),
    ("responseLatency", "rl"),
    ("topicFamiliarity", "tf"),
    ("conversationDepth", "cd"),
    ("currentMoment", "cm"),
    ("predictedNeed", "pn"),
    ("nextLikelyTopic", "nlt"),
    // values
    ("increasing", "inc"),
    ("decreasing", "dec"),
    ("stable", "stb"),
    ("neutral", "neu"),
    ("positive", "pos"),
    ("negative", "neg"),
    ("analytical", "anl"),
    ("creative", "cre"),
    ("technical", "tech"),
    ("emotional", "emo"),
    ("balanced", "bal"),
    ("direct", "dir"),
    ("curious", "cur"),
    ("focused", "foc"),
    ("anxious", "anx"),
    ("excited", "exc"),
    ("morning", "am"),
    ("evening", "pm"),
    ("high", "hi"),
    ("medium", "med"),
    ("low", "lo"),
];

fn abbreviate(word: &str) -> Option<&'static str> {
    ABBREV_V1
        .iter()
        .find(|(long, _)| *long == word)
        .map(|(_, short)| *short)
}

/// Coarse but monotonic and deterministic token estimate.
pub fn estimate_tokens(text: &str) -> u32 {
    (text.len() as u32 + 3) / 4
}

// ============================================================
// Model Profiles
// ============================================================

#[derive(Debug, Clone, Copy)]
pub struct ModelProfile {
    pub max_context_tokens: u32,
    pub optimal_intelligence_tokens: u32,
    pub compression_tolerance: f64,
}

const DEFAULT_PROFILE: ModelProfile = ModelProfile {
    max_context_tokens: 8192,
    optimal_intelligence_tokens: 120,
    compression_tolerance: 1.0,
};

/// Known upstream models. Unknown names fall back to the default profile.
pub fn model_profile(model: &str) -> ModelProfile {
    match model {
        "solace-chat" => DEFAULT_PROFILE,
        "solace-chat-large" => ModelProfile {
            max_context_tokens: 32768,
            optimal_intelligence_tokens: 220,
            compression_tolerance: 1.2,
        },
        "solace-mini" => ModelProfile {
            max_context_tokens: 4096,
            optimal_intelligence_tokens: 60,
            compression_tolerance: 0.8,
        },
        _ => DEFAULT_PROFILE,
    }
}

// ============================================================
// Budget
// ============================================================

fn message_type_factor(message_type: &str) -> f64 {
    match message_type {
        "greeting" => 0.3,
        "standard" => 1.0,
        "question" => 1.2,
        "technical" => 1.5,
        "analysis" => 1.8,
        "emotional" => 1.3,
        "creative" => 1.4,
        _ => 1.0,
    }
}

fn complexity_factor(complexity: f64) -> f64 {
    (0.5 + complexity / 10.0).clamp(0.0, 2.0)
}

fn history_factor(history_len: usize) -> f64 {
    if history_len > 10 {
        1.3
    } else if history_len < 3 {
        0.8
    } else {
        1.0
    }
}

/// `B = clamp(profileOptimal × complexity × messageType × history, 0, 10% of context)`
pub fn token_budget(
    profile: &ModelProfile,
    message_type: &str,
    complexity: f64,
    history_len: usize,
) -> u32 {
    let raw = profile.optimal_intelligence_tokens as f64
        * complexity_factor(complexity)
        * message_type_factor(message_type)
        * history_factor(history_len);
    let cap = profile.max_context_tokens as f64 * 0.10;
    raw.clamp(0.0, cap).round() as u32
}

// ============================================================
// Clusters
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Cluster {
    Core,
    Dynamic,
    Contextual,
    Predictive,
    Behavioral,
    Emotional,
    Cognitive,
}

impl Cluster {
    fn reliability(self) -> f64 {
        match self {
            Cluster::Core => 0.9,
            Cluster::Emotional => 0.85,
            Cluster::Dynamic => 0.8,
            Cluster::Behavioral => 0.75,
            Cluster::Cognitive => 0.7,
            Cluster::Contextual => 0.6,
            Cluster::Predictive => 0.5,
        }
    }
}

#[derive(Debug, Default)]
struct ClusterData {
    entries: Vec<(String, serde_json::Value)>,
}

impl ClusterData {
    fn richness(&self) -> f64 {
        (self.entries.len() as f64 / 10.0).min(1.0)
    }
}

const EMOTIONAL_KEYS: &[&str] = &[
    "primaryEmotion",
    "emotionalIntensity",
    "emotionalTrend",
    "currentEnergy",
    "mood",
];

const COGNITIVE_KEYS: &[&str] = &["cognitiveStyle", "learningStyle", "decisionStyle"];

const BEHAVIORAL_KEYS: &[&str] = &[
    "interactionPattern",
    "engagementLevel",
    "responseLatency",
    "messageFrequency",
    "sessionRhythm",
];

/// Route the four analytical layers into the seven semantic clusters.
/// Unrecognized keys go to the layer's primary cluster so nothing is lost.
fn cluster_context(ctx: &IntelligenceContext) -> Vec<(Cluster, ClusterData)> {
    let mut core = ClusterData::default();
    let mut dynamic = ClusterData::default();
    let mut contextual = ClusterData::default();
    let mut predictive = ClusterData::default();
    let mut behavioral = ClusterData::default();
    let mut emotional = ClusterData::default();
    let mut cognitive = ClusterData::default();

    let route = |map: &LayerMap,
                 matches: &[&str],
                 hit: &mut ClusterData,
                 miss: &mut ClusterData| {
        for (key, value) in map {
            let target: &mut ClusterData = if matches.contains(&key.as_str()) { hit } else { miss };
            target.entries.push((key.clone(), value.clone()));
        }
    };

    route(&ctx.micro, EMOTIONAL_KEYS, &mut emotional, &mut dynamic);
    route(&ctx.medium, BEHAVIORAL_KEYS, &mut behavioral, &mut contextual);
    route(&ctx.macro_layer, COGNITIVE_KEYS, &mut cognitive, &mut core);
    for (key, value) in &ctx.synthesis {
        predictive.entries.push((key.clone(), value.clone()));
    }

    vec![
        (Cluster::Core, core),
        (Cluster::Dynamic, dynamic),
        (Cluster::Contextual, contextual),
        (Cluster::Predictive, predictive),
        (Cluster::Behavioral, behavioral),
        (Cluster::Emotional, emotional),
        (Cluster::Cognitive, cognitive),
    ]
}

// ============================================================
// Strategy & Priorities
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    Minimal,
    Balanced,
    Comprehensive,
}

impl Strategy {
    fn for_budget(budget: u32) -> Self {
        if budget <= 50 {
            Strategy::Minimal
        } else if budget >= 150 {
            Strategy::Comprehensive
        } else {
            Strategy::Balanced
        }
    }
}

/// Fixed strategy × cluster base priorities. Emotional and dynamic stay
/// at or above core in every row.
fn base_priority(strategy: Strategy, cluster: Cluster) -> f64 {
    match strategy {
        Strategy::Minimal => match cluster {
            Cluster::Emotional => 1.0,
            Cluster::Dynamic => 0.9,
            Cluster::Core => 0.8,
            Cluster::Behavioral => 0.4,
            Cluster::Cognitive => 0.3,
            Cluster::Contextual => 0.3,
            Cluster::Predictive => 0.2,
        },
        Strategy::Balanced => match cluster {
            Cluster::Emotional => 1.0,
            Cluster::Dynamic => 0.9,
            Cluster::Core => 0.8,
            Cluster::Behavioral => 0.6,
            Cluster::Cognitive => 0.5,
            Cluster::Contextual => 0.5,
            Cluster::Predictive => 0.4,
        },
        Strategy::Comprehensive => match cluster {
            Cluster::Emotional => 1.0,
            Cluster::Dynamic => 1.0,
            Cluster::Core => 0.9,
            Cluster::Behavioral => 0.8,
            Cluster::Cognitive => 0.7,
            Cluster::Contextual => 0.7,
            Cluster::Predictive => 0.6,
        },
    }
}

// ============================================================
// Value Compression
// ============================================================

fn compress_string(s: &str) -> String {
    if let Some(short) = abbreviate(s) {
        return short.to_string();
    }
    s.chars().take(8).collect()
}

fn compress_number(n: f64) -> String {
    if n.fract() == 0.0 {
        format!("{}", n as i64)
    } else {
        format!("{:.1}", n)
    }
}

/// Recursive value compression. Objects shaped like `{trend, current}`
/// and `{emotion, intensity}` get dedicated short forms; any other
/// object collapses to its first entry.
fn compress_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => compress_string(s),
        serde_json::Value::Number(n) => compress_number(n.as_f64().unwrap_or(0.0)),
        serde_json::Value::Bool(b) => if *b { "y" } else { "n" }.to_string(),
        serde_json::Value::Null => String::new(),
        serde_json::Value::Array(items) => {
            items.iter().map(compress_value).collect::<Vec<_>>().concat()
        }
        serde_json::Value::Object(map) => {
            if let (Some(trend), Some(current)) = (map.get("trend"), map.get("current")) {
                return format!("{}{}", compress_value(current), compress_value(trend));
            }
            if let (Some(emotion), Some(intensity)) = (map.get("emotion"), map.get("intensity")) {
                return format!("{}{}", compress_value(emotion), compress_value(intensity));
            }
            map.iter()
                .next()
                .map(|(_, v)| compress_value(v))
                .unwrap_or_default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Mode {
    Ultra,
    Standard,
    Detailed,
}

impl Mode {
    fn for_allocation(tokens: u32) -> Self {
        if tokens < 20 {
            Mode::Ultra
        } else if tokens <= 50 {
            Mode::Standard
        } else {
            Mode::Detailed
        }
    }

    fn max_pairs(self) -> usize {
        match self {
            Mode::Ultra => 3,
            Mode::Standard => 6,
            Mode::Detailed => usize::MAX,
        }
    }
}

fn compress_cluster(data: &ClusterData, mode: Mode) -> Vec<String> {
    data.entries
        .iter()
        .take(mode.max_pairs())
        .map(|(key, value)| {
            let short_key = abbreviate(key)
                .map(|s| s.to_string())
                .unwrap_or_else(|| key.chars().take(8).collect());
            let mut compressed = compress_value(value);
            if mode == Mode::Ultra {
                compressed.truncate(6);
            }
            format!("{}:{}", short_key, compressed)
        })
        .filter(|pair| !pair.ends_with(':'))
        .collect()
}

// ============================================================
// Compression Result
// ============================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionMetadata {
    pub strategy: Strategy,
    pub budget: u32,
    pub estimated_tokens: u32,
    /// estimated output tokens / estimated raw-context tokens
    pub ratio: f64,
    pub fallback: bool,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressedContext {
    pub text: String,
    pub metadata: CompressionMetadata,
}

/// Compress an intelligence context into the tagged budgeted summary.
/// Deterministic: identical inputs produce byte-identical output.
pub fn compress(
    ctx: &IntelligenceContext,
    message_type: &str,
    complexity: f64,
    history_len: usize,
    model: &str,
    forced: Option<Strategy>,
) -> CompressedContext {
    let profile = model_profile(model);
    let budget = token_budget(&profile, message_type, complexity, history_len);

    // A tolerant model affords a leaner strategy at the same budget.
    let strategy = forced.unwrap_or_else(|| {
        Strategy::for_budget((budget as f64 / profile.compression_tolerance).round() as u32)
    });

    match compress_inner(ctx, budget, strategy) {
        Some(text) => {
            let raw_estimate = estimate_tokens(
                &serde_json::to_string(ctx).unwrap_or_default(),
            )
            .max(1);
            let estimated = estimate_tokens(&text);
            CompressedContext {
                text,
                metadata: CompressionMetadata {
                    strategy,
                    budget,
                    estimated_tokens: estimated,
                    ratio: estimated as f64 / raw_estimate as f64,
                    fallback: false,
                    version: ABBREV_VERSION.to_string(),
                },
            }
        }
        None => {
            let text = format!("User shows {} communication pattern.", message_type);
            let estimated = estimate_tokens(&text);
            CompressedContext {
                text,
                metadata: CompressionMetadata {
                    strategy,
                    budget,
                    estimated_tokens: estimated,
                    ratio: 1.0,
                    fallback: true,
                    version: ABBREV_VERSION.to_string(),
                },
            }
        }
    }
}

/// Tag order is fixed: MICRO TOPIC CORE BEHAV COG PRED.
/// TOPIC carries both dynamic and contextual pairs.
fn section_plan() -> Vec<(&'static str, Vec<Cluster>)> {
    vec![
        ("MICRO", vec![Cluster::Emotional]),
        ("TOPIC", vec![Cluster::Dynamic, Cluster::Contextual]),
        ("CORE", vec![Cluster::Core]),
        ("BEHAV", vec![Cluster::Behavioral]),
        ("COG", vec![Cluster::Cognitive]),
        ("PRED", vec![Cluster::Predictive]),
    ]
}

fn compress_inner(ctx: &IntelligenceContext, budget: u32, strategy: Strategy) -> Option<String> {
    if budget == 0 {
        return None;
    }
    let clusters = cluster_context(ctx);
    if clusters.iter().all(|(_, data)| data.entries.is_empty()) {
        return None;
    }

    // Adjusted priority = base × reliability × richness.
    let adjusted: Vec<(Cluster, f64)> = clusters
        .iter()
        .map(|(cluster, data)| {
            (
                *cluster,
                base_priority(strategy, *cluster) * cluster.reliability() * data.richness(),
            )
        })
        .collect();
    let total: f64 = adjusted.iter().map(|(_, p)| p).sum();
    if total <= 0.0 {
        return None;
    }

    // Distribute the budget proportionally, then emit each cluster at the
    // mode its allocation affords.
    let mut sections: Vec<(&'static str, Vec<String>)> = Vec::new();
    for (tag, members) in section_plan() {
        let mut pairs = Vec::new();
        for member in members {
            let priority = adjusted
                .iter()
                .find(|(c, _)| *c == member)
                .map(|(_, p)| *p)
                .unwrap_or(0.0);
            let allocation = (budget as f64 * priority / total) as u32;
            if allocation == 0 {
                continue;
            }
            let data = clusters
                .iter()
                .find(|(c, _)| *c == member)
                .map(|(_, d)| d)
                .unwrap();
            pairs.extend(compress_cluster(data, Mode::for_allocation(allocation)));
        }
        if !pairs.is_empty() {
            sections.push((tag, pairs));
        }
    }

    if sections.is_empty() {
        return None;
    }

    // Truncate by dropping trailing pairs until the estimate fits.
    loop {
        let text = render_sections(&sections);
        if estimate_tokens(&text) <= budget {
            return Some(text);
        }
        let dropped = sections
            .iter_mut()
            .rev()
            .find_map(|(_, pairs)| pairs.pop());
        sections.retain(|(_, pairs)| !pairs.is_empty());
        if dropped.is_none() || sections.is_empty() {
            return None;
        }
    }
}

fn render_sections(sections: &[(&'static str, Vec<String>)]) -> String {
    sections
        .iter()
        .map(|(tag, pairs)| format!("{}{{{}}}", tag, pairs.join(",")))
        .collect::<Vec<_>>()
        .join(" ")
}

// ============================================================
// Tests
// ============================================================
