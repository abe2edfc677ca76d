//! Cross-phase memory records.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::phase::FeaturePhase;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryKind {
    Insight,
    Failure,
    Decision,
    Constraint,
}

impl MemoryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insight => "insight",
            Self::Failure => "failure",
            Self::Decision => "decision",
            Self::Constraint => "constraint",
        }
    }
}

impl fmt::Display for MemoryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MemoryKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "insight" => Ok(Self::Insight),
            "failure" => Ok(Self::Failure),
            "decision" => Ok(Self::Decision),
            "constraint" => Ok(Self::Constraint),
            _ => Err(format!("Invalid memory kind: {}", s)),
        }
    }
}

/// An append-only note recorded by one phase and read by every later phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub phase: FeaturePhase,
    pub kind: MemoryKind,
    pub content: String,
}

impl MemoryRecord {
    pub fn new(phase: FeaturePhase, kind: MemoryKind, content: impl Into<String>) -> Self {
        Self {
            phase,
            kind,
            content: content.into(),
        }
    }
}

/// Render memories as a prompt section. Returns an empty string when there
/// are none so callers can splice it in unconditionally.
pub fn render_memories(memories: &[MemoryRecord]) -> String {
    if memories.is_empty() {
        return String::new();
    }
    let mut out = String::from("## Memories from earlier phases\n\n");
    for m in memories {
        out.push_str(&format!("- [{}/{}] {}\n", m.phase, m.kind, m.content));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_memories_empty() {
        assert_eq!(render_memories(&[]), "");
    }

    #[test]
    fn test_render_memories_lists_each_record() {
        let memories = vec![
            MemoryRecord::new(FeaturePhase::Analysis, MemoryKind::Insight, "uses redux"),
            MemoryRecord::new(FeaturePhase::Approaches, MemoryKind::Decision, "selected a"),
        ];
        let rendered = render_memories(&memories);
        assert!(rendered.contains("- [analysis/insight] uses redux"));
        assert!(rendered.contains("- [approaches/decision] selected a"));
    }

    #[test]
    fn test_memory_record_serde_shape() {
        let m = MemoryRecord::new(FeaturePhase::Judging, MemoryKind::Constraint, "no new deps");
        let json = serde_json::to_value(&m).unwrap();
        assert_eq!(json["phase"], "judging");
        assert_eq!(json["kind"], "constraint");
        let back: MemoryRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, m);
    }
}
