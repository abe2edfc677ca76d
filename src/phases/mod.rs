//! Agent-driven phases that are not covered by a dedicated module:
//! codebase analysis and approach generation, plus the prompt builders
//! shared by every role.

pub mod analysis;
pub mod approaches;
pub mod prompts;

pub use analysis::{ExplorerTool, run_analysis};
pub use approaches::{parse_approaches, run_approaches};

/// Pull a JSON object out of free-form model output.
///
/// Tries a ```json fenced block, then any fenced block containing `{`, then
/// the first balanced top-level `{...}` in the text.
pub fn extract_json(output: &str) -> Option<String> {
    if let Some(start) = output.find("```json") {
        let after_marker = &output[start + 7..];
        if let Some(end) = after_marker.find("```") {
            return Some(after_marker[..end].trim().to_string());
        }
    }

    if let Some(start) = output.find("```") {
        let after_marker = &output[start + 3..];
        if let Some(end) = after_marker.find("```")
            && let Some(json_start) = after_marker[..end].find('{')
        {
            let content = &after_marker[json_start..end];
            if !content.is_empty() {
                return Some(content.trim().to_string());
            }
        }
    }

    if let Some(start) = output.find('{') {
        let mut depth = 0usize;
        let mut in_string = false;
        let mut escaped = false;
        for (i, c) in output[start..].char_indices() {
            if in_string {
                match c {
                    _ if escaped => escaped = false,
                    '\\' => escaped = true,
                    '"' => in_string = false,
                    _ => {}
                }
                continue;
            }
            match c {
                '"' => in_string = true,
                '{' => depth += 1,
                '}' => {
                    depth -= 1;
                    if depth == 0 {
                        return Some(output[start..start + i + 1].to_string());
                    }
                }
                _ => {}
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_json_code_block() {
        let output = "Here is my verdict:\n```json\n{\"verdict\": \"pass\"}\n```\nDone.";
        assert_eq!(extract_json(output).as_deref(), Some("{\"verdict\": \"pass\"}"));
    }

    #[test]
    fn test_extract_json_generic_block() {
        let output = "```\n{\"a\": 1}\n```";
        assert_eq!(extract_json(output).as_deref(), Some("{\"a\": 1}"));
    }

    #[test]
    fn test_extract_json_raw_nested() {
        let output = "Result: {\"outer\": {\"inner\": \"}\"}} trailing";
        assert_eq!(
            extract_json(output).as_deref(),
            Some("{\"outer\": {\"inner\": \"}\"}}")
        );
    }

    #[test]
    fn test_extract_json_none() {
        assert!(extract_json("no json here").is_none());
        assert!(extract_json("{ unbalanced").is_none());
    }
}
