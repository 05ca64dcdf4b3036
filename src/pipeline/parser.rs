//! Pipeline string parsing
//!
//! `exec ls -la | json pick name | table` becomes three stages. Quoting
//! follows POSIX shell word rules:
//!
//! - `|` separates stages only outside `'...'`, `"..."` and backslash escapes
//! - words split on whitespace, newlines included, so a pipeline may span
//!   several lines
//! - `#` at the start of a word comments out the rest of the line

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::{Error, Result};

/// One command plus its arguments
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageDescriptor {
    pub command: String,
    pub args: Vec<String>,
}

impl StageDescriptor {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
        }
    }
}

impl fmt::Display for StageDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let words = std::iter::once(&self.command).chain(self.args.iter());
        f.write_str(&shell_words::join(words))
    }
}

/// Parsed pipeline; immutable once built
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineDefinition {
    source: String,
    stages: Vec<StageDescriptor>,
}

impl PipelineDefinition {
    /// Parse a pipeline string
    pub fn parse(source: &str) -> Result<Self> {
        let stages = parse(source)?;
        Ok(Self {
            source: source.to_string(),
            stages,
        })
    }

    /// The string this pipeline was parsed from
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn stages(&self) -> &[StageDescriptor] {
        &self.stages
    }

    pub fn stage(&self, index: usize) -> Option<&StageDescriptor> {
        self.stages.get(index)
    }

    /// Number of stages (always at least one)
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

impl FromStr for PipelineDefinition {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for PipelineDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self.stages.iter().map(|s| s.to_string()).collect();
        f.write_str(&rendered.join(" | "))
    }
}

/// Split a pipeline string into stage descriptors
pub fn parse(source: &str) -> Result<Vec<StageDescriptor>> {
    let segments = split_stages(source)?;

    if segments.len() == 1 && segments[0].trim().is_empty() {
        return Err(Error::Parse("pipeline is empty".to_string()));
    }

    segments
        .iter()
        .enumerate()
        .map(|(index, segment)| parse_stage(index, segment))
        .collect()
}

fn parse_stage(index: usize, segment: &str) -> Result<StageDescriptor> {
    let mut words = shell_words::split(segment)
        .map_err(|e| Error::Parse(format!("stage {}: {}", index, e)))?
        .into_iter();

    let command = words
        .next()
        .ok_or_else(|| Error::Parse(format!("stage {} has no command", index)))?;

    Ok(StageDescriptor::new(command, words.collect()))
}

/// Split on top-level `|`, keeping quotes intact for word splitting
fn split_stages(source: &str) -> Result<Vec<String>> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    // True only where an unquoted, unescaped word may begin
    let mut word_start = true;
    let mut chars = source.chars().peekable();

    while let Some(c) = chars.next() {
        match (quote, c) {
            (None, '|') => {
                segments.push(std::mem::take(&mut current));
                word_start = true;
                continue;
            }
            (None, '\\') | (Some('"'), '\\') => {
                current.push(c);
                match chars.next() {
                    Some(escaped) => current.push(escaped),
                    None => return Err(Error::Parse("trailing backslash".to_string())),
                }
            }
            (None, '\'' | '"') => {
                quote = Some(c);
                current.push(c);
            }
            (None, '#') if word_start => {
                // Drop the comment but keep the newline as a word break
                while let Some(&next) = chars.peek() {
                    if next == '\n' {
                        break;
                    }
                    chars.next();
                }
                continue;
            }
            (None, c) if c.is_whitespace() => {
                current.push(c);
                word_start = true;
                continue;
            }
            (Some(q), c) if c == q => {
                quote = None;
                current.push(c);
            }
            _ => current.push(c),
        }
        word_start = false;
    }

    if let Some(q) = quote {
        return Err(Error::Parse(format!("unterminated {} quote", q)));
    }

    segments.push(current);
    Ok(segments)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stage(command: &str, args: &[&str]) -> StageDescriptor {
        StageDescriptor::new(command, args.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn test_parse_two_stages() {
        let stages = parse("exec ls -la | table").unwrap();
        assert_eq!(stages, vec![stage("exec", &["ls", "-la"]), stage("table", &[])]);
    }

    #[test]
    fn test_single_stage_and_whitespace() {
        assert_eq!(parse("   approve   ").unwrap(), vec![stage("approve", &[])]);
        assert_eq!(
            parse("exec\techo  a\t b").unwrap(),
            vec![stage("exec", &["echo", "a", "b"])]
        );
    }

    #[test]
    fn test_multiline_pipeline() {
        let source = "exec gh pr list\n  | approve --prompt 'merge these?'\n  | table";
        let stages = parse(source).unwrap();
        assert_eq!(stages.len(), 3);
        assert_eq!(stages[1], stage("approve", &["--prompt", "merge these?"]));
    }

    #[test]
    fn test_pipe_inside_quotes_is_literal() {
        let stages = parse(r#"exec sh -c "ls | wc -l" | echo 'a|b' | echo a\|b"#).unwrap();
        assert_eq!(
            stages,
            vec![
                stage("exec", &["sh", "-c", "ls | wc -l"]),
                stage("echo", &["a|b"]),
                stage("echo", &["a|b"]),
            ]
        );
    }

    #[test]
    fn test_quoted_words_keep_spaces() {
        let stages = parse(r#"echo "hello world" 'it''s' "say \"hi\"""#).unwrap();
        assert_eq!(stages, vec![stage("echo", &["hello world", "its", "say \"hi\""])]);
    }

    #[test]
    fn test_comments_are_dropped() {
        let source = "exec echo hi # first stage | not a stage\n| table";
        let stages = parse(source).unwrap();
        assert_eq!(stages, vec![stage("exec", &["echo", "hi"]), stage("table", &[])]);
        // A '#' inside a word is ordinary
        assert_eq!(parse("echo a#b").unwrap(), vec![stage("echo", &["a#b"])]);
        assert_eq!(parse(r"echo a\ #b").unwrap(), vec![stage("echo", &["a #b"])]);
        assert_eq!(parse("echo '' #b").unwrap(), vec![stage("echo", &[""])]);
        assert_eq!(
            parse("echo |# next\ntable").unwrap(),
            vec![stage("echo", &[]), stage("table", &[])]
        );
    }

    #[test]
    fn test_empty_pipeline_is_error() {
        assert!(matches!(parse(""), Err(Error::Parse(_))));
        assert!(matches!(parse("  \n\t "), Err(Error::Parse(_))));
        assert!(matches!(parse("# only a comment"), Err(Error::Parse(_))));
    }

    #[test]
    fn test_empty_segment_is_error() {
        for source in ["a | | b", "| a", "a |", "a ||b"] {
            let err = parse(source).unwrap_err();
            assert!(matches!(err, Error::Parse(_)), "{source} should not parse");
        }
    }

    #[test]
    fn test_unbalanced_quotes_are_errors() {
        assert!(matches!(parse("echo 'oops | table"), Err(Error::Parse(_))));
        assert!(matches!(parse("echo \"oops"), Err(Error::Parse(_))));
        assert!(matches!(parse("echo oops\\"), Err(Error::Parse(_))));
    }

    #[test]
    fn test_display_round_trips() {
        let definition = PipelineDefinition::parse("exec echo 'a b' | json pick name").unwrap();
        let rendered = definition.to_string();
        assert_eq!(rendered, "exec echo 'a b' | json pick name");
        assert_eq!(
            PipelineDefinition::parse(&rendered).unwrap().stages(),
            definition.stages()
        );
    }

    #[test]
    fn test_definition_keeps_source() {
        let source = "exec echo hi |\n table";
        let definition: PipelineDefinition = source.parse().unwrap();
        assert_eq!(definition.source(), source);
        assert_eq!(definition.len(), 2);
    }
}
