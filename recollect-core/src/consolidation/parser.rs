//! Tolerant parsing of generation responses.
//!
//! Structured responses follow a small line grammar:
//!
//! ```text
//! response  := preamble? delimiter? block*
//! block     := ENTRY line, [KEYWORDS line], CONTENT line, continuation*
//! ```
//!
//! Field labels are case-insensitive and may carry markdown decoration
//! (`**ENTRY:**`, `- Content:`). Content continues on following lines until
//! a blank line; text after that is stray. Malformed blocks are reported and
//! skipped; they never stop the blocks after them from being read.

use crate::error::ParseError;
use crate::store::normalize_keyword;

/// Quote characters stripped from the ends of a response.
const QUOTES: &[(char, char)] = &[('"', '"'), ('\'', '\''), ('“', '”'), ('`', '`')];

/// One entity block read from a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedEntity {
    /// Title as written by the model.
    pub name: String,
    /// Normalized keywords.
    pub keywords: Vec<String>,
    /// Content lines joined with spaces.
    pub content: String,
}

/// Result of parsing a structured response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StructuredParse {
    /// Text before the delimiter, if any.
    pub preamble: Option<String>,
    /// Well-formed blocks in response order.
    pub entities: Vec<ParsedEntity>,
    /// Problems with discarded blocks and stray lines.
    pub errors: Vec<ParseError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Entry,
    Keywords,
    Content,
}

#[derive(Debug, PartialEq, Eq)]
enum Token<'a> {
    Field(Field, &'a str),
    Text(&'a str),
    Blank,
}

/// Classify one line.
fn tokenize(line: &str) -> Token<'_> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Token::Blank;
    }

    let undecorated = trimmed.trim_start_matches(|c: char| matches!(c, '*' | '-' | '#' | '>' | ' '));
    if let Some(colon) = undecorated.find(':') {
        let label = undecorated[..colon].trim_matches(|c: char| c == '*' || c == ' ');
        let field = match label.to_ascii_uppercase().as_str() {
            "ENTRY" | "ENTRY NAME" | "NAME" => Some(Field::Entry),
            "KEYWORDS" | "KEYWORD" | "KEYS" => Some(Field::Keywords),
            "CONTENT" => Some(Field::Content),
            _ => None,
        };
        if let Some(field) = field {
            let value = undecorated[colon + 1..].trim_matches(|c: char| c == '*' || c.is_whitespace());
            return Token::Field(field, value);
        }
    }
    Token::Text(trimmed)
}

#[derive(Debug, Default)]
struct BlockBuilder {
    number: usize,
    name: String,
    keywords: Vec<String>,
    content: Vec<String>,
    has_content: bool,
    /// Set by a blank line after content; later text no longer continues it.
    closed: bool,
}

impl BlockBuilder {
    fn finish(self) -> Result<ParsedEntity, ParseError> {
        let name = strip_quotes(self.name.trim()).trim().to_string();
        if name.is_empty() {
            return Err(ParseError::MissingName { block: self.number });
        }
        let content = self.content.join(" ").trim().to_string();
        if content.is_empty() {
            return Err(ParseError::MissingContent {
                block: self.number,
                name,
            });
        }
        Ok(ParsedEntity {
            name,
            keywords: self.keywords,
            content,
        })
    }
}

/// Parse a structured response.
///
/// Everything before the first line containing `delimiter` is the preamble.
/// Without a delimiter the whole response is scanned for blocks.
pub fn parse_structured(response: &str, delimiter: &str) -> StructuredParse {
    let lines: Vec<&str> = response.lines().collect();
    let delimiter = delimiter.trim();

    let (preamble, body_start) = match lines
        .iter()
        .position(|l| !delimiter.is_empty() && l.contains(delimiter))
    {
        Some(pos) => {
            let pre = lines[..pos].join("\n").trim().to_string();
            ((!pre.is_empty()).then_some(pre), pos + 1)
        }
        None => (None, 0),
    };

    let mut result = StructuredParse {
        preamble,
        ..Default::default()
    };
    let mut current: Option<BlockBuilder> = None;
    let mut blocks = 0;

    for (offset, line) in lines[body_start..].iter().enumerate() {
        let line_no = body_start + offset + 1;
        match tokenize(line) {
            Token::Field(Field::Entry, value) => {
                if let Some(block) = current.take() {
                    push_block(&mut result, block);
                }
                blocks += 1;
                current = Some(BlockBuilder {
                    number: blocks,
                    name: value.to_string(),
                    ..Default::default()
                });
            }
            Token::Field(Field::Keywords, value) => match current.as_mut() {
                Some(block) => block.keywords.extend(split_keywords(value)),
                None => result.errors.push(ParseError::StrayLine {
                    line: line_no,
                    text: line.trim().to_string(),
                }),
            },
            Token::Field(Field::Content, value) => match current.as_mut() {
                Some(block) => {
                    block.has_content = true;
                    if !value.is_empty() {
                        block.content.push(value.to_string());
                    }
                }
                None => result.errors.push(ParseError::StrayLine {
                    line: line_no,
                    text: line.trim().to_string(),
                }),
            },
            Token::Text(text) => match current.as_mut() {
                Some(block) if block.has_content && !block.closed => {
                    block.content.push(text.to_string())
                }
                _ => result.errors.push(ParseError::StrayLine {
                    line: line_no,
                    text: text.to_string(),
                }),
            },
            Token::Blank => {
                if let Some(block) = current.as_mut().filter(|b| b.has_content) {
                    block.closed = true;
                }
            }
        }
    }

    if let Some(block) = current.take() {
        push_block(&mut result, block);
    }
    result
}

fn push_block(result: &mut StructuredParse, block: BlockBuilder) {
    match block.finish() {
        Ok(entity) => result.entities.push(entity),
        Err(e) => result.errors.push(e),
    }
}

/// Split a keyword list on commas and semicolons, normalizing each keyword.
pub fn split_keywords(value: &str) -> Vec<String> {
    let mut keywords: Vec<String> = Vec::new();
    for keyword in value.split([',', ';']).filter_map(normalize_keyword) {
        if !keywords.contains(&keyword) {
            keywords.push(keyword);
        }
    }
    keywords
}

/// Remove quoting and label artifacts the model wraps around its answer.
pub fn strip_artifacts(response: &str, prefixes: &[String]) -> String {
    let mut text = response.trim().to_string();
    loop {
        let before = text.len();
        text = strip_quotes(&text).trim().to_string();
        for prefix in prefixes {
            if let Some(rest) = strip_prefix_ignore_case(&text, prefix) {
                text = rest.trim().to_string();
            }
        }
        if text.len() == before {
            return text;
        }
    }
}

/// Whether the response says there is nothing new.
pub fn is_no_data(response: &str, sentinel: &str) -> bool {
    let sentinel = sentinel.trim();
    if sentinel.is_empty() {
        return false;
    }
    let cleaned = response
        .trim()
        .trim_end_matches(|c: char| c == '.' || c == '!')
        .trim();
    cleaned.eq_ignore_ascii_case(sentinel)
}

/// Clip a summary to `max_words` words and then `max_chars` characters,
/// marking any cut with an ellipsis.
pub fn clip_summary(text: &str, max_words: usize, max_chars: usize) -> String {
    let mut clipped = text.trim().to_string();

    if max_words > 0 && clipped.split_whitespace().count() > max_words {
        clipped = clipped
            .split_whitespace()
            .take(max_words)
            .collect::<Vec<_>>()
            .join(" ");
        clipped.push('…');
    }

    if max_chars > 0 && clipped.chars().count() > max_chars {
        let keep = max_chars.saturating_sub(1);
        let mut cut: String = clipped.chars().take(keep).collect();
        cut = cut.trim_end().to_string();
        cut.push('…');
        clipped = cut;
    }

    clipped
}

/// Strip one outer quote pair, unless the quote also appears inside
/// (`"We ride," Ann said. "At dawn."` is dialogue, not a wrapped answer).
fn strip_quotes(text: &str) -> &str {
    for (open, close) in QUOTES {
        if let Some(inner) = text
            .strip_prefix(*open)
            .and_then(|rest| rest.strip_suffix(*close))
        {
            if inner.contains(*open) || inner.contains(*close) {
                return text;
            }
            return inner;
        }
    }
    text
}

fn strip_prefix_ignore_case<'a>(text: &'a str, prefix: &str) -> Option<&'a str> {
    let prefix = prefix.trim();
    if prefix.is_empty() {
        return None;
    }
    let head = text.get(..prefix.len())?;
    if head.eq_ignore_ascii_case(prefix) {
        text.get(prefix.len()..)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_DELIMITER;

    fn prefixes() -> Vec<String> {
        vec!["UPDATED MEMORY:".to_string(), "SUMMARY:".to_string()]
    }

    #[test]
    fn test_single_block_without_delimiter() {
        let parsed = parse_structured(
            "ENTRY: Alice\nKEYWORDS: ally\nCONTENT: met the player\n",
            DEFAULT_DELIMITER,
        );
        assert_eq!(parsed.preamble, None);
        assert_eq!(
            parsed.entities,
            vec![ParsedEntity {
                name: "Alice".to_string(),
                keywords: vec!["ally".to_string()],
                content: "met the player".to_string(),
            }]
        );
        assert!(parsed.errors.is_empty());
    }

    #[test]
    fn test_preamble_and_delimiter() {
        let response = "Alice and Bob argued about the map.\n### ENTRIES ###\n\
            ENTRY: Alice\nKEYWORDS: ally, Map\nCONTENT: Holds the map.\n\n\
            ENTRY: Bob\nCONTENT: Wants the map.";
        let parsed = parse_structured(response, DEFAULT_DELIMITER);
        assert_eq!(
            parsed.preamble.as_deref(),
            Some("Alice and Bob argued about the map.")
        );
        assert_eq!(parsed.entities.len(), 2);
        assert_eq!(parsed.entities[0].keywords, vec!["ally", "map"]);
        assert!(parsed.entities[1].keywords.is_empty());
    }

    #[test]
    fn test_malformed_blocks_do_not_abort() {
        let response = "ENTRY:\nCONTENT: nameless\n\
            ENTRY: Ghost\nKEYWORDS: boo\n\
            ENTRY: Carol\nCONTENT: runs the inn";
        let parsed = parse_structured(response, DEFAULT_DELIMITER);
        assert_eq!(parsed.entities.len(), 1);
        assert_eq!(parsed.entities[0].name, "Carol");
        assert_eq!(
            parsed.errors,
            vec![
                ParseError::MissingName { block: 1 },
                ParseError::MissingContent {
                    block: 2,
                    name: "Ghost".to_string()
                },
            ]
        );
    }

    #[test]
    fn test_markdown_decoration_and_multiline_content() {
        let response = "**ENTRY:** \"The Old Mill\"\n- Keywords: mill; river\n**Content:** Burned down.\nNobody knows who did it.";
        let parsed = parse_structured(response, DEFAULT_DELIMITER);
        assert_eq!(parsed.entities.len(), 1);
        let mill = &parsed.entities[0];
        assert_eq!(mill.name, "The Old Mill");
        assert_eq!(mill.keywords, vec!["mill", "river"]);
        assert_eq!(mill.content, "Burned down. Nobody knows who did it.");
    }

    #[test]
    fn test_trailing_fragment_discarded() {
        let response = "ENTRY: Dan\nCONTENT: a guard\nENTRY: Ev";
        let parsed = parse_structured(response, DEFAULT_DELIMITER);
        assert_eq!(parsed.entities.len(), 1);
        assert_eq!(parsed.errors.len(), 1);
    }

    #[test]
    fn test_chatter_after_last_block_is_stray() {
        let parsed = parse_structured(
            "ENTRY: Dan\nCONTENT: a guard\n\nHope this helps! Let me know.",
            DEFAULT_DELIMITER,
        );
        assert_eq!(parsed.entities.len(), 1);
        assert_eq!(parsed.entities[0].content, "a guard");
        assert_eq!(
            parsed.errors,
            vec![ParseError::StrayLine {
                line: 4,
                text: "Hope this helps! Let me know.".to_string()
            }]
        );
    }

    #[test]
    fn test_blank_line_before_content_keeps_block_open() {
        let parsed = parse_structured(
            "ENTRY: Dan\n\nCONTENT: a guard\nat the east gate",
            DEFAULT_DELIMITER,
        );
        assert_eq!(parsed.entities[0].content, "a guard at the east gate");
        assert!(parsed.errors.is_empty());
    }

    #[test]
    fn test_stray_lines_reported() {
        let parsed = parse_structured("just chatter\nKEYWORDS: x", DEFAULT_DELIMITER);
        assert!(parsed.entities.is_empty());
        assert_eq!(parsed.errors.len(), 2);
    }

    #[test]
    fn test_split_keywords_dedupes() {
        assert_eq!(split_keywords("Sword, sword ; , shield"), vec!["sword", "shield"]);
    }

    #[test]
    fn test_strip_artifacts() {
        assert_eq!(
            strip_artifacts("  \"Updated memory: They met at dawn.\" ", &prefixes()),
            "They met at dawn."
        );
        assert_eq!(
            strip_artifacts("SUMMARY: \"quoted\"", &prefixes()),
            "quoted"
        );
        assert_eq!(strip_artifacts("plain", &prefixes()), "plain");
    }

    #[test]
    fn test_dialogue_quotes_are_kept() {
        let summary = "\"We ride,\" Ann said. Bot agreed: \"At dawn.\"";
        assert_eq!(strip_artifacts(summary, &prefixes()), summary);
        assert_eq!(
            strip_artifacts("“They rode out at dawn.”", &prefixes()),
            "They rode out at dawn."
        );
    }

    #[test]
    fn test_no_data_sentinel() {
        assert!(is_no_data(" no_new_data. ", "NO_NEW_DATA"));
        assert!(!is_no_data("NO_NEW_DATA but Alice left", "NO_NEW_DATA"));
        assert!(!is_no_data("", ""));
    }

    #[test]
    fn test_clip_summary_words() {
        assert_eq!(clip_summary("one two three four", 2, 100), "one two…");
        assert_eq!(clip_summary("one two", 2, 100), "one two");
    }

    #[test]
    fn test_clip_summary_chars() {
        let clipped = clip_summary("abcdefghij", 0, 5);
        assert_eq!(clipped, "abcd…");
        assert_eq!(clipped.chars().count(), 5);
    }
}
