//! Action Parser (C3): extracts `<name>payload</name>` action tags from
//! assistant text against a closed whitelist.

use regex::Regex;
use serde::{Deserialize, Serialize};

/// A parsed action: the tag name, its decoded arguments, and the raw
/// substring it was parsed from (for P6, the parse-purity invariant).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub name: String,
    pub args: ActionArgs,
    pub raw_span: String,
}

/// Payload shape: either a single raw string, or `key:value` pairs
/// delimited by `|` (§6.5 — implementations must accept both shapes).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ActionArgs {
    Raw(String),
    Fields(std::collections::BTreeMap<String, String>),
}

impl ActionArgs {
    pub fn as_raw(&self) -> Option<&str> {
        match self {
            ActionArgs::Raw(s) => Some(s),
            ActionArgs::Fields(_) => None,
        }
    }

    pub fn field(&self, key: &str) -> Option<&str> {
        match self {
            ActionArgs::Fields(map) => map.get(key).map(|s| s.as_str()),
            ActionArgs::Raw(_) => None,
        }
    }
}

/// A malformed opener (`<name>` with no matching `</name>`) encountered
/// while parsing; parsing continues past it (§4.3).
#[derive(Debug, Clone, PartialEq)]
pub struct ParseWarning {
    pub name: String,
    pub position: usize,
}

#[derive(Debug, Clone)]
pub struct ParseOutcome {
    pub actions: Vec<Action>,
    pub warnings: Vec<ParseWarning>,
}

#[derive(Debug, Clone)]
pub struct ActionParserConfig {
    /// Closed whitelist of recognized action names.
    pub whitelist: Vec<String>,
    /// Open question #1 (DESIGN.md): default `false` keeps the legacy
    /// behavior of treating fenced-code tags as real actions.
    pub strict_outside_fences: bool,
}

impl ActionParserConfig {
    pub fn new(whitelist: Vec<String>) -> Self {
        Self {
            whitelist,
            strict_outside_fences: false,
        }
    }
}

/// Parses action tags out of assistant text per the whitelist in `config`.
pub struct ActionParser {
    config: ActionParserConfig,
    tag_re: Regex,
    fence_re: Regex,
}

impl ActionParser {
    pub fn new(config: ActionParserConfig) -> Self {
        // Matches <name ...>...</name> for any identifier-shaped name; the
        // whitelist filter happens after matching so unknown/HTML-looking
        // tags are left untouched rather than erroring.
        let tag_re = Regex::new(r"(?s)<([a-zA-Z_][a-zA-Z0-9_]*)>(.*?)</\1>").unwrap();
        let fence_re = Regex::new(r"```[\s\S]*?```").unwrap();
        Self {
            config,
            tag_re,
            fence_re,
        }
    }

    /// Deterministic: parsing the same text twice yields the same result
    /// (P6). Concatenating the returned `raw_span`s, in order, yields a
    /// substring of `text` that preserves appearance order.
    pub fn parse(&self, text: &str) -> ParseOutcome {
        let fence_ranges: Vec<(usize, usize)> = if self.config.strict_outside_fences {
            self.fence_re
                .find_iter(text)
                .map(|m| (m.start(), m.end()))
                .collect()
        } else {
            Vec::new()
        };

        let mut actions = Vec::new();
        for cap in self.tag_re.captures_iter(text) {
            let whole = cap.get(0).unwrap();
            let name = cap.get(1).unwrap().as_str();

            if !self.config.whitelist.iter().any(|w| w == name) {
                continue; // not in the whitelist: leave untouched, not an action.
            }
            if self.config.strict_outside_fences
                && fence_ranges
                    .iter()
                    .any(|(start, end)| whole.start() >= *start && whole.end() <= *end)
            {
                continue; // inside a fenced code block and strict mode is on.
            }

            let payload = cap.get(2).unwrap().as_str();
            actions.push(Action {
                name: name.to_string(),
                args: parse_payload(payload),
                raw_span: whole.as_str().to_string(),
            });
        }

        let warnings = self.find_malformed_openers(text, &actions);

        ParseOutcome { actions, warnings }
    }

    /// Finds `<name>` openers (for whitelisted names) with no matching
    /// closer, so a structured warning can be emitted without aborting the
    /// rest of the parse (§4.3).
    fn find_malformed_openers(&self, text: &str, matched: &[Action]) -> Vec<ParseWarning> {
        let opener_re = Regex::new(r"<([a-zA-Z_][a-zA-Z0-9_]*)>").unwrap();
        let matched_spans: Vec<&str> = matched.iter().map(|a| a.raw_span.as_str()).collect();
        let mut warnings = Vec::new();

        for cap in opener_re.captures_iter(text) {
            let whole = cap.get(0).unwrap();
            let name = cap.get(1).unwrap().as_str();
            if !self.config.whitelist.iter().any(|w| w == name) {
                continue;
            }
            let within_matched = matched_spans.iter().any(|span| span.contains(whole.as_str()));
            let closer = format!("</{name}>");
            let has_closer_after = text[whole.end()..].contains(&closer);
            if !has_closer_after && !within_matched {
                warnings.push(ParseWarning {
                    name: name.to_string(),
                    position: whole.start(),
                });
            }
        }
        warnings
    }
}

fn parse_payload(payload: &str) -> ActionArgs {
    // key:value fields are pipe-delimited; a payload with no ':' is raw.
    if payload.contains(':') && payload.contains('|') {
        let mut map = std::collections::BTreeMap::new();
        for segment in payload.split('|') {
            if let Some((key, value)) = segment.split_once(':') {
                map.insert(key.trim().to_string(), value.trim().to_string());
            }
        }
        if !map.is_empty() {
            return ActionArgs::Fields(map);
        }
    } else if let Some((key, value)) = payload.split_once(':') {
        if !key.trim().is_empty() && !key.contains(' ') && !key.contains('\n') {
            let mut map = std::collections::BTreeMap::new();
            map.insert(key.trim().to_string(), value.trim().to_string());
            return ActionArgs::Fields(map);
        }
    }
    ActionArgs::Raw(payload.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parser() -> ActionParser {
        ActionParser::new(ActionParserConfig::new(vec![
            "execute".into(),
            "search".into(),
            "task_create".into(),
        ]))
    }

    #[test]
    fn parses_a_single_raw_action() {
        let outcome = parser().parse("before <execute>echo hello</execute> after");
        assert_eq!(outcome.actions.len(), 1);
        assert_eq!(outcome.actions[0].name, "execute");
        assert_eq!(outcome.actions[0].args.as_raw(), Some("echo hello"));
    }

    #[test]
    fn preserves_order_of_multiple_actions() {
        let outcome = parser().parse("<search>a</search> middle <execute>b</execute>");
        assert_eq!(outcome.actions.len(), 2);
        assert_eq!(outcome.actions[0].name, "search");
        assert_eq!(outcome.actions[1].name, "execute");
    }

    #[test]
    fn unknown_tag_names_are_left_untouched() {
        let outcome = parser().parse("<div>not an action</div>");
        assert!(outcome.actions.is_empty());
    }

    #[test]
    fn parses_colon_delimited_key_value_fields() {
        let outcome = parser().parse("<task_create>title:Fix bug|priority:high</task_create>");
        let args = &outcome.actions[0].args;
        assert_eq!(args.field("title"), Some("Fix bug"));
        assert_eq!(args.field("priority"), Some("high"));
    }

    #[test]
    fn legacy_mode_treats_fenced_tags_as_actions() {
        let outcome = parser().parse("```\n<execute>echo hi</execute>\n```");
        assert_eq!(outcome.actions.len(), 1);
    }

    #[test]
    fn strict_mode_ignores_fenced_tags() {
        let mut config = ActionParserConfig::new(vec!["execute".into()]);
        config.strict_outside_fences = true;
        let strict_parser = ActionParser::new(config);
        let outcome = strict_parser.parse("```\n<execute>echo hi</execute>\n```");
        assert!(outcome.actions.is_empty());
    }

    #[test]
    fn parse_is_deterministic_and_spans_are_substrings() {
        let text = "<search>q</search> and <execute>cmd</execute>";
        let first = parser().parse(text);
        let second = parser().parse(text);
        assert_eq!(first.actions, second.actions);
        for action in &first.actions {
            assert!(text.contains(&action.raw_span));
        }
    }
}
