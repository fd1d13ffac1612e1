//! Response pattern matching.
//!
//! A [`ResponseMatcher`] holds the response patterns of a device model in
//! load order. A line is tried against each pattern in turn and the first
//! pattern that matches at the start of the line wins. Well-formed models
//! have disjoint patterns; when two can match the same line, the one that
//! was added first is used and the overlap is the model author's problem.

use std::collections::BTreeMap;

use regex::Regex;

use avlink_core::types::ResponseMatch;

/// Match `line` against one pattern.
///
/// The match must start at the beginning of the line; it may stop before
/// the end. Named groups that did not take part in the match are left out
/// of the fields.
pub fn match_pattern(action_id: &str, pattern: &Regex, line: &str) -> Option<ResponseMatch> {
    let caps = pattern.captures(line)?;
    if caps.get(0).map_or(true, |m| m.start() != 0) {
        return None;
    }
    let fields: BTreeMap<String, String> = pattern
        .capture_names()
        .flatten()
        .filter_map(|name| {
            caps.name(name)
                .map(|m| (name.to_string(), m.as_str().to_string()))
        })
        .collect();
    Some(ResponseMatch {
        action_id: action_id.to_string(),
        fields,
    })
}

/// Ordered library of response patterns keyed by action id.
#[derive(Debug, Clone, Default)]
pub struct ResponseMatcher {
    patterns: Vec<(String, Regex)>,
}

impl ResponseMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a pattern; earlier patterns take priority.
    pub fn add(&mut self, action_id: impl Into<String>, pattern: Regex) {
        self.patterns.push((action_id.into(), pattern));
    }

    /// Try every pattern in load order and return the first match.
    pub fn match_line(&self, line: &str) -> Option<ResponseMatch> {
        self.patterns
            .iter()
            .find_map(|(id, re)| match_pattern(id, re, line))
    }

    /// Pattern registered for `action_id`, if any.
    pub fn pattern(&self, action_id: &str) -> Option<&Regex> {
        self.patterns
            .iter()
            .find(|(id, _)| id == action_id)
            .map(|(_, re)| re)
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

impl<S: Into<String>> FromIterator<(S, Regex)> for ResponseMatcher {
    fn from_iter<I: IntoIterator<Item = (S, Regex)>>(iter: I) -> Self {
        let mut matcher = ResponseMatcher::new();
        for (id, re) in iter {
            matcher.add(id, re);
        }
        matcher
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn re(pattern: &str) -> Regex {
        Regex::new(pattern).unwrap()
    }

    fn fields(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn extracts_named_groups() {
        let m = match_pattern(
            "power.on",
            &re(r"PWR(?P<zone>\d)=(?P<state>\d)\r"),
            "PWR3=1\r",
        )
        .unwrap();
        assert_eq!(m.action_id, "power.on");
        assert_eq!(m.fields, fields(&[("zone", "3"), ("state", "1")]));
    }

    #[test]
    fn match_must_start_at_line_start() {
        let pattern = re(r"VOL(?P<level>\d+)");
        assert!(match_pattern("volume.get", &pattern, "XVOL10").is_none());
        assert!(match_pattern("volume.get", &pattern, "VOL10 trailing").is_some());
    }

    #[test]
    fn values_are_not_coerced() {
        let m = match_pattern("volume.get", &re(r"VOL(?P<level>-?\d+)"), "VOL-07").unwrap();
        assert_eq!(m.fields["level"], "-07");
    }

    #[test]
    fn unmatched_optional_group_is_omitted() {
        let pattern = re(r"SRC(?P<input>\d)(?:,(?P<name>\w+))?");
        let m = match_pattern("source.get", &pattern, "SRC2").unwrap();
        assert_eq!(m.fields, fields(&[("input", "2")]));
    }

    #[test]
    fn first_configured_pattern_wins() {
        let matcher: ResponseMatcher = vec![
            ("power.get", re(r"PWR(?P<state>\d)")),
            ("power.any", re(r"PWR(?P<raw>.*)")),
        ]
        .into_iter()
        .collect();

        let m = matcher.match_line("PWR1\r").unwrap();
        assert_eq!(m.action_id, "power.get");
        assert_eq!(matcher.match_line("PWRX\r").unwrap().action_id, "power.any");
    }

    #[test]
    fn no_match_returns_none() {
        let mut matcher = ResponseMatcher::new();
        matcher.add("power.get", re(r"PWR(?P<state>\d)"));
        assert!(matcher.match_line("#ERR\r").is_none());
        assert!(ResponseMatcher::new().match_line("PWR1").is_none());
    }

    #[test]
    fn pattern_lookup_by_action() {
        let mut matcher = ResponseMatcher::new();
        matcher.add("power.get", re(r"PWR(?P<state>\d)"));
        assert!(matcher.pattern("power.get").is_some());
        assert!(matcher.pattern("volume.get").is_none());
        assert_eq!(matcher.len(), 1);
        assert!(!matcher.is_empty());
    }
}
