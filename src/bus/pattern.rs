use regex::Regex;

use super::RouterError;
use crate::topics::normalize_destination;

const SEGMENT_SEPARATOR: char = '.';
const SINGLE_WILDCARD: &str = "*";
const TRAILING_WILDCARD: &str = ">";

/// A subscription destination, possibly containing broker wildcards.
///
/// `*` matches exactly one segment and `>` matches one or more trailing
/// segments. Matching is anchored at both ends.
#[derive(Debug, Clone)]
pub struct TopicPattern {
    raw: String,
    matcher: Option<Regex>,
}

impl TopicPattern {
    pub fn parse(topic: &str) -> Result<Self, RouterError> {
        let raw = normalize_destination(topic);
        let (namespace, body) = split_namespace(&raw);
        let segments: Vec<&str> = body.split(SEGMENT_SEPARATOR).collect();

        let is_wildcard = segments
            .iter()
            .any(|s| *s == SINGLE_WILDCARD || *s == TRAILING_WILDCARD);
        if !is_wildcard {
            return Ok(Self { raw, matcher: None });
        }

        let last = segments.len() - 1;
        let mut expr = String::with_capacity(raw.len() * 2);
        expr.push('^');
        expr.push_str(&regex::escape(namespace));
        for (i, segment) in segments.iter().enumerate() {
            if i > 0 {
                expr.push_str(r"\.");
            }
            match *segment {
                SINGLE_WILDCARD => expr.push_str(r"[^./]+"),
                TRAILING_WILDCARD if i == last => expr.push_str(r"[^/]+"),
                TRAILING_WILDCARD => {
                    return Err(RouterError::InvalidPattern {
                        pattern: raw,
                        reason: "'>' is only allowed as the last segment".to_string(),
                    })
                }
                literal => expr.push_str(&regex::escape(literal)),
            }
        }
        expr.push('$');

        let matcher = Regex::new(&expr).map_err(|e| RouterError::InvalidPattern {
            pattern: raw.clone(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            raw,
            matcher: Some(matcher),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn is_wildcard(&self) -> bool {
        self.matcher.is_some()
    }

    /// `destination` must already be normalized.
    pub fn matches(&self, destination: &str) -> bool {
        match &self.matcher {
            Some(re) => re.is_match(destination),
            None => self.raw == destination,
        }
    }
}

/// Splits `/topic/a.b` into (`/topic/`, `a.b`).
fn split_namespace(destination: &str) -> (&str, &str) {
    if let Some(rest) = destination.strip_prefix('/') {
        if let Some(idx) = rest.find('/') {
            return destination.split_at(idx + 2);
        }
    }
    ("", destination)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matches(pattern: &str, destination: &str) -> bool {
        TopicPattern::parse(pattern)
            .unwrap()
            .matches(&normalize_destination(destination))
    }

    #[test]
    fn test_single_segment_wildcard() {
        assert!(matches("/topic/a.b.*", "/topic/a.b.c"));
        assert!(!matches("/topic/a.b.*", "/topic/a.b.c.d"));
        assert!(!matches("/topic/a.b.*", "/topic/a.b"));
        assert!(matches("/topic/a.*.c", "/topic/a.x.c"));
    }

    #[test]
    fn test_trailing_wildcard() {
        assert!(matches("/topic/a.b.>", "/topic/a.b.c"));
        assert!(matches("/topic/a.b.>", "/topic/a.b.c.d"));
        assert!(!matches("/topic/a.b.>", "/topic/a.b"));
        assert!(TopicPattern::parse("/topic/a.>.c").is_err());
    }

    #[test]
    fn test_anchored_and_namespaced() {
        assert!(!matches("/topic/a.b.*", "/topic/x.a.b.c"));
        assert!(!matches("/topic/a.b.*", "/queue/a.b.c"));
        assert!(matches("a.b.*", "a.b.c"));
        assert!(matches("/temp-queue/response.*", "/temp-queue/response.1234"));
    }

    #[test]
    fn test_literal_dots_are_not_regex() {
        let pattern = TopicPattern::parse("/topic/a.b").unwrap();
        assert!(!pattern.is_wildcard());
        assert!(!pattern.matches("/topic/aXb"));
    }
}
