//! Secret detection over file fragments.
//!
//! The detector runs a fixed set of high-confidence rules against raw
//! fragment bytes. Each rule carries keyword anchors; an Aho-Corasick pass
//! over the fragment selects candidate rules before any regex work, so
//! fragments without anchor text cost one automaton scan and nothing else.
//!
//! The detector is pure over its input: the same fragment always yields the
//! same findings, which is what makes fingerprint-level caching sound.

use crate::error::{Error, Result};
use aho_corasick::{AhoCorasick, AhoCorasickBuilder};
use regex::bytes::Regex;

/// A single secret match within a fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finding {
    /// Identifier of the rule that matched.
    pub rule_id: String,
    /// Path of the file the fragment belongs to.
    pub file: String,
    /// Raw matched text.
    pub secret: String,
    /// 1-based line of the match start within the fragment.
    pub start_line: u32,
}

struct RuleSpec {
    id: &'static str,
    keywords: &'static [&'static str],
    pattern: &'static str,
}

/// Rule table. Keywords are matched case-insensitively; patterns are
/// case-sensitive byte regexes confirming the hit.
const RULES: &[RuleSpec] = &[
    RuleSpec {
        id: "aws-access-key-id",
        keywords: &["akia", "asia", "abia", "acca"],
        pattern: r"\b(?:AKIA|ASIA|ABIA|ACCA)[0-9A-Z]{16}\b",
    },
    RuleSpec {
        id: "github-token",
        keywords: &["ghp_", "gho_", "ghs_", "ghu_", "ghr_"],
        pattern: r"\bgh[opsur]_[0-9A-Za-z]{36}\b",
    },
    RuleSpec {
        id: "gitlab-pat",
        keywords: &["glpat-"],
        pattern: r"\bglpat-[0-9A-Za-z_\-]{20}\b",
    },
    RuleSpec {
        id: "slack-token",
        keywords: &["xoxb", "xoxa", "xoxp", "xoxr", "xoxs"],
        pattern: r"\bxox[baprs]-[0-9A-Za-z\-]{10,48}\b",
    },
    RuleSpec {
        id: "stripe-secret-key",
        keywords: &["sk_live_", "sk_test_"],
        pattern: r"\bsk_(?:live|test)_[0-9A-Za-z]{20,99}\b",
    },
    RuleSpec {
        id: "gcp-api-key",
        keywords: &["aiza"],
        pattern: r"\bAIza[0-9A-Za-z_\-]{35}\b",
    },
    RuleSpec {
        id: "sendgrid-api-key",
        keywords: &["sg."],
        pattern: r"\bSG\.[0-9A-Za-z_\-]{22}\.[0-9A-Za-z_\-]{43}\b",
    },
    RuleSpec {
        id: "npm-access-token",
        keywords: &["npm_"],
        pattern: r"\bnpm_[0-9A-Za-z]{36}\b",
    },
    RuleSpec {
        id: "private-key",
        keywords: &["private key"],
        pattern: r"-----BEGIN (?:RSA |EC |DSA |OPENSSH |PGP )?PRIVATE KEY(?: BLOCK)?-----",
    },
];

struct CompiledRule {
    id: &'static str,
    regex: Regex,
}

/// Keyword-prefiltered regex detector.
pub struct Detector {
    rules: Vec<CompiledRule>,
    prefilter: AhoCorasick,
    /// Maps automaton pattern index to owning rule index.
    keyword_owner: Vec<usize>,
}

impl Detector {
    /// Compiles the built-in rule table.
    pub fn new() -> Result<Self> {
        let mut rules = Vec::with_capacity(RULES.len());
        let mut keywords = Vec::new();
        let mut keyword_owner = Vec::new();

        for (idx, spec) in RULES.iter().enumerate() {
            let regex = Regex::new(spec.pattern).map_err(|e| Error::InvalidRule {
                id: spec.id.to_string(),
                reason: e.to_string(),
            })?;
            rules.push(CompiledRule { id: spec.id, regex });
            for kw in spec.keywords {
                keywords.push(*kw);
                keyword_owner.push(idx);
            }
        }

        let prefilter = AhoCorasickBuilder::new()
            .ascii_case_insensitive(true)
            .build(&keywords)
            .map_err(|e| Error::InvalidRule {
                id: "keyword-prefilter".to_string(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            rules,
            prefilter,
            keyword_owner,
        })
    }

    /// Runs all anchored rules against one fragment. `path` is attached to
    /// each finding so downstream records can derive the file extension.
    pub fn detect(&self, path: &str, data: &[u8]) -> Vec<Finding> {
        let mut candidates = vec![false; self.rules.len()];
        let mut any = false;
        for hit in self.prefilter.find_iter(data) {
            let owner = self.keyword_owner[hit.pattern().as_usize()];
            candidates[owner] = true;
            any = true;
        }
        if !any {
            return Vec::new();
        }

        let mut findings = Vec::new();
        for (idx, rule) in self.rules.iter().enumerate() {
            if !candidates[idx] {
                continue;
            }
            for m in rule.regex.find_iter(data) {
                findings.push(Finding {
                    rule_id: rule.id.to_string(),
                    file: path.to_string(),
                    secret: String::from_utf8_lossy(m.as_bytes()).into_owned(),
                    start_line: line_of(data, m.start()),
                });
            }
        }
        findings
    }
}

/// 1-based line number of byte offset `pos` within `data`.
fn line_of(data: &[u8], pos: usize) -> u32 {
    memchr::memchr_iter(b'\n', &data[..pos]).count() as u32 + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_of_counts_newlines() {
        let data = b"a\nb\nc";
        assert_eq!(line_of(data, 0), 1);
        assert_eq!(line_of(data, 2), 2);
        assert_eq!(line_of(data, 4), 3);
    }

    #[test]
    fn test_prefilter_skips_clean_fragments() {
        let detector = Detector::new().unwrap();
        let data = vec![b'x'; 4096];
        assert!(detector.detect("clean.txt", &data).is_empty());
    }
}
