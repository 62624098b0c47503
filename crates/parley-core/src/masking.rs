// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Redaction of sensitive values before messages are logged.
//!
//! Two passes are folded into a single walk over the JSON tree:
//!
//! 1. **Keyed masking.** Fields listed in the masking table have their scalars
//!    replaced by `***`. Containers are walked down to the configured preserve
//!    depth; anything deeper collapses into a structural summary
//!    `*items-<n>*collections-<m>*maxdepth-<d>*`.
//! 2. **Card masking.** Inside text-bearing fields every card-number shaped
//!    substring keeps its last four digits and loses the rest.
//!
//! Precedence per key: whitelist, then keyed masking, then card masking,
//! otherwise the value is walked unchanged.

use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};

/// Replacement for masked scalars.
pub const MASK: &str = "***";

/// Preserve depth used when a field is listed without an explicit depth.
pub const DEFAULT_PRESERVE_DEPTH: i32 = 2;

/// Fields masked when no configuration is supplied.
pub const DEFAULT_MASKING_FIELDS: &[&str] = &[
    "token",
    "access_token",
    "refresh_token",
    "epkId",
    "profileId",
];

/// Text-bearing fields scanned for card numbers.
pub const DEFAULT_CARD_MASKING_FIELDS: &[&str] = &[
    "message",
    "original_text",
    "normalized_text",
    "asr_normalized_message",
    "human_normalized_text",
    "original_message",
    "incoming_text",
    "annotations",
    "tokenized_elements_list",
    "debug_info",
];

// 18 digits, 16 digits, or 4x4 space separated groups with an optional 2-digit tail.
// The leading and trailing groups stand in for digit boundaries.
static CARD_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:^|\D)(\d{18}|\d{16}|\d{4} \d{4} \d{4} \d{4}(?: ?\d{2})?)(?:\D|$)")
        .expect("card regex is valid")
});

static SUMMARY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\*items-\d+\*collections-\d+\*maxdepth-\d+\*$").expect("summary regex is valid")
});

/// Masking configuration and entry point.
#[derive(Debug, Clone)]
pub struct Masker {
    fields: HashMap<String, i32>,
    whitelist: HashSet<String>,
    card_fields: HashSet<String>,
    available_depth: i32,
}

impl Default for Masker {
    fn default() -> Self {
        Self::new(
            DEFAULT_MASKING_FIELDS
                .iter()
                .map(|f| (f.to_string(), DEFAULT_PRESERVE_DEPTH)),
        )
    }
}

impl Masker {
    /// Create a masker for the given `{field: preserve_depth}` table.
    pub fn new(fields: impl IntoIterator<Item = (String, i32)>) -> Self {
        Self {
            fields: fields.into_iter().collect(),
            whitelist: HashSet::new(),
            card_fields: DEFAULT_CARD_MASKING_FIELDS
                .iter()
                .map(|f| f.to_string())
                .collect(),
            available_depth: -1,
        }
    }

    /// Keys that are never masked.
    pub fn with_whitelist(mut self, keys: impl IntoIterator<Item = String>) -> Self {
        self.whitelist = keys.into_iter().collect();
        self
    }

    /// Replace the set of text-bearing fields scanned for card numbers.
    pub fn with_card_fields(mut self, keys: impl IntoIterator<Item = String>) -> Self {
        self.card_fields = keys.into_iter().collect();
        self
    }

    /// Cap how deep the structural summary walk descends (`-1` is unbounded).
    pub fn with_available_depth(mut self, depth: i32) -> Self {
        self.available_depth = depth;
        self
    }

    /// Return a masked copy of `value`.
    pub fn mask(&self, value: &Value) -> Value {
        self.walk(value, false)
    }

    /// Mask and serialize `value` as JSON text.
    pub fn mask_to_string(&self, value: &Value) -> String {
        self.mask(value).to_string()
    }

    fn walk(&self, value: &Value, card: bool) -> Value {
        match value {
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(key, child)| (key.clone(), self.mask_entry(key, child, card)))
                    .collect::<Map<_, _>>(),
            ),
            Value::Array(items) => {
                Value::Array(items.iter().map(|item| self.walk(item, card)).collect())
            }
            Value::String(text) if card => Value::String(mask_card_numbers(text)),
            Value::Number(number) if card && (number.is_i64() || number.is_u64()) => {
                let text = number.to_string();
                let masked = mask_card_numbers(&text);
                if masked == text {
                    value.clone()
                } else {
                    Value::String(masked)
                }
            }
            other => other.clone(),
        }
    }

    fn mask_entry(&self, key: &str, value: &Value, card: bool) -> Value {
        if self.whitelist.contains(key) {
            return value.clone();
        }
        if let Some(depth) = self.fields.get(key) {
            return self.mask_subtree(value, *depth);
        }
        self.walk(value, card || self.card_fields.contains(key))
    }

    fn mask_subtree(&self, value: &Value, depth: i32) -> Value {
        match value {
            Value::Object(map) if depth > 0 => Value::Object(
                map.iter()
                    .map(|(key, child)| (key.clone(), self.mask_subtree(child, depth - 1)))
                    .collect(),
            ),
            Value::Array(items) if depth > 0 => Value::Array(
                items
                    .iter()
                    .map(|item| self.mask_subtree(item, depth - 1))
                    .collect(),
            ),
            Value::Object(_) | Value::Array(_) => {
                Value::String(StructureSummary::of(value, self.available_depth).to_string())
            }
            Value::String(text) if is_masked(text) => value.clone(),
            _ => Value::String(MASK.to_string()),
        }
    }
}

fn is_masked(text: &str) -> bool {
    text == MASK || SUMMARY_RE.is_match(text)
}

/// Shape of a subtree that is too deep to keep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StructureSummary {
    /// Scalar leaves.
    pub items: usize,
    /// Containers below the root.
    pub collections: usize,
    /// Deepest level reached (root children are level 1).
    pub max_depth: usize,
}

impl StructureSummary {
    /// Walk `value` once, descending at most `available_depth` levels (`-1` is unbounded).
    pub fn of(value: &Value, available_depth: i32) -> Self {
        let mut summary = Self::default();
        summary.visit_children(value, 1, available_depth);
        summary
    }

    fn visit_children(&mut self, value: &Value, level: usize, available_depth: i32) {
        if available_depth >= 0 && level > available_depth as usize {
            return;
        }
        let children: Box<dyn Iterator<Item = &Value>> = match value {
            Value::Object(map) => Box::new(map.values()),
            Value::Array(items) => Box::new(items.iter()),
            _ => return,
        };
        for child in children {
            self.max_depth = self.max_depth.max(level);
            match child {
                Value::Object(_) | Value::Array(_) => {
                    self.collections += 1;
                    self.visit_children(child, level + 1, available_depth);
                }
                _ => self.items += 1,
            }
        }
    }
}

impl std::fmt::Display for StructureSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "*items-{}*collections-{}*maxdepth-{}*",
            self.items, self.collections, self.max_depth
        )
    }
}

/// Replace card-number shaped substrings, keeping the last four digits of each.
pub fn mask_card_numbers(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut copied = 0;
    let mut start = 0;
    while start < text.len() {
        let Some(caps) = CARD_RE.captures_at(text, start) else {
            break;
        };
        let Some(card) = caps.get(1) else {
            break;
        };
        out.push_str(&text[copied..card.start()]);
        out.push_str(&mask_run(card.as_str()));
        copied = card.end();
        start = card.end();
    }
    out.push_str(&text[copied..]);
    out
}

// Separators between the kept last four digits stay readable.
fn mask_run(run: &str) -> String {
    let tail = run
        .char_indices()
        .rev()
        .filter(|(_, ch)| ch.is_ascii_digit())
        .nth(3)
        .map_or(0, |(at, _)| at);
    let mut masked: String = run[..tail].chars().map(|_| '*').collect();
    masked.push_str(&run[tail..]);
    masked
}

/// Luhn checksum over the digits of `number`; non-digits are ignored.
pub fn luhn_valid(number: &str) -> bool {
    let digits: Vec<u32> = number.chars().filter_map(|c| c.to_digit(10)).collect();
    if digits.len() < 2 {
        return false;
    }
    let sum: u32 = digits
        .iter()
        .rev()
        .enumerate()
        .map(|(i, &d)| {
            if i % 2 == 1 {
                let doubled = d * 2;
                if doubled > 9 { doubled - 9 } else { doubled }
            } else {
                d
            }
        })
        .sum();
    sum % 10 == 0
}
