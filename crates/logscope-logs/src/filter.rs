use regex::Regex;
use std::collections::HashSet;

use logscope_types::{LogLevel, LogRecord};

use crate::ansi::strip_ansi;

/// Compiled client-side search over log records
#[derive(Clone)]
pub struct CompiledFilter {
    /// Regex pattern (if any)
    regex: Option<Regex>,

    /// Original pattern string
    pattern: String,

    /// Log levels to include (empty = all)
    levels: HashSet<LogLevel>,

    invert: bool,
}

impl CompiledFilter {
    /// Create a new filter from a pattern string
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        Self::build(pattern, false)
    }

    /// Create a case-insensitive filter
    pub fn new_case_insensitive(pattern: &str) -> Result<Self, regex::Error> {
        Self::build(pattern, true)
    }

    /// A filter that matches every record
    pub fn match_all() -> Self {
        Self {
            regex: None,
            pattern: String::new(),
            levels: HashSet::new(),
            invert: false,
        }
    }

    fn build(pattern: &str, case_insensitive: bool) -> Result<Self, regex::Error> {
        let regex = match (pattern.is_empty(), case_insensitive) {
            (true, _) => None,
            (false, true) => Some(Regex::new(&format!("(?i){}", pattern))?),
            (false, false) => Some(Regex::new(pattern)?),
        };

        Ok(Self {
            regex,
            pattern: pattern.to_string(),
            ..Self::match_all()
        })
    }

    /// Set log levels to filter by
    pub fn with_levels(mut self, levels: HashSet<LogLevel>) -> Self {
        self.levels = levels;
        self
    }

    /// Keep only records the pattern does not match
    pub fn inverted(mut self) -> Self {
        self.invert = true;
        self
    }

    /// Check if a record matches this filter
    pub fn matches(&self, record: &LogRecord) -> bool {
        if !self.levels.is_empty() && !self.levels.contains(&record.level) {
            return self.invert;
        }

        // Search what the user sees, not the escape codes
        let text_match = match &self.regex {
            Some(re) => re.is_match(&strip_ansi(&record.text)),
            None => true,
        };

        if self.invert { !text_match } else { text_match }
    }

    /// Find all match positions in a string (for highlighting)
    pub fn find_matches(&self, text: &str) -> Vec<(usize, usize)> {
        match &self.regex {
            Some(re) if !self.invert => re.find_iter(text).map(|m| (m.start(), m.end())).collect(),
            _ => Vec::new(),
        }
    }

    /// Get the original pattern
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Check if filter is empty (matches everything)
    pub fn is_empty(&self) -> bool {
        self.regex.is_none() && self.levels.is_empty() && !self.invert
    }

    pub fn is_inverted(&self) -> bool {
        self.invert
    }
}

impl std::fmt::Debug for CompiledFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledFilter")
            .field("pattern", &self.pattern)
            .field("levels", &self.levels)
            .field("invert", &self.invert)
            .finish()
    }
}

/// Quick filter presets
pub struct FilterPresets;

impl FilterPresets {
    /// Filter for errors only
    pub fn errors_only() -> CompiledFilter {
        CompiledFilter::match_all().with_levels(HashSet::from([LogLevel::Error, LogLevel::Fatal]))
    }

    /// Filter for warnings and above
    pub fn warnings_and_above() -> CompiledFilter {
        CompiledFilter::match_all().with_levels(HashSet::from([
            LogLevel::Warn,
            LogLevel::Error,
            LogLevel::Fatal,
        ]))
    }
}
