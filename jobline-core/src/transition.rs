//! Transition elements
//!
//! Transitions route control after a step, flow, split or decision based on
//! its exit status. `on` patterns match the whole exit status; `*` matches
//! any run of characters and `?` matches exactly one.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;

static PATTERN_CACHE: Lazy<RwLock<HashMap<String, Regex>>> = Lazy::new(|| RwLock::new(HashMap::new()));

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Transition {
    /// Continue with the element named `to`
    Next { on: String, to: String },

    /// End the job as COMPLETED
    End {
        on: String,
        exit_status: Option<String>,
    },

    /// End the job as FAILED
    Fail {
        on: String,
        exit_status: Option<String>,
    },

    /// End the job as STOPPED; a restart resumes at `restart`
    Stop {
        on: String,
        exit_status: Option<String>,
        restart: Option<String>,
    },
}

impl Transition {
    pub fn next(on: impl Into<String>, to: impl Into<String>) -> Self {
        Transition::Next {
            on: on.into(),
            to: to.into(),
        }
    }

    pub fn end(on: impl Into<String>) -> Self {
        Transition::End {
            on: on.into(),
            exit_status: None,
        }
    }

    pub fn fail(on: impl Into<String>) -> Self {
        Transition::Fail {
            on: on.into(),
            exit_status: None,
        }
    }

    pub fn stop(on: impl Into<String>, restart: Option<&str>) -> Self {
        Transition::Stop {
            on: on.into(),
            exit_status: None,
            restart: restart.map(str::to_string),
        }
    }

    /// Override the exit status set on the job by `end`, `fail` or `stop`
    pub fn with_exit_status(mut self, status: impl Into<String>) -> Self {
        match &mut self {
            Transition::End { exit_status, .. }
            | Transition::Fail { exit_status, .. }
            | Transition::Stop { exit_status, .. } => *exit_status = Some(status.into()),
            Transition::Next { .. } => {}
        }
        self
    }

    pub fn on(&self) -> &str {
        match self {
            Transition::Next { on, .. }
            | Transition::End { on, .. }
            | Transition::Fail { on, .. }
            | Transition::Stop { on, .. } => on,
        }
    }

    pub fn matches(&self, exit_status: &str) -> bool {
        matches_pattern(self.on(), exit_status)
    }
}

/// First transition whose pattern matches, in declaration order
pub fn find_match<'a>(transitions: &'a [Transition], exit_status: &str) -> Option<&'a Transition> {
    transitions.iter().find(|t| t.matches(exit_status))
}

/// Match a whole value against an `on` pattern
pub fn matches_pattern(pattern: &str, value: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if !pattern.contains(['*', '?']) {
        return pattern == value;
    }

    if let Ok(cache) = PATTERN_CACHE.read() {
        if let Some(regex) = cache.get(pattern) {
            return regex.is_match(value);
        }
    }

    let Some(regex) = compile(pattern) else {
        return false;
    };
    let matched = regex.is_match(value);
    if let Ok(mut cache) = PATTERN_CACHE.write() {
        cache.insert(pattern.to_string(), regex);
    }
    matched
}

fn compile(pattern: &str) -> Option<Regex> {
    let mut source = String::with_capacity(pattern.len() + 8);
    source.push('^');
    for ch in pattern.chars() {
        match ch {
            '*' => source.push_str(".*"),
            '?' => source.push('.'),
            other => source.push_str(&regex::escape(&other.to_string())),
        }
    }
    source.push('$');

    Regex::new(&source).ok()
}
