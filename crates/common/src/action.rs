//! Declarative browser actions that make up a test case

use serde::{Deserialize, Serialize};

/// A single step executed against a browser session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum BrowserAction {
    /// Navigate to a URL (absolute, or relative to the run's base URL)
    Navigate { url: String },

    /// Click an element
    Click {
        selector: String,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },

    /// Fill an input field
    Fill { selector: String, value: String },

    /// Press a key, optionally on a focused element
    Press {
        #[serde(default)]
        selector: Option<String>,
        key: String,
    },

    /// Wait for an element to reach a state
    Wait {
        selector: String,
        #[serde(default = "default_wait_timeout")]
        timeout_ms: u64,
        #[serde(default)]
        state: WaitState,
    },

    /// Wait for a fixed amount of time (use sparingly)
    Sleep { ms: u64 },

    /// Assert something about an element
    Assert {
        selector: String,
        #[serde(default)]
        visible: Option<bool>,
        #[serde(default)]
        text_contains: Option<String>,
        #[serde(default)]
        min_count: Option<usize>,
    },

    /// Assert that the current URL differs from `from`, or contains `contains`
    AssertUrl {
        #[serde(default)]
        changed_from: Option<String>,
        #[serde(default)]
        contains: Option<String>,
    },

    /// Assert that no exchange since the last navigation returned a 5xx
    AssertNoServerErrors,

    /// Take a screenshot
    Screenshot { name: String },

    /// Log a message (for debugging)
    Log { message: String },
}

fn default_wait_timeout() -> u64 {
    5000
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitState {
    #[default]
    Visible,
    Hidden,
    Attached,
    Detached,
}

impl WaitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WaitState::Visible => "visible",
            WaitState::Hidden => "hidden",
            WaitState::Attached => "attached",
            WaitState::Detached => "detached",
        }
    }
}

impl BrowserAction {
    /// Short human-readable label used in step records and logs
    pub fn label(&self) -> String {
        match self {
            BrowserAction::Navigate { url } => format!("navigate:{}", url),
            BrowserAction::Click { selector, .. } => format!("click:{}", selector),
            BrowserAction::Fill { selector, .. } => format!("fill:{}", selector),
            BrowserAction::Press { key, .. } => format!("press:{}", key),
            BrowserAction::Wait { selector, .. } => format!("wait:{}", selector),
            BrowserAction::Sleep { ms } => format!("sleep:{}ms", ms),
            BrowserAction::Assert { selector, .. } => format!("assert:{}", selector),
            BrowserAction::AssertUrl { .. } => "assert_url".to_string(),
            BrowserAction::AssertNoServerErrors => "assert_no_server_errors".to_string(),
            BrowserAction::Screenshot { name } => format!("screenshot:{}", name),
            BrowserAction::Log { message } => {
                let end = message
                    .char_indices()
                    .nth(30)
                    .map(|(i, _)| i)
                    .unwrap_or(message.len());
                format!("log:{}", &message[..end])
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tagged_actions() {
        let json = r#"[
            {"action": "navigate", "url": "/orders"},
            {"action": "fill", "selector": "input[name=q]", "value": "abc"},
            {"action": "wait", "selector": "table"},
            {"action": "assert_no_server_errors"}
        ]"#;
        let actions: Vec<BrowserAction> = serde_json::from_str(json).unwrap();
        assert_eq!(actions.len(), 4);
        match &actions[2] {
            BrowserAction::Wait { timeout_ms, state, .. } => {
                assert_eq!(*timeout_ms, 5000);
                assert_eq!(*state, WaitState::Visible);
            }
            other => panic!("unexpected action {:?}", other),
        }
    }

    #[test]
    fn test_log_label_truncates_on_char_boundary() {
        let action = BrowserAction::Log {
            message: "é".repeat(40),
        };
        assert_eq!(action.label().chars().count(), "log:".len() + 30);
    }
}
