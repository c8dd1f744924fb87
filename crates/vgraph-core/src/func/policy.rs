//! Which external commands a function may launch.
//!
//! Rules are evaluated first-match-wins; an unmatched command is denied.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CommandRule {
    Allow { command: String },
    Deny { command: String, reason: String },
}

impl CommandRule {
    pub fn matches(&self, command: &str) -> bool {
        match self {
            CommandRule::Allow { command: c } | CommandRule::Deny { command: c, .. } => {
                c == command
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandVerdict {
    Allowed,
    Denied { reason: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandPolicy {
    pub rules: Vec<CommandRule>,
}

impl CommandPolicy {
    /// A policy that denies everything.
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    /// Allow exactly the declared commands.
    pub fn declared<S: AsRef<str>>(commands: &[S]) -> Self {
        commands.iter().fold(Self::empty(), |policy, c| {
            policy.with_rule(CommandRule::Allow {
                command: c.as_ref().to_string(),
            })
        })
    }

    pub fn with_rule(mut self, rule: CommandRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn evaluate(&self, command: &str) -> CommandVerdict {
        match self.rules.iter().find(|r| r.matches(command)) {
            Some(CommandRule::Allow { .. }) => CommandVerdict::Allowed,
            Some(CommandRule::Deny { reason, .. }) => CommandVerdict::Denied {
                reason: reason.clone(),
            },
            None => CommandVerdict::Denied {
                reason: "not declared in the sandbox configuration".into(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_undeclared_command_denied() {
        let policy = CommandPolicy::declared(&["aws"]);
        assert_eq!(policy.evaluate("aws"), CommandVerdict::Allowed);
        assert!(matches!(
            policy.evaluate("curl"),
            CommandVerdict::Denied { .. }
        ));
    }

    #[test]
    fn test_first_match_wins() {
        let policy = CommandPolicy::empty()
            .with_rule(CommandRule::Deny {
                command: "aws".into(),
                reason: "maintenance".into(),
            })
            .with_rule(CommandRule::Allow {
                command: "aws".into(),
            });
        assert_eq!(
            policy.evaluate("aws"),
            CommandVerdict::Denied {
                reason: "maintenance".into()
            }
        );
    }
}
