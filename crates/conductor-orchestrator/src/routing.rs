//! Keyword routing of free-text task descriptions.
//!
//! The description is split on non-alphanumeric characters and lowercased.
//! A keyword of three or more characters matches anywhere inside a word
//! ("deploy" matches "redeployment"); shorter keywords such as "pr" must match
//! a whole word. Multi-word keywords must appear as consecutive words: the
//! first part may end a word and the last part may start one, the rest must
//! match exactly ("write code" matches "rewrite codebase").

use crate::types::{AgentType, TaskPriority};
use serde::{Deserialize, Serialize};

/// Checked in order; anything unmatched is [`TaskPriority::Normal`].
const PRIORITY_RULES: &[(TaskPriority, &[&str])] = &[
    (TaskPriority::Critical, &["critical", "urgent", "hotfix"]),
    (TaskPriority::High, &["important", "high priority", "security"]),
    (TaskPriority::Low, &["minor", "low priority"]),
];

/// Checked in order, first match wins; anything unmatched goes to the
/// coordinator.
const AGENT_RULES: &[(AgentType, &[&str])] = &[
    (
        AgentType::Codegen,
        &["generate", "create", "implement", "write code"],
    ),
    (AgentType::Review, &["review", "check"]),
    (AgentType::Test, &["test", "coverage"]),
    (AgentType::Issue, &["issue", "bug", "analyze", "security"]),
    (AgentType::Pr, &["pr", "pull request", "merge"]),
    (AgentType::Deployment, &["deploy", "release"]),
];

const MIN_SUBSTRING_LEN: usize = 3;

/// Inferred routing for a description.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    /// Inferred urgency.
    pub priority: TaskPriority,
    /// Agent the task goes to.
    pub agent: AgentType,
}

/// Infer both priority and agent.
pub fn route(description: &str) -> Route {
    let words = tokenize(description);
    Route {
        priority: first_match(&words, PRIORITY_RULES).unwrap_or(TaskPriority::Normal),
        agent: first_match(&words, AGENT_RULES).unwrap_or(AgentType::Coordinator),
    }
}

/// Infer priority alone.
pub fn infer_priority(description: &str) -> TaskPriority {
    first_match(&tokenize(description), PRIORITY_RULES).unwrap_or(TaskPriority::Normal)
}

/// Infer the agent alone.
pub fn infer_agent(description: &str) -> AgentType {
    first_match(&tokenize(description), AGENT_RULES).unwrap_or(AgentType::Coordinator)
}

fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|word| !word.is_empty())
        .map(str::to_lowercase)
        .collect()
}

fn first_match<T: Copy>(words: &[String], rules: &[(T, &[&str])]) -> Option<T> {
    rules
        .iter()
        .find(|(_, keywords)| keywords.iter().any(|kw| contains_keyword(words, kw)))
        .map(|(value, _)| *value)
}

fn contains_keyword(words: &[String], keyword: &str) -> bool {
    let parts: Vec<&str> = keyword.split_whitespace().collect();
    match parts.as_slice() {
        [] => false,
        [single] => words.iter().any(|word| word_matches(word, single)),
        [first, middle @ .., last] => words.windows(parts.len()).any(|window| {
            let n = window.len();
            window[0].ends_with(first)
                && window[1..n - 1].iter().zip(middle).all(|(word, part)| word == part)
                && window[n - 1].starts_with(last)
        }),
    }
}

fn word_matches(word: &str, keyword: &str) -> bool {
    if keyword.len() < MIN_SUBSTRING_LEN {
        word == keyword
    } else {
        word.contains(keyword)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_urgent_security_fix() {
        let route = route("URGENT: fix critical security vulnerability");
        assert_eq!(route.priority, TaskPriority::Critical);
        assert_eq!(route.agent, AgentType::Issue);
    }

    #[test]
    fn test_priority_keywords() {
        assert_eq!(infer_priority("hotfix for login"), TaskPriority::Critical);
        assert_eq!(infer_priority("This is HIGH PRIORITY"), TaskPriority::High);
        assert_eq!(infer_priority("security audit"), TaskPriority::High);
        assert_eq!(infer_priority("minor typo"), TaskPriority::Low);
        assert_eq!(infer_priority("low priority cleanup"), TaskPriority::Low);
        assert_eq!(infer_priority("rename a variable"), TaskPriority::Normal);
    }

    #[test]
    fn test_critical_beats_low() {
        assert_eq!(infer_priority("minor but urgent"), TaskPriority::Critical);
    }

    #[test]
    fn test_agent_table_order() {
        assert_eq!(infer_agent("Implement OAuth login"), AgentType::Codegen);
        assert_eq!(infer_agent("please write code for the parser"), AgentType::Codegen);
        assert_eq!(infer_agent("Review the auth module"), AgentType::Review);
        assert_eq!(infer_agent("increase coverage"), AgentType::Test);
        assert_eq!(infer_agent("Analyze the crash report"), AgentType::Issue);
        assert_eq!(infer_agent("open a PR for the fix"), AgentType::Pr);
        assert_eq!(infer_agent("merge the feature branch"), AgentType::Pr);
        assert_eq!(infer_agent("deploy to staging"), AgentType::Deployment);
        assert_eq!(infer_agent("summarize the week"), AgentType::Coordinator);
    }

    #[test]
    fn test_first_match_wins() {
        // "create" (codegen) is checked before "pull request" (pr).
        assert_eq!(infer_agent("create a pull request"), AgentType::Codegen);
        assert_eq!(infer_agent("review the test plan"), AgentType::Review);
    }

    #[test]
    fn test_keywords_match_inside_words() {
        assert_eq!(infer_agent("deployment checklist"), AgentType::Review);
        assert_eq!(infer_agent("release notes"), AgentType::Deployment);
        assert_eq!(infer_agent("bugs in the importer"), AgentType::Issue);
        assert_eq!(infer_agent("redeploy the api service"), AgentType::Deployment);
        assert_eq!(infer_agent("autogenerate the client"), AgentType::Codegen);
        assert_eq!(infer_agent("retest the parser"), AgentType::Test);
        assert_eq!(infer_agent("recheck the config"), AgentType::Review);
        assert_eq!(infer_priority("non-critical cleanup"), TaskPriority::Critical);
    }

    #[test]
    fn test_phrase_edges_match_partial_words() {
        assert_eq!(infer_agent("rewrite codebase docs"), AgentType::Codegen);
        assert_eq!(infer_agent("file a pull requests batch"), AgentType::Pr);
    }

    #[test]
    fn test_short_keywords_need_whole_word() {
        // "pr" must not fire inside "improve" or "process".
        assert_eq!(infer_agent("improve the process"), AgentType::Coordinator);
        assert_eq!(infer_agent("pr #42 needs a rebase"), AgentType::Pr);
    }

    #[test]
    fn test_phrases_need_consecutive_words() {
        assert_eq!(infer_priority("high load, priority unclear"), TaskPriority::Normal);
        assert_eq!(infer_agent("write the code"), AgentType::Coordinator);
    }

    #[test]
    fn test_empty_description() {
        assert_eq!(
            route(""),
            Route {
                priority: TaskPriority::Normal,
                agent: AgentType::Coordinator,
            }
        );
    }
}
