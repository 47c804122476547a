//! Context assembly: which stored history goes into a completion request.

use serde::Deserialize;

use crate::relay::database::StoredMessage;
use crate::relay::openai::{CompletionRequest, Role, Turn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextPolicy {
    /// System preamble, the previous bot reply and the current input.
    SingleTurn,
    /// The last N stored messages joined into one prompt.
    #[default]
    Windowed,
}

/// Build a single-turn chat request.
///
/// The role labels are inverted: the previous bot reply goes out as `user`
/// and the current input as `assistant`. Probably a historical mistake, but
/// existing conversations were produced this way.
pub fn single_turn(system_prompt: &str, prior_bot_reply: Option<&str>, input: &str) -> CompletionRequest {
    let mut turns = Vec::with_capacity(3);
    turns.push(Turn::new(Role::System, system_prompt));
    if let Some(prior) = prior_bot_reply {
        turns.push(Turn::new(Role::User, prior));
    }
    turns.push(Turn::new(Role::Assistant, input));
    CompletionRequest::Chat(turns)
}

/// Build a windowed prompt from history ordered oldest to newest.
pub fn windowed(history: &[StoredMessage]) -> CompletionRequest {
    let prompt = history
        .iter()
        .map(|m| m.text.as_str())
        .collect::<Vec<_>>()
        .join("\n");
    CompletionRequest::Prompt(prompt)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stored(id: i64, text: &str, is_bot: bool) -> StoredMessage {
        StoredMessage {
            id,
            user_id: 1,
            text: text.to_string(),
            is_bot,
            timestamp: "2024-01-01 10:00:00".to_string(),
        }
    }

    #[test]
    fn test_single_turn_inverted_roles() {
        let req = single_turn("You are a helpful assistant.", Some("previous answer"), "new question");
        let CompletionRequest::Chat(turns) = req else {
            panic!("expected chat request");
        };
        assert_eq!(
            turns,
            vec![
                Turn::new(Role::System, "You are a helpful assistant."),
                Turn::new(Role::User, "previous answer"),
                Turn::new(Role::Assistant, "new question"),
            ]
        );
    }

    #[test]
    fn test_single_turn_without_prior_reply() {
        let req = single_turn("sys", None, "first");
        let CompletionRequest::Chat(turns) = req else {
            panic!("expected chat request");
        };
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[1], Turn::new(Role::Assistant, "first"));
    }

    #[test]
    fn test_windowed_joins_in_order() {
        let history = [stored(1, "hi", false), stored(2, "hello!", true), stored(3, "how are you?", false)];
        assert_eq!(
            windowed(&history),
            CompletionRequest::Prompt("hi\nhello!\nhow are you?".to_string())
        );
    }

    #[test]
    fn test_policy_deserialize() {
        let p: ContextPolicy = serde_json::from_str(r#""single_turn""#).unwrap();
        assert_eq!(p, ContextPolicy::SingleTurn);
        let p: ContextPolicy = serde_json::from_str(r#""windowed""#).unwrap();
        assert_eq!(p, ContextPolicy::Windowed);
        assert_eq!(ContextPolicy::default(), ContextPolicy::Windowed);
    }
}
