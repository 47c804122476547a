//! Per-user authorization state machine.
//!
//! `New -> AwaitingPhrase -> Authorized`. `Authorized` is sticky: the flag is
//! persisted in the users table and survives restarts. `Idle` is where
//! `/cancel` parks a session; it does not touch the persisted flag.

use crate::relay::database::User;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    /// No session and no user row yet.
    New,
    AwaitingPhrase,
    Authorized,
    Idle,
}

/// What to say when a user makes contact via `/start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContactReply {
    /// First contact: greeting plus phrase prompt.
    Greeting,
    /// Known but unauthorized user: prompt again.
    Prompt,
    WelcomeBack,
}

/// Result of a contact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Contact {
    pub state: AuthState,
    pub reply: ContactReply,
    /// A user row must be created.
    pub create_user: bool,
}

/// Decide the transition for a contact, given the stored user (if any).
pub fn on_contact(user: Option<&User>) -> Contact {
    match user {
        None => Contact {
            state: AuthState::AwaitingPhrase,
            reply: ContactReply::Greeting,
            create_user: true,
        },
        Some(u) if u.is_authorized => Contact {
            state: AuthState::Authorized,
            reply: ContactReply::WelcomeBack,
            create_user: false,
        },
        Some(_) => Contact {
            state: AuthState::AwaitingPhrase,
            reply: ContactReply::Prompt,
            create_user: false,
        },
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhraseCheck {
    Accepted,
    Rejected,
}

impl PhraseCheck {
    pub fn next_state(self) -> AuthState {
        match self {
            PhraseCheck::Accepted => AuthState::Authorized,
            PhraseCheck::Rejected => AuthState::AwaitingPhrase,
        }
    }
}

/// Exact, case-sensitive comparison. No trimming, no attempt limit.
pub fn check_phrase(input: &str, secret: &str) -> PhraseCheck {
    if input == secret {
        PhraseCheck::Accepted
    } else {
        PhraseCheck::Rejected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_contact() {
        let c = on_contact(None);
        assert_eq!(c.state, AuthState::AwaitingPhrase);
        assert_eq!(c.reply, ContactReply::Greeting);
        assert!(c.create_user);
    }

    #[test]
    fn test_returning_unauthorized() {
        let user = User { user_id: 1, is_authorized: false };
        let c = on_contact(Some(&user));
        assert_eq!(c.state, AuthState::AwaitingPhrase);
        assert_eq!(c.reply, ContactReply::Prompt);
        assert!(!c.create_user);
    }

    #[test]
    fn test_returning_authorized() {
        let user = User { user_id: 1, is_authorized: true };
        let c = on_contact(Some(&user));
        assert_eq!(c.state, AuthState::Authorized);
        assert_eq!(c.reply, ContactReply::WelcomeBack);
    }

    #[test]
    fn test_phrase_is_case_sensitive() {
        assert_eq!(check_phrase("Secret123", "Secret123"), PhraseCheck::Accepted);
        assert_eq!(check_phrase("secret123", "Secret123"), PhraseCheck::Rejected);
        assert_eq!(check_phrase("Secret123 ", "Secret123"), PhraseCheck::Rejected);
        assert_eq!(check_phrase("", "Secret123"), PhraseCheck::Rejected);
    }

    #[test]
    fn test_phrase_next_state() {
        assert_eq!(PhraseCheck::Accepted.next_state(), AuthState::Authorized);
        assert_eq!(PhraseCheck::Rejected.next_state(), AuthState::AwaitingPhrase);
    }
}
