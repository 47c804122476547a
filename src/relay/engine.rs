//! Relay engine - routes each update by the user's auth state.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{error, info, warn};

use crate::relay::auth::{self, AuthState, ContactReply, PhraseCheck};
use crate::relay::context::{self, ContextPolicy};
use crate::relay::database::{Database, DbError, TIMESTAMP_FORMAT};
use crate::relay::openai::{Completer, CompletionError};
use crate::relay::supervisor::{self, FailurePolicy, Supervisor};
use crate::relay::telegram::Outbox;

pub const GREETING: &str =
    "Hi! I'm a bot powered by GPT-3.5. Please enter the passphrase to get access.";
pub const PROMPT: &str = "Please enter the passphrase to get access.";
pub const WELCOME_BACK: &str = "Welcome back! How can I help?";
pub const WELCOME: &str = "You're in! How can I help?";
pub const RETRY: &str = "Sorry, that passphrase is wrong. Please try again.";
pub const GOODBYE: &str = "Session ended. Send /start to begin again.";
pub const IDLE_HINT: &str = "Send /start to begin.";
pub const OUTAGE: &str =
    "The assistant is unavailable because of a problem with the AI service. The bot is shutting down.";
pub const APOLOGY: &str = "Sorry, I couldn't get an answer right now. Please try again later.";
pub const FAILURE: &str = "Something went wrong on my side. Please try again later.";

/// Engine settings taken from the process config.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub secret_phrase: String,
    pub system_prompt: String,
    pub context_policy: ContextPolicy,
    pub context_window: usize,
}

/// The relay engine. Built once at startup and shared by all handlers.
pub struct RelayEngine {
    config: RelayConfig,
    database: Database,
    completer: Arc<dyn Completer>,
    outbox: Arc<dyn Outbox>,
    supervisor: Supervisor,
    /// One entry per user seen by this process, so bounded by the `users` table.
    sessions: Mutex<HashMap<i64, AuthState>>,
    /// Serializes updates of the same user. Entries live only while a turn is
    /// running or waiting.
    user_locks: StdMutex<HashMap<i64, Arc<Mutex<()>>>>,
}

/// Exclusive turn of one user. Dropping it releases the lock and forgets
/// the user's entry when nobody else is waiting on it.
struct UserTurn<'a> {
    locks: &'a StdMutex<HashMap<i64, Arc<Mutex<()>>>>,
    user_id: i64,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for UserTurn<'_> {
    fn drop(&mut self) {
        self.guard.take();
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if locks.get(&self.user_id).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(&self.user_id);
        }
    }
}

impl RelayEngine {
    pub fn new(
        config: RelayConfig,
        database: Database,
        completer: Arc<dyn Completer>,
        outbox: Arc<dyn Outbox>,
        failure_policy: FailurePolicy,
    ) -> Self {
        Self {
            config,
            database,
            completer,
            outbox,
            supervisor: Supervisor::new(failure_policy),
            sessions: Mutex::new(HashMap::new()),
            user_locks: StdMutex::new(HashMap::new()),
        }
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    #[cfg(test)]
    pub fn database(&self) -> &Database {
        &self.database
    }

    #[cfg(test)]
    pub fn tracked_locks(&self) -> usize {
        self.user_locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Current session state; `New` if the user has none.
    pub async fn session_state(&self, user_id: i64) -> AuthState {
        self.sessions
            .lock()
            .await
            .get(&user_id)
            .copied()
            .unwrap_or(AuthState::New)
    }

    /// Handle `/start`.
    pub async fn handle_start(&self, user_id: i64) {
        let _turn = self.begin_turn(user_id).await;
        if self.supervisor.is_halted() {
            return;
        }

        info!("👋 /start from {}", user_id);
        if let Err(e) = self.contact(user_id).await {
            self.report_failure(user_id, e).await;
        }
    }

    /// Handle `/cancel`.
    pub async fn handle_cancel(&self, user_id: i64) {
        let _turn = self.begin_turn(user_id).await;
        if self.supervisor.is_halted() {
            return;
        }

        info!("🛑 /cancel from {}", user_id);
        self.set_state(user_id, AuthState::Idle).await;
        self.reply(user_id, GOODBYE).await;
    }

    /// Handle free text.
    pub async fn handle_text(&self, user_id: i64, text: &str) {
        let _turn = self.begin_turn(user_id).await;
        if self.supervisor.is_halted() {
            return;
        }

        let result = match self.session_state(user_id).await {
            AuthState::New => self.rehydrate(user_id, text).await,
            AuthState::AwaitingPhrase => self.check_phrase(user_id, text).await,
            AuthState::Authorized => self.chat(user_id, text).await,
            AuthState::Idle => {
                self.reply(user_id, IDLE_HINT).await;
                Ok(())
            }
        };

        if let Err(e) = result {
            self.report_failure(user_id, e).await;
        }
    }

    async fn contact(&self, user_id: i64) -> Result<(), DbError> {
        let user = self.database.get_user(user_id)?;
        let contact = auth::on_contact(user.as_ref());
        if contact.create_user {
            self.database.create_user(user_id)?;
            info!("New user {}", user_id);
        }
        self.set_state(user_id, contact.state).await;

        let text = match contact.reply {
            ContactReply::Greeting => GREETING,
            ContactReply::Prompt => PROMPT,
            ContactReply::WelcomeBack => WELCOME_BACK,
        };
        self.reply(user_id, text).await;
        Ok(())
    }

    /// No session in memory (fresh process or never started): consult the store.
    async fn rehydrate(&self, user_id: i64, text: &str) -> Result<(), DbError> {
        match self.database.get_user(user_id)? {
            Some(user) if user.is_authorized => {
                self.set_state(user_id, AuthState::Authorized).await;
                self.chat(user_id, text).await
            }
            _ => self.contact(user_id).await,
        }
    }

    async fn check_phrase(&self, user_id: i64, input: &str) -> Result<(), DbError> {
        match auth::check_phrase(input, &self.config.secret_phrase) {
            PhraseCheck::Accepted => {
                self.database.set_authorized(user_id, true)?;
                self.set_state(user_id, PhraseCheck::Accepted.next_state()).await;
                info!("🔓 User {} authorized", user_id);
                self.reply(user_id, WELCOME).await;
            }
            PhraseCheck::Rejected => {
                info!("🔒 Wrong passphrase from {}", user_id);
                self.reply(user_id, RETRY).await;
            }
        }
        Ok(())
    }

    async fn chat(&self, user_id: i64, text: &str) -> Result<(), DbError> {
        info!("💬 Chat from {} ({} chars)", user_id, text.chars().count());

        let request = match self.config.context_policy {
            ContextPolicy::SingleTurn => {
                let prior = self.database.last_bot_message(user_id)?;
                self.database.append(user_id, text, false, &now())?;
                context::single_turn(&self.config.system_prompt, prior.as_deref(), text)
            }
            ContextPolicy::Windowed => {
                self.database.append(user_id, text, false, &now())?;
                let history = self.database.recent_messages(user_id, self.config.context_window)?;
                context::windowed(&history)
            }
        };

        let result = self.completer.complete(&request).await;
        if self.supervisor.is_halted() {
            // Another failure stopped the engine while this request was running.
            info!("Dropping completion for {}: engine halted", user_id);
            return Ok(());
        }

        match result {
            Ok(reply) => {
                let reply = reply.trim();
                self.database.append(user_id, reply, true, &now())?;
                self.reply(user_id, reply).await;
                Ok(())
            }
            Err(e) => self.on_completion_failure(user_id, e).await,
        }
    }

    async fn on_completion_failure(&self, user_id: i64, e: CompletionError) -> Result<(), DbError> {
        if e.is_api_error() {
            error!("OpenAI API error for {}: {}", user_id, e);
        } else {
            error!("Unexpected completion failure for {}: {}", user_id, e);
        }

        match self.supervisor.policy() {
            FailurePolicy::Apologize => {
                self.reply(user_id, APOLOGY).await;
            }
            FailurePolicy::Shutdown => {
                if self.supervisor.halt() {
                    warn!("Completion failed, notifying all users and shutting down");
                    supervisor::broadcast(&self.database, self.outbox.as_ref(), OUTAGE).await?;
                }
            }
        }
        Ok(())
    }

    async fn report_failure(&self, user_id: i64, e: DbError) {
        error!("Handling update from {} failed: {}", user_id, e);
        self.reply(user_id, FAILURE).await;
    }

    async fn reply(&self, user_id: i64, text: &str) {
        // Delivery failures are logged by the outbox.
        let _ = self.outbox.send(user_id, text).await;
    }

    async fn set_state(&self, user_id: i64, state: AuthState) {
        self.sessions.lock().await.insert(user_id, state);
    }

    async fn begin_turn(&self, user_id: i64) -> UserTurn<'_> {
        let lock = self
            .user_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(user_id)
            .or_default()
            .clone();
        let guard = lock.lock_owned().await;
        UserTurn { locks: &self.user_locks, user_id, guard: Some(guard) }
    }
}

fn now() -> String {
    chrono::Utc::now().format(TIMESTAMP_FORMAT).to_string()
}
