//! Relay module - gates Telegram users behind a passphrase and relays their
//! messages to OpenAI.

pub mod auth;
pub mod cipher;
pub mod context;
pub mod database;
pub mod engine;
pub mod openai;
pub mod supervisor;
pub mod telegram;


pub use cipher::Cipher;
pub use database::Database;
pub use engine::{RelayConfig, RelayEngine};
pub use openai::OpenAiClient;
pub use telegram::TelegramClient;
