mod config;
mod relay;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use teloxide::prelude::*;
use teloxide::utils::command::BotCommands;
use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;

use config::Config;
use relay::{Cipher, Database, OpenAiClient, RelayConfig, RelayEngine, TelegramClient};

#[derive(BotCommands, Clone)]
#[command(rename_rule = "lowercase", description = "Supported commands:")]
enum Command {
    #[command(description = "start or resume the conversation")]
    Start,
    #[command(description = "end the current session")]
    Cancel,
}

#[tokio::main]
async fn main() -> ExitCode {
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = match Config::load(config_path.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("gptgate: {e}");
            return ExitCode::FAILURE;
        }
    };

    // Setup logging
    let log_dir = config.data_dir.join("logs");
    std::fs::create_dir_all(&log_dir).ok();
    let file_appender = tracing_appender::rolling::never(&log_dir, "gptgate.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .with_filter(
                    tracing_subscriber::EnvFilter::from_default_env()
                        .add_directive(tracing::Level::INFO.into()),
                ),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_filter(
                    tracing_subscriber::EnvFilter::from_default_env()
                        .add_directive(tracing::Level::INFO.into()),
                ),
        )
        .init();

    info!("🚀 Starting gptgate...");
    if let Some(ref path) = config_path {
        info!("Loaded config from {}", path.display());
    }
    info!(
        "Context policy: {:?} (window {}), failure policy: {:?}",
        config.context_policy, config.context_window, config.failure_policy
    );

    let database = match open_database(&config) {
        Ok(db) => db,
        Err(e) => {
            error!("Startup failed: {e}");
            return ExitCode::FAILURE;
        }
    };

    let completer = match OpenAiClient::new(
        config.openai_api_key.clone(),
        config.api_base.clone(),
        config.chat_model.clone(),
        config.completion_model.clone(),
        config.max_tokens,
        config.request_timeout,
    ) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            error!("Startup failed: {e}");
            return ExitCode::FAILURE;
        }
    };

    let bot = Bot::new(&config.telegram_token);
    let relay_config = RelayConfig {
        secret_phrase: config.secret_phrase.clone(),
        system_prompt: config.system_prompt.clone(),
        context_policy: config.context_policy,
        context_window: config.context_window,
    };
    let engine = Arc::new(RelayEngine::new(
        relay_config,
        database,
        completer,
        Arc::new(TelegramClient::new(bot.clone())),
        config.failure_policy,
    ));

    let handler = Update::filter_message()
        .filter(|msg: Message| msg.chat.is_private())
        .branch(
            dptree::entry()
                .filter_command::<Command>()
                .endpoint(handle_command),
        )
        .branch(dptree::endpoint(handle_text));

    let mut dispatcher = Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![engine.clone()])
        .enable_ctrlc_handler()
        .build();

    // Stop polling once the engine halts on a completion failure.
    let shutdown = dispatcher.shutdown_token();
    let mut halted = engine.supervisor().subscribe();
    tokio::spawn(async move {
        if halted.wait_for(|h| *h).await.is_ok() {
            warn!("Engine halted, stopping dispatcher");
            if let Ok(done) = shutdown.shutdown() {
                done.await;
            }
        }
    });

    dispatcher.dispatch().await;

    if engine.supervisor().is_halted() {
        error!("Stopped after a completion failure");
        ExitCode::FAILURE
    } else {
        info!("Stopped");
        ExitCode::SUCCESS
    }
}

fn open_database(config: &Config) -> Result<Database, String> {
    let cipher = Cipher::new(&config.aes_key).map_err(|e| format!("bad AES key: {e}"))?;
    if let Some(parent) = config.database_path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("cannot create {}: {e}", parent.display()))?;
    }
    let database = Database::open(&config.database_path, cipher).map_err(|e| e.to_string())?;
    database
        .encrypt_legacy_messages()
        .map_err(|e| format!("legacy encryption failed: {e}"))?;
    Ok(database)
}

fn sender_id(msg: &Message) -> Option<i64> {
    msg.from.as_ref().map(|u| u.id.0 as i64)
}

async fn handle_command(msg: Message, cmd: Command, engine: Arc<RelayEngine>) -> ResponseResult<()> {
    let Some(user_id) = sender_id(&msg) else {
        return Ok(());
    };

    match cmd {
        Command::Start => engine.handle_start(user_id).await,
        Command::Cancel => engine.handle_cancel(user_id).await,
    }
    Ok(())
}

async fn handle_text(msg: Message, engine: Arc<RelayEngine>) -> ResponseResult<()> {
    let (Some(user_id), Some(text)) = (sender_id(&msg), msg.text()) else {
        return Ok(());
    };

    engine.handle_text(user_id, text).await;
    Ok(())
}
