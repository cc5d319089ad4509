use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use tracing::{error, info};

use mojiokoshi::audio::{Mixer, OpusMixer};
use mojiokoshi::config::Config;
use mojiokoshi::discord::{Client, GatewayClient};
use mojiokoshi::session::{self, Manager};
use mojiokoshi::speech::{CloudSpeechConfig, CloudSpeechTranscriber};
use mojiokoshi::storage::{run_migration, PostgresRepository};
use mojiokoshi::webhook::HttpSender;

const DISCORD_CONNECT_TIMEOUT: Duration = Duration::from_secs(20);

#[tokio::main]
async fn main() {
    let cfg = match Config::load() {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("config validation failed: {err:#}");
            std::process::exit(1);
        }
    };
    init_logger(&cfg);
    info!(env = %cfg.env, "startup: configuration loaded");

    let (manager, discord) = match setup(cfg).await {
        Ok(parts) => parts,
        Err(err) => {
            error!(error = %format!("{err:#}"), "startup failed");
            std::process::exit(1);
        }
    };

    // The serve phase runs in its own task so a panic degrades to a clean
    // shutdown with a non-zero exit instead of an abrupt process death.
    let serve_discord = Arc::clone(&discord);
    let result = tokio::spawn(serve(serve_discord)).await;
    match result {
        Ok(()) => {
            shutdown(&manager, &discord, session::STOP_REASON_SERVER_CLOSED).await;
        }
        Err(join_err) => {
            error!(panic = join_err.is_panic(), "bot terminated abnormally");
            shutdown(&manager, &discord, session::STOP_REASON_UNKNOWN_ERROR).await;
            std::process::exit(1);
        }
    }
}

fn init_logger(cfg: &Config) {
    let level = if cfg.is_development() {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();
}

async fn setup(cfg: Config) -> Result<(Arc<Manager>, Arc<GatewayClient>)> {
    info!("startup: connecting to database");
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&cfg.database_url)
        .await
        .context("failed to connect to database")?;
    run_migration(&pool).await.context("failed to run migration")?;
    info!("startup: database ready");

    let repo = Arc::new(PostgresRepository::new(pool));
    let discord = Arc::new(GatewayClient::new(&cfg.discord_token));
    let transcriber = Arc::new(CloudSpeechTranscriber::new(CloudSpeechConfig {
        project_id: cfg.google_cloud_project_id.clone(),
        credentials_json: cfg.google_cloud_credentials_json.clone(),
        language: cfg.default_transcribe_language.clone(),
        location: cfg.google_cloud_speech_location.clone(),
        model: cfg.google_cloud_speech_model.clone(),
    }));
    let webhook = Arc::new(HttpSender::new(cfg.transcript_webhook_url.clone()));

    let guild_id = cfg.discord_guild_id.clone();
    let manager = Manager::new(
        cfg,
        repo,
        Arc::clone(&discord) as Arc<dyn Client>,
        transcriber,
        webhook,
        Arc::new(|| Arc::new(OpusMixer::new()) as Arc<dyn Mixer>),
    );

    info!("startup: connecting to discord gateway");
    tokio::time::timeout(DISCORD_CONNECT_TIMEOUT, discord.connect())
        .await
        .context("discord connect timed out")?
        .context("discord connect failed")?;
    info!("startup: discord connected");

    let bot_user_id = discord
        .get_bot_user_id()
        .await
        .context("failed to resolve bot user id")?;
    manager.set_bot_user_id(&bot_user_id);

    discord
        .upsert_guild_slash_commands(&guild_id, &session::slash_command_definitions())
        .await
        .with_context(|| format!("failed to upsert slash commands for guild {guild_id}"))?;

    {
        let manager = Arc::clone(&manager);
        discord.register_voice_state_update_handler(Arc::new(move |event| {
            let manager = Arc::clone(&manager);
            Box::pin(async move {
                manager.handle_voice_state_update(event).await;
            })
        }));
    }
    {
        let manager = Arc::clone(&manager);
        discord.register_slash_command_handler(Arc::new(move |event| {
            let manager = Arc::clone(&manager);
            Box::pin(async move {
                manager.handle_slash_command(event).await;
            })
        }));
    }
    info!(
        %guild_id,
        commands = ?[session::COMMAND_MOJIOKOSHI, session::COMMAND_MOJIOKOSHI_STOP],
        "discord handlers registered"
    );

    Ok((manager, discord))
}

/// Runs the gateway loop until an interrupt signal arrives or the loop exits
/// on its own.
async fn serve(discord: Arc<GatewayClient>) {
    let mut run_loop = tokio::spawn(async move {
        info!("startup: entering discord run loop");
        if let Err(err) = discord.run().await {
            error!(error = %format!("{err:#}"), "discord run failed");
        }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
        }
        _ = &mut run_loop => {}
    }
}

async fn shutdown(manager: &Arc<Manager>, discord: &Arc<GatewayClient>, reason: &str) {
    let stopped = manager.stop_all_sessions(reason).await;
    info!(stopped, reason, "stopped running sessions on shutdown");
    if let Err(err) = discord.close().await {
        error!(error = %format!("{err:#}"), "discord close failed");
    }
}
