use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{ArgAction, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use takopi_core::commands::CommandRegistry;
use takopi_core::config::{default_config_path, TakopiConfig};
use takopi_core::error::TakopiError;
use takopi_core::ids::RESERVED_COMMAND_IDS;
use takopi_core::lockfile::{acquire_lock, token_fingerprint};
use takopi_engine::claude::ClaudeRunner;
use takopi_engine::codex::CodexRunner;
use takopi_engine::router::{EngineRouter, RunnerEntry};
use takopi_engine::runner::Runner;
use takopi_engine::runtime::TransportRuntime;
use takopi_telegram::runner_bridge::ExecBridgeConfig;
use takopi_telegram::{
    run_main_loop, BotClient, MainLoopOptions, TelegramBridgeConfig, TelegramPresenter,
    TelegramTransport,
};

#[derive(Parser)]
#[command(
    name = "takopi",
    version,
    about = "Bridge a Telegram chat to local coding-agent engines."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Override the transport backend id.
    #[arg(long, global = true)]
    transport: Option<String>,

    /// Send the final response as a new message (not an edit). Default.
    #[arg(long, global = true, action = ArgAction::SetTrue, conflicts_with = "no_final_notify")]
    final_notify: bool,

    /// Edit the final response into the progress message instead.
    #[arg(long, global = true, action = ArgAction::SetTrue)]
    no_final_notify: bool,

    /// Run the interactive setup wizard before starting.
    #[arg(long, global = true, action = ArgAction::SetTrue)]
    onboard: bool,

    /// Log engine JSONL, Telegram requests, and rendered messages.
    #[arg(long, global = true, action = ArgAction::SetTrue)]
    debug: bool,

    /// Watch the config file and reload projects and commands on change.
    #[arg(long, global = true, action = ArgAction::SetTrue)]
    watch_config: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Register the current repo as a Takopi project.
    Init {
        /// Project alias (used as /alias in messages).
        alias: Option<String>,
        /// Set this project as the default_project.
        #[arg(long, action = ArgAction::SetTrue)]
        default: bool,
    },
    /// List available transport backends.
    Transports,
    /// Run with the codex engine.
    Codex,
    /// Run with the claude engine.
    Claude,
}

fn setup_logging(debug: bool) {
    let default_filter = if debug {
        "takopi_cli=debug,takopi_core=debug,takopi_engine=debug,takopi_scheduler=debug,\
         takopi_sessions=debug,takopi_telegram=debug"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();
}

fn config_path() -> PathBuf {
    std::env::var("TAKOPI_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| default_config_path())
}

fn display_path(path: &Path) -> String {
    if let Ok(home) = std::env::var("HOME") {
        if let Ok(rest) = path.strip_prefix(&home) {
            return format!("~/{}", rest.display());
        }
    }
    path.display().to_string()
}

fn build_engine_runners(config: &TakopiConfig) -> takopi_core::Result<Vec<Arc<dyn Runner>>> {
    let null = serde_json::Value::Null;
    let codex = CodexRunner::from_table(config.engines.get("codex").unwrap_or(&null))?;
    let claude = ClaudeRunner::from_table(config.engines.get("claude").unwrap_or(&null))?;
    Ok(vec![Arc::new(codex), Arc::new(claude)])
}

fn build_router(
    config: &TakopiConfig,
    default_engine: &str,
) -> takopi_core::Result<EngineRouter> {
    let mut entries = Vec::new();
    for runner in build_engine_runners(config)? {
        let engine = runner.engine().to_string();
        let issue = match which::which(runner.cli_cmd()) {
            Ok(_) => None,
            Err(_) => Some(format!("{} not found on PATH", runner.cli_cmd())),
        };
        if let Some(issue) = &issue {
            if engine == default_engine {
                return Err(TakopiError::Config(format!(
                    "Default engine {engine:?} unavailable: {issue}"
                )));
            }
            warn!(engine = %engine, issue = %issue, "engine unavailable");
        }
        entries.push(RunnerEntry {
            engine,
            available: issue.is_none(),
            issue,
            runner,
        });
    }
    EngineRouter::new(entries, default_engine.to_string())
}

fn is_tty() -> bool {
    use std::io::IsTerminal;
    std::io::stdin().is_terminal() && std::io::stdout().is_terminal()
}

fn prompt(label: &str) -> std::io::Result<String> {
    use std::io::Write;
    print!("{label}: ");
    std::io::stdout().flush()?;
    let mut line = String::new();
    std::io::stdin().read_line(&mut line)?;
    Ok(line.trim().to_string())
}

/// Minimal onboarding: ask for the bot token and chat id, write the config.
fn run_onboarding(path: &Path) -> takopi_core::Result<()> {
    if !is_tty() {
        return Err(TakopiError::Config("--onboard requires a TTY".into()));
    }
    println!("setting up takopi at {}", display_path(path));
    let bot_token = prompt("telegram bot token")?;
    if bot_token.is_empty() {
        return Err(TakopiError::Config("bot token cannot be empty".into()));
    }
    let chat_id: i64 = prompt("chat id")?
        .parse()
        .map_err(|_| TakopiError::Config("chat id must be an integer".into()))?;

    let mut config = match takopi_core::config::read_raw_toml(path) {
        Ok(config) => config,
        Err(_) => toml::Table::new(),
    };
    if !config.contains_key("default_engine") {
        config.insert("default_engine".into(), toml::Value::String("codex".into()));
    }
    let mut telegram = toml::Table::new();
    telegram.insert("bot_token".into(), toml::Value::String(bot_token));
    telegram.insert("chat_id".into(), toml::Value::Integer(chat_id));
    let mut transports = toml::Table::new();
    transports.insert("telegram".into(), toml::Value::Table(telegram));
    config.insert("transports".into(), toml::Value::Table(transports));
    takopi_core::config::write_raw_toml(&config, path)?;
    println!("saved config to {}", display_path(path));
    Ok(())
}

fn run_init(alias: Option<String>, default: bool) -> takopi_core::Result<()> {
    let path = config_path();
    let mut config = match takopi_core::config::read_raw_toml(&path) {
        Ok(config) => config,
        Err(_) => toml::Table::new(),
    };

    let cwd = std::env::current_dir()?;
    let default_alias = cwd
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .filter(|n| !n.is_empty());
    let alias = match alias {
        Some(alias) => alias,
        None => match &default_alias {
            Some(default_alias) if is_tty() => {
                let entered = prompt(&format!("project alias [{default_alias}]"))?;
                if entered.is_empty() {
                    default_alias.clone()
                } else {
                    entered
                }
            }
            Some(default_alias) => default_alias.clone(),
            None => prompt("project alias")?,
        },
    };
    let alias = alias.trim().to_string();
    if alias.is_empty() {
        return Err(TakopiError::Config("project alias cannot be empty".into()));
    }
    let alias_key = alias.to_lowercase();
    for engine in ["codex", "claude"] {
        if alias_key == engine {
            return Err(TakopiError::Config(format!(
                "Invalid project alias {alias:?}; aliases must not match engine ids."
            )));
        }
    }
    if RESERVED_COMMAND_IDS.iter().any(|r| *r == alias_key) {
        return Err(TakopiError::Config(format!(
            "Invalid project alias {alias:?}; aliases must not match reserved commands."
        )));
    }

    if !config.contains_key("projects") {
        config.insert("projects".into(), toml::Value::Table(toml::Table::new()));
    }
    let projects = config
        .get_mut("projects")
        .and_then(|v| v.as_table_mut())
        .ok_or_else(|| {
            TakopiError::Config(format!(
                "Invalid `projects` in {}; expected a table.",
                path.display()
            ))
        })?;

    let mut entry = toml::Table::new();
    entry.insert(
        "path".into(),
        toml::Value::String(cwd.display().to_string()),
    );
    entry.insert(
        "worktrees_dir".into(),
        toml::Value::String(".worktrees".into()),
    );
    projects.insert(alias.clone(), toml::Value::Table(entry));
    if default {
        config.insert(
            "default_project".into(),
            toml::Value::String(alias.clone()),
        );
    }
    takopi_core::config::write_raw_toml(&config, &path)?;
    println!("saved project {alias:?} to {}", display_path(&path));
    Ok(())
}

async fn run_bridge(
    cli: &Cli,
    default_engine_override: Option<&str>,
) -> takopi_core::Result<bool> {
    let path = config_path();
    if cli.onboard {
        run_onboarding(&path)?;
    }
    if !path.exists() {
        if is_tty() {
            eprintln!(
                "config at {} is missing; run `takopi --onboard` to create it.",
                display_path(&path)
            );
        }
        return Err(TakopiError::Config(format!(
            "missing takopi config at {}",
            display_path(&path)
        )));
    }

    let config = TakopiConfig::load(&path)?;
    let transport_id = cli
        .transport
        .clone()
        .unwrap_or_else(|| config.transport.clone());
    if transport_id != "telegram" {
        return Err(TakopiError::Config(format!(
            "Unknown transport {transport_id:?}. Available: telegram."
        )));
    }
    let telegram_cfg = config.telegram(&path)?.clone();

    let default_engine = default_engine_override
        .map(str::to_string)
        .unwrap_or_else(|| config.default_engine.to_lowercase());
    let router = build_router(&config, &default_engine)?;
    let projects = config.to_projects(&path, &router.engine_ids(), RESERVED_COMMAND_IDS)?;
    let runtime = TransportRuntime::new(
        router,
        projects,
        Some(path.clone()),
        config.plugins.clone(),
    );

    let _lock = acquire_lock(&path, Some(&token_fingerprint(&telegram_cfg.bot_token)))?;

    let bot = BotClient::new(&telegram_cfg.bot_token);
    let transport = Arc::new(TelegramTransport::new(bot.clone()));
    let final_notify = cli.final_notify || !cli.no_final_notify;
    let exec = ExecBridgeConfig {
        transport,
        presenter: TelegramPresenter,
        final_notify,
    };

    let available = runtime.available_engine_ids().join(", ");
    let missing = runtime.missing_engine_ids();
    let mut startup_msg = format!(
        "takopi {} ready · engines: {available}",
        env!("CARGO_PKG_VERSION")
    );
    if !missing.is_empty() {
        startup_msg.push_str(&format!(" (unavailable: {})", missing.join(", ")));
    }

    let bridge_cfg = TelegramBridgeConfig {
        bot,
        chat_id: telegram_cfg.chat_id,
        chat_ids: telegram_cfg.chat_ids.clone().unwrap_or_default(),
        startup_msg,
        exec,
        files: telegram_cfg.files.clone(),
        topics: telegram_cfg.topics.clone(),
        voice: telegram_cfg.voice_transcription.clone(),
    };
    let options = MainLoopOptions {
        watch_config: cli.watch_config,
        transport_snapshot: Some(telegram_cfg),
        default_engine_override: default_engine_override.map(str::to_string),
    };
    let registry = CommandRegistry::new(None);

    let cancel = CancellationToken::new();
    let interrupted = Arc::new(std::sync::atomic::AtomicBool::new(false));
    {
        let cancel = cancel.clone();
        let interrupted = Arc::clone(&interrupted);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, shutting down");
                interrupted.store(true, std::sync::atomic::Ordering::SeqCst);
                cancel.cancel();
            }
        });
    }

    run_main_loop(bridge_cfg, runtime, registry, options, cancel).await?;
    Ok(interrupted.load(std::sync::atomic::Ordering::SeqCst))
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    setup_logging(cli.debug);

    let result = match &cli.command {
        Some(Command::Init { alias, default }) => {
            return match run_init(alias.clone(), *default) {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    eprintln!("error: {e}");
                    ExitCode::from(1)
                }
            };
        }
        Some(Command::Transports) => {
            println!("telegram");
            return ExitCode::SUCCESS;
        }
        Some(Command::Codex) => run_bridge(&cli, Some("codex")).await,
        Some(Command::Claude) => run_bridge(&cli, Some("claude")).await,
        None => run_bridge(&cli, None).await,
    };

    match result {
        Ok(false) => ExitCode::SUCCESS,
        Ok(true) => ExitCode::from(130),
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::from(1)
        }
    }
}
