//! # parley
//!
//! Command-line front end: wires settings, telemetry, storage, tools and both
//! transports into an [`Orchestrator`] and runs one prompt per invocation.

#![deny(unsafe_code)]

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use secrecy::SecretString;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{info, warn};

use parley_core::{
    Backend, BackendKind, Message, PersistencePort, ProviderConfig, ProviderType, Role, Segment,
    ServerConfig, ServerId, ServerKind, Session, SessionId, ToolProvider,
};
use parley_engine::{Orchestrator, TranscriptUpdate, TurnOutcome};
use parley_llm::{ClientOptions, ProviderAdapter};
use parley_rpc::acp::{ClientInfo, SessionNewParams};
use parley_rpc::{ConnectionConfig, RemoteAgentAdapter};
use parley_settings::{McpAuthSettings, McpServerSettings, ParleySettings};
use parley_store::{Database, MemoryCredentials, SqliteStore};
use parley_telemetry::{LogFormat, TelemetryConfig};
use parley_tools::{HttpMcpProvider, McpAuth, McpServerConfig, RetryPolicy, ToolAggregator};

const API_KEY_ENV: &str = "PARLEY_API_KEY";

/// Streaming chat client for remote agents and model providers.
#[derive(Parser, Debug)]
#[command(name = "parley", version, about = "Streaming chat sessions")]
struct Cli {
    /// Path to the `SQLite` database (overrides settings).
    #[arg(long, global = true)]
    db_path: Option<PathBuf>,

    /// Emit JSON logs to stderr.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send a prompt straight to a model provider.
    Chat {
        /// Provider type, e.g. `openai`, `anthropic`, `groq`.
        #[arg(long)]
        provider: ProviderType,
        #[arg(long)]
        model: String,
        /// Server id the session and its credential are stored under.
        #[arg(long)]
        server: Option<String>,
        /// Continue an existing session instead of starting a new one.
        #[arg(long)]
        session: Option<String>,
        #[arg(long)]
        base_url: Option<String>,
        #[arg(long)]
        system: Option<String>,
        #[arg(long)]
        temperature: Option<f64>,
        /// Ask the model for a reasoning trace.
        #[arg(long)]
        reasoning: bool,
        /// API key; falls back to `PARLEY_API_KEY`.
        #[arg(long)]
        api_key: Option<String>,
        prompt: String,
    },
    /// Send a prompt to a remote agent over WebSocket.
    Agent {
        /// Agent endpoint, e.g. `ws://localhost:9000`.
        #[arg(long)]
        url: String,
        #[arg(long)]
        server: Option<String>,
        #[arg(long)]
        session: Option<String>,
        /// Agent mode announced on `session/new`.
        #[arg(long)]
        mode: Option<String>,
        prompt: String,
    },
    /// List stored sessions for a server, newest first.
    Sessions {
        #[arg(long)]
        server: String,
    },
    /// Print a stored transcript.
    Show {
        #[arg(long)]
        server: String,
        #[arg(long)]
        session: String,
    },
}

fn telemetry_config(settings: &ParleySettings, json: bool) -> TelemetryConfig {
    let logging = &settings.logging;
    let module_levels = logging
        .modules
        .iter()
        .filter_map(|(module, level)| {
            let parsed = parley_telemetry::parse_level(level);
            if parsed.is_none() {
                eprintln!("ignoring log level {level:?} for {module}");
            }
            parsed.map(|l| (module.clone(), l))
        })
        .collect();
    TelemetryConfig {
        log_level: parley_telemetry::parse_level(&logging.level).unwrap_or(tracing::Level::INFO),
        module_levels,
        format: if json || logging.json {
            LogFormat::Json
        } else {
            LogFormat::Pretty
        },
    }
}

fn mcp_config(server: &McpServerSettings) -> McpServerConfig {
    let auth = match &server.auth {
        None => McpAuth::None,
        Some(McpAuthSettings::Bearer { token }) => {
            McpAuth::Bearer(SecretString::from(token.clone()))
        }
        Some(McpAuthSettings::ApiKey { key, header_name }) => McpAuth::ApiKey {
            key: SecretString::from(key.clone()),
            header_name: header_name.clone(),
        },
    };
    McpServerConfig {
        id: server.id.clone(),
        name: server.name.clone(),
        url: server.url.clone(),
        auth,
    }
}

/// Register every enabled MCP server. A server that fails discovery stays
/// registered in its error state and contributes no tools.
async fn build_tools(settings: &ParleySettings) -> Arc<ToolAggregator> {
    let tools = Arc::new(ToolAggregator::new(RetryPolicy {
        attempts: settings.tools.discovery_attempts,
        backoff: Duration::from_millis(settings.tools.discovery_backoff_ms),
    }));
    let http = reqwest::Client::new();
    let servers: Vec<&McpServerSettings> =
        settings.tools.mcp_servers.iter().filter(|s| s.enabled).collect();
    let providers: Vec<Arc<dyn ToolProvider>> = servers
        .iter()
        .map(|server| {
            let provider = HttpMcpProvider::new(mcp_config(server), http.clone())
                .with_client_info(&settings.rpc.client_name, &settings.rpc.client_version);
            Arc::new(provider) as Arc<dyn ToolProvider>
        })
        .collect();
    let results = tools.register_all(providers).await;
    for (server, result) in servers.iter().zip(results) {
        if let Err(e) = result {
            warn!(server = %server.id, error = %e, "MCP server unavailable");
        }
    }
    tools
}

struct App {
    settings: ParleySettings,
    store: Arc<SqliteStore>,
    credentials: Arc<MemoryCredentials>,
    agents: Arc<RemoteAgentAdapter>,
    orchestrator: Arc<Orchestrator>,
}

impl App {
    async fn build(settings: ParleySettings, db_path: PathBuf) -> Result<Self> {
        let db = Database::open(&db_path)
            .with_context(|| format!("failed to open database {}", db_path.display()))?;
        info!(path = %db_path.display(), "database opened");
        let store = Arc::new(SqliteStore::new(db));
        let credentials = Arc::new(MemoryCredentials::new());

        let provider = &settings.provider;
        let providers = Arc::new(ProviderAdapter::http(
            credentials.clone(),
            ClientOptions {
                connect_timeout: Duration::from_millis(provider.connect_timeout_ms),
                idle_timeout: Duration::from_millis(provider.idle_timeout_ms),
                anthropic_max_tokens: provider.anthropic_max_tokens,
                anthropic_thinking_budget: provider.anthropic_thinking_budget,
            },
            provider.max_steps,
        ));
        let agents = Arc::new(RemoteAgentAdapter::new(
            ConnectionConfig {
                request_timeout: Duration::from_millis(settings.rpc.request_timeout_ms),
            },
            ClientInfo {
                name: settings.rpc.client_name.clone(),
                version: settings.rpc.client_version.clone(),
            },
        ));
        let tools = build_tools(&settings).await;

        let orchestrator = Orchestrator::new(store.clone())
            .with_adapter(providers)
            .with_adapter(agents.clone())
            .with_tools(tools);

        Ok(Self {
            settings,
            store,
            credentials,
            agents,
            orchestrator: Arc::new(orchestrator),
        })
    }

    /// Load `session` if given, otherwise create one with `backend`.
    fn open_session(
        &self,
        server_id: &ServerId,
        session: Option<String>,
        backend: impl FnOnce() -> Result<Backend>,
    ) -> Result<Session> {
        match session {
            Some(id) => Ok(self
                .orchestrator
                .load_session(server_id, &SessionId::from_raw(id))?),
            None => Ok(self.orchestrator.create_session(server_id.clone(), backend()?)?),
        }
    }

    /// Stream one prompt to stdout. Ctrl-C cancels the turn.
    async fn run_prompt(&self, session: &Session, prompt: String) -> Result<TurnOutcome> {
        let updates = self.orchestrator.subscribe();
        let printer = tokio::spawn(print_reply(updates, session.id.clone(), std::io::stdout()));

        let orchestrator = self.orchestrator.clone();
        let interrupt = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                let cancelled = orchestrator.cancel_all();
                info!(cancelled, "interrupted");
            }
        });

        let outcome = self
            .orchestrator
            .send_prompt(&session.id, prompt, Vec::new())
            .await;
        interrupt.abort();
        let _ = printer.await;
        Ok(outcome?)
    }
}

/// Write assistant text for `session_id` to `out` as it streams in, until
/// the turn finishes. Every update carries the whole message, so skipped
/// updates only delay output.
async fn print_reply(
    mut updates: broadcast::Receiver<TranscriptUpdate>,
    session_id: SessionId,
    mut out: impl Write,
) {
    let mut printed = 0usize;
    loop {
        match updates.recv().await {
            Ok(
                TranscriptUpdate::MessageAppended { session_id: id, message }
                | TranscriptUpdate::MessageUpdated { session_id: id, message },
            ) if id == session_id && message.role == Role::Assistant => {
                printed = write_suffix(&mut out, &message, printed);
            }
            Ok(TranscriptUpdate::StreamFinished { session_id: id, .. }) if id == session_id => {
                let _ = writeln!(out);
                break;
            }
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "output fell behind the stream");
            }
            Err(RecvError::Closed) => break,
        }
    }
    let _ = out.flush();
}

/// Write the part of `message.content` not yet shown. Returns the new offset.
fn write_suffix(out: &mut impl Write, message: &Message, printed: usize) -> usize {
    let content = &message.content;
    // A different or rewritten message restarts from its start.
    let from = if printed <= content.len() && content.is_char_boundary(printed) {
        printed
    } else {
        0
    };
    if from < content.len() {
        let _ = out.write_all(content[from..].as_bytes());
        let _ = out.flush();
    }
    content.len()
}

fn print_message(message: &Message) {
    let role = match message.role {
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::System => "system",
    };
    println!("[{role}] {}", message.content);
    if let Some(reasoning) = &message.reasoning {
        println!("  (reasoning) {reasoning}");
    }
    for segment in &message.segments {
        match segment {
            Segment::ToolCall {
                tool_name,
                input,
                result,
                is_complete,
            } => {
                let state = if *is_complete { "done" } else { "open" };
                println!("  (tool {tool_name}, {state}) {input}");
                if let Some(result) = result {
                    println!("    -> {result}");
                }
            }
            Segment::AgentEvent { label, detail, .. } => match detail {
                Some(detail) => println!("  (event) {label}: {detail}"),
                None => println!("  (event) {label}"),
            },
            Segment::Text { .. } | Segment::Thought { .. } => {}
        }
    }
    for artifact in &message.artifacts {
        let language = artifact.language.as_deref().unwrap_or("text");
        println!("  (artifact {language}, {} bytes)", artifact.content.len());
    }
}

fn report(outcome: &TurnOutcome) {
    if let Some(error) = &outcome.error {
        eprintln!("error: {error}");
    } else if outcome.is_aborted() {
        eprintln!("cancelled");
    } else if let Some(reason) = &outcome.stop_reason {
        info!(stop_reason = %reason, "turn finished");
    }
}

fn server_id_or_new(raw: Option<String>) -> ServerId {
    raw.map(ServerId::from_raw).unwrap_or_default()
}

async fn run(cli: Cli, settings: ParleySettings) -> Result<()> {
    let db_path = cli
        .db_path
        .unwrap_or_else(|| settings.storage.database_path.clone());
    let app = App::build(settings, db_path).await?;

    match cli.command {
        Command::Chat {
            provider,
            model,
            server,
            session,
            base_url,
            system,
            temperature,
            reasoning,
            api_key,
            prompt,
        } => {
            let server_id = server_id_or_new(server);
            let mut config = ProviderConfig::new(provider, model);
            config.base_url = base_url;
            config.system_prompt = system;
            config.temperature = temperature;
            config.reasoning_enabled = reasoning;

            let key = api_key
                .or_else(|| std::env::var(API_KEY_ENV).ok())
                .with_context(|| format!("no API key: pass --api-key or set {API_KEY_ENV}"))?;
            app.credentials.set_for(&server_id, &config, key);

            app.store.save_server(&ServerConfig {
                id: server_id.clone(),
                name: format!("{provider} {}", config.model_id),
                kind: ServerKind::AiProvider(config.clone()),
            })?;
            let session = app.open_session(&server_id, session, || Ok(Backend::Provider(config)))?;
            if session.backend.kind() != BackendKind::Provider {
                bail!("session {} is not a provider session", session.id);
            }
            eprintln!("session {}", session.id);
            let outcome = app.run_prompt(&session, prompt).await?;
            report(&outcome);
        }
        Command::Agent {
            url,
            server,
            session,
            mode,
            prompt,
        } => {
            let server_id = server_id_or_new(server);
            let conn = app
                .agents
                .connect(&server_id, &url)
                .await
                .with_context(|| format!("failed to connect to {url}"))?;
            app.store.save_server(&ServerConfig {
                id: server_id.clone(),
                name: url.clone(),
                kind: ServerKind::Acp { url: url.clone() },
            })?;

            let session = match session {
                Some(id) => app
                    .orchestrator
                    .load_session(&server_id, &SessionId::from_raw(id))?,
                None => {
                    let remote_session_id = conn
                        .new_session(&SessionNewParams {
                            cwd: app.settings.rpc.cwd.clone(),
                            mode_id: mode,
                        })
                        .await
                        .context("session/new failed")?;
                    app.orchestrator.create_session(
                        server_id.clone(),
                        Backend::RemoteAgent { remote_session_id },
                    )?
                }
            };
            if session.backend.kind() != BackendKind::RemoteAgent {
                bail!("session {} is not a remote agent session", session.id);
            }
            eprintln!("session {}", session.id);
            let outcome = app.run_prompt(&session, prompt).await?;
            report(&outcome);
        }
        Command::Sessions { server } => {
            let sessions = app.orchestrator.list_sessions(&ServerId::from_raw(server))?;
            for session in sessions {
                println!(
                    "{}  {}  {}",
                    session.id,
                    session.updated_at.format("%Y-%m-%d %H:%M"),
                    session.title.as_deref().unwrap_or("(untitled)")
                );
            }
        }
        Command::Show { server, session } => {
            let server_id = ServerId::from_raw(server);
            let session_id = SessionId::from_raw(session);
            app.orchestrator.load_session(&server_id, &session_id)?;
            let transcript = app
                .orchestrator
                .transcript(&session_id)
                .with_context(|| format!("session {session_id} not loaded"))?;
            for message in &transcript.messages {
                print_message(message);
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = parley_settings::load_settings().context("failed to load settings")?;
    let _ = parley_telemetry::init_telemetry(&telemetry_config(&settings, cli.json_logs));
    info!(settings = %parley_settings::settings_path().display(), "starting parley");
    run(cli, settings).await
}
