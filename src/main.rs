use anyhow::Context;
use std::io::{self, Write};
use std::sync::Arc;
use steve_chat::ai::{HttpTransport, IpLookupResolver};
use steve_chat::clock::SystemClock;
use steve_chat::rate_limit::format_cooldown;
use steve_chat::storage::{FileStore, KeyValueStore};
use steve_chat::{
    ChatConfig, ChatMessage, ChatSession, ConversationSnapshot, MessageKind, RateStatus,
    SendOutcome, ToolPayload,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing::warn;
use tracing_subscriber::EnvFilter;

fn init_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("steve_chat=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn render(message: &ChatMessage) -> String {
    match &message.kind {
        MessageKind::User { content } => format!("you> {content}"),
        MessageKind::Agent { content } => format!("steve> {content}"),
        MessageKind::Error { content } => format!("!! {content}"),
        MessageKind::AgentToolCall { calls } => {
            let names: Vec<&str> = calls.iter().map(|call| call.name.as_str()).collect();
            format!("steve is using: {}", names.join(", "))
        }
        MessageKind::ToolOutput(tool) => match &tool.output {
            ToolPayload::Weather(weather) => format!(
                "[weather] {}°C, {}% rain in {}, {}, {}",
                weather.current_temperature,
                weather.current_rain,
                weather.city,
                weather.region.to_uppercase(),
                weather.country.to_uppercase()
            ),
            ToolPayload::GithubProfile(profile) => format!(
                "[github] {} (@{}) - {} public repos - {}",
                profile.name, profile.username, profile.num_repos, profile.profile_url
            ),
            ToolPayload::LinkedInProfile(profile) => format!(
                "[linkedin] {} - {} - {}",
                profile.name, profile.headline, profile.profile_url
            ),
            ToolPayload::Unknown(output) => format!(
                "[{}] args: {} output: {}",
                tool.name, tool.args, output
            ),
        },
    }
}

/// Prints conversation changes as they are published. The agent message of a
/// running turn is written incrementally as its tokens arrive.
#[derive(Default)]
struct Transcript {
    printed: usize,
    streamed: String,
    typing: bool,
}

impl Transcript {
    fn update(&mut self, snapshot: &ConversationSnapshot) -> io::Result<()> {
        let mut out = io::stdout().lock();
        if snapshot.messages.len() < self.printed {
            // conversation was reset
            *self = Self::default();
        }
        if snapshot.is_loading && !self.typing {
            writeln!(out, "steve is typing...")?;
        }
        self.typing = snapshot.is_loading;

        while let Some(message) = snapshot.messages.get(self.printed) {
            let open = snapshot.is_loading && self.printed + 1 == snapshot.messages.len();
            match &message.kind {
                MessageKind::Agent { content } => {
                    self.stream_agent(&mut out, content)?;
                    if open {
                        break;
                    }
                    if !self.streamed.is_empty() {
                        writeln!(out)?;
                    }
                    self.streamed.clear();
                }
                _ => writeln!(out, "{}", render(message))?,
            }
            self.printed += 1;
        }
        out.flush()
    }

    fn stream_agent(&mut self, out: &mut impl Write, content: &str) -> io::Result<()> {
        match content.strip_prefix(self.streamed.as_str()) {
            Some("") => {}
            Some(rest) if !self.streamed.is_empty() => write!(out, "{rest}")?,
            // the final response rewrote what was streamed so far
            _ => {
                if !self.streamed.is_empty() {
                    writeln!(out)?;
                }
                write!(out, "steve> {content}")?;
            }
        }
        self.streamed = content.to_string();
        Ok(())
    }
}

async fn follow(mut view: watch::Receiver<ConversationSnapshot>) {
    let mut transcript = Transcript::default();
    while view.changed().await.is_ok() {
        let snapshot = view.borrow_and_update().clone();
        if let Err(err) = transcript.update(&snapshot) {
            warn!(%err, "could not write transcript");
            break;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env is optional; real environment variables win
    let _ = dotenvy::dotenv();
    init_logging();

    let config = ChatConfig::from_env().context("invalid chat configuration")?;
    let transport = HttpTransport::new(&config).context("failed to build HTTP client")?;
    let resolver = IpLookupResolver::new(config.ip_lookup_url.clone())
        .context("failed to build identity resolver")?;
    let store: Arc<dyn KeyValueStore> = Arc::new(FileStore::new(config.data_dir.clone()));

    let mut session = ChatSession::start(
        transport,
        config.mode,
        config.rate_limits(),
        &resolver,
        store,
        Arc::new(SystemClock),
    )
    .await;

    if let RateStatus::Saturated { retry_after } = session.rate_status() {
        println!(
            "Message limit reached. Try again in {}.",
            format_cooldown(retry_after)
        );
    }
    println!("Ask Steve anything. /reset clears the conversation, /quit exits.");
    let renderer = tokio::spawn(follow(session.subscribe()));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match line.trim() {
            "/quit" => break,
            "/reset" => {
                session.reset();
                continue;
            }
            _ => {}
        }

        session.set_input_value(line);
        if let SendOutcome::RateLimited { .. } = session.submit_input().await {
            if let Some(notice) = session.limit_notice() {
                println!("{}", notice.message());
            }
        }
    }

    // closing the session ends the renderer once it has drained
    drop(session);
    renderer.await.context("transcript renderer panicked")?;
    Ok(())
}
