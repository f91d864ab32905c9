use anyhow::{Context, Result};
use flume::unbounded;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use parley_backend::config::InterviewConfig;
use parley_backend::coordinator::{InterviewEvent, TurnPhase};
use parley_backend::runtime::InterviewRuntime;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,parley_backend=debug")),
        )
        .init();

    let config = InterviewConfig::load();
    if !InterviewConfig::config_path().exists() {
        // First run: leave a template next to the executable for editing.
        if let Err(e) = config.save() {
            tracing::warn!("could not write default config template: {e:#}");
        }
    }
    let (event_tx, event_rx) = unbounded();
    let runtime =
        InterviewRuntime::bootstrap(config, event_tx).context("failed to bootstrap runtime")?;

    let rt = tokio::runtime::Runtime::new().context("failed to start tokio runtime")?;
    rt.block_on(run_console_session(runtime, event_rx))
}

/// Drive one interview over stdin/stdout. Blank lines are ignored; `/quit`
/// abandons the conversation.
async fn run_console_session(
    runtime: InterviewRuntime,
    event_rx: flume::Receiver<InterviewEvent>,
) -> Result<()> {
    let conversation_id = Uuid::new_v4().to_string();
    let user_id = std::env::var("PARLEY_USER_ID").unwrap_or_else(|_| "console".to_string());
    tracing::info!("Starting console interview {conversation_id} for {user_id}");

    let coordinator = runtime.coordinator(&conversation_id, &user_id)?;

    tokio::spawn(async move {
        while let Ok(event) = event_rx.recv_async().await {
            match event {
                InterviewEvent::MessageAppended {
                    role,
                    text,
                    is_typing,
                } => {
                    if is_typing {
                        println!("[{role}] ...");
                    } else {
                        println!("[{role}] {text}");
                    }
                }
                InterviewEvent::TypingReplaced { text } => println!("[assistant] {text}"),
                InterviewEvent::ReadyToFinish => println!("-- interview complete --"),
                InterviewEvent::Error(e) => eprintln!("[error] {e}"),
            }
        }
    });

    coordinator.start().await?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim().to_string();
        if line.is_empty() {
            continue;
        }
        if line == "/quit" {
            break;
        }
        coordinator.submit(line).await?;
        if coordinator.phase().await == TurnPhase::Finished {
            break;
        }
    }

    // Safety net: persist whatever happened even when the session ended
    // without a natural close. The pipeline is idempotent, so this is a
    // no-op after a normal finish.
    let transcript = coordinator.messages().await;
    if let Err(e) = runtime
        .finalizer()
        .finalize(&conversation_id, &transcript)
        .await
    {
        tracing::warn!("safety-net finalization failed: {e:#}");
    }

    Ok(())
}
