use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use voice_dispatch::TaskManager;
use voice_dispatch::config::{ResilienceConfig, ResourceConfig};
use voice_dispatch::provider::{
    ASR_TASK, AsrExecutor, AsrProvider, EchoProvider, LLM_TASK, LlmExecutor, LlmProvider,
    Resilient, TTS_TASK, TtsExecutor, TtsProvider,
};
use voice_dispatch::task::{OneshotCallback, Task, TaskRegistry};

const DEMO_CLIENT: &str = "demo-client";

/// Console logging, plus a daily-rolling file when `VOICE_DISPATCH_LOG_DIR`
/// is set. The returned guard flushes the file writer on drop.
fn init_tracing() -> Option<WorkerGuard> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, guard) = match std::env::var("VOICE_DISPATCH_LOG_DIR") {
        Ok(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "voice-dispatch.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        Err(_) => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(file_layer)
        .init();

    guard
}

/// Submit one task and wait for its outcome.
async fn run_stage(manager: &TaskManager, task: Task) -> anyhow::Result<Value> {
    let task_type = task.task_type.clone();
    let (callback, outcome) = OneshotCallback::channel();
    manager
        .submit_task(DEMO_CLIENT, task.with_callback(callback))
        .await
        .with_context(|| format!("submitting {task_type} task"))?;
    let result = outcome
        .await
        .with_context(|| format!("{task_type} task dropped without an outcome"))??;
    Ok(result)
}

/// Speech in, speech out: transcribe, answer, synthesize.
async fn run_turn(
    manager: &TaskManager,
    utterance: &str,
    connection: &CancellationToken,
) -> anyhow::Result<()> {
    let heard = run_stage(
        manager,
        Task::new(ASR_TASK, json!({ "audio": utterance.as_bytes() }))
            .with_cancellation(connection.clone()),
    )
    .await?;
    let text = heard["text"].as_str().unwrap_or_default();
    eprintln!("   ASR  → {text}");

    let answered = run_stage(
        manager,
        Task::new(
            LLM_TASK,
            json!({ "messages": [{ "role": "user", "content": text }] }),
        )
        .with_priority(1)
        .with_max_retries(2)
        .with_cancellation(connection.clone()),
    )
    .await?;
    let reply = answered["reply"].as_str().unwrap_or_default();
    eprintln!("   LLM  → {reply}");

    let spoken = run_stage(
        manager,
        Task::new(TTS_TASK, json!({ "text": reply })).with_cancellation(connection.clone()),
    )
    .await?;
    let bytes = spoken["audio"].as_array().map_or(0, Vec::len);
    let format = spoken["format"].as_str().unwrap_or("unknown");
    eprintln!("   TTS  → {bytes} bytes of {format}");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _log_guard = init_tracing();

    let resources = ResourceConfig::from_env()?;
    let resilience = ResilienceConfig::default();

    eprintln!("🎙  Voice Dispatch v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Workers: {}", resources.max_workers);
    eprintln!("   Queue capacity: {}", resources.queue_size());
    eprintln!("   Press Ctrl-C to stop.\n");

    let echo = EchoProvider::with_latency(Duration::from_millis(50));
    let asr: Arc<dyn AsrProvider> = Arc::new(Resilient::<_, String>::new(
        echo.clone(),
        "asr-echo",
        &resilience,
    ));
    let llm: Arc<dyn LlmProvider> = Arc::new(
        Resilient::<_, String>::new(echo.clone(), "llm-echo", &resilience).without_cache(),
    );
    let tts: Arc<dyn TtsProvider> =
        Arc::new(Resilient::<_, Vec<u8>>::new(echo, "tts-echo", &resilience));

    let registry = TaskRegistry::new()
        .with(ASR_TASK, Arc::new(AsrExecutor::new(asr)))
        .with(LLM_TASK, Arc::new(LlmExecutor::new(llm)))
        .with(TTS_TASK, Arc::new(TtsExecutor::new(tts)));

    let manager = TaskManager::from_resources(registry, resources);
    manager.start();

    // Stands in for the client's websocket lifetime.
    let connection = CancellationToken::new();

    let conversation = async {
        for utterance in ["hello there", "what time is it", "hello there"] {
            eprintln!("🗣  {utterance}");
            run_turn(&manager, utterance, &connection).await?;
        }
        anyhow::Ok(())
    };

    tokio::select! {
        result = conversation => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Conversation failed");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            eprintln!("\nInterrupted, shutting down...");
            connection.cancel();
        }
    }

    if let Some(usage) = manager.quota(DEMO_CLIENT).await {
        eprintln!("\n📊 Quota: {}", serde_json::to_string(&usage)?);
    }
    eprintln!("📊 Pool: {}", serde_json::to_string(&manager.pool_stats())?);

    manager.stop().await;
    Ok(())
}
