//! One-shot question answering with live progress on the terminal.

use std::io::{self, Write};

use anyhow::Result;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use ampere_config::{AppConfig, Strategy};
use ampere_llm::Conversation;
use ampere_runtime::{AnswerPath, FailoverOrchestrator, PipelineEvent};

pub async fn run(config: &AppConfig, question: &str, strategy: Strategy, remote: Option<&str>) -> Result<()> {
    let orchestrator = match remote {
        Some(url) => {
            info!(%url, "answering through remote server");
            FailoverOrchestrator::remote(url, config)
        }
        None => FailoverOrchestrator::local(config),
    };

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_interrupt.cancel();
        }
    });

    let (tx, rx) = mpsc::unbounded_channel();
    let printer = tokio::spawn(print_progress(rx));

    let outcome = orchestrator
        .run(Conversation::from_user(question), strategy, &cancel, Some(&tx))
        .await;
    drop(tx);
    let printed = printer.await.unwrap_or_default();

    let answer = match outcome {
        Ok(answer) => answer,
        Err(err) => {
            if !printed.is_empty() {
                println!();
            }
            if err.is_retryable() {
                anyhow::bail!("{err} (retrying may help)");
            }
            return Err(err.into());
        }
    };

    if printed != answer.text {
        if !printed.is_empty() {
            println!();
        }
        print!("{}", answer.text);
    }
    println!();

    let path = match answer.path {
        AnswerPath::Streamed => "streamed",
        AnswerPath::Synthesized => "two-phase",
        AnswerPath::FailedOver => "failed over to two-phase",
    };
    eprintln!(
        "[{path}; {} tool call(s), {} result(s)]",
        answer.tool_calls, answer.tool_results
    );
    Ok(())
}

/// Echo tokens to stdout and everything else to stderr.  Returns the text
/// that reached stdout.
async fn print_progress(mut rx: mpsc::UnboundedReceiver<PipelineEvent>) -> String {
    let mut shown = String::new();
    let mut stdout = io::stdout();
    while let Some(event) = rx.recv().await {
        match event {
            PipelineEvent::Token(token) => {
                shown.push_str(&token);
                let _ = write!(stdout, "{token}");
                let _ = stdout.flush();
            }
            PipelineEvent::Replace(text) => {
                if !shown.is_empty() {
                    let _ = writeln!(stdout);
                }
                let _ = write!(stdout, "{text}");
                let _ = stdout.flush();
                shown = text;
            }
            PipelineEvent::Status(line) => eprintln!("… {line}"),
            PipelineEvent::FailingOver => eprintln!("… switching to the two-phase pipeline"),
            PipelineEvent::Decoded(event) => {
                let raw = serde_json::to_string(&event).unwrap_or_default();
                eprintln!("[{}] {raw}", event.kind());
            }
        }
    }
    shown
}
