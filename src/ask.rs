//! `vrag ask`: one question, answer streamed to stdout.

use std::io::Write;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::db;
use crate::orchestrator::{ChatRequest, Pipeline, StreamEvent};
use crate::sqlite_index::SqliteIndex;

pub async fn run_ask(config: &Config, request: ChatRequest) -> Result<()> {
    if request.message.trim().is_empty() {
        anyhow::bail!("question must not be empty");
    }

    let pool = db::connect(config).await?;
    let pipeline = Pipeline::from_config(config, Arc::new(SqliteIndex::new(pool.clone())))?;

    let cancel = CancellationToken::new();
    let on_ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_ctrl_c.cancel();
        }
    });

    let (tx, mut rx) = mpsc::channel(64);

    let printer = tokio::spawn(async move {
        let mut stdout = std::io::stdout();
        while let Some(event) = rx.recv().await {
            match event {
                StreamEvent::Token { text } => {
                    let _ = write!(stdout, "{}", text);
                    let _ = stdout.flush();
                }
                StreamEvent::Stage { stage } => tracing::debug!(stage = stage.as_str(), "stage"),
                StreamEvent::Done { .. } => {}
            }
        }
    });

    let result = pipeline.orchestrator(Some(tx), cancel).run(request).await;
    printer.await?;
    let response = result?;

    println!();
    if response.truncated {
        println!("(answer truncated)");
    }
    for warning in &response.warnings {
        eprintln!("warning: {}", warning);
    }
    if !response.citations.is_empty() {
        println!();
        println!("Sources:");
        for c in &response.citations {
            match &c.book {
                Some(book) => println!("  - {} ({}, {}) [{:.3}]", c.source_title, book, c.category, c.relevance_score),
                None => println!("  - {} ({}) [{:.3}]", c.source_title, c.category, c.relevance_score),
            }
        }
    }

    pool.close().await;
    Ok(())
}
