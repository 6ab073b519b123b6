//! `vrag search`: ranked retrieval from the command line.

use std::sync::Arc;

use anyhow::Result;

use vault_rag_core::models::{Query, SearchFilter};

use crate::config::Config;
use crate::db;
use crate::orchestrator::{OrchestratorError, Pipeline, Source};
use crate::sqlite_index::SqliteIndex;

const EXCERPT_CHARS: usize = 200;

pub async fn run_search(
    config: &Config,
    query: &str,
    category: Option<String>,
    book: Option<String>,
    limit: Option<usize>,
) -> Result<()> {
    if query.trim().is_empty() {
        println!("No results.");
        return Ok(());
    }

    let pool = db::connect(config).await?;
    let pipeline = Pipeline::from_config(config, Arc::new(SqliteIndex::new(pool.clone())))?;
    let top_k = limit.unwrap_or(config.retrieval.top_k).max(1);
    let query = Query::new(query).with_filter(SearchFilter { category, book });

    let results = match pipeline.search(query, top_k).await {
        Ok(results) => results,
        Err(OrchestratorError::NoContext(reason)) => {
            eprintln!("warning: {}", reason);
            println!("No results.");
            pool.close().await;
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };
    for warning in &results.warnings {
        eprintln!("warning: {}", warning);
    }

    if results.hits.is_empty() {
        println!("No results.");
    }
    for (i, hit) in results.hits.iter().enumerate() {
        print_hit(i + 1, hit);
    }

    pool.close().await;
    Ok(())
}

fn print_hit(rank: usize, hit: &Source) {
    let place = match (&hit.book, &hit.chapter) {
        (Some(book), Some(chapter)) => format!("{} / {} / {}", hit.category, book, chapter),
        (Some(book), None) => format!("{} / {}", hit.category, book),
        _ => hit.category.clone(),
    };
    println!("{}. [{:.3}] {} ({})", rank, hit.final_score, hit.title, place);
    println!(
        "    semantic: {:.3}  keyword: {:.3}  combined: {:.3}",
        hit.semantic_score, hit.keyword_score, hit.combined_score
    );
    println!("    path: {}", hit.source_path);
    println!("    excerpt: \"{}\"", excerpt(&hit.text, EXCERPT_CHARS));
    println!("    id: {}", hit.chunk_id);
    println!();
}

/// First `max_chars` characters on one line, with an ellipsis if cut.
pub fn excerpt(text: &str, max_chars: usize) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= max_chars {
        return flat;
    }
    let cut: String = flat.chars().take(max_chars).collect();
    format!("{}…", cut.trim_end())
}
