//! `vrag stats`: what's indexed.

use anyhow::Result;

use vault_rag_core::index::ChunkStore;

use crate::config::Config;
use crate::db;
use crate::sqlite_index::SqliteIndex;

pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let index = SqliteIndex::new(pool.clone());
    let stats = index.stats().await?;

    let last_ingest: Option<i64> = sqlx::query_scalar("SELECT MAX(ingested_at) FROM documents")
        .fetch_one(&pool)
        .await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("vault-rag — Index Stats");
    println!("=======================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!(
        "  Last ingest: {}",
        last_ingest.map(format_ts_relative).unwrap_or_else(|| "never".to_string())
    );
    println!();
    println!("  Documents:   {}", stats.documents);
    println!("  Chunks:      {}", stats.chunks);
    println!(
        "  Embedded:    {} / {} ({}%)",
        stats.embedded_chunks,
        stats.chunks,
        if stats.chunks > 0 {
            (stats.embedded_chunks * 100) / stats.chunks
        } else {
            0
        }
    );

    if !stats.categories.is_empty() {
        println!();
        println!("  {:<32} {:>6}", "CATEGORY", "DOCS");
        println!("  {}", "-".repeat(39));
        for (name, count) in &stats.categories {
            println!("  {:<32} {:>6}", name, count);
        }
    }
    if !stats.books.is_empty() {
        println!();
        println!("  {:<32} {:>6}", "BOOK", "DOCS");
        println!("  {}", "-".repeat(39));
        for (name, count) in &stats.books {
            println!("  {:<32} {:>6}", name, count);
        }
    }
    println!();

    pool.close().await;
    Ok(())
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Relative time for recent timestamps ("3 hours ago"), a date otherwise.
fn format_ts_relative(ts: i64) -> String {
    let delta = chrono::Utc::now().timestamp() - ts;
    if delta < 0 || delta >= 86400 * 30 {
        return chrono::DateTime::from_timestamp(ts, 0)
            .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| ts.to_string());
    }
    let (n, unit) = match delta {
        0..=59 => return "just now".to_string(),
        60..=3599 => (delta / 60, "min"),
        3600..=86399 => (delta / 3600, "hour"),
        _ => (delta / 86400, "day"),
    };
    format!("{} {}{} ago", n, unit, if n == 1 { "" } else { "s" })
}
