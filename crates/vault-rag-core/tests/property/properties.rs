use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use proptest::prelude::*;

use vault_rag_core::assemble::{assemble, format_entry, SOURCE_SEPARATOR};
use vault_rag_core::chunk::{chunk_document, chunk_text, ChunkerConfig};
use vault_rag_core::citation::extract;
use vault_rag_core::embedding::Embedder;
use vault_rag_core::error::EmbeddingError;
use vault_rag_core::index::{IndexWriter, InMemoryIndex};
use vault_rag_core::models::{Chunk, ChunkMetadata, Document, DocumentMetadata, Query, RetrievedChunk};
use vault_rag_core::retrieve::{HybridRetriever, RetrievalParams};
use vault_rag_core::tokens::{count_tokens, normalize};

fn paragraph() -> impl Strategy<Value = String> {
    (
        prop::bool::weighted(0.2),
        prop::collection::vec("[a-z]{1,8}", 1..40),
    )
        .prop_map(|(heading, words)| {
            let body = words.join(" ");
            if heading {
                format!("## {body}")
            } else {
                body
            }
        })
}

fn document_text() -> impl Strategy<Value = String> {
    prop::collection::vec(paragraph(), 0..12).prop_map(|ps| ps.join("\n\n"))
}

fn chunker_config() -> impl Strategy<Value = ChunkerConfig> {
    (4usize..80).prop_flat_map(|max| {
        (0..=max / 2, 0..max).prop_map(move |(min, overlap)| ChunkerConfig {
            max_tokens: max,
            overlap_tokens: overlap,
            min_tokens: min,
        })
    })
}

fn document(id: &str, title: &str, text: &str) -> Document {
    Document {
        id: id.into(),
        title: title.into(),
        category: "Spiritual".into(),
        book: None,
        chapter: None,
        full_text: text.into(),
        outbound_links: Default::default(),
        metadata: DocumentMetadata {
            source_path: format!("Spiritual/{title}.md"),
            modified_at: None,
            word_count: count_tokens(text),
        },
    }
}

/// Deterministic bag-of-letters embedding.
struct LetterEmbedder;

#[async_trait]
impl Embedder for LetterEmbedder {
    fn model_name(&self) -> &str {
        "letters"
    }
    fn dims(&self) -> usize {
        26
    }
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        Ok(texts
            .iter()
            .map(|t| {
                let mut v = vec![0.0f32; 26];
                for b in t.bytes().filter(u8::is_ascii_lowercase) {
                    v[(b - b'a') as usize] += 1.0;
                }
                v
            })
            .collect())
    }
}

fn ranked(sizes: &[usize]) -> Vec<RetrievedChunk> {
    sizes
        .iter()
        .enumerate()
        .map(|(i, &n)| {
            let text = vec!["word"; n].join(" ");
            RetrievedChunk {
                chunk: Arc::new(Chunk {
                    id: format!("d{i}#0"),
                    document_id: format!("d{i}"),
                    sequence_index: 0,
                    token_count: n,
                    text,
                    overlap_token_count: 0,
                    hard_split: false,
                    hash: String::new(),
                    metadata: ChunkMetadata {
                        title: format!("Title {i}"),
                        category: "Spiritual".into(),
                        ..Default::default()
                    },
                }),
                semantic_score: 0.0,
                keyword_score: 0.0,
                combined_score: 0.0,
                final_score: 1.0 - i as f64 / 100.0,
            }
        })
        .collect()
}

proptest! {
    #[test]
    fn chunks_without_overlap_reproduce_normalized_text(text in document_text(), config in chunker_config()) {
        let config = ChunkerConfig { overlap_tokens: 0, ..config };
        let pieces = chunk_text(&text, &config);
        let joined = pieces.iter().map(|p| p.text.as_str()).collect::<Vec<_>>().join(" ");
        prop_assert_eq!(normalize(&joined), normalize(&text));
    }

    #[test]
    fn chunk_sizes_within_bounds(text in document_text(), config in chunker_config()) {
        let doc = document("doc", "Doc", &text);
        let chunks = chunk_document(&doc, &config);
        for (i, c) in chunks.iter().enumerate() {
            prop_assert_eq!(c.token_count, count_tokens(&c.text));
            prop_assert!(c.token_count <= config.max_tokens);
            if chunks.len() > 1 && i + 1 < chunks.len() {
                prop_assert!(c.token_count >= config.min_tokens);
            }
        }
    }

    #[test]
    fn overlap_stripped_chunks_cover_document_in_order(text in document_text(), config in chunker_config()) {
        let doc = document("doc", "Doc", &text);
        let chunks = chunk_document(&doc, &config);
        let covered = chunks.iter().map(|c| c.primary_text()).filter(|t| !t.is_empty()).collect::<Vec<_>>().join(" ");
        prop_assert_eq!(covered, normalize(&text));
        for (i, c) in chunks.iter().enumerate() {
            prop_assert_eq!(c.sequence_index, i);
        }
    }

    #[test]
    fn retriever_never_returns_duplicate_chunks(
        texts in prop::collection::vec(document_text(), 1..6),
        query in "[a-z]{1,8}( [a-z]{1,8}){0,3}",
        top_k in 1usize..8,
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let ids: Vec<String> = rt.block_on(async {
            let index = Arc::new(InMemoryIndex::new());
            let config = ChunkerConfig { max_tokens: 20, overlap_tokens: 5, min_tokens: 5 };
            for (i, text) in texts.iter().enumerate() {
                let doc = document(&format!("d{i}"), &format!("Title {i}"), text);
                let chunks = chunk_document(&doc, &config);
                let inputs: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
                let vectors = LetterEmbedder.embed_batch(&inputs).await.unwrap();
                index.replace_document(&doc, &chunks, Some(&vectors)).await.unwrap();
            }
            let retriever = HybridRetriever::new(
                Arc::new(LetterEmbedder),
                index.clone(),
                index.clone(),
                index,
                RetrievalParams::default(),
            ).unwrap();
            let out = retriever.retrieve(&Query::new(query), top_k).await.unwrap();
            out.chunks.iter().map(|c| c.chunk.id.clone()).collect()
        });
        let unique: HashSet<&String> = ids.iter().collect();
        prop_assert_eq!(unique.len(), ids.len());
    }

    #[test]
    fn assembler_respects_budget_and_is_greedy_maximal(
        sizes in prop::collection::vec(1usize..60, 0..12),
        budget in 0usize..300,
    ) {
        let chunks = ranked(&sizes);
        let ctx = assemble(&chunks, budget);
        prop_assert!(ctx.token_count <= budget);
        prop_assert_eq!(ctx.token_count, count_tokens(&ctx.text));

        let used = ctx.chunks.len();
        for (a, b) in ctx.chunks.iter().zip(chunks.iter()) {
            prop_assert_eq!(&a.chunk.id, &b.chunk.id);
        }
        if used < chunks.len() {
            let separator = if used == 0 { 0 } else { count_tokens(SOURCE_SEPARATOR) };
            let next = count_tokens(&format_entry(&chunks[used].chunk)) + separator;
            prop_assert!(ctx.token_count + next > budget);
        }
        if used > 0 {
            let shorter = assemble(&chunks[..used - 1], budget);
            prop_assert!(shorter.token_count < ctx.token_count);
        }
    }

    #[test]
    fn citations_only_reference_context(
        cited in prop::collection::vec(0usize..8, 0..10),
        context_size in 0usize..5,
        noise in "[a-zA-Z ,.\\[\\]:;]{0,40}",
    ) {
        let context = ranked(&vec![3; context_size]);
        let mut text = noise;
        for i in &cited {
            text.push_str(&format!(" [Source: Title {i}]"));
        }
        let allowed: HashSet<&str> = context.iter().map(|c| c.document_id()).collect();
        let citations = extract(&text, &context);
        let mut seen = HashSet::new();
        for c in &citations {
            prop_assert!(allowed.contains(c.document_id.as_str()));
            prop_assert!(seen.insert(c.chunk_id.clone()));
        }
    }
}
