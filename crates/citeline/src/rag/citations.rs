//! Citation grouping and scoring.
//!
//! Raw bracket tags on each generated item are expanded (numeric ranges),
//! deduplicated, and grouped into maximal runs of consecutive integers;
//! non-numeric tags stand alone. Each group is scored against the item via
//! one batched embedding call plus the numeric-match boost, then the item's
//! tags are rewritten in place to the stable citation ids.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::Config;
use crate::embeddings::EmbeddingClient;
use crate::rag::similarity;
use crate::types::{Citation, Response, Row, Source};

/// Expand a numeric range tag `a-b` into `a..=b`; inverted ranges drop,
/// mixed-letter tags pass through unchanged.
fn expand_tag_range(tag: &str) -> Vec<String> {
    let Some((start, end)) = tag.split_once('-') else {
        return vec![tag.to_string()];
    };
    match (start.parse::<u64>(), end.parse::<u64>()) {
        (Ok(start), Ok(end)) if start <= end => (start..=end).map(|n| n.to_string()).collect(),
        (Ok(_), Ok(_)) => Vec::new(),
        _ => Vec::new(),
    }
}

/// Partition tags into groups: maximal runs of consecutive integers in
/// ascending order, then non-numeric tags as singletons in appearance order.
fn group_sequential(tags: &[String]) -> Vec<Vec<String>> {
    let mut numeric: Vec<u64> = Vec::new();
    let mut singletons: Vec<String> = Vec::new();

    for tag in tags {
        match tag.parse::<u64>() {
            Ok(n) if !numeric.contains(&n) => numeric.push(n),
            Ok(_) => {}
            Err(_) => singletons.push(tag.clone()),
        }
    }
    numeric.sort_unstable();

    let mut groups: Vec<Vec<String>> = Vec::new();
    let mut current: Vec<u64> = Vec::new();
    for n in numeric {
        if let Some(&last) = current.last() {
            if n != last + 1 {
                groups.push(current.iter().map(u64::to_string).collect());
                current.clear();
            }
        }
        current.push(n);
    }
    if !current.is_empty() {
        groups.push(current.iter().map(u64::to_string).collect());
    }

    groups.extend(singletons.into_iter().map(|t| vec![t]));
    groups
}

pub struct CitationScorer {
    embedder: Arc<EmbeddingClient>,
    boost: f32,
}

impl CitationScorer {
    pub fn new(embedder: Arc<EmbeddingClient>, config: &Config) -> Self {
        Self {
            embedder,
            boost: config.ai.number_match_boost,
        }
    }

    /// Score every item of the response, rewriting its tags to citation ids
    /// and returning the citation map.
    pub async fn score_response(
        &self,
        response: &mut Response,
        sources: &HashMap<String, Source>,
    ) -> HashMap<String, Citation> {
        match response {
            Response::Text { items } => {
                let mut citations = HashMap::new();
                for (idx, item) in items.iter_mut().enumerate() {
                    let (ids, scored) = self
                        .score_item(&item.text, &item.tags, sources, &idx.to_string())
                        .await;
                    item.tags = ids;
                    citations.extend(scored);
                }
                citations
            }
            Response::Table { rows } | Response::Chart { rows, .. } => {
                self.score_rows(rows, sources).await
            }
        }
    }

    async fn score_rows(
        &self,
        rows: &mut [Row],
        sources: &HashMap<String, Source>,
    ) -> HashMap<String, Citation> {
        let mut citations = HashMap::new();
        for (row_idx, row) in rows.iter_mut().enumerate() {
            for (cell_idx, cell) in row.cells.iter_mut().enumerate() {
                let (ids, scored) = self
                    .score_item(
                        &cell.text,
                        &cell.tags,
                        sources,
                        &format!("{row_idx}_{cell_idx}"),
                    )
                    .await;
                cell.tags = ids;
                citations.extend(scored);
            }
        }
        citations
    }

    /// Score one item's tags. Returns the citation ids (in group order) and
    /// the scored citations. Group indices count every group, including ones
    /// skipped for resolving no sources, so ids stay stable.
    async fn score_item(
        &self,
        text: &str,
        raw_tags: &[String],
        sources: &HashMap<String, Source>,
        item_idx: &str,
    ) -> (Vec<String>, HashMap<String, Citation>) {
        if raw_tags.is_empty() || text.is_empty() {
            return (Vec::new(), HashMap::new());
        }

        // Expand ranges, then dedupe preserving order.
        let mut tags: Vec<String> = Vec::new();
        for tag in raw_tags {
            for expanded in expand_tag_range(tag) {
                if !tags.contains(&expanded) {
                    tags.push(expanded);
                }
            }
        }
        if tags.is_empty() {
            return (Vec::new(), HashMap::new());
        }

        let groups = group_sequential(&tags);

        let mut citation_ids = Vec::new();
        let mut grouped: Vec<(String, Vec<&Source>)> = Vec::new();
        for (group_idx, group) in groups.iter().enumerate() {
            let resolved: Vec<&Source> = group.iter().filter_map(|tag| sources.get(tag)).collect();
            if resolved.is_empty() {
                continue;
            }
            let cid = format!("c{item_idx}_{group_idx}");
            citation_ids.push(cid.clone());
            grouped.push((cid, resolved));
        }

        if grouped.is_empty() {
            return (Vec::new(), HashMap::new());
        }

        let cited_texts: Vec<String> = grouped
            .iter()
            .map(|(_, resolved)| {
                resolved
                    .iter()
                    .map(|s| s.unit.text.as_str())
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .collect();

        let mut inputs: Vec<String> = Vec::with_capacity(cited_texts.len() + 1);
        inputs.push(text.to_string());
        inputs.extend(cited_texts.iter().cloned());

        // A failed embedding call degrades every group to score 0 instead of
        // failing the run.
        let scores = match self.embedder.embed_many(&inputs).await {
            Ok(embeddings) if embeddings.len() == inputs.len() => similarity::score_with_boost(
                &embeddings[0],
                &embeddings[1..],
                text,
                &cited_texts,
                self.boost,
            ),
            Ok(_) | Err(_) => {
                tracing::warn!("citation embedding failed, degrading group scores to 0");
                vec![0.0; grouped.len()]
            }
        };

        let mut citations = HashMap::new();
        for ((cid, resolved), score) in grouped.into_iter().zip(scores) {
            citations.insert(
                cid,
                Citation {
                    units: resolved.iter().map(|s| s.unit.clone()).collect(),
                    file: resolved[0].file.clone(),
                    score,
                },
            );
        }

        (citation_ids, citations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{source_for, text_sources, StubEmbeddings};
    use crate::types::Item;

    fn scorer() -> CitationScorer {
        let config = Config::default();
        let embedder = Arc::new(EmbeddingClient::new(Arc::new(StubEmbeddings), &config));
        CitationScorer::new(embedder, &config)
    }

    fn failing_scorer() -> CitationScorer {
        let config = Config::default();
        let embedder = Arc::new(EmbeddingClient::new(
            Arc::new(crate::testing::FailingEmbeddings),
            &config,
        ));
        CitationScorer::new(embedder, &config)
    }

    #[test]
    fn test_expand_tag_range() {
        assert_eq!(expand_tag_range("45-47"), vec!["45", "46", "47"]);
        assert_eq!(expand_tag_range("12"), vec!["12"]);
        assert!(expand_tag_range("47-45").is_empty());
        // Mixed-letter ranges never expand.
        assert_eq!(expand_tag_range("45B"), vec!["45B"]);
        assert!(expand_tag_range("45A-45C").is_empty());
    }

    #[test]
    fn test_group_sequential_runs() {
        let tags: Vec<String> = ["1", "2", "3", "5"].iter().map(|s| s.to_string()).collect();
        let groups = group_sequential(&tags);
        assert_eq!(groups, vec![vec!["1", "2", "3"], vec!["5"]]);
    }

    #[test]
    fn test_group_letter_tags_are_singletons() {
        let tags: Vec<String> = ["45B", "45C"].iter().map(|s| s.to_string()).collect();
        let groups = group_sequential(&tags);
        assert_eq!(groups, vec![vec!["45B"], vec!["45C"]]);
    }

    #[test]
    fn test_group_mixed_numeric_and_letters() {
        let tags: Vec<String> = ["7", "45B", "8"].iter().map(|s| s.to_string()).collect();
        let groups = group_sequential(&tags);
        assert_eq!(groups, vec![vec!["7", "8"], vec!["45B"]]);
    }

    #[tokio::test]
    async fn test_range_expansion_scenario() {
        // Tags [45-47]: sources 45, 46, 47 exist → one citation with three
        // units, id c0_0.
        let sources = text_sources(&[(45, "a"), (46, "b"), (47, "c")]);
        let mut response = Response::Text {
            items: vec![Item {
                text: "Combined statement.".to_string(),
                tags: vec!["45-47".to_string()],
            }],
        };

        let citations = scorer().score_response(&mut response, &sources).await;
        let Response::Text { items } = &response else {
            panic!()
        };
        assert_eq!(items[0].tags, vec!["c0_0"]);
        let citation = &citations["c0_0"];
        assert_eq!(citation.units.len(), 3);
        assert_eq!(
            citation.units.iter().map(|u| u.id.as_str()).collect::<Vec<_>>(),
            vec!["45", "46", "47"]
        );
    }

    #[tokio::test]
    async fn test_letter_coords_get_separate_citations() {
        let mut sources = HashMap::new();
        sources.insert("45B".to_string(), source_for("B45", "cell one"));
        sources.insert("45C".to_string(), source_for("C45", "cell two"));

        let mut response = Response::Text {
            items: vec![Item {
                text: "Two cells cited.".to_string(),
                tags: vec!["45B".to_string(), "45C".to_string()],
            }],
        };

        let citations = scorer().score_response(&mut response, &sources).await;
        let Response::Text { items } = &response else {
            panic!()
        };
        assert_eq!(items[0].tags, vec!["c0_0", "c0_1"]);
        assert_eq!(citations.len(), 2);
        assert_eq!(citations["c0_0"].units.len(), 1);
    }

    #[tokio::test]
    async fn test_unresolved_group_keeps_indices_stable() {
        // Tags 1 and 99: only 99 resolves. Group 0 (for "1") is skipped but
        // still counted, so the surviving citation is c0_1.
        let sources = text_sources(&[(99, "lonely source")]);
        let mut response = Response::Text {
            items: vec![Item {
                text: "statement".to_string(),
                tags: vec!["1".to_string(), "99".to_string()],
            }],
        };

        let citations = scorer().score_response(&mut response, &sources).await;
        let Response::Text { items } = &response else {
            panic!()
        };
        assert_eq!(items[0].tags, vec!["c0_1"]);
        assert!(citations.contains_key("c0_1"));
    }

    #[tokio::test]
    async fn test_numeric_boost_raises_score() {
        use crate::embeddings::EmbeddingApi;
        use crate::rag::similarity;

        let source_text = "Revenue in Q4 2024 was $47.5B.";
        let response_text = "Revenue rose to $47.5B";
        let sources = text_sources(&[(12, source_text)]);

        let mut response = Response::Text {
            items: vec![Item {
                text: response_text.to_string(),
                tags: vec!["12".to_string()],
            }],
        };
        let citations = scorer().score_response(&mut response, &sources).await;
        let scored = citations["c0_0"].score;

        // Expected: the stub-embedding cosine plus exactly one matched
        // number ($47.5B), clamped.
        let vectors = StubEmbeddings
            .embed("m", &[response_text.to_string(), source_text.to_string()])
            .await
            .unwrap();
        let base = similarity::cosine(&vectors[0], &vectors[1]);
        let expected = (base + 0.30f32).min(1.0);
        assert!((scored - expected).abs() < 1e-5, "got {scored}, expected {expected}");
    }

    #[tokio::test]
    async fn test_embedding_failure_degrades_to_zero() {
        let sources = text_sources(&[(1, "source text")]);
        let mut response = Response::Text {
            items: vec![Item {
                text: "statement".to_string(),
                tags: vec!["1".to_string()],
            }],
        };

        let citations = failing_scorer().score_response(&mut response, &sources).await;
        let Response::Text { items } = &response else {
            panic!()
        };
        // Ids still assigned; score dropped to zero.
        assert_eq!(items[0].tags, vec!["c0_0"]);
        assert_eq!(citations["c0_0"].score, 0.0);
    }

    #[tokio::test]
    async fn test_table_cells_scored_per_cell() {
        let sources = text_sources(&[(122, "Revenue was $47.5B"), (308, "Revenue was $39.1B")]);
        let mut response = Response::Table {
            rows: vec![crate::types::Row {
                cells: vec![
                    Item {
                        text: "Revenue".to_string(),
                        tags: vec![],
                    },
                    Item {
                        text: "$47.5B".to_string(),
                        tags: vec!["122".to_string()],
                    },
                    Item {
                        text: "$39.1B".to_string(),
                        tags: vec!["308".to_string()],
                    },
                ],
            }],
        };

        let citations = scorer().score_response(&mut response, &sources).await;
        let Response::Table { rows } = &response else {
            panic!()
        };
        assert!(rows[0].cells[0].tags.is_empty());
        assert_eq!(rows[0].cells[1].tags, vec!["c0_1_0"]);
        assert_eq!(rows[0].cells[2].tags, vec!["c0_2_0"]);
        assert_eq!(citations.len(), 2);
        // Every rewritten tag resolves in the citation map.
        for cell in &rows[0].cells {
            for tag in &cell.tags {
                assert!(citations.contains_key(tag));
            }
        }
    }

    #[tokio::test]
    async fn test_duplicate_tags_dedupe_preserving_order() {
        let sources = text_sources(&[(5, "five"), (6, "six")]);
        let mut response = Response::Text {
            items: vec![Item {
                text: "statement".to_string(),
                tags: vec!["6".to_string(), "5".to_string(), "6".to_string()],
            }],
        };

        let citations = scorer().score_response(&mut response, &sources).await;
        // 5 and 6 are consecutive → one group.
        assert_eq!(citations.len(), 1);
        assert_eq!(citations["c0_0"].units.len(), 2);
    }
}
