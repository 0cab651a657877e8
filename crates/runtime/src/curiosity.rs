//! Gap, hotspot, and hypothesis detection over the knowledge base.

use chrono::{Duration, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::memory::knowledge::{KnowledgeStore, ENTITY_HIT_PREFIX};
use crate::metrics::MetricStore;
use crate::similarity::text_similarity;
use crate::types::{CortexResult, KnowledgeFact};

/// Confidence below which a fact is a low-confidence gap.
const LOW_CONFIDENCE: f64 = 0.5;

/// Confidence below which an untagged fact counts as unverified.
const UNVERIFIED_CONFIDENCE: f64 = 0.8;

/// Similarity band signalling a subtle contradiction between two facts.
const CONTRADICTION_BAND: (f64, f64) = (0.4, 0.95);

/// Hypotheses emitted per scan, at most.
const MAX_HYPOTHESES: usize = 5;

/// Kind of knowledge gap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GapKind {
    LowConfidence,
    Unverified,
    Contradiction,
}

/// A detected gap in the knowledge base.
#[derive(Debug, Clone, PartialEq)]
pub struct KnowledgeGap {
    pub entity: String,
    pub kind: GapKind,
    pub details: String,
}

/// An entity referenced often but barely described.
#[derive(Debug, Clone, PartialEq)]
pub struct Hotspot {
    pub entity: String,
    pub references: f64,
    pub fact_count: u64,
}

/// Scans knowledge and metrics for things worth investigating.
pub struct CuriosityEngine {
    knowledge: Arc<KnowledgeStore>,
    metrics: Arc<MetricStore>,
}

impl CuriosityEngine {
    pub fn new(knowledge: Arc<KnowledgeStore>, metrics: Arc<MetricStore>) -> Self {
        Self { knowledge, metrics }
    }

    /// Low-confidence facts, unverified facts, and subtle contradictions.
    pub async fn identify_knowledge_gaps(&self) -> CortexResult<Vec<KnowledgeGap>> {
        let facts = self.knowledge.all_facts().await?;
        let mut gaps = Vec::new();

        for fact in &facts {
            if fact.confidence < LOW_CONFIDENCE {
                gaps.push(KnowledgeGap {
                    entity: fact.entity.clone(),
                    kind: GapKind::LowConfidence,
                    details: format!(
                        "fact '{}' has confidence {:.2}",
                        fact.fact, fact.confidence
                    ),
                });
            }
            if fact.confidence < UNVERIFIED_CONFIDENCE
                && !fact.tags.iter().any(|t| t == "verified")
            {
                gaps.push(KnowledgeGap {
                    entity: fact.entity.clone(),
                    kind: GapKind::Unverified,
                    details: format!("fact '{}' has never been verified", fact.fact),
                });
            }
        }

        for (entity, entity_facts) in group_by_entity(&facts) {
            let confident: Vec<&KnowledgeFact> = entity_facts
                .iter()
                .copied()
                .filter(|f| f.confidence > 0.6)
                .collect();
            if confident.len() < 2 {
                continue;
            }
            for (i, a) in confident.iter().enumerate() {
                for b in confident.iter().skip(i + 1) {
                    let similarity = text_similarity(&a.fact, &b.fact);
                    if similarity > CONTRADICTION_BAND.0 && similarity < CONTRADICTION_BAND.1 {
                        gaps.push(KnowledgeGap {
                            entity: entity.clone(),
                            kind: GapKind::Contradiction,
                            details: format!(
                                "facts '{}' and '{}' overlap without agreeing (similarity {:.2})",
                                a.fact, b.fact, similarity
                            ),
                        });
                    }
                }
            }
        }

        Ok(gaps)
    }

    /// Entities with many references but fewer than three recorded facts.
    pub async fn identify_knowledge_hotspots(&self) -> CortexResult<Vec<Hotspot>> {
        let counters = self.metrics.top_by_prefix(ENTITY_HIT_PREFIX, 10).await?;
        let mut hotspots = Vec::new();
        for (metric_name, references) in counters {
            let entity = metric_name
                .strip_prefix(ENTITY_HIT_PREFIX)
                .unwrap_or(&metric_name)
                .to_string();
            let fact_count = self.knowledge.count_entity_facts(&entity).await?;
            if fact_count < 3 && references > 5.0 {
                hotspots.push(Hotspot {
                    entity,
                    references,
                    fact_count,
                });
            }
        }
        Ok(hotspots)
    }

    /// Questions an agent should ask about an entity, tailored to what is
    /// already known.
    pub async fn suggest_questions(&self, entity: &str) -> CortexResult<Vec<String>> {
        let facts = self.knowledge.get_entity_facts(entity).await?;
        if facts.is_empty() {
            return Ok(vec![
                format!("What is {entity} and what role does it play in the system?"),
                format!("Where is {entity} used or referenced?"),
                format!("What are the known failure modes of {entity}?"),
            ]);
        }

        let tags: BTreeSet<&str> = facts
            .iter()
            .flat_map(|f| f.tags.iter().map(String::as_str))
            .collect();

        let mut questions = Vec::new();
        if tags.contains("database") {
            questions.push(format!(
                "What schema and indexing strategy does {entity} rely on?"
            ));
        }
        if tags.contains("performance") {
            questions.push(format!(
                "What are the latency and throughput characteristics of {entity} under load?"
            ));
        }
        if tags.contains("security") {
            questions.push(format!(
                "What is the threat model and access-control story for {entity}?"
            ));
        }
        questions.push(format!(
            "Which recorded facts about {entity} conflict, and which source is authoritative?"
        ));
        questions.push(format!(
            "Can the unverified facts about {entity} be confirmed against a primary source?"
        ));
        Ok(questions)
    }

    /// Pairwise relationship hypotheses between well-established entities
    /// sharing a tag.
    pub async fn generate_hypotheses(&self) -> CortexResult<Vec<String>> {
        let facts = self.knowledge.all_facts().await?;
        let mut clusters: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for fact in facts.iter().filter(|f| f.confidence > 0.8) {
            for tag in &fact.tags {
                clusters
                    .entry(tag.clone())
                    .or_default()
                    .insert(fact.entity.clone());
            }
        }

        let mut hypotheses = Vec::new();
        'outer: for (tag, entities) in &clusters {
            if entities.len() < 2 {
                continue;
            }
            let entities: Vec<&String> = entities.iter().collect();
            for (i, a) in entities.iter().enumerate() {
                for b in entities.iter().skip(i + 1) {
                    hypotheses.push(format!(
                        "HYPOTHESIS: {a} and {b} may be connected through shared trait '{tag}'"
                    ));
                    if hypotheses.len() >= MAX_HYPOTHESES {
                        break 'outer;
                    }
                }
            }
        }
        Ok(hypotheses)
    }

    /// Everything worth researching right now: gaps, hotspots, hypotheses,
    /// and the publication ritual when evolution has been busy.
    pub async fn propose_research(&self) -> CortexResult<Vec<String>> {
        let mut proposals = Vec::new();

        for gap in self.identify_knowledge_gaps().await? {
            let label = match gap.kind {
                GapKind::LowConfidence => "Shore up",
                GapKind::Unverified => "Verify",
                GapKind::Contradiction => "Resolve",
            };
            proposals.push(format!("{label} '{}': {}", gap.entity, gap.details));
        }

        for hotspot in self.identify_knowledge_hotspots().await? {
            proposals.push(format!(
                "Research hotspot '{}': referenced {} times but only {} fact(s) recorded",
                hotspot.entity, hotspot.references, hotspot.fact_count
            ));
        }

        proposals.extend(self.generate_hypotheses().await?);

        let week_ago = Utc::now() - Duration::days(7);
        if self.metrics.count_since("evolution_applied", week_ago).await? > 5 {
            proposals.push(
                "Sovereign Publication Ritual: consolidate this week's applied evolutions into a shareable knowledge artifact"
                    .to_string(),
            );
        }

        Ok(proposals)
    }
}

fn group_by_entity(facts: &[KnowledgeFact]) -> BTreeMap<String, Vec<&KnowledgeFact>> {
    let mut grouped: BTreeMap<String, Vec<&KnowledgeFact>> = BTreeMap::new();
    for fact in facts {
        grouped.entry(fact.entity.clone()).or_default().push(fact);
    }
    grouped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TableNames;
    use crate::storage::Database;

    fn engine() -> (CuriosityEngine, Arc<KnowledgeStore>, Arc<MetricStore>) {
        let db = Arc::new(Database::open_in_memory(TableNames::default()).unwrap());
        let metrics = Arc::new(MetricStore::new(db.clone()));
        let knowledge = Arc::new(KnowledgeStore::new(db, metrics.clone()));
        (
            CuriosityEngine::new(knowledge.clone(), metrics.clone()),
            knowledge,
            metrics,
        )
    }

    #[tokio::test]
    async fn low_confidence_and_unverified_gaps() {
        let (curiosity, knowledge, _) = engine();
        knowledge.add_fact("redis", "might be a cache", 0.3, &[]).await.unwrap();
        knowledge
            .add_fact(
                "postgres",
                "stores relational data",
                0.9,
                &["verified".to_string()],
            )
            .await
            .unwrap();
        knowledge
            .add_fact("kafka", "handles event streams", 0.7, &[])
            .await
            .unwrap();

        let gaps = curiosity.identify_knowledge_gaps().await.unwrap();
        let kinds: Vec<(&str, GapKind)> = gaps
            .iter()
            .map(|g| (g.entity.as_str(), g.kind))
            .collect();
        assert!(kinds.contains(&("redis", GapKind::LowConfidence)));
        assert!(kinds.contains(&("redis", GapKind::Unverified)));
        assert!(kinds.contains(&("kafka", GapKind::Unverified)));
        assert!(!kinds.iter().any(|(e, _)| *e == "postgres"));
    }

    #[tokio::test]
    async fn subtle_contradictions_are_flagged() {
        let (curiosity, knowledge, _) = engine();
        // Similar but not near-identical statements about the same entity.
        knowledge
            .add_fact("cache", "the cache evicts entries using LRU ordering", 0.9, &[])
            .await
            .unwrap();
        knowledge
            .add_fact("cache", "the cache evicts entries using FIFO ordering", 0.9, &[])
            .await
            .unwrap();
        // A near-identical pair must not be flagged.
        knowledge
            .add_fact("queue", "the queue is durable", 0.9, &[])
            .await
            .unwrap();
        knowledge
            .add_fact("queue", "the queue is durable", 0.9, &[])
            .await
            .unwrap();

        let gaps = curiosity.identify_knowledge_gaps().await.unwrap();
        let contradictions: Vec<&KnowledgeGap> = gaps
            .iter()
            .filter(|g| g.kind == GapKind::Contradiction)
            .collect();
        assert_eq!(contradictions.len(), 1);
        assert_eq!(contradictions[0].entity, "cache");
    }

    #[tokio::test]
    async fn hotspots_require_many_references_and_few_facts() {
        let (curiosity, knowledge, metrics) = engine();
        for _ in 0..7 {
            metrics.record("entity_hit_mystery", 1.0).await.unwrap();
        }
        for _ in 0..7 {
            metrics.record("entity_hit_known", 1.0).await.unwrap();
        }
        for i in 0..3 {
            knowledge
                .add_fact("known", &format!("fact {i}"), 0.9, &[])
                .await
                .unwrap();
        }

        let hotspots = curiosity.identify_knowledge_hotspots().await.unwrap();
        assert_eq!(hotspots.len(), 1);
        assert_eq!(hotspots[0].entity, "mystery");
        assert!(hotspots[0].references > 5.0);
    }

    #[tokio::test]
    async fn questions_cold_start_without_knowledge() {
        let (curiosity, _, _) = engine();
        let questions = curiosity.suggest_questions("ghost").await.unwrap();
        assert_eq!(questions.len(), 3);
        assert!(questions[0].contains("ghost"));
    }

    #[tokio::test]
    async fn questions_follow_tags() {
        let (curiosity, knowledge, _) = engine();
        knowledge
            .add_fact(
                "postgres",
                "backs the session store",
                0.9,
                &["database".to_string(), "performance".to_string()],
            )
            .await
            .unwrap();

        let questions = curiosity.suggest_questions("postgres").await.unwrap();
        assert!(questions.iter().any(|q| q.contains("schema")));
        assert!(questions.iter().any(|q| q.contains("latency")));
        assert!(!questions.iter().any(|q| q.contains("threat model")));
        // Contradiction and verification prompts always close the list.
        assert!(questions.iter().any(|q| q.contains("conflict")));
        assert!(questions.iter().any(|q| q.contains("unverified")));
    }

    #[tokio::test]
    async fn hypotheses_pair_entities_sharing_tags() {
        let (curiosity, knowledge, _) = engine();
        for entity in ["api", "worker", "scheduler"] {
            knowledge
                .add_fact(entity, "emits structured logs", 0.9, &["observability".to_string()])
                .await
                .unwrap();
        }
        knowledge
            .add_fact("lonely", "unrelated", 0.9, &["other".to_string()])
            .await
            .unwrap();

        let hypotheses = curiosity.generate_hypotheses().await.unwrap();
        assert_eq!(hypotheses.len(), 3); // C(3,2) pairs
        assert!(hypotheses.iter().all(|h| h.starts_with("HYPOTHESIS:")));
        assert!(hypotheses.iter().all(|h| h.contains("observability")));
    }

    #[tokio::test]
    async fn hypotheses_are_capped() {
        let (curiosity, knowledge, _) = engine();
        for i in 0..6 {
            knowledge
                .add_fact(&format!("svc{i}"), "shares a mesh", 0.9, &["mesh".to_string()])
                .await
                .unwrap();
        }
        let hypotheses = curiosity.generate_hypotheses().await.unwrap();
        assert_eq!(hypotheses.len(), MAX_HYPOTHESES);
    }

    #[tokio::test]
    async fn research_proposals_include_publication_ritual_when_busy() {
        let (curiosity, _, metrics) = engine();
        for _ in 0..6 {
            metrics.record("evolution_applied", 1.0).await.unwrap();
        }
        let proposals = curiosity.propose_research().await.unwrap();
        assert!(proposals
            .iter()
            .any(|p| p.starts_with("Sovereign Publication Ritual")));
    }

    #[tokio::test]
    async fn quiet_weeks_skip_the_ritual() {
        let (curiosity, _, metrics) = engine();
        for _ in 0..5 {
            metrics.record("evolution_applied", 1.0).await.unwrap();
        }
        let proposals = curiosity.propose_research().await.unwrap();
        assert!(!proposals
            .iter()
            .any(|p| p.starts_with("Sovereign Publication Ritual")));
    }
}
