//! Optimizer Agent
//!
//! Runs over the tests that survived validation: exact deduplication by
//! canonicalized code hash, semantic deduplication by pairwise cosine
//! similarity over embeddings, then requirements-coverage analysis.
//! Insertion order is stable throughout and `code` is never mutated.

use futures::stream::{self, StreamExt};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use testops_core::error::CopilotResult;
use testops_core::llm::LlmClient;
use testops_core::models::{CoverageAnalysis, TestCase};

/// Tests needed to call a requirement well-covered.
const GOOD_COVERAGE_COUNT: f64 = 2.0;

/// Result of one optimizer run.
#[derive(Debug, Clone)]
pub struct OptimizationResult {
    /// All input tests in insertion order, duplicate flags set.
    pub tests: Vec<TestCase>,
    pub unique_count: usize,
    pub duplicate_count: usize,
    pub coverage: Vec<CoverageAnalysis>,
    /// Request-level score: covered requirements / all requirements.
    pub coverage_score: f64,
    pub gaps: Vec<String>,
}

impl OptimizationResult {
    /// Kept (non-duplicate) tests in insertion order.
    pub fn unique_tests(&self) -> Vec<&TestCase> {
        self.tests.iter().filter(|t| !t.is_duplicate).collect()
    }
}

/// Strip trailing whitespace per line and normalize line endings.
pub fn canonicalize_source(code: &str) -> String {
    code.lines()
        .map(|line| line.trim_end())
        .collect::<Vec<_>>()
        .join("\n")
}

/// SHA-256 of the canonicalized source.
pub fn code_hash(code: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonicalize_source(code).as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Cosine similarity of two vectors; 0 when either norm vanishes.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// Optimizer over the cached LLM client's embedding endpoint.
pub struct OptimizerAgent {
    llm: Arc<LlmClient>,
    similarity_threshold: f32,
    fanout: usize,
}

impl OptimizerAgent {
    pub fn new(llm: Arc<LlmClient>, similarity_threshold: f32, fanout: usize) -> Self {
        Self {
            llm,
            similarity_threshold,
            fanout: fanout.max(1),
        }
    }

    /// Deduplicate and score coverage. Tests arrive in the generator's
    /// output order, which decides every keep-first tie.
    pub async fn optimize(
        &self,
        mut tests: Vec<TestCase>,
        requirements: &[String],
    ) -> CopilotResult<OptimizationResult> {
        // Exact dedup by canonicalized hash, first-inserted kept.
        for test in tests.iter_mut() {
            test.code_hash = code_hash(&test.code);
        }
        let mut first_by_hash: HashMap<String, (usize, Uuid)> = HashMap::new();
        for index in 0..tests.len() {
            let hash = tests[index].code_hash.clone();
            match first_by_hash.get(&hash) {
                Some((_, canonical_id)) => {
                    let canonical_id = *canonical_id;
                    let test = &mut tests[index];
                    test.is_duplicate = true;
                    test.duplicate_of = Some(canonical_id);
                    test.similarity_score = Some(1.0);
                }
                None => {
                    first_by_hash.insert(hash, (index, tests[index].id));
                }
            }
        }
        let exact_duplicates = tests.iter().filter(|t| t.is_duplicate).count();
        debug!("Exact dedup removed {exact_duplicates} tests");

        // Embeddings for the remaining tests, bounded fan-out, input
        // order preserved. Pre-set embeddings are kept as-is.
        let pending: Vec<(usize, String)> = tests
            .iter()
            .enumerate()
            .filter(|(_, t)| !t.is_duplicate && t.semantic_embedding.is_none())
            .map(|(index, t)| (index, format!("{} {}", t.name, t.code)))
            .collect();

        let embeddings: Vec<(usize, Vec<f32>)> = stream::iter(pending)
            .map(|(index, text)| {
                let llm = self.llm.clone();
                async move { (index, llm.embed(&text).await) }
            })
            .buffered(self.fanout)
            .map(|(index, result)| result.map(|embedding| (index, embedding)))
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .collect::<CopilotResult<Vec<_>>>()?;

        for (index, embedding) in embeddings {
            tests[index].semantic_embedding = Some(embedding);
        }

        // Semantic dedup: pairwise cosine, a duplicate attaches to the
        // smallest-index kept test at or above the threshold.
        let candidate_indices: Vec<usize> = tests
            .iter()
            .enumerate()
            .filter(|(_, t)| !t.is_duplicate)
            .map(|(index, _)| index)
            .collect();

        let mut kept: Vec<usize> = Vec::new();
        for &candidate in &candidate_indices {
            let mut duplicate_of: Option<(usize, f32)> = None;
            for &kept_index in &kept {
                let similarity = match (
                    tests[kept_index].semantic_embedding.as_ref(),
                    tests[candidate].semantic_embedding.as_ref(),
                ) {
                    (Some(a), Some(b)) => cosine_similarity(a, b),
                    _ => 0.0,
                };
                if similarity >= self.similarity_threshold {
                    duplicate_of = Some((kept_index, similarity));
                    break;
                }
            }
            match duplicate_of {
                Some((kept_index, similarity)) => {
                    let canonical_id = tests[kept_index].id;
                    let test = &mut tests[candidate];
                    test.is_duplicate = true;
                    test.duplicate_of = Some(canonical_id);
                    test.similarity_score = Some(similarity);
                }
                None => kept.push(candidate),
            }
        }

        // An exact duplicate may point at a test the semantic pass just
        // marked duplicate itself. Re-attach it to that test's keeper so
        // every duplicate_of lands on a kept test; chains are at most
        // one hop deep because semantic duplicates only attach to kept
        // tests.
        let reattach: HashMap<Uuid, (Uuid, Option<f32>)> = tests
            .iter()
            .filter(|t| t.is_duplicate)
            .filter_map(|t| t.duplicate_of.map(|d| (t.id, (d, t.similarity_score))))
            .collect();
        for test in tests.iter_mut().filter(|t| t.is_duplicate) {
            if let Some(target) = test.duplicate_of {
                if let Some(&(keeper, keeper_score)) = reattach.get(&target) {
                    test.duplicate_of = Some(keeper);
                    test.similarity_score = keeper_score;
                }
            }
        }

        let duplicate_count = tests.iter().filter(|t| t.is_duplicate).count();
        let unique_count = tests.len() - duplicate_count;

        // Coverage over the kept set only.
        let (coverage, coverage_score, gaps) = self.analyze_coverage(&tests, requirements);

        info!(
            "Optimizer kept {unique_count} of {} tests, coverage score {coverage_score:.2}",
            tests.len()
        );

        Ok(OptimizationResult {
            tests,
            unique_count,
            duplicate_count,
            coverage,
            coverage_score,
            gaps,
        })
    }

    /// A test covers a requirement when the case-folded requirement text
    /// appears in its code or the requirement index is declared.
    fn analyze_coverage(
        &self,
        tests: &[TestCase],
        requirements: &[String],
    ) -> (Vec<CoverageAnalysis>, f64, Vec<String>) {
        let request_id = tests.first().map(|t| t.request_id).unwrap_or_default();
        let mut rows = Vec::new();
        let mut gaps = Vec::new();
        let mut covered_total = 0usize;

        for (index, requirement) in requirements.iter().enumerate() {
            let needle = requirement.to_lowercase();
            let covering: Vec<Uuid> = tests
                .iter()
                .filter(|t| !t.is_duplicate)
                .filter(|t| {
                    t.code.to_lowercase().contains(&needle)
                        || t.covered_requirements.contains(&index)
                })
                .map(|t| t.id)
                .collect();

            let coverage_count = covering.len();
            let is_covered = coverage_count > 0;
            let has_gap = !is_covered || (coverage_count as f64) < GOOD_COVERAGE_COUNT;
            let gap_description = if !is_covered {
                let description = format!("No tests cover: {requirement}");
                gaps.push(description.clone());
                Some(description)
            } else {
                None
            };
            if is_covered {
                covered_total += 1;
            }

            rows.push(CoverageAnalysis {
                id: Uuid::new_v4(),
                request_id,
                requirement_text: requirement.clone(),
                requirement_index: index,
                is_covered,
                covering_tests: covering,
                coverage_count,
                coverage_score: (coverage_count as f64 / GOOD_COVERAGE_COUNT).min(1.0),
                has_gap,
                gap_description,
            });
        }

        let score = if requirements.is_empty() {
            0.0
        } else {
            covered_total as f64 / requirements.len() as f64
        };

        (rows, score, gaps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use testops_core::llm::{FakeTransport, LlmSettings};
    use testops_core::models::CaseType;

    fn optimizer(threshold: f32) -> OptimizerAgent {
        let settings = LlmSettings {
            retry_base_delay_ms: 1,
            ..Default::default()
        };
        let llm = Arc::new(LlmClient::new(settings, Arc::new(FakeTransport::new())));
        OptimizerAgent::new(llm, threshold, 8)
    }

    fn test_case(request_id: Uuid, name: &str, code: &str) -> TestCase {
        TestCase::new(
            request_id,
            name.to_string(),
            code.to_string(),
            CaseType::Automated,
        )
    }

    /// Embedding along one axis: lets tests pin exact cosine values.
    fn axis_embedding(weights: [f32; 2]) -> Vec<f32> {
        let mut v = vec![0.0_f32; 384];
        v[0] = weights[0];
        v[1] = weights[1];
        let norm = (v[0] * v[0] + v[1] * v[1]).sqrt();
        v[0] /= norm;
        v[1] /= norm;
        v
    }

    #[test]
    fn test_canonicalization_normalizes_endings_and_trailing_space() {
        let a = "def test_a():   \r\n    assert True  \r\n";
        let b = "def test_a():\n    assert True\n";
        assert_eq!(canonicalize_source(a), canonicalize_source(b));
        assert_eq!(code_hash(a), code_hash(b));
    }

    #[test]
    fn test_cosine_of_identical_vectors_is_one() {
        let v = axis_embedding([1.0, 0.0]);
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_of_orthogonal_vectors_is_zero() {
        let a = axis_embedding([1.0, 0.0]);
        let b = axis_embedding([0.0, 1.0]);
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_exact_duplicates_keep_first_inserted() {
        let request_id = Uuid::new_v4();
        let a = test_case(request_id, "test_a", "def test_a():\n    assert True\n");
        // Same code modulo trailing whitespace: an exact duplicate.
        let a2 = test_case(request_id, "test_a", "def test_a():   \n    assert True\n");
        let a_id = a.id;
        let a2_id = a2.id;

        let result = optimizer(0.85).optimize(vec![a, a2], &[]).await.unwrap();

        assert_eq!(result.unique_count, 1);
        assert_eq!(result.duplicate_count, 1);
        let kept = result.unique_tests();
        assert_eq!(kept[0].id, a_id);
        let duplicate = result.tests.iter().find(|t| t.id == a2_id).unwrap();
        assert!(duplicate.is_duplicate);
        assert_eq!(duplicate.duplicate_of, Some(a_id));
        assert_eq!(duplicate.similarity_score, Some(1.0));
    }

    #[tokio::test]
    async fn test_semantic_duplicate_attaches_to_earlier_test() {
        let request_id = Uuid::new_v4();
        let mut a = test_case(request_id, "test_a", "def test_a():\n    assert True\n");
        let mut b = test_case(request_id, "test_b", "def test_b():\n    assert True\n");
        // cos = 0.9 between these two unit vectors.
        a.semantic_embedding = Some(axis_embedding([1.0, 0.0]));
        let angle = 0.9_f32.acos();
        b.semantic_embedding = Some(axis_embedding([angle.cos(), angle.sin()]));
        let a_id = a.id;
        let b_id = b.id;

        let result = optimizer(0.85).optimize(vec![a, b], &[]).await.unwrap();

        let duplicate = result.tests.iter().find(|t| t.id == b_id).unwrap();
        assert!(duplicate.is_duplicate);
        assert_eq!(duplicate.duplicate_of, Some(a_id));
        let similarity = duplicate.similarity_score.unwrap();
        assert!((similarity - 0.9).abs() < 1e-3);
    }

    #[tokio::test]
    async fn test_tie_break_prefers_smallest_index() {
        let request_id = Uuid::new_v4();
        let mut a = test_case(request_id, "test_a", "def test_a():\n    assert 1\n");
        let mut b = test_case(request_id, "test_b", "def test_b():\n    assert 2\n");
        let mut c = test_case(request_id, "test_c", "def test_c():\n    assert 3\n");
        // a and b are dissimilar; c is similar to both.
        a.semantic_embedding = Some(axis_embedding([1.0, 0.0]));
        b.semantic_embedding = Some(axis_embedding([0.0, 1.0]));
        c.semantic_embedding = Some(axis_embedding([1.0, 1.0]));
        let a_id = a.id;
        let c_id = c.id;

        let result = optimizer(0.7).optimize(vec![a, b, c], &[]).await.unwrap();

        let duplicate = result.tests.iter().find(|t| t.id == c_id).unwrap();
        assert!(duplicate.is_duplicate);
        assert_eq!(duplicate.duplicate_of, Some(a_id));
        assert_eq!(result.unique_count, 2);
    }

    #[tokio::test]
    async fn test_below_threshold_pairs_are_kept() {
        let request_id = Uuid::new_v4();
        let mut a = test_case(request_id, "test_a", "def test_a():\n    assert 1\n");
        let mut b = test_case(request_id, "test_b", "def test_b():\n    assert 2\n");
        a.semantic_embedding = Some(axis_embedding([1.0, 0.0]));
        b.semantic_embedding = Some(axis_embedding([0.0, 1.0]));

        let result = optimizer(0.85).optimize(vec![a, b], &[]).await.unwrap();
        assert_eq!(result.unique_count, 2);
        assert_eq!(result.duplicate_count, 0);
    }

    #[tokio::test]
    async fn test_exact_duplicate_reattached_when_canonical_is_semantic_duplicate() {
        let request_id = Uuid::new_v4();
        let mut z = test_case(request_id, "test_z", "def test_z():\n    assert 0\n");
        let mut x = test_case(request_id, "test_x", "def test_x():\n    assert 1\n");
        // Exact copy of x, inserted after it.
        let x_copy = test_case(request_id, "test_x", "def test_x():\n    assert 1\n");
        z.semantic_embedding = Some(axis_embedding([1.0, 0.0]));
        let angle = 0.9_f32.acos();
        x.semantic_embedding = Some(axis_embedding([angle.cos(), angle.sin()]));
        let z_id = z.id;
        let x_id = x.id;
        let copy_id = x_copy.id;

        let result = optimizer(0.85)
            .optimize(vec![z, x, x_copy], &[])
            .await
            .unwrap();

        // x became a semantic duplicate of z; its exact copy must not
        // point at a duplicate.
        let x_row = result.tests.iter().find(|t| t.id == x_id).unwrap();
        assert!(x_row.is_duplicate);
        assert_eq!(x_row.duplicate_of, Some(z_id));

        let copy_row = result.tests.iter().find(|t| t.id == copy_id).unwrap();
        assert!(copy_row.is_duplicate);
        assert_eq!(copy_row.duplicate_of, Some(z_id));

        for duplicate in result.tests.iter().filter(|t| t.is_duplicate) {
            let canonical = result
                .tests
                .iter()
                .find(|t| Some(t.id) == duplicate.duplicate_of)
                .unwrap();
            assert!(!canonical.is_duplicate);
        }
    }

    #[tokio::test]
    async fn test_single_test_has_no_dedup_pairs() {
        let request_id = Uuid::new_v4();
        let a = test_case(request_id, "test_a", "def test_a():\n    assert True\n");
        let result = optimizer(0.85).optimize(vec![a], &[]).await.unwrap();
        assert_eq!(result.unique_count, 1);
        assert_eq!(result.duplicate_count, 0);
    }

    #[tokio::test]
    async fn test_coverage_substring_and_declared() {
        let request_id = Uuid::new_v4();
        let mut a = test_case(
            request_id,
            "test_login",
            "def test_login():\n    # login works\n    assert True\n",
        );
        let mut b = test_case(request_id, "test_other", "def test_other():\n    assert 2\n");
        a.semantic_embedding = Some(axis_embedding([1.0, 0.0]));
        b.semantic_embedding = Some(axis_embedding([0.0, 1.0]));
        b.covered_requirements = vec![1];

        let requirements = vec!["login works".to_string(), "logout works".to_string()];
        let result = optimizer(0.85)
            .optimize(vec![a, b], &requirements)
            .await
            .unwrap();

        assert_eq!(result.coverage.len(), 2);
        let login = &result.coverage[0];
        assert!(login.is_covered);
        assert_eq!(login.coverage_count, 1);
        assert_eq!(login.coverage_score, 0.5);
        assert!(login.has_gap);

        // Covered only through the declared index.
        let logout = &result.coverage[1];
        assert!(logout.is_covered);
        assert_eq!(logout.coverage_count, 1);

        assert_eq!(result.coverage_score, 1.0);
        assert!(result.gaps.is_empty());
    }

    #[tokio::test]
    async fn test_uncovered_requirement_produces_gap() {
        let request_id = Uuid::new_v4();
        let a = test_case(request_id, "test_a", "def test_a():\n    assert True\n");

        let requirements = vec!["payment flow".to_string()];
        let result = optimizer(0.85)
            .optimize(vec![a], &requirements)
            .await
            .unwrap();

        let row = &result.coverage[0];
        assert!(!row.is_covered);
        assert_eq!(row.coverage_count, 0);
        assert!(row.has_gap);
        assert!(row.gap_description.as_ref().unwrap().contains("payment flow"));
        assert_eq!(result.coverage_score, 0.0);
        assert_eq!(result.gaps.len(), 1);
    }

    #[tokio::test]
    async fn test_empty_requirements_give_no_rows() {
        let request_id = Uuid::new_v4();
        let a = test_case(request_id, "test_a", "def test_a():\n    assert True\n");
        let result = optimizer(0.85).optimize(vec![a], &[]).await.unwrap();
        assert!(result.coverage.is_empty());
        assert_eq!(result.coverage_score, 0.0);
    }

    #[tokio::test]
    async fn test_duplicates_excluded_from_coverage() {
        let request_id = Uuid::new_v4();
        let a = test_case(request_id, "test_a", "def test_a():\n    # login works\n    pass\n");
        let a2 = test_case(request_id, "test_a", "def test_a():\n    # login works\n    pass\n");
        let a_id = a.id;

        let requirements = vec!["login works".to_string()];
        let result = optimizer(0.85)
            .optimize(vec![a, a2], &requirements)
            .await
            .unwrap();

        let row = &result.coverage[0];
        assert_eq!(row.coverage_count, 1);
        assert_eq!(row.covering_tests, vec![a_id]);
    }

    #[tokio::test]
    async fn test_dedup_idempotence() {
        let request_id = Uuid::new_v4();
        let mut a = test_case(request_id, "test_a", "def test_a():\n    assert 1\n");
        let mut b = test_case(request_id, "test_b", "def test_b():\n    assert 2\n");
        let mut c = test_case(request_id, "test_c", "def test_c():\n    assert 3\n");
        a.semantic_embedding = Some(axis_embedding([1.0, 0.0]));
        b.semantic_embedding = Some(axis_embedding([0.0, 1.0]));
        c.semantic_embedding = Some(axis_embedding([1.0, 1.0]));

        let requirements = vec!["assert".to_string()];
        let agent = optimizer(0.7);
        let first = agent
            .optimize(vec![a, b, c], &requirements)
            .await
            .unwrap();

        let kept: Vec<TestCase> = first
            .unique_tests()
            .into_iter()
            .cloned()
            .collect();
        let kept_ids: Vec<Uuid> = kept.iter().map(|t| t.id).collect();

        let second = agent.optimize(kept, &requirements).await.unwrap();
        assert_eq!(second.duplicate_count, 0);
        let second_ids: Vec<Uuid> = second.unique_tests().iter().map(|t| t.id).collect();
        assert_eq!(second_ids, kept_ids);
    }

    #[tokio::test]
    async fn test_insertion_order_preserved() {
        let request_id = Uuid::new_v4();
        let tests: Vec<TestCase> = (0..5)
            .map(|i| {
                let mut t = test_case(
                    request_id,
                    &format!("test_{i}"),
                    &format!("def test_{i}():\n    assert {i}\n"),
                );
                let mut v = vec![0.0_f32; 384];
                v[i] = 1.0;
                t.semantic_embedding = Some(v);
                t
            })
            .collect();
        let names: Vec<String> = tests.iter().map(|t| t.name.clone()).collect();

        let result = optimizer(0.85).optimize(tests, &[]).await.unwrap();
        let out_names: Vec<String> = result.tests.iter().map(|t| t.name.clone()).collect();
        assert_eq!(out_names, names);
    }
}
