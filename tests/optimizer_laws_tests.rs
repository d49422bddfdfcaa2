//! Optimizer law and boundary tests
//!
//! Exercises the dedup fixed-point law, the duplicate-reference
//! invariant and the N=200 boundary against the deterministic
//! hash-derived embeddings.

use std::sync::Arc;

use testops_agents::OptimizerAgent;
use testops_core::llm::{FakeTransport, LlmClient, LlmSettings};
use testops_core::models::{CaseType, TestCase};
use uuid::Uuid;

fn optimizer() -> OptimizerAgent {
    let settings = LlmSettings {
        retry_base_delay_ms: 1,
        ..Default::default()
    };
    let llm = Arc::new(LlmClient::new(settings, Arc::new(FakeTransport::new())));
    OptimizerAgent::new(llm, 0.85, 8)
}

fn corpus(request_id: Uuid, count: usize) -> Vec<TestCase> {
    (0..count)
        .map(|i| {
            TestCase::new(
                request_id,
                format!("test_case_{i}"),
                format!(
                    "def test_case_{i}(page):\n    page.goto(\"/item/{i}\")\n    assert page.url.endswith(\"/{i}\")\n"
                ),
                CaseType::Automated,
            )
        })
        .collect()
}

#[tokio::test]
async fn test_duplicate_references_point_at_kept_tests() {
    let request_id = Uuid::new_v4();
    let result = optimizer()
        .optimize(corpus(request_id, 60), &[])
        .await
        .unwrap();

    assert_eq!(result.unique_count + result.duplicate_count, 60);
    for test in result.tests.iter().filter(|t| t.is_duplicate) {
        let canonical_id = test.duplicate_of.expect("duplicate without reference");
        let canonical = result
            .tests
            .iter()
            .find(|t| t.id == canonical_id)
            .expect("reference to unknown test");
        assert!(!canonical.is_duplicate);
        assert_eq!(canonical.request_id, test.request_id);
        assert!(test.similarity_score.unwrap() >= 0.85);
    }
}

#[tokio::test]
async fn test_dedup_is_a_fixed_point() {
    let request_id = Uuid::new_v4();
    let agent = optimizer();
    let requirements = vec!["item pages open".to_string()];

    let first = agent
        .optimize(corpus(request_id, 40), &requirements)
        .await
        .unwrap();

    let kept: Vec<TestCase> = first
        .tests
        .iter()
        .filter(|t| !t.is_duplicate)
        .cloned()
        .collect();
    let kept_ids: Vec<Uuid> = kept.iter().map(|t| t.id).collect();

    let second = agent.optimize(kept, &requirements).await.unwrap();

    assert_eq!(second.duplicate_count, 0);
    let second_ids: Vec<Uuid> = second
        .tests
        .iter()
        .filter(|t| !t.is_duplicate)
        .map(|t| t.id)
        .collect();
    assert_eq!(second_ids, kept_ids);
}

#[tokio::test]
async fn test_two_hundred_tests_complete_quickly() {
    let request_id = Uuid::new_v4();
    let requirements: Vec<String> = (0..10).map(|i| format!("requirement {i}")).collect();

    let started = std::time::Instant::now();
    let result = optimizer()
        .optimize(corpus(request_id, 200), &requirements)
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert_eq!(result.tests.len(), 200);
    assert_eq!(result.unique_count + result.duplicate_count, 200);
    assert_eq!(result.coverage.len(), 10);
    // Well inside the 60 s optimization stage deadline.
    assert!(elapsed.as_secs() < 60);
}

#[tokio::test]
async fn test_code_is_never_mutated() {
    let request_id = Uuid::new_v4();
    let tests = corpus(request_id, 20);
    let codes: Vec<String> = tests.iter().map(|t| t.code.clone()).collect();

    let result = optimizer().optimize(tests, &[]).await.unwrap();

    let after: Vec<String> = result.tests.iter().map(|t| t.code.clone()).collect();
    assert_eq!(codes, after);
}
