//! 管线集成测试：端到端场景与并发运行

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use wasp::config::AppConfig;
use wasp::core::{CorrectionOutcome, PipelineBuilder};
use wasp::providers::{
    MockClarifier, MockKnowledge, MockPerception, MockReasoning, MockReviewer,
};
use wasp::Stage;

fn test_config() -> AppConfig {
    let mut cfg = AppConfig::default();
    cfg.pipeline.max_retries = 3;
    cfg.pipeline.max_clarifications = 2;
    cfg.pipeline.clarification_timeout_secs = 1;
    cfg.pipeline.result_wait_timeout_secs = 5;
    cfg.dispatcher.queue_capacity = 16;
    cfg.dispatcher.worker_count = 2;
    cfg.dispatcher.drain_timeout_secs = 1;
    cfg
}

#[tokio::test]
async fn test_end_to_end_success() {
    wasp::observability::init();

    let pipeline = PipelineBuilder::new(test_config())
        .with_perception(Arc::new(MockPerception::new()))
        .with_reasoning(Arc::new(MockReasoning::new().with_confidence(0.9)))
        .with_knowledge(Arc::new(MockKnowledge::new()))
        .with_reviewer(Arc::new(MockReviewer::new()))
        .with_clarifier(Arc::new(MockClarifier::empty()))
        .build()
        .unwrap();

    let done = pipeline
        .run("conv_1", "summarize the report", &CancellationToken::new())
        .await;

    assert_eq!(done.stage, Stage::Complete);
    assert_eq!(done.retry_count, 0);
    assert_eq!(done.final_output, done.candidate_output);
    assert!(done.history.iter().any(|h| h.stage == Stage::Perceiving));
    assert!(done.history.iter().any(|h| h.stage == Stage::PolicyReview));
    assert!(pipeline.stats().completed >= 2);

    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_knowledge_snippets_reach_reasoning() {
    use wasp::providers::Analysis;

    // 感知给出检索键，推理的默认输出会标注用到的片段数
    let perception = MockPerception::with_script(vec![Ok(Analysis {
        summary: "needs background".to_string(),
        knowledge_keys: vec!["topic_a".to_string(), "topic_b".to_string()],
    })]);
    let knowledge = Arc::new(MockKnowledge::with_snippets(vec![
        "snippet one".to_string(),
        "snippet two".to_string(),
    ]));

    let pipeline = PipelineBuilder::new(test_config())
        .with_perception(Arc::new(perception))
        .with_reasoning(Arc::new(MockReasoning::new().with_confidence(0.9)))
        .with_knowledge(Arc::clone(&knowledge) as Arc<dyn wasp::providers::KnowledgeLookup>)
        .with_reviewer(Arc::new(MockReviewer::new()))
        .with_clarifier(Arc::new(MockClarifier::empty()))
        .build()
        .unwrap();

    let done = pipeline
        .run("conv_1", "explain", &CancellationToken::new())
        .await;

    assert_eq!(done.stage, Stage::Complete);
    assert_eq!(knowledge.calls(), 1);
    assert!(done.final_output.unwrap().contains("2 snippets"));

    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_policy_rejection_learning_loop() {
    let reviewer = Arc::new(MockReviewer::with_script(vec![
        MockReviewer::reject("citation_missing"),
        MockReviewer::reject("citation_missing"),
    ]));

    let pipeline = PipelineBuilder::new(test_config())
        .with_perception(Arc::new(MockPerception::new()))
        .with_reasoning(Arc::new(MockReasoning::new().with_confidence(0.9)))
        .with_knowledge(Arc::new(MockKnowledge::new()))
        .with_reviewer(Arc::clone(&reviewer) as Arc<dyn wasp::providers::PolicyReviewer>)
        .with_clarifier(Arc::new(MockClarifier::empty()))
        .build()
        .unwrap();

    let done = pipeline
        .run("conv_1", "write the summary", &CancellationToken::new())
        .await;

    assert_eq!(done.stage, Stage::Complete);
    assert_eq!(done.retry_count, 2);

    // 否决经历沉淀进纠错记忆，最终接受使同类查询优先命中成功策略
    let corrections = pipeline.corrections();
    assert!(corrections.count_for("policy_rejection:citation_missing") >= 2);
    let best = corrections.lookup("policy_rejection:citation_missing").unwrap();
    assert_eq!(best.outcome, CorrectionOutcome::Success);

    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_always_failing_collaborator_halts_with_fallback() {
    let mut cfg = test_config();
    cfg.pipeline.max_retries = 2;
    cfg.pipeline.fallback_output = "we could not process this request".to_string();

    let pipeline = PipelineBuilder::new(cfg)
        .with_perception(Arc::new(MockPerception::failing("upstream unavailable")))
        .with_reasoning(Arc::new(MockReasoning::new()))
        .with_knowledge(Arc::new(MockKnowledge::new()))
        .with_reviewer(Arc::new(MockReviewer::new()))
        .with_clarifier(Arc::new(MockClarifier::empty()))
        .build()
        .unwrap();

    let done = pipeline
        .run("conv_1", "anything", &CancellationToken::new())
        .await;

    assert_eq!(done.stage, Stage::Halted);
    assert_eq!(done.retry_count, 2);
    assert_eq!(
        done.final_output.as_deref(),
        Some("we could not process this request")
    );
    assert!(!done.anomalies.is_empty());

    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_clarification_dialog_end_to_end() {
    use wasp::providers::Candidate;

    let reasoning = MockReasoning::with_script(vec![Ok(Candidate {
        output: "ambiguous draft".to_string(),
        confidence: 0.9,
        ambiguous: true,
        clarification_question: Some("Monthly or quarterly report?".to_string()),
    })]);
    let clarifier = Arc::new(MockClarifier::with_answer("the quarterly one"));

    let pipeline = PipelineBuilder::new(test_config())
        .with_perception(Arc::new(MockPerception::new()))
        .with_reasoning(Arc::new(reasoning))
        .with_knowledge(Arc::new(MockKnowledge::new()))
        .with_reviewer(Arc::new(MockReviewer::new()))
        .with_clarifier(Arc::clone(&clarifier) as Arc<dyn wasp::providers::ClarificationChannel>)
        .build()
        .unwrap();

    let done = pipeline
        .run("conv_1", "prepare the report", &CancellationToken::new())
        .await;

    assert_eq!(done.stage, Stage::Complete);
    assert_eq!(clarifier.calls(), 1);
    assert_eq!(done.clarification_attempts, 1);
    assert_eq!(done.clarifications, vec!["the quarterly one".to_string()]);

    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_runs_share_one_dispatcher() {
    let pipeline = Arc::new(
        PipelineBuilder::new(test_config())
            .with_perception(Arc::new(MockPerception::new()))
            .with_reasoning(Arc::new(MockReasoning::new().with_confidence(0.9)))
            .with_knowledge(Arc::new(MockKnowledge::new()))
            .with_reviewer(Arc::new(MockReviewer::new()))
            .with_clarifier(Arc::new(MockClarifier::empty()))
            .build()
            .unwrap(),
    );

    let mut handles = Vec::new();
    for i in 0..6 {
        let pipeline = Arc::clone(&pipeline);
        handles.push(tokio::spawn(async move {
            pipeline
                .run(
                    &format!("conv_{}", i),
                    &format!("request {}", i),
                    &CancellationToken::new(),
                )
                .await
        }));
    }

    for handle in handles {
        let done = handle.await.unwrap();
        assert_eq!(done.stage, Stage::Complete);
    }

    // 每个请求至少一个感知任务 + 一个推理任务
    assert!(pipeline.stats().completed >= 12);
    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_rejects_new_work() {
    let pipeline = PipelineBuilder::new(test_config())
        .with_perception(Arc::new(MockPerception::new()))
        .with_reasoning(Arc::new(MockReasoning::new()))
        .with_knowledge(Arc::new(MockKnowledge::new()))
        .with_reviewer(Arc::new(MockReviewer::new()))
        .with_clarifier(Arc::new(MockClarifier::empty()))
        .build()
        .unwrap();

    pipeline.shutdown().await;

    // 关闭后提交被拒绝，run 以 Halted 收束且仍带非空输出
    let done = pipeline
        .run("conv_late", "too late", &CancellationToken::new())
        .await;
    assert_eq!(done.stage, Stage::Halted);
    assert!(done.final_output.is_some());
}
