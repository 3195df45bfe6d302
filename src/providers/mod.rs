//! 协作者层：外部能力的接口抽象与 Mock 实现

pub mod mock;
pub mod traits;

pub use mock::{MockClarifier, MockKnowledge, MockPerception, MockReasoning, MockReviewer};
pub use traits::{
    Analysis, Candidate, ClarificationChannel, KnowledgeLookup, PerceptionProvider,
    PolicyReviewer, ReasoningProvider, Verdict,
};
