//! Query-side modules: C9 classification, C10 retrieval orchestration, and
//! C11 scoring/fusion.

pub mod classifier;
pub mod fusion;
pub mod retrieval;

pub use classifier::{classify, Classification};
pub use retrieval::RetrievalOrchestrator;
