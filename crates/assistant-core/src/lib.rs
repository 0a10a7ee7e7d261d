//! Prompt orchestration and API communication for a screen-watching study
//! assistant. The embedding UI supplies frames (base64 JPEG or data URIs)
//! and chat input; this crate renders prompts, talks to the Gemini API
//! directly or through a trusted proxy, retries transient failures and
//! keeps the conversation state.

pub mod config;
pub mod conversation;
pub mod dedup;
pub mod error;
pub mod gateway;
pub mod logging;
pub mod orchestrator;
pub mod template;

pub use config::Config;
pub use conversation::{ConversationStore, ConversationTurn, Role};
pub use dedup::FrameDeduplicator;
pub use error::Error;
pub use gateway::{Backend, CallOptions, ImagePayload, ModelGateway, Transport};
pub use logging::SessionLog;
pub use orchestrator::{AnalysisOrchestrator, AnalysisTrigger};
pub use template::{PromptTemplate, PromptVars, SubjectMode, SKIP_MARKER};
