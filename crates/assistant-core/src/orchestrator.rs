//! Top-level coordinator: wires templates, history, dedup and the gateway
//! together, and enforces the one-in-flight-call rule per session.

use parking_lot::Mutex;

use crate::config::Config;
use crate::conversation::{ConversationStore, ConversationTurn, HistoryListener, Role};
use crate::dedup::FrameDeduplicator;
use crate::error::Error;
use crate::gateway::{CallKind, CallOptions, ImagePayload, ModelGateway, RequestEnvelope};
use crate::logging::SessionLog;
use crate::template::{self, PromptTemplate, PromptVars, SubjectMode, SKIP_MARKER};

/// How many non-system turns feed the analyze prompt.
const ANALYZE_HISTORY_TURNS: usize = 5;
/// How many non-system turns feed the chat prompt.
const CHAT_HISTORY_TURNS: usize = 8;

/// Whether an analysis was requested by the periodic capture loop or by the
/// user pressing the Analyze button. Only the automatic path goes through
/// the duplicate-frame gate, and only it is silent on failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalysisTrigger {
    Automatic,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Analyzing,
    Chatting,
}

// Resets the phase to Idle when the owning call finishes, on any path out.
struct PhaseGuard<'a> {
    phase: &'a Mutex<Phase>,
}

impl Drop for PhaseGuard<'_> {
    fn drop(&mut self) {
        *self.phase.lock() = Phase::Idle;
    }
}

/// One assistant session. Owns the conversation state, the dedup
/// fingerprint and the gateway; at most one analyze or chat call is in
/// flight at a time, and a second caller gets [`Error::Busy`] instead of
/// queueing.
pub struct AnalysisOrchestrator {
    gateway: ModelGateway,
    store: ConversationStore,
    dedup: Mutex<FrameDeduplicator>,
    phase: Mutex<Phase>,
    template: PromptTemplate,
    session_log: Option<SessionLog>,
}

impl AnalysisOrchestrator {
    pub fn new(
        gateway: ModelGateway,
        template: PromptTemplate,
        session_log: Option<SessionLog>,
    ) -> Self {
        Self {
            gateway,
            store: ConversationStore::new(),
            dedup: Mutex::new(FrameDeduplicator::new()),
            phase: Mutex::new(Phase::Idle),
            template,
            session_log,
        }
    }

    /// Build a session from config: backend selection, retry policy and the
    /// default template, plus a transcript log when enabled.
    pub fn from_config(config: &Config) -> Self {
        let session_log = if config.logging.enabled {
            let dir = config.logging.directory.clone().unwrap_or_else(|| "logs".into());
            SessionLog::create(std::path::Path::new(&dir), None)
        } else {
            None
        };
        Self::new(
            ModelGateway::from_config(config),
            PromptTemplate::default(),
            session_log,
        )
    }

    /// Analyze the current frame. Returns `Ok(None)` when there is nothing
    /// new to show: a duplicate frame (automatic trigger only), an empty
    /// answer, or an answer carrying the skip marker.
    pub async fn analyze_frame(
        &self,
        frame: &str,
        subject: SubjectMode,
        custom_template: Option<&PromptTemplate>,
        trigger: AnalysisTrigger,
    ) -> Result<Option<String>, Error> {
        let _guard = {
            let mut phase = self.phase.lock();
            if *phase != Phase::Idle {
                return Err(Error::Busy);
            }
            // The explicit Analyze button always forces a call; only the
            // periodic path consults (and advances) the fingerprint.
            if trigger == AnalysisTrigger::Automatic && !self.dedup.lock().should_analyze(frame)
            {
                return Ok(None);
            }
            *phase = Phase::Analyzing;
            PhaseGuard { phase: &self.phase }
        };

        let template = custom_template.unwrap_or(&self.template);
        let history = self.store.recent_history_text(ANALYZE_HISTORY_TURNS);
        let prompt = template::render(
            &template.analyze_template,
            &PromptVars {
                history: &history,
                subject_instruction: subject.instruction(),
                ..Default::default()
            },
        );

        let envelope = RequestEnvelope {
            prompt_text: prompt,
            image: Some(ImagePayload::from_frame(frame)),
            kind: CallKind::Analyze,
            subject: subject.id().to_string(),
            last_analysis: String::new(),
            history: self.store.wire_history(ANALYZE_HISTORY_TURNS),
        };
        let options = CallOptions {
            silent: trigger == AnalysisTrigger::Automatic,
        };

        let answer = self.gateway.call(&envelope, options).await?;

        match answer {
            Some(text) if !text.trim().is_empty() && !text.contains(SKIP_MARKER) => {
                self.store.set_last_analysis(&text);
                self.store.append(Role::Assistant, &text);
                if let Some(log) = &self.session_log {
                    log.log_exchange("(screen analysis)", &text);
                }
                Ok(Some(text))
            }
            _ => Ok(None),
        }
    }

    /// Send a chat message with optional frame context. The user turn is
    /// appended before the network call, so it survives failures.
    pub async fn send_chat_message(
        &self,
        text: &str,
        frame: Option<&str>,
        subject: SubjectMode,
        custom_template: Option<&PromptTemplate>,
    ) -> Result<Option<String>, Error> {
        let _guard = {
            let mut phase = self.phase.lock();
            if *phase != Phase::Idle {
                return Err(Error::Busy);
            }
            *phase = Phase::Chatting;
            PhaseGuard { phase: &self.phase }
        };

        self.store.append(Role::User, text);

        let template = custom_template.unwrap_or(&self.template);
        let history = self.store.recent_history_text(CHAT_HISTORY_TURNS);
        let last_analysis = self.store.last_analysis();
        let prompt = template::render(
            &template.chat_template,
            &PromptVars {
                history: &history,
                subject_instruction: subject.instruction(),
                last_analysis: &last_analysis,
                user_message: text,
            },
        );

        let envelope = RequestEnvelope {
            prompt_text: prompt,
            image: frame.map(ImagePayload::from_frame),
            kind: CallKind::Chat {
                message: text.to_string(),
            },
            subject: subject.id().to_string(),
            last_analysis,
            history: self.store.wire_history(CHAT_HISTORY_TURNS),
        };

        let answer = self.gateway.call(&envelope, CallOptions::default()).await?;

        if let Some(answer_text) = &answer {
            self.store.append(Role::Assistant, answer_text);
            if let Some(log) = &self.session_log {
                log.log_exchange(text, answer_text);
            }
        }
        Ok(answer)
    }

    /// Reset the conversation and the dedup fingerprint. Rejected while a
    /// call is in flight.
    pub fn clear_conversation(&self) -> Result<(), Error> {
        {
            let phase = self.phase.lock();
            if *phase != Phase::Idle {
                return Err(Error::Busy);
            }
        }
        self.store.clear();
        self.dedup.lock().reset();
        Ok(())
    }

    /// Add a UI-only notice to the history. Never sent upstream.
    pub fn add_notice(&self, text: &str) {
        self.store.append(Role::System, text);
    }

    pub fn history(&self) -> Vec<ConversationTurn> {
        self.store.history()
    }

    pub fn last_analysis(&self) -> String {
        self.store.last_analysis()
    }

    /// Register a listener invoked with the full history after every append
    /// and clear (live UI sync).
    pub fn subscribe(&self, listener: HistoryListener) {
        self.store.subscribe(listener);
    }
}
