//! Prompt templates and the placeholder substitution engine.
//!
//! Templates are plain strings with `{HISTORY}`, `{SUBJECT_INSTRUCTION}`,
//! `{LAST_ANALYSIS}` and `{USER_MESSAGE}` placeholders. Rendering is a pure
//! single pass; unrecognized placeholders pass through untouched.

/// Reserved token an automatic analysis answer uses to signal "nothing new
/// to report". The orchestrator suppresses answers containing it.
pub const SKIP_MARKER: &str = "[WAITING]";

/// Substituted for `{LAST_ANALYSIS}` when no analysis has happened yet.
pub const NO_ANALYSIS_TEXT: &str = "No recent analysis available.";

const PLACEHOLDERS: [&str; 4] = [
    "{HISTORY}",
    "{SUBJECT_INSTRUCTION}",
    "{LAST_ANALYSIS}",
    "{USER_MESSAGE}",
];

/// Variable bag for [`render`]. Empty string means "absent" -- the engine
/// applies the documented default for each placeholder.
#[derive(Default, Clone, Copy)]
pub struct PromptVars<'a> {
    pub history: &'a str,
    pub subject_instruction: &'a str,
    pub last_analysis: &'a str,
    pub user_message: &'a str,
}

/// Render `template`, replacing each recognized placeholder exactly once per
/// occurrence. Substituted text is never rescanned, so values containing
/// placeholder-like text are inserted verbatim.
///
/// Defaults: `{HISTORY}` and `{SUBJECT_INSTRUCTION}` become empty when the
/// variable is empty; a non-empty subject instruction is wrapped in a header
/// block; `{LAST_ANALYSIS}` falls back to [`NO_ANALYSIS_TEXT`];
/// `{USER_MESSAGE}` is substituted verbatim and left as-is when absent,
/// which signals a caller bug without failing the render.
pub fn render(template: &str, vars: &PromptVars<'_>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let tail = &rest[open..];

        match PLACEHOLDERS.iter().find(|p| tail.starts_with(**p)) {
            Some(placeholder) => {
                match substitution(placeholder, vars) {
                    Some(value) => out.push_str(&value),
                    // Absent USER_MESSAGE: leave the placeholder in place.
                    None => out.push_str(placeholder),
                }
                rest = &tail[placeholder.len()..];
            }
            None => {
                out.push('{');
                rest = &tail[1..];
            }
        }
    }

    out.push_str(rest);
    out
}

fn substitution(placeholder: &str, vars: &PromptVars<'_>) -> Option<String> {
    match placeholder {
        "{HISTORY}" => Some(vars.history.to_string()),
        "{SUBJECT_INSTRUCTION}" => {
            if vars.subject_instruction.is_empty() {
                Some(String::new())
            } else {
                Some(format!(
                    "=== SUBJECT INSTRUCTION ===\n{}",
                    vars.subject_instruction
                ))
            }
        }
        "{LAST_ANALYSIS}" => {
            if vars.last_analysis.is_empty() {
                Some(NO_ANALYSIS_TEXT.to_string())
            } else {
                Some(vars.last_analysis.to_string())
            }
        }
        "{USER_MESSAGE}" => {
            if vars.user_message.is_empty() {
                None
            } else {
                Some(vars.user_message.to_string())
            }
        }
        _ => unreachable!("unknown placeholder {placeholder}"),
    }
}

/// Which instruction block gets substituted into prompts. `Auto` injects
/// nothing and lets the model decide the subject on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SubjectMode {
    #[default]
    Auto,
    Math,
    Portuguese,
    English,
    Logic,
}

impl SubjectMode {
    /// Wire name sent to the proxy backend.
    pub fn id(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Math => "math",
            Self::Portuguese => "portuguese",
            Self::English => "english",
            Self::Logic => "logic",
        }
    }

    /// Instruction text substituted for `{SUBJECT_INSTRUCTION}`.
    pub fn instruction(self) -> &'static str {
        match self {
            Self::Auto => "",
            Self::Math => {
                "Focus on MATH. Show the calculation step by step and verify \
                 the result by substituting values back. Watch the units."
            }
            Self::Portuguese => {
                "Focus on PORTUGUESE. Cite the applicable grammar rule and \
                 pay attention to agreement and regency."
            }
            Self::English => {
                "Focus on ENGLISH. Translate the important terms and \
                 identify the verb tenses correctly."
            }
            Self::Logic => {
                "Focus on LOGICAL REASONING. Explain the pattern you found \
                 and eliminate the incorrect alternatives one by one."
            }
        }
    }
}

impl std::fmt::Display for SubjectMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Auto => write!(f, "Auto"),
            Self::Math => write!(f, "Math"),
            Self::Portuguese => write!(f, "Portuguese"),
            Self::English => write!(f, "English"),
            Self::Logic => write!(f, "Logic"),
        }
    }
}

/// A pair of prompt templates selected together. Immutable once chosen for
/// a call.
#[derive(Debug, Clone)]
pub struct PromptTemplate {
    pub id: String,
    pub analyze_template: String,
    pub chat_template: String,
}

impl PromptTemplate {
    pub fn new(id: &str, analyze_template: &str, chat_template: &str) -> Self {
        Self {
            id: id.to_string(),
            analyze_template: analyze_template.to_string(),
            chat_template: chat_template.to_string(),
        }
    }

    /// The built-in template set. The first entry is the default.
    pub fn builtin() -> Vec<PromptTemplate> {
        vec![
            PromptTemplate::new(
                "study-assistant",
                STUDY_ANALYZE_TEMPLATE,
                STUDY_CHAT_TEMPLATE,
            ),
            PromptTemplate::new(
                "detailed-tutor",
                TUTOR_ANALYZE_TEMPLATE,
                TUTOR_CHAT_TEMPLATE,
            ),
            PromptTemplate::new(
                "quick-answer",
                QUICK_ANALYZE_TEMPLATE,
                QUICK_CHAT_TEMPLATE,
            ),
        ]
    }
}

impl Default for PromptTemplate {
    fn default() -> Self {
        PromptTemplate::new(
            "study-assistant",
            STUDY_ANALYZE_TEMPLATE,
            STUDY_CHAT_TEMPLATE,
        )
    }
}

const STUDY_ANALYZE_TEMPLATE: &str = "\
You are a HIGH-PRECISION STUDY ASSISTANT analyzing the user's screen.
{HISTORY}

{SUBJECT_INSTRUCTION}

=== INSTRUCTIONS ===

1. EXAMINE the screen image carefully
2. If a QUESTION/EXERCISE is visible:
   - Identify the type (Math, Portuguese, English, Logic)
   - Read ALL the alternatives
   - Think STEP BY STEP
   - Give the CORRECT answer

RESPONSE FORMAT:

\u{1F3AF} **TYPE:** [Subject identified]

\u{1F4CC} **CORRECT ANSWER:** [Letter/Answer]

\u{1F4DD} **EXPLANATION:**
[Clear reasoning]

\u{1F4A1} **TIP:** [Tip for similar questions]

=== IF THERE IS NO QUESTION ===
Reply only: [WAITING]

=== IMPORTANT ===
- Take the time you need to be PRECISE
- Never guess -- always justify your answer
- The user may ask FOLLOW-UP QUESTIONS about your analysis

ANALYZE NOW:";

const STUDY_CHAT_TEMPLATE: &str = "\
You are a helpful, knowledgeable STUDY ASSISTANT.

{SUBJECT_INSTRUCTION}

=== LAST SCREEN ANALYSIS ===
{LAST_ANALYSIS}

=== CONVERSATION HISTORY ===
{HISTORY}

=== CURRENT QUESTION ===
{USER_MESSAGE}

Use the context above to give a RELEVANT answer. If the user asks about the
previous analysis, use that context.

ANSWER:";

const TUTOR_ANALYZE_TEMPLATE: &str = "\
You are a DEDICATED TEACHER who explains everything in DETAIL.
{HISTORY}

{SUBJECT_INSTRUCTION}

You are analyzing the student's screen.

=== YOUR STYLE ===
- Explain STEP BY STEP as if the student had never seen the topic
- Give ADDITIONAL EXAMPLES
- Show DIFFERENT WAYS to solve when possible
- Include memorization tips

FORMAT:

\u{1F3AF} **SUBJECT:** [Type]

\u{1F4CC} **ANSWER:** [Letter/Answer]

\u{1F4D6} **DETAILED EXPLANATION:**
[Complete step-by-step reasoning]

\u{1F50D} **WHY THE OTHERS ARE WRONG:**
[Analysis of each incorrect alternative]

ANALYZE:";

const TUTOR_CHAT_TEMPLATE: &str = "\
You are a DEDICATED TEACHER. Explain with plenty of detail.

{SUBJECT_INSTRUCTION}

CONTEXT: {LAST_ANALYSIS}
HISTORY: {HISTORY}
QUESTION: {USER_MESSAGE}

Answer in a DETAILED and DIDACTIC way:";

const QUICK_ANALYZE_TEMPLATE: &str = "\
You are a FAST and DIRECT assistant.

{SUBJECT_INSTRUCTION}

ANALYZE THE SCREEN AND REPLY:

\u{1F4CC} **ANSWER:** [Letter]
\u{1F4DD} **Reason:** [1-2 sentences only]

Be CONCISE:";

const QUICK_CHAT_TEMPLATE: &str = "\
FAST and DIRECT answer.
{SUBJECT_INSTRUCTION}
Question: {USER_MESSAGE}
Context: {LAST_ANALYSIS}

Answer in at most 2-3 sentences:";
