//! Step detection over the session output stream.
//!
//! The detector keeps a bounded window of ANSI-stripped output and, on every
//! chunk, classifies the shape of what the wizard is showing:
//! - completion markers and fatal error markers (scanned in new text)
//! - explicit yes/no prompts and numbered menus (scanned on the last line)
//! - otherwise free text when the output stops mid-line, else unknown
//!
//! Rules live in an ordered table of tagged patterns so new target CLIs can
//! be supported by adding rows rather than branches.

use crate::distributor::Utf8Stream;
use crate::redact::Redact;
use crate::serializer::current_timestamp_ms;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

static ANSI_PATTERN: OnceLock<Regex> = OnceLock::new();
static PARTIAL_ESCAPE: OnceLock<Regex> = OnceLock::new();
static OPTION_LINE: OnceLock<Regex> = OnceLock::new();
static BARE_PROMPT: OnceLock<Regex> = OnceLock::new();
static PROMPT_DEFAULT: OnceLock<Regex> = OnceLock::new();
static YES_NO_DEFAULT: OnceLock<Regex> = OnceLock::new();

fn ansi_pattern() -> &'static Regex {
    ANSI_PATTERN.get_or_init(|| {
        Regex::new(r"\x1B\[[0-9;?]*[A-Za-z]|\x1B\][^\x07\x1B]*(?:\x07|\x1B\\)|\x1B[()][A-Z0-9]|\x1B[=>]")
            .expect("valid ansi pattern")
    })
}

/// An escape sequence cut off by the end of a chunk
fn partial_escape() -> &'static Regex {
    PARTIAL_ESCAPE.get_or_init(|| {
        Regex::new(r"\x1B(?:\[[0-9;?]*|\][^\x07\x1B]*|[()])?$").expect("valid partial escape pattern")
    })
}

/// Longest unfinished escape sequence held for the next chunk
const MAX_ESCAPE_CARRY: usize = 256;

/// `1) Create project`, `[2] Reuse`, `3. Skip`
fn option_line() -> &'static Regex {
    OPTION_LINE.get_or_init(|| {
        Regex::new(r"^\s*\[?(\d{1,3})[\)\].:]\s+(\S.*?)\s*$").expect("valid option pattern")
    })
}

/// A line that asks for a menu selection: `#?`, `Select a region:`, `Choice [1]:`
fn bare_prompt() -> &'static Regex {
    BARE_PROMPT.get_or_init(|| Regex::new(r"(^#\?$|[:?>]$|\]\s*:?$)").expect("valid prompt pattern"))
}

fn prompt_default() -> &'static Regex {
    PROMPT_DEFAULT.get_or_init(|| {
        Regex::new(r"(?i)\[(?:default[:=]?\s*)?(\d+)\]|\(default[:=]?\s*(\d+)\)|default(?: is)?[:=]?\s+(\d+)")
            .expect("valid default pattern")
    })
}

fn yes_no_default() -> &'static Regex {
    YES_NO_DEFAULT.get_or_init(|| {
        Regex::new(r"(?i)default[:=]?\s*(?:is\s+)?(y(?:es)?|n(?:o)?)\b").expect("valid default pattern")
    })
}

/// Strip ANSI escape sequences from text
pub fn strip_ansi(text: &str) -> String {
    ansi_pattern().replace_all(text, "").to_string()
}

/// Strip escapes, fold carriage returns into newlines, drop other controls
fn normalize(text: &str) -> String {
    strip_ansi(text)
        .replace("\r\n", "\n")
        .replace('\r', "\n")
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .collect()
}

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptKind {
    YesNo,
    NumericChoice,
    FreeText,
    Error,
    Completion,
    Unknown,
}

impl PromptKind {
    /// Prompts that name their accepted answers
    pub const fn is_explicit_prompt(&self) -> bool {
        matches!(self, Self::YesNo | Self::NumericChoice)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

/// Session phase as seen by the detector and reported by `state()`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Idle,
    Running,
    WaitingForInput,
    Completed,
    Failed,
}

impl Phase {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::WaitingForInput => "waiting_for_input",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Whether a session in this phase accepts input
    pub const fn accepts_input(&self) -> bool {
        matches!(self, Self::Running | Self::WaitingForInput)
    }
}

/// One entry of a numbered menu
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChoiceOption {
    pub key: String,
    pub label: String,
    pub is_default: bool,
}

/// Classification of the current trailing output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptSignature {
    /// Matched text, trimmed
    pub raw: String,
    pub kind: PromptKind,
    /// Accepted answers in display order (`["y", "N"]`, `["1", "2", "3"]`)
    pub choices: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<ChoiceOption>,
    /// Default answer when the prompt indicates exactly one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_choice: Option<String>,
    pub confidence: Confidence,
}

impl PromptSignature {
    fn bare(kind: PromptKind, raw: impl Into<String>, confidence: Confidence) -> Self {
        Self {
            raw: raw.into(),
            kind,
            choices: Vec::new(),
            options: Vec::new(),
            default_choice: None,
            confidence,
        }
    }
}

/// State reported to tools, the UI and the autopilot
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub phase: Phase,
    pub waiting_for_input: bool,
    pub prompt: String,
    pub choices: Vec<String>,
    pub completed: bool,
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<PromptKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_choice: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<Confidence>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<ChoiceOption>,
}

/// Emitted whenever the snapshot changes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateEvent {
    pub seq: u64,
    pub timestamp: u64,
    #[serde(flatten)]
    pub state: StateSnapshot,
}

// ============================================================================
// Rule table
// ============================================================================

/// Which text a rule is matched against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleScope {
    /// Lines that arrived with the latest chunk
    NewText,
    /// The last non-blank line of the window
    LastLine,
}

pub struct Rule {
    pub kind: PromptKind,
    pub scope: RuleScope,
    pub pattern: Regex,
}

/// Extra patterns supplied by configuration, per rule class
#[derive(Debug, Clone, Default)]
pub struct CustomPatterns {
    pub completion: Vec<String>,
    pub error: Vec<String>,
    pub prompt: Vec<String>,
}

pub struct RuleTable {
    rules: Vec<Rule>,
}

impl RuleTable {
    /// Built-in rules, with custom patterns ahead of the defaults of their class
    pub fn new(custom: &CustomPatterns) -> Self {
        let mut rules = Vec::new();

        let mut push = |kind, scope, pattern: &str| match Regex::new(pattern) {
            Ok(re) => rules.push(Rule {
                kind,
                scope,
                pattern: re,
            }),
            Err(e) => warn!("Ignoring invalid {:?} pattern {:?}: {}", kind, pattern, e),
        };

        for p in &custom.completion {
            push(PromptKind::Completion, RuleScope::NewText, p);
        }
        for p in [
            r"(?im)^.*\bdeployment (?:is )?(?:complete|completed|succeeded|successful)\b.*$",
            r"(?im)^.*\bsuccessfully deployed\b.*$",
            r"(?im)^.*\bcompleted successfully\b.*$",
            r"(?im)^.*\ball done\b.*$",
            r"(?m)^.*✅.*$",
        ] {
            push(PromptKind::Completion, RuleScope::NewText, p);
        }

        for p in &custom.error {
            push(PromptKind::Error, RuleScope::NewText, p);
        }
        for p in [
            r"(?im)^\s*(?:error|fatal)\b.*$",
            r"(?m)^.*\bFAILED\b.*$",
            r"(?im)^.*\bcommand not found\b.*$",
            r"(?im)^.*\bpermission denied\b.*$",
            r"(?m)^Traceback \(most recent call last\).*$",
        ] {
            push(PromptKind::Error, RuleScope::NewText, p);
        }

        for p in &custom.prompt {
            push(PromptKind::FreeText, RuleScope::LastLine, p);
        }
        push(
            PromptKind::YesNo,
            RuleScope::LastLine,
            r"(?i)[\[(]\s*(y(?:es)?|n(?:o)?)\s*/\s*(y(?:es)?|n(?:o)?)\s*[\])]",
        );

        Self { rules }
    }

    fn of(&self, kind: PromptKind, scope: RuleScope) -> impl Iterator<Item = &Rule> {
        self.rules
            .iter()
            .filter(move |r| r.kind == kind && r.scope == scope)
    }
}

// ============================================================================
// Detector
// ============================================================================

/// Detector settings
#[derive(Debug, Clone)]
pub struct DetectorConfig {
    /// Characters of trailing output considered for classification
    pub window_chars: usize,
    pub custom: CustomPatterns,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            window_chars: 4000,
            custom: CustomPatterns::default(),
        }
    }
}

pub struct StepDetector {
    rules: RuleTable,
    window_chars: usize,
    /// Normalized trailing output
    window: String,
    /// Output after the last newline, carried into the next scan
    pending_line: String,
    decoder: Utf8Stream,
    /// Start of an escape sequence whose tail has not arrived yet
    escape_carry: String,
    signature: Option<PromptSignature>,
    last_error: Option<String>,
    completed: bool,
    current: StateSnapshot,
    redactor: Arc<dyn Redact>,
}

impl StepDetector {
    pub fn new(config: &DetectorConfig, redactor: Arc<dyn Redact>) -> Self {
        Self {
            rules: RuleTable::new(&config.custom),
            window_chars: config.window_chars.max(256),
            window: String::new(),
            pending_line: String::new(),
            decoder: Utf8Stream::new(),
            escape_carry: String::new(),
            signature: None,
            last_error: None,
            completed: false,
            current: StateSnapshot::default(),
            redactor,
        }
    }

    /// Current snapshot
    pub fn snapshot(&self) -> &StateSnapshot {
        &self.current
    }

    /// Latest prompt signature
    pub fn signature(&self) -> Option<&PromptSignature> {
        self.signature.as_ref()
    }

    /// Normalized window contents
    pub fn window(&self) -> &str {
        &self.window
    }

    /// Forget everything and report `phase` (session start or stop)
    pub fn reset(&mut self, phase: Phase) -> Option<StateSnapshot> {
        self.window.clear();
        self.pending_line.clear();
        self.decoder.reset();
        self.escape_carry.clear();
        self.signature = None;
        self.last_error = None;
        self.completed = false;
        self.commit(StateSnapshot {
            phase,
            ..StateSnapshot::default()
        })
    }

    /// The child exited on its own
    pub fn session_ended(&mut self, exit_code: i32) -> Option<StateSnapshot> {
        let mut state = StateSnapshot {
            completed: exit_code == 0,
            ..StateSnapshot::default()
        };
        if exit_code == 0 {
            state.phase = Phase::Completed;
            state.last_error = self.last_error.clone();
        } else {
            state.phase = Phase::Failed;
            state.last_error = Some(
                self.last_error
                    .clone()
                    .unwrap_or_else(|| format!("process exited with status {exit_code}")),
            );
        }
        self.commit(state)
    }

    /// Input was written to the session: whatever prompt was showing has been
    /// answered. Errors stay sticky; a stale completion does not.
    ///
    /// The open prompt line is closed so its echoed answer reads as output.
    pub fn input_sent(&mut self) -> Option<StateSnapshot> {
        if !self.window.is_empty() && !self.window.ends_with('\n') {
            self.window.push('\n');
        }
        self.pending_line.clear();
        self.signature = None;
        self.completed = false;
        let state = self.derive_state();
        self.commit(state)
    }

    /// Feed one output chunk. Returns the new snapshot if it changed.
    pub fn ingest(&mut self, chunk: &[u8]) -> Option<StateSnapshot> {
        let text = self.decoder.decode(chunk);
        let text = self.hold_partial_escape(text);
        let clean = normalize(&text);
        if clean.is_empty() {
            return None;
        }

        self.window.push_str(&clean);
        self.truncate_window();

        let mut scan = std::mem::take(&mut self.pending_line);
        scan.push_str(&clean);
        self.pending_line = match scan.rfind('\n') {
            Some(pos) => scan[pos + 1..].to_string(),
            None => scan.clone(),
        };

        if let Some(line) = self.last_match(PromptKind::Completion, &scan) {
            info!("Completion marker detected");
            self.completed = true;
            self.last_error = None;
            self.signature = Some(PromptSignature::bare(
                PromptKind::Completion,
                line,
                Confidence::High,
            ));
        } else if let Some(line) = self.last_match(PromptKind::Error, &scan) {
            let line = self.redactor.redact(&line);
            warn!("Error marker detected: {}", line);
            self.completed = false;
            self.last_error = Some(line.clone());
            self.signature = Some(PromptSignature::bare(PromptKind::Error, line, Confidence::High));
        } else {
            let signature = self.classify_window();
            if self.last_error.is_some() && signature.kind.is_explicit_prompt() {
                debug!("Explicit prompt after error, clearing error state");
                self.last_error = None;
            }
            self.signature = Some(signature);
        }

        let state = self.derive_state();
        self.commit(state)
    }

    /// Prepend the carried escape prefix and hold back a new unfinished one
    fn hold_partial_escape(&mut self, text: String) -> String {
        let mut text = std::mem::take(&mut self.escape_carry) + &text;
        if let Some(start) = partial_escape().find(&text).map(|m| m.start()) {
            if text.len() - start <= MAX_ESCAPE_CARRY {
                self.escape_carry = text.split_off(start);
            }
        }
        text
    }

    fn commit(&mut self, state: StateSnapshot) -> Option<StateSnapshot> {
        if state == self.current {
            return None;
        }
        self.current = state.clone();
        Some(state)
    }

    fn derive_state(&self) -> StateSnapshot {
        let mut state = StateSnapshot {
            completed: self.completed,
            last_error: self.last_error.clone(),
            ..StateSnapshot::default()
        };

        if self.last_error.is_some() {
            state.phase = Phase::Failed;
            state.kind = Some(PromptKind::Error);
            return state;
        }
        if self.completed {
            state.phase = Phase::Completed;
            state.kind = Some(PromptKind::Completion);
            return state;
        }

        match &self.signature {
            Some(sig)
                if matches!(
                    sig.kind,
                    PromptKind::YesNo | PromptKind::NumericChoice | PromptKind::FreeText
                ) =>
            {
                state.phase = Phase::WaitingForInput;
                state.waiting_for_input = true;
                state.prompt = self.redactor.redact(&sig.raw);
                state.choices = sig.choices.clone();
                state.options = sig.options.clone();
                state.default_choice = sig.default_choice.clone();
                state.kind = Some(sig.kind);
                state.confidence = Some(sig.confidence);
            }
            _ => {
                state.phase = Phase::Running;
                state.kind = Some(PromptKind::Unknown);
            }
        }
        state
    }

    /// Last line in `text` matched by any rule of `kind`
    fn last_match(&self, kind: PromptKind, text: &str) -> Option<String> {
        let mut best: Option<(usize, String)> = None;
        for rule in self.rules.of(kind, RuleScope::NewText) {
            if let Some(m) = rule.pattern.find_iter(text).last() {
                if best.as_ref().map_or(true, |(start, _)| m.start() > *start) {
                    best = Some((m.start(), m.as_str().trim().to_string()));
                }
            }
        }
        best.map(|(_, line)| line)
    }

    fn classify_window(&self) -> PromptSignature {
        let ends_mid_line = !self.window.ends_with('\n');
        let lines: Vec<&str> = self.window.lines().collect();
        let Some(last_idx) = lines.iter().rposition(|l| !l.trim().is_empty()) else {
            return PromptSignature::bare(PromptKind::Unknown, "", Confidence::Low);
        };
        let last = lines[last_idx].trim();
        // A terminated line is output, even when it quotes a prompt
        let prompt_open = ends_mid_line && last_idx + 1 == lines.len();

        if prompt_open {
            if let Some(sig) = self.match_yes_no(last) {
                return sig;
            }
            if let Some(sig) = self.match_numeric(&lines, last_idx) {
                return sig;
            }
        }
        if self
            .rules
            .of(PromptKind::FreeText, RuleScope::LastLine)
            .any(|r| r.pattern.is_match(last))
        {
            return PromptSignature::bare(PromptKind::FreeText, last, Confidence::High);
        }

        // Output stopped mid-line: something is waiting for typed input
        if prompt_open {
            let confidence = if last.ends_with([':', '?', '>', '$', '#', '%']) {
                Confidence::Medium
            } else {
                Confidence::Low
            };
            return PromptSignature::bare(PromptKind::FreeText, last, confidence);
        }

        PromptSignature::bare(PromptKind::Unknown, last, Confidence::Low)
    }

    fn match_yes_no(&self, last: &str) -> Option<PromptSignature> {
        let caps = self
            .rules
            .of(PromptKind::YesNo, RuleScope::LastLine)
            .find_map(|r| r.pattern.captures(last))?;
        let first = caps.get(1)?.as_str().to_string();
        let second = caps.get(2)?.as_str().to_string();

        // The capitalised answer is the default; otherwise look for "default: y"
        let upper: Vec<&String> = [&first, &second]
            .into_iter()
            .filter(|c| c.chars().next().is_some_and(|ch| ch.is_ascii_uppercase()))
            .collect();
        let default_choice = if upper.len() == 1 {
            Some(upper[0].clone())
        } else {
            yes_no_default()
                .captures(last)
                .and_then(|c| c.get(1))
                .map(|m| m.as_str().to_string())
        };

        Some(PromptSignature {
            raw: last.to_string(),
            kind: PromptKind::YesNo,
            choices: vec![first, second],
            options: Vec::new(),
            default_choice,
            confidence: Confidence::High,
        })
    }

    fn match_numeric(&self, lines: &[&str], last_idx: usize) -> Option<PromptSignature> {
        let prompt = lines[last_idx].trim();
        if option_line().is_match(prompt) || !bare_prompt().is_match(prompt) {
            return None;
        }

        // Walk upwards over the option block directly above the prompt
        let mut options = Vec::new();
        for line in lines[..last_idx].iter().rev() {
            if line.trim().is_empty() {
                continue;
            }
            match option_line().captures(line) {
                Some(caps) => options.push(ChoiceOption {
                    key: caps[1].to_string(),
                    label: caps[2].to_string(),
                    is_default: caps[2].to_lowercase().contains("(default)"),
                }),
                None => break,
            }
        }
        if options.len() < 2 {
            return None;
        }
        options.reverse();

        let mut defaults: Vec<String> = options
            .iter()
            .filter(|o| o.is_default)
            .map(|o| o.key.clone())
            .collect();
        for caps in prompt_default().captures_iter(prompt) {
            if let Some(m) = caps.get(1).or_else(|| caps.get(2)).or_else(|| caps.get(3)) {
                defaults.push(m.as_str().to_string());
            }
        }
        defaults.sort();
        defaults.dedup();

        let default_choice = match defaults.as_slice() {
            [only] if options.iter().any(|o| &o.key == only) => Some(only.clone()),
            _ => None,
        };
        for option in &mut options {
            option.is_default = default_choice.as_deref() == Some(option.key.as_str());
        }

        Some(PromptSignature {
            raw: prompt.to_string(),
            kind: PromptKind::NumericChoice,
            choices: options.iter().map(|o| o.key.clone()).collect(),
            options,
            default_choice,
            confidence: Confidence::High,
        })
    }

    /// Keep the window bounded (on a char boundary)
    fn truncate_window(&mut self) {
        if self.window.len() > self.window_chars {
            let target_start = self.window.len() - self.window_chars;
            let start = self
                .window
                .char_indices()
                .map(|(i, _)| i)
                .find(|&i| i >= target_start)
                .unwrap_or(self.window.len());
            self.window = self.window[start..].to_string();
        }
    }
}

// ============================================================================
// State channel
// ============================================================================

/// Shared detector plus the broadcast of its events.
///
/// Subscribers get their own bounded receiver; a lagging subscriber loses
/// old events instead of slowing the detector down.
pub struct StateChannel {
    detector: Mutex<StepDetector>,
    tx: broadcast::Sender<StateEvent>,
    seq: AtomicU64,
    last: Mutex<StateEvent>,
}

impl StateChannel {
    pub fn new(detector: StepDetector, capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        let initial = StateEvent {
            seq: 0,
            timestamp: current_timestamp_ms(),
            state: detector.snapshot().clone(),
        };
        Self {
            detector: Mutex::new(detector),
            tx,
            seq: AtomicU64::new(0),
            last: Mutex::new(initial),
        }
    }

    fn detector(&self) -> MutexGuard<'_, StepDetector> {
        self.detector.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateEvent> {
        self.tx.subscribe()
    }

    /// Last emitted event
    pub fn current(&self) -> StateEvent {
        self.last.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Latest prompt signature
    pub fn signature(&self) -> Option<PromptSignature> {
        self.detector().signature().cloned()
    }

    pub fn ingest(&self, chunk: &[u8]) -> Option<StateEvent> {
        let changed = self.detector().ingest(chunk);
        changed.map(|state| self.publish(state))
    }

    pub fn input_sent(&self) -> Option<StateEvent> {
        let changed = self.detector().input_sent();
        changed.map(|state| self.publish(state))
    }

    pub fn session_started(&self) -> Option<StateEvent> {
        let changed = self.detector().reset(Phase::Running);
        changed.map(|state| self.publish(state))
    }

    pub fn session_stopped(&self) -> Option<StateEvent> {
        let changed = self.detector().reset(Phase::Idle);
        changed.map(|state| self.publish(state))
    }

    pub fn session_ended(&self, exit_code: i32) -> Option<StateEvent> {
        let changed = self.detector().session_ended(exit_code);
        changed.map(|state| self.publish(state))
    }

    fn publish(&self, state: StateSnapshot) -> StateEvent {
        let event = StateEvent {
            seq: self.seq.fetch_add(1, Ordering::SeqCst) + 1,
            timestamp: current_timestamp_ms(),
            state,
        };
        debug!(
            "State #{}: phase={} waiting={}",
            event.seq,
            event.state.phase.as_str(),
            event.state.waiting_for_input
        );
        *self.last.lock().unwrap_or_else(|e| e.into_inner()) = event.clone();
        // No receivers is fine
        let _ = self.tx.send(event.clone());
        event
    }
}
