//! GDB Machine Interface (MI) Type Definitions

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// GDB/MI result class types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultClass {
    Done,
    Running,
    Connected,
    Error,
    Exit,
}

impl ResultClass {
    pub fn from_name(s: &str) -> Option<Self> {
        match s {
            "done" => Some(ResultClass::Done),
            "running" => Some(ResultClass::Running),
            "connected" => Some(ResultClass::Connected),
            "error" => Some(ResultClass::Error),
            "exit" => Some(ResultClass::Exit),
            _ => None,
        }
    }
}

/// Leading character of an MI output record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sigil {
    /// `^`
    Result,
    /// `*`
    Exec,
    /// `+`
    Status,
    /// `=`
    Notify,
    /// `~`
    Console,
    /// `@`
    Target,
    /// `&`
    Log,
}

impl Sigil {
    pub fn from_char(c: char) -> Option<Self> {
        match c {
            '^' => Some(Sigil::Result),
            '*' => Some(Sigil::Exec),
            '+' => Some(Sigil::Status),
            '=' => Some(Sigil::Notify),
            '~' => Some(Sigil::Console),
            '@' => Some(Sigil::Target),
            '&' => Some(Sigil::Log),
            _ => None,
        }
    }

    pub fn as_char(self) -> char {
        match self {
            Sigil::Result => '^',
            Sigil::Exec => '*',
            Sigil::Status => '+',
            Sigil::Notify => '=',
            Sigil::Console => '~',
            Sigil::Target => '@',
            Sigil::Log => '&',
        }
    }

    /// Records that may legitimately arrive without a token
    pub fn tokenless_ok(self) -> bool {
        !matches!(self, Sigil::Result)
    }

    pub fn is_stream(self) -> bool {
        matches!(self, Sigil::Console | Sigil::Target | Sigil::Log)
    }
}

/// Stop reason types
#[derive(Debug, Clone, PartialEq)]
pub enum StopReason {
    BreakpointHit,
    WatchpointTrigger,
    ReadWatchpointTrigger,
    AccessWatchpointTrigger,
    FunctionFinished,
    LocationReached,
    WatchpointScope,
    EndSteppingRange,
    ExitedSignalled,
    Exited,
    ExitedNormally,
    SignalReceived,
    Unknown(String),
}

impl From<&str> for StopReason {
    fn from(s: &str) -> Self {
        match s {
            "breakpoint-hit" => StopReason::BreakpointHit,
            "watchpoint-trigger" => StopReason::WatchpointTrigger,
            "read-watchpoint-trigger" => StopReason::ReadWatchpointTrigger,
            "access-watchpoint-trigger" => StopReason::AccessWatchpointTrigger,
            "function-finished" => StopReason::FunctionFinished,
            "location-reached" => StopReason::LocationReached,
            "watchpoint-scope" => StopReason::WatchpointScope,
            "end-stepping-range" => StopReason::EndSteppingRange,
            "exited-signalled" => StopReason::ExitedSignalled,
            "exited" => StopReason::Exited,
            "exited-normally" => StopReason::ExitedNormally,
            "signal-received" => StopReason::SignalReceived,
            other => StopReason::Unknown(other.to_string()),
        }
    }
}

impl StopReason {
    /// True for the reasons that mean the inferior is gone
    pub fn is_exit(&self) -> bool {
        matches!(
            self,
            StopReason::ExitedNormally | StopReason::Exited | StopReason::ExitedSignalled
        )
    }
}

/// A parsed MI value: literal, ordered list, or named hash.
///
/// Equality is structural: hash members compare without regard to order,
/// lists compare element by element.
#[derive(Debug, Clone)]
pub enum MiValue {
    Literal(String),
    List(Vec<MiValue>),
    Hash(MiHash),
}

impl MiValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            MiValue::Literal(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[MiValue]> {
        match self {
            MiValue::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_hash(&self) -> Option<&MiHash> {
        match self {
            MiValue::Hash(h) => Some(h),
            _ => None,
        }
    }

    /// Look up a member when this value is a hash
    pub fn get(&self, key: &str) -> Option<&MiValue> {
        self.as_hash().and_then(|h| h.get(key))
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(MiValue::as_str)
    }
}

impl PartialEq for MiValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (MiValue::Literal(a), MiValue::Literal(b)) => a == b,
            (MiValue::List(a), MiValue::List(b)) => a == b,
            (MiValue::Hash(a), MiValue::Hash(b)) => a == b,
            _ => false,
        }
    }
}

/// GDB/MI result (variable=value pair)
#[derive(Debug, Clone, PartialEq)]
pub struct MiResult {
    pub variable: String,
    pub value: MiValue,
}

/// Ordered name -> value mapping with unique names
#[derive(Debug, Clone, Default)]
pub struct MiHash {
    entries: Vec<MiResult>,
}

impl MiHash {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&MiValue> {
        self.entries
            .iter()
            .find(|r| r.variable == key)
            .map(|r| &r.value)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(MiValue::as_str)
    }

    /// Numeric member; GDB quotes every number
    pub fn get_u32(&self, key: &str) -> Option<u32> {
        self.get_str(key).and_then(|s| s.parse().ok())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MiResult> {
        self.entries.iter()
    }

    pub(crate) fn get_mut(&mut self, key: &str) -> Option<&mut MiValue> {
        self.entries
            .iter_mut()
            .find(|r| r.variable == key)
            .map(|r| &mut r.value)
    }

    /// Append a member. The caller guarantees `variable` is not present yet.
    pub(crate) fn push(&mut self, variable: String, value: MiValue) {
        debug_assert!(!self.contains(&variable));
        self.entries.push(MiResult { variable, value });
    }
}

impl PartialEq for MiHash {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len()
            && self
                .entries
                .iter()
                .all(|r| other.get(&r.variable) == Some(&r.value))
    }
}

/// One raw record as read off the wire, before its body is parsed
#[derive(Debug, Clone, PartialEq)]
pub struct PendingRecord {
    /// 0 when the line carried no token
    pub token: u64,
    pub sigil: Sigil,
    /// Everything after the sigil
    pub tail: String,
}

/// A parsed `^` record
#[derive(Debug, Clone, PartialEq)]
pub struct ResultRecord {
    pub token: u64,
    pub class: ResultClass,
    pub body: MiHash,
}

/// Which frame a variable object is evaluated in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameBinding {
    /// Bound to the frame selected at creation (`*`)
    CurrentFrame,
    /// Re-evaluated in whatever frame is selected (`@`)
    AnyFrame,
}

impl FrameBinding {
    pub fn mi_flag(self) -> char {
        match self {
            FrameBinding::CurrentFrame => '*',
            FrameBinding::AnyFrame => '@',
        }
    }
}

/// Function argument
#[derive(Debug, Clone, PartialEq)]
pub struct FrameArgument {
    pub name: String,
    pub value: Option<String>,
}

/// Frame information
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub level: u32,
    pub address: u64,
    pub function: String,
    pub source_uri: Option<String>,
    pub line: Option<u32>,
    pub arguments: Vec<FrameArgument>,
}

/// Breakpoint information
#[derive(Debug, Clone, PartialEq)]
pub struct Breakpoint {
    pub number: String,
    pub source_uri: Option<String>,
    pub line: Option<u32>,
    pub function: Option<String>,
    pub enabled: bool,
}

/// A breakpoint asked for by the collaborator, possibly before connecting
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BreakpointRequest {
    Line { file: String, line: u32 },
    Function { name: String },
}

impl BreakpointRequest {
    pub fn location(&self) -> String {
        match self {
            BreakpointRequest::Line { file, line } => format!("{}:{}", file, line),
            BreakpointRequest::Function { name } => name.clone(),
        }
    }
}

/// Execution state of the debugged program
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DebuggerState {
    #[default]
    Disconnected,
    Running,
    Interrupted,
}

impl fmt::Display for DebuggerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DebuggerState::Disconnected => "disconnected",
            DebuggerState::Running => "running",
            DebuggerState::Interrupted => "interrupted",
        };
        f.write_str(s)
    }
}

/// Stable handle of a variable object inside one session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VarId(pub u64);

/// Change notifications for the presentation layer
#[derive(Debug, Clone, PartialEq)]
pub enum DebuggerEvent {
    StateChanged(DebuggerState),
    StackChanged,
    LocalsChanged,
    BreakpointsChanged,
    SourceChanged {
        uri: Option<String>,
        line: Option<u32>,
    },
    ActiveFrameChanged(u32),
    /// The object is gone; holders must drop the id
    VariableInvalidated(VarId),
    Error {
        message: String,
    },
}

/// MI dialect requested with `--interpreter`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Interpreter {
    Mi,
    #[default]
    Mi2,
}

impl Interpreter {
    pub fn as_arg(self) -> &'static str {
        match self {
            Interpreter::Mi => "--interpreter=mi",
            Interpreter::Mi2 => "--interpreter=mi2",
        }
    }
}

/// GDB configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GdbConfig {
    pub gdb_path: String,
    pub interpreter: Interpreter,
    pub extra_args: Vec<String>,
    /// Inter-read timeout before the timeout handler is consulted
    pub timeout_ms: u64,
    /// Insert a temporary breakpoint on `main` before running
    pub stop_at_main: bool,
}

impl Default for GdbConfig {
    fn default() -> Self {
        Self {
            gdb_path: "gdb".to_string(),
            interpreter: Interpreter::Mi2,
            extra_args: Vec::new(),
            timeout_ms: 15000,
            stop_at_main: true,
        }
    }
}

/// The program to debug
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DebugTarget {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
}

impl DebugTarget {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }
}
