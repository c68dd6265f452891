//! In-memory stand-in for a GDB process
//!
//! `ScriptedTransport` records every command written to it and queues the
//! reply lines produced by either a custom responder or `FakeGdb`, a small
//! model of a stopped C program.

use crate::gdb::error::TransportError;
use crate::gdb::transport::{MiTransport, ReadMode, TimeoutHandler};
use std::cell::{RefCell, RefMut};
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::time::Duration;

type Responder = Box<dyn FnMut(u64, &str) -> Vec<String>>;

#[derive(Default)]
struct Script {
    sent: Vec<String>,
    incoming: VecDeque<String>,
    responder: Option<Responder>,
    fake: FakeGdb,
    fail_writes: bool,
    output_closed: bool,
    shut_down: bool,
    timeout_handler: Option<TimeoutHandler>,
    /// Replies held back until a blocking read is granted more time
    late: VecDeque<String>,
    hold_replies: bool,
}

/// Time a blocking read pretends to wait before consulting the handler
const SCRIPTED_TIMEOUT: Duration = Duration::from_millis(10);

pub struct ScriptedTransport {
    script: Rc<RefCell<Script>>,
}

/// Test-side view of a `ScriptedTransport` moved into a session
#[derive(Clone)]
pub struct ScriptHandle {
    script: Rc<RefCell<Script>>,
}

impl ScriptedTransport {
    pub fn new() -> (Self, ScriptHandle) {
        let script = Rc::new(RefCell::new(Script::default()));
        (
            Self {
                script: Rc::clone(&script),
            },
            ScriptHandle { script },
        )
    }
}

fn split_token(line: &str) -> (u64, &str) {
    let digits = line.bytes().take_while(u8::is_ascii_digit).count();
    (line[..digits].parse().unwrap_or(0), &line[digits..])
}

impl MiTransport for ScriptedTransport {
    fn write_line(&mut self, line: &str) -> Result<(), TransportError> {
        let mut script = self.script.borrow_mut();
        if script.shut_down {
            return Err(TransportError::Closed);
        }
        if script.fail_writes {
            return Err(TransportError::Write(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "broken pipe",
            )));
        }
        script.sent.push(line.to_string());

        let (token, command) = split_token(line);
        let replies = match script.responder.as_mut() {
            Some(responder) => responder(token, command),
            None => script.fake.respond(token, command),
        };
        if script.hold_replies {
            script.late.extend(replies);
        } else {
            script.incoming.extend(replies);
        }
        Ok(())
    }

    fn read_line(&mut self, mode: ReadMode) -> Result<Option<String>, TransportError> {
        let mut script = self.script.borrow_mut();
        match script.incoming.pop_front() {
            Some(line) => Ok(Some(line)),
            None if script.output_closed => Err(TransportError::Eof),
            None => match mode {
                ReadMode::Poll => Ok(None),
                ReadMode::Wait => {
                    let mut waited = Duration::ZERO;
                    loop {
                        waited += SCRIPTED_TIMEOUT;
                        let extra = script
                            .timeout_handler
                            .as_ref()
                            .and_then(|handler| (&mut *handler.borrow_mut())(waited));
                        if extra.is_none() {
                            return Err(TransportError::Timeout(waited));
                        }
                        if let Some(line) = script.late.pop_front() {
                            return Ok(Some(line));
                        }
                    }
                }
            },
        }
    }

    fn shutdown(&mut self) {
        self.script.borrow_mut().shut_down = true;
    }

    fn set_timeout_handler(&mut self, handler: Option<TimeoutHandler>) {
        self.script.borrow_mut().timeout_handler = handler;
    }
}

impl ScriptHandle {
    /// Replace `FakeGdb` with a closure from `(token, command)` to reply lines
    pub fn respond_with(&self, responder: impl FnMut(u64, &str) -> Vec<String> + 'static) {
        self.script.borrow_mut().responder = Some(Box::new(responder));
    }

    pub fn push_line(&self, line: impl Into<String>) {
        self.script.borrow_mut().incoming.push_back(line.into());
    }

    pub fn push_lines(&self, lines: &[&str]) {
        for line in lines {
            self.push_line(*line);
        }
    }

    /// Every line written, tokens included
    pub fn sent(&self) -> Vec<String> {
        self.script.borrow().sent.clone()
    }

    /// Every line written, tokens stripped
    pub fn sent_commands(&self) -> Vec<String> {
        self.script
            .borrow()
            .sent
            .iter()
            .map(|line| split_token(line).1.to_string())
            .collect()
    }

    pub fn count_sent(&self, prefix: &str) -> usize {
        self.sent_commands()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    pub fn clear_sent(&self) {
        self.script.borrow_mut().sent.clear();
    }

    pub fn fail_writes(&self) {
        self.script.borrow_mut().fail_writes = true;
    }

    pub fn close_output(&self) {
        self.script.borrow_mut().output_closed = true;
    }

    /// Hold every later reply back until a timed-out blocking read is
    /// allowed to keep waiting
    pub fn hold_replies(&self) {
        self.script.borrow_mut().hold_replies = true;
    }

    pub fn has_timeout_handler(&self) -> bool {
        self.script.borrow().timeout_handler.is_some()
    }

    pub fn was_shut_down(&self) -> bool {
        self.script.borrow().shut_down
    }

    pub fn fake(&self) -> RefMut<'_, FakeGdb> {
        RefMut::map(self.script.borrow_mut(), |s| &mut s.fake)
    }
}

#[derive(Debug, Clone)]
pub struct FakeFrame {
    pub function: String,
    pub file: Option<String>,
    pub line: Option<u32>,
    pub args: Vec<(String, String)>,
}

impl FakeFrame {
    pub fn new(function: &str, file: Option<&str>, line: Option<u32>) -> Self {
        Self {
            function: function.to_string(),
            file: file.map(str::to_string),
            line,
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, name: &str, value: &str) -> Self {
        self.args.push((name.to_string(), value.to_string()));
        self
    }

    fn tuple(&self, level: Option<usize>, with_args: bool) -> String {
        let mut fields = Vec::new();
        if let Some(level) = level {
            fields.push(format!("level=\"{}\"", level));
        }
        let addr = 0x401136 + level.unwrap_or(0) * 0x100;
        fields.push(format!("addr=\"0x{:016x}\"", addr));
        fields.push(format!("func=\"{}\"", self.function));
        if with_args {
            fields.push("args=[]".to_string());
        }
        if let Some(file) = &self.file {
            fields.push(format!("file=\"{}\"", file));
            fields.push(format!("fullname=\"/src/{}\"", file));
        }
        if let Some(line) = self.line {
            fields.push(format!("line=\"{}\"", line));
        }
        format!("{{{}}}", fields.join(","))
    }
}

/// A stopped program: `main(argc, argv)` with locals `x` and `p`, called
/// from the C runtime
pub struct FakeGdb {
    pub frames: Vec<FakeFrame>,
    /// Local names per frame level
    pub locals: Vec<Vec<String>>,
    /// Current value of each expression
    pub values: HashMap<String, String>,
    /// `(exp, value)` children of composite expressions
    pub children: HashMap<String, Vec<(String, String)>>,
    /// Changelist entries returned by the next `-var-update`
    pub changes: Vec<String>,
    /// Lines emitted after each resume acknowledgement
    pub stops: VecDeque<Vec<String>>,
    pub fail_symbols: bool,
    pub selected: usize,
    next_bkpt: u32,
    /// gdb name -> expression
    objects: HashMap<String, String>,
}

impl Default for FakeGdb {
    fn default() -> Self {
        let frames = vec![
            FakeFrame::new("main", Some("prog.c"), Some(12))
                .arg("argc", "1")
                .arg("argv", "0x7ffe"),
            FakeFrame::new("__libc_start_main", None, None),
        ];
        let values = [("argc", "1"), ("argv", "0x7ffe"), ("x", "3"), ("p", "{...}")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let mut children = HashMap::new();
        children.insert(
            "p".to_string(),
            vec![("x".to_string(), "1".to_string()), ("y".to_string(), "2".to_string())],
        );
        Self {
            frames,
            locals: vec![vec!["x".to_string(), "p".to_string()], Vec::new()],
            values,
            children,
            changes: Vec::new(),
            stops: VecDeque::new(),
            fail_symbols: false,
            selected: 0,
            next_bkpt: 1,
            objects: HashMap::new(),
        }
    }
}

impl FakeGdb {
    /// `*stopped` record located in frame 0
    pub fn stopped(&self, reason: &str) -> String {
        let frame = self
            .frames
            .first()
            .map(|f| format!(",frame={}", f.tuple(None, true)))
            .unwrap_or_default();
        format!(
            "*stopped,reason=\"{}\"{},thread-id=\"1\",stopped-threads=\"all\"",
            reason, frame
        )
    }

    pub fn has_object(&self, name: &str) -> bool {
        self.objects.contains_key(name)
    }

    fn value_of(&self, expression: &str) -> Option<String> {
        if let Some(v) = self.values.get(expression) {
            return Some(v.clone());
        }
        let (parent, exp) = expression.rsplit_once('.')?;
        self.children
            .get(parent)?
            .iter()
            .find(|(e, _)| e == exp)
            .map(|(_, v)| v.clone())
    }

    pub fn respond(&mut self, token: u64, command: &str) -> Vec<String> {
        let mut words = command.split_whitespace();
        let verb = words.next().unwrap_or("");
        let rest: Vec<&str> = words.collect();
        let done = |body: &str| {
            if body.is_empty() {
                format!("{}^done", token)
            } else {
                format!("{}^done,{}", token, body)
            }
        };
        let error = |msg: &str| format!("{}^error,msg=\"{}\"", token, msg);

        match verb {
            "-file-exec-and-symbols" if self.fail_symbols => {
                vec![error("No such file or directory.")]
            }
            "-break-insert" => {
                let temporary = rest.contains(&"-t");
                let location = rest.last().copied().unwrap_or("main").trim_matches('"');
                let number = self.next_bkpt;
                self.next_bkpt += 1;
                let place = match location.rsplit_once(':') {
                    Some((file, line)) => format!(
                        "func=\"main\",file=\"{}\",fullname=\"/src/{}\",line=\"{}\"",
                        file, file, line
                    ),
                    None => format!(
                        "func=\"{}\",file=\"prog.c\",fullname=\"/src/prog.c\",line=\"12\"",
                        location
                    ),
                };
                vec![done(&format!(
                    "bkpt={{number=\"{}\",type=\"breakpoint\",disp=\"{}\",enabled=\"y\",addr=\"0x0000000000401136\",{},thread-groups=[\"i1\"],times=\"0\"}}",
                    number,
                    if temporary { "del" } else { "keep" },
                    place
                ))]
            }
            "-exec-run" | "-exec-continue" | "-exec-next" | "-exec-step" | "-exec-finish" => {
                let mut lines = vec![
                    format!("{}^running", token),
                    "*running,thread-id=\"all\"".to_string(),
                    "(gdb) ".to_string(),
                ];
                if let Some(stop) = self.stops.pop_front() {
                    lines.extend(stop);
                }
                lines
            }
            "-exec-interrupt" => vec![done(""), self.stopped("signal-received")],
            "-stack-select-frame" => {
                match rest.first().and_then(|n| n.parse::<usize>().ok()) {
                    Some(level) if level < self.frames.len() => {
                        self.selected = level;
                        vec![done("")]
                    }
                    _ => vec![error("No frame at level.")],
                }
            }
            "-stack-info-depth" => vec![done(&format!("depth=\"{}\"", self.frames.len()))],
            "-stack-info-frame" => match self.frames.get(self.selected) {
                Some(frame) => vec![done(&format!(
                    "frame={}",
                    frame.tuple(Some(self.selected), false)
                ))],
                None => vec![error("No stack.")],
            },
            "-stack-list-frames" => {
                let frames: Vec<String> = self
                    .frames
                    .iter()
                    .enumerate()
                    .map(|(level, f)| format!("frame={}", f.tuple(Some(level), false)))
                    .collect();
                vec![done(&format!("stack=[{}]", frames.join(",")))]
            }
            "-stack-list-arguments" => {
                let with_values = rest.first() == Some(&"1");
                let range = match (rest.get(1), rest.get(2)) {
                    (Some(lo), Some(hi)) => {
                        let lo: usize = lo.parse().unwrap_or(0);
                        let hi: usize = hi.parse().unwrap_or(0);
                        lo..hi + 1
                    }
                    _ => 0..self.frames.len(),
                };
                let frames: Vec<String> = range
                    .filter_map(|level| self.frames.get(level).map(|f| (level, f)))
                    .map(|(level, f)| {
                        let args: Vec<String> = f
                            .args
                            .iter()
                            .map(|(name, value)| {
                                if with_values {
                                    format!("{{name=\"{}\",value=\"{}\"}}", name, value)
                                } else {
                                    format!("name=\"{}\"", name)
                                }
                            })
                            .collect();
                        format!("frame={{level=\"{}\",args=[{}]}}", level, args.join(","))
                    })
                    .collect();
                vec![done(&format!("stack-args=[{}]", frames.join(",")))]
            }
            "-stack-list-locals" => {
                let names: Vec<String> = self
                    .locals
                    .get(self.selected)
                    .map(|names| names.iter().map(|n| format!("name=\"{}\"", n)).collect())
                    .unwrap_or_default();
                vec![done(&format!("locals=[{}]", names.join(",")))]
            }
            "-var-create" => {
                let (Some(name), Some(expression)) = (rest.first(), rest.get(2..)) else {
                    return vec![error("-var-create: Usage: NAME FRAME EXPRESSION.")];
                };
                let expression = expression.join(" ");
                let expression = expression.trim_matches('"').to_string();
                let Some(value) = self.value_of(&expression) else {
                    return vec![error("-var-create: unable to create variable object")];
                };
                let numchild = self.children.get(&expression).map_or(0, Vec::len);
                let var_type = if numchild > 0 { "struct point" } else { "int" };
                self.objects.insert(name.to_string(), expression);
                vec![done(&format!(
                    "name=\"{}\",numchild=\"{}\",value=\"{}\",type=\"{}\",thread-id=\"1\",has_more=\"0\"",
                    name, numchild, value, var_type
                ))]
            }
            "-var-evaluate-expression" => {
                let Some(expression) = rest.first().and_then(|n| self.objects.get(*n)) else {
                    return vec![error("Variable object not found")];
                };
                match self.value_of(expression) {
                    Some(value) => vec![done(&format!("value=\"{}\"", value))],
                    None => vec![error("Variable object not found")],
                }
            }
            "-var-list-children" => {
                let Some(name) = rest.last().map(|n| n.to_string()) else {
                    return vec![error("-var-list-children: Usage: NAME.")];
                };
                let Some(expression) = self.objects.get(&name).cloned() else {
                    return vec![error("Variable object not found")];
                };
                let kids = self.children.get(&expression).cloned().unwrap_or_default();
                let mut items = Vec::new();
                for (exp, value) in &kids {
                    let child = format!("{}.{}", name, exp);
                    self.objects.insert(child.clone(), format!("{}.{}", expression, exp));
                    items.push(format!(
                        "child={{name=\"{}\",exp=\"{}\",numchild=\"0\",value=\"{}\",type=\"int\",thread-id=\"1\"}}",
                        child, exp, value
                    ));
                }
                vec![done(&format!(
                    "numchild=\"{}\",children=[{}],has_more=\"0\"",
                    kids.len(),
                    items.join(",")
                ))]
            }
            "-var-update" => {
                let changes = std::mem::take(&mut self.changes);
                vec![done(&format!("changelist=[{}]", changes.join(",")))]
            }
            "-var-delete" => {
                let Some(name) = rest.last().map(|n| n.to_string()) else {
                    return vec![error("-var-delete: Usage: NAME.")];
                };
                if self.objects.remove(&name).is_none() {
                    return vec![error("Variable object not found")];
                }
                let prefix = format!("{}.", name);
                let before = self.objects.len();
                self.objects.retain(|n, _| !n.starts_with(&prefix));
                vec![done(&format!("ndeleted=\"{}\"", 1 + before - self.objects.len()))]
            }
            _ => vec![done("")],
        }
    }
}
