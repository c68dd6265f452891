//! GDB/MI Session Driver
//!
//! Runs one program under GDB and drives it from the terminal.
//!
//! Usage:
//!   gdbmi-session [--config gdb.json] <program> [args...]
//!
//! The config file holds a JSON `GdbConfig`:
//!   ```json
//!   { "gdb_path": "gdb-multiarch", "timeout_ms": 30000 }
//!   ```

use anyhow::{bail, Context, Result};
use gdbmi_session::gdb::{
    timeout_handler, DebugTarget, DebuggerEvent, DebuggerState, FrameBinding, GdbConfig,
    GdbDebugger,
};
use std::sync::mpsc::Receiver;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const USAGE: &str = "usage: gdbmi-session [--config file.json] <program> [args...]";
const POLL_INTERVAL: Duration = Duration::from_millis(20);

struct Options {
    config: GdbConfig,
    target: DebugTarget,
}

fn parse_args(mut args: impl Iterator<Item = String>) -> Result<Options> {
    let mut config = GdbConfig::default();
    let mut positional = Vec::new();
    while let Some(arg) = args.next() {
        // everything after the program belongs to the program
        if positional.is_empty() && arg == "--config" {
            let path = args.next().context("--config needs a file")?;
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path))?;
            config = serde_json::from_str(&text)
                .with_context(|| format!("Failed to parse {}", path))?;
        } else {
            positional.push(arg);
        }
    }

    let mut positional = positional.into_iter();
    let Some(program) = positional.next() else {
        bail!(USAGE);
    };
    let mut target = DebugTarget::new(program);
    target.args = positional.collect();
    Ok(Options { config, target })
}

/// A terminal command
#[derive(Debug, Clone, PartialEq)]
enum Command {
    Continue,
    Next,
    Step,
    Finish,
    Interrupt,
    Restart,
    Backtrace,
    Locals,
    Frame(u32),
    Print(String),
    Break(String),
    Quit,
}

fn parse_command(line: &str) -> Result<Option<Command>> {
    let line = line.trim();
    let (word, rest) = match line.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (line, ""),
    };
    let command = match word {
        "" => return Ok(None),
        "c" | "continue" => Command::Continue,
        "n" | "next" => Command::Next,
        "s" | "step" => Command::Step,
        "f" | "finish" => Command::Finish,
        "i" | "interrupt" => Command::Interrupt,
        "r" | "restart" => Command::Restart,
        "bt" | "backtrace" => Command::Backtrace,
        "locals" => Command::Locals,
        "frame" => Command::Frame(
            rest.parse()
                .with_context(|| format!("Bad frame level: {:?}", rest))?,
        ),
        "p" | "print" if !rest.is_empty() => Command::Print(rest.to_string()),
        "b" | "break" if !rest.is_empty() => Command::Break(rest.to_string()),
        "q" | "quit" => Command::Quit,
        _ => bail!("Unknown command: {}", line),
    };
    Ok(Some(command))
}

fn execute(dbg: &mut GdbDebugger, command: Command) -> gdbmi_session::gdb::Result<()> {
    match command {
        Command::Continue => dbg.continue_execution(),
        Command::Next => dbg.next(),
        Command::Step => dbg.step(),
        Command::Finish => dbg.finish(),
        Command::Interrupt => dbg.interrupt(),
        Command::Restart => dbg.restart(),
        Command::Backtrace => {
            for frame in dbg.stack()? {
                let args: Vec<String> = frame
                    .arguments
                    .iter()
                    .map(|a| match &a.value {
                        Some(value) => format!("{}={}", a.name, value),
                        None => a.name.clone(),
                    })
                    .collect();
                let location = match (&frame.source_uri, frame.line) {
                    (Some(uri), Some(line)) => format!(" at {}:{}", uri, line),
                    _ => String::new(),
                };
                println!(
                    "#{} 0x{:016x} in {}({}){}",
                    frame.level,
                    frame.address,
                    frame.function,
                    args.join(", "),
                    location
                );
            }
            Ok(())
        }
        Command::Locals => {
            for id in dbg.locals()? {
                let name = dbg
                    .variable(id)
                    .map(|o| o.expression.clone())
                    .unwrap_or_default();
                match dbg.variable_value(id) {
                    Ok(value) => println!("{} = {}", name, value),
                    Err(e) => println!("{} = <{}>", name, e),
                }
            }
            Ok(())
        }
        Command::Frame(level) => dbg.set_active_frame(level),
        Command::Print(expression) => {
            let id = dbg.create_variable(&expression, FrameBinding::CurrentFrame)?;
            let value = dbg.variable_value(id);
            dbg.delete_variable(id)?;
            println!("{} = {}", expression, value?);
            Ok(())
        }
        Command::Break(location) => {
            let line = location
                .rsplit_once(':')
                .and_then(|(file, line)| Some((file, line.parse::<u32>().ok()?)));
            match line {
                Some((file, line)) => dbg.request_line_breakpoint(file, line),
                None => dbg.request_function_breakpoint(&location),
            }
        }
        Command::Quit => Ok(()),
    }
}

fn print_events(dbg: &GdbDebugger, events: &Receiver<DebuggerEvent>) {
    for event in events.try_iter() {
        match event {
            DebuggerEvent::StateChanged(state) => println!("[{}]", state),
            DebuggerEvent::SourceChanged {
                uri: Some(uri),
                line,
            } => match line {
                Some(line) => println!("at {}:{}", uri, line),
                None => println!("in {}", uri),
            },
            DebuggerEvent::BreakpointsChanged => {
                for bp in dbg.breakpoints() {
                    let place = match (&bp.source_uri, bp.line, &bp.function) {
                        (Some(uri), Some(line), _) => format!("{}:{}", uri, line),
                        (_, _, Some(function)) => function.clone(),
                        _ => "<pending>".to_string(),
                    };
                    let enabled = if bp.enabled { "" } else { " (disabled)" };
                    println!("breakpoint {} at {}{}", bp.number, place, enabled);
                }
            }
            DebuggerEvent::ActiveFrameChanged(level) => println!("frame {}", level),
            DebuggerEvent::Error { message } => println!("error: {}", message),
            _ => {}
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // Initialize logging to stderr
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let options = parse_args(std::env::args().skip(1))?;
    info!("Starting gdbmi-session v{}", env!("CARGO_PKG_VERSION"));

    let mut dbg = GdbDebugger::new(options.config);
    let events = dbg
        .event_receiver()
        .context("Event receiver already taken")?;
    dbg.set_timeout_handler(Some(timeout_handler(|waited| {
        warn!("GDB has not answered for {:?}", waited);
        None
    })));
    dbg.connect(options.target)?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut ticker = tokio::time::interval(POLL_INTERVAL);

    loop {
        tokio::select! {
            _ = ticker.tick() => dbg.poll(),
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                match parse_command(&line) {
                    Ok(Some(Command::Quit)) => break,
                    Ok(Some(command)) => {
                        if let Err(e) = execute(&mut dbg, command) {
                            println!("error: {}", e);
                        }
                    }
                    Ok(None) => {}
                    Err(e) => println!("{}", e),
                }
            }
        }
        print_events(&dbg, &events);

        if dbg.state() == DebuggerState::Disconnected && !dbg.is_connected() {
            info!("Session ended");
            break;
        }
    }

    dbg.disconnect();
    print_events(&dbg, &events);
    Ok(())
}
