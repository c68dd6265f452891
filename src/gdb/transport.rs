//! GDB process transport
//!
//! Spawns GDB with its MI interpreter and exchanges lines over its pipes.
//! Blocking pipe reads happen on helper threads that forward lines through
//! a channel, so the session thread can either poll or wait with a timeout.

use crate::gdb::error::TransportError;
use crate::gdb::types::GdbConfig;
use std::cell::RefCell;
use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::rc::Rc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, TryRecvError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// How a read should behave when no line is ready yet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    /// Return `Ok(None)` immediately
    Poll,
    /// Block until a line arrives or the timeout is exhausted
    Wait,
}

/// Consulted each time a blocking read times out. Receives the total time
/// waited so far; returning `Some(extra)` keeps waiting that much longer.
///
/// Shared, so the session and every transport it attaches see the same one.
pub type TimeoutHandler = Rc<RefCell<dyn FnMut(Duration) -> Option<Duration>>>;

pub fn timeout_handler(
    handler: impl FnMut(Duration) -> Option<Duration> + 'static,
) -> TimeoutHandler {
    Rc::new(RefCell::new(handler))
}

/// Line-oriented connection to a debugger speaking MI
pub trait MiTransport {
    /// Write one command line; the newline is appended by the transport
    fn write_line(&mut self, line: &str) -> Result<(), TransportError>;

    /// Read one output line without its trailing newline
    fn read_line(&mut self, mode: ReadMode) -> Result<Option<String>, TransportError>;

    /// Terminate the debugger. Further writes fail with `Closed`.
    fn shutdown(&mut self);

    /// Replace the handler consulted when a blocking read times out
    fn set_timeout_handler(&mut self, _handler: Option<TimeoutHandler>) {}
}

/// A GDB child process driven through its stdio pipes
pub struct ProcessTransport {
    child: Child,
    stdin: Option<ChildStdin>,
    lines: Receiver<std::io::Result<String>>,
    timeout: Duration,
    timeout_handler: Option<TimeoutHandler>,
}

impl ProcessTransport {
    /// Start GDB according to `config`
    pub fn spawn(config: &GdbConfig) -> Result<Self, TransportError> {
        info!("Starting GDB: {}", config.gdb_path);

        let mut command = Command::new(&config.gdb_path);
        command
            .arg(config.interpreter.as_arg())
            .arg("-q")
            .arg("-nx")
            .args(&config.extra_args);
        Self::spawn_command(&mut command, Duration::from_millis(config.timeout_ms))
    }

    /// Start an already-configured command with piped stdio
    pub(crate) fn spawn_command(
        command: &mut Command,
        timeout: Duration,
    ) -> Result<Self, TransportError> {
        let mut child = command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(TransportError::Spawn)?;

        let missing = |name: &str| {
            TransportError::Spawn(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                format!("gdb {} was not captured", name),
            ))
        };
        let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;

        let (tx, lines) = mpsc::channel();
        thread::spawn(move || {
            let mut reader = BufReader::new(stdout);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf) {
                    Ok(0) => break,
                    Ok(_) => {
                        let line = String::from_utf8_lossy(&buf)
                            .trim_end_matches(['\n', '\r'])
                            .to_string();
                        if tx.send(Ok(line)).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        let _ = tx.send(Err(e));
                        break;
                    }
                }
            }
            debug!("GDB output reader stopped");
        });

        thread::spawn(move || {
            let reader = BufReader::new(stderr);
            for line in reader.lines().map_while(Result::ok) {
                debug!("GDB stderr: {}", line);
            }
        });

        Ok(Self {
            child,
            stdin: Some(stdin),
            lines,
            timeout,
            timeout_handler: None,
        })
    }

    fn wait_for_line(&mut self) -> Result<Option<String>, TransportError> {
        let started = Instant::now();
        let mut wait = self.timeout;
        loop {
            match self.lines.recv_timeout(wait) {
                Ok(Ok(line)) => return Ok(Some(line)),
                Ok(Err(e)) => return Err(TransportError::Read(e)),
                Err(RecvTimeoutError::Disconnected) => return Err(TransportError::Eof),
                Err(RecvTimeoutError::Timeout) => {
                    let elapsed = started.elapsed();
                    let extra = self
                        .timeout_handler
                        .as_ref()
                        .and_then(|handler| (&mut *handler.borrow_mut())(elapsed));
                    match extra {
                        Some(extra) => {
                            debug!("Still waiting for GDB after {:?}", elapsed);
                            wait = extra;
                        }
                        None => return Err(TransportError::Timeout(elapsed)),
                    }
                }
            }
        }
    }
}

impl MiTransport for ProcessTransport {
    fn write_line(&mut self, line: &str) -> Result<(), TransportError> {
        let stdin = self.stdin.as_mut().ok_or(TransportError::Closed)?;
        let framed = format!("{}\n", line);
        stdin
            .write_all(framed.as_bytes())
            .and_then(|_| stdin.flush())
            .map_err(TransportError::Write)
    }

    fn read_line(&mut self, mode: ReadMode) -> Result<Option<String>, TransportError> {
        match mode {
            ReadMode::Poll => match self.lines.try_recv() {
                Ok(Ok(line)) => Ok(Some(line)),
                Ok(Err(e)) => Err(TransportError::Read(e)),
                Err(TryRecvError::Empty) => Ok(None),
                Err(TryRecvError::Disconnected) => Err(TransportError::Eof),
            },
            ReadMode::Wait => self.wait_for_line(),
        }
    }

    fn shutdown(&mut self) {
        let Some(mut stdin) = self.stdin.take() else {
            return;
        };
        // Ask politely first, then make sure
        let _ = stdin.write_all(b"-gdb-exit\n");
        let _ = stdin.flush();
        drop(stdin);

        for _ in 0..25 {
            match self.child.try_wait() {
                Ok(Some(status)) => {
                    info!("GDB exited with {}", status);
                    return;
                }
                Ok(None) => thread::sleep(Duration::from_millis(20)),
                Err(e) => {
                    warn!("Failed to query GDB process: {}", e);
                    break;
                }
            }
        }
        let _ = self.child.kill();
        let _ = self.child.wait();
        info!("GDB stopped");
    }

    fn set_timeout_handler(&mut self, handler: Option<TimeoutHandler>) {
        self.timeout_handler = handler;
    }
}

impl Drop for ProcessTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spawn_missing_binary_fails() {
        let config = GdbConfig {
            gdb_path: "/nonexistent/definitely-not-gdb".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            ProcessTransport::spawn(&config),
            Err(TransportError::Spawn(_))
        ));
    }

    /// Run a shell snippet in place of gdb, reusing the pipe plumbing
    #[cfg(unix)]
    fn spawn_script(script: &str, timeout_ms: u64) -> ProcessTransport {
        ProcessTransport::spawn_command(
            Command::new("sh").arg("-c").arg(script),
            Duration::from_millis(timeout_ms),
        )
        .unwrap()
    }

    #[cfg(unix)]
    #[test]
    fn test_lines_are_forwarded_and_eof_reported() {
        let mut transport = spawn_script("printf '1^done\\r\\n(gdb) \\n'", 2000);
        assert_eq!(transport.read_line(ReadMode::Wait).unwrap().as_deref(), Some("1^done"));
        assert_eq!(transport.read_line(ReadMode::Wait).unwrap().as_deref(), Some("(gdb) "));
        assert!(matches!(transport.read_line(ReadMode::Wait), Err(TransportError::Eof)));
    }

    #[cfg(unix)]
    #[test]
    fn test_write_reaches_child() {
        let mut transport = spawn_script("read line; echo \"got $line\"", 2000);
        transport.write_line("7-gdb-version").unwrap();
        assert_eq!(
            transport.read_line(ReadMode::Wait).unwrap().as_deref(),
            Some("got 7-gdb-version")
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_timeout_handler_extends_then_gives_up() {
        let mut transport = spawn_script("sleep 5", 20);
        let mut firings = 0;
        transport.set_timeout_handler(Some(timeout_handler(move |_elapsed| {
            firings += 1;
            (firings < 3).then(|| Duration::from_millis(20))
        })));
        let started = Instant::now();
        assert!(matches!(
            transport.read_line(ReadMode::Wait),
            Err(TransportError::Timeout(_))
        ));
        assert!(started.elapsed() >= Duration::from_millis(60));
        assert_eq!(transport.read_line(ReadMode::Poll).unwrap(), None);
    }

    #[cfg(unix)]
    #[test]
    fn test_writes_fail_after_shutdown() {
        let mut transport = spawn_script("cat > /dev/null", 2000);
        transport.shutdown();
        assert!(matches!(transport.write_line("1-exec-run"), Err(TransportError::Closed)));
    }
}
