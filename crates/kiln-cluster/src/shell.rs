//! Simulated `sh` for the in-memory cluster.
//!
//! Understands the subset of POSIX shell that command scripts and the
//! step driver use: variable expansion, quoting, `;`/`&&`/`||` lists,
//! `>`/`>>`/`>&2` redirection and a handful of builtins (`echo`, `export`,
//! `cd`, `exit`, `sleep`, `cat`, `touch`, `rm`, `printenv`, `pwd`, `true`,
//! `false`). The command `kiln-sim-disconnect` drops the stream without an
//! exit status, which callers observe as a broken channel.

use async_trait::async_trait;
use futures::StreamExt;
use kiln_core::ports::{ExecFrame, ExecStream};
use kiln_core::sandbox::SandboxRef;
use kiln_core::{Error, Result};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// Files visible to every unit of one simulated sandbox.
pub type SharedFiles = Arc<Mutex<BTreeMap<String, String>>>;

/// Command name that breaks the exec stream mid-flight.
pub const DISCONNECT_COMMAND: &str = "kiln-sim-disconnect";

/// Everything an exec handler gets to see about one call.
#[derive(Debug, Clone)]
pub struct ExecSession {
    pub sandbox: SandboxRef,
    pub unit: String,
    pub argv: Vec<String>,
    /// Environment the unit was started with.
    pub env: BTreeMap<String, String>,
    pub working_dir: String,
    pub files: SharedFiles,
}

/// Runs commands for the in-memory cluster.
#[async_trait]
pub trait ExecHandler: Send + Sync {
    async fn exec(&self, session: ExecSession) -> Result<ExecStream>;
}

/// Default handler: interprets the script with the simulated shell.
#[derive(Debug, Default, Clone, Copy)]
pub struct ScriptedShell;

#[async_trait]
impl ExecHandler for ScriptedShell {
    async fn exec(&self, session: ExecSession) -> Result<ExecStream> {
        let script = match session.argv.as_slice() {
            [_, flag, script, ..] if flag == "-c" => script.clone(),
            argv => argv.join(" "),
        };

        let (tx, rx) = mpsc::channel(64);
        let mut shell = Interpreter {
            env: session.env,
            cwd: session.working_dir,
            files: session.files,
            last_status: 0,
            tx,
        };
        tokio::spawn(async move {
            match shell.run(&script).await {
                Flow::Continue => {
                    let status = shell.last_status;
                    let _ = shell.tx.send(Ok(ExecFrame::Exit(status))).await;
                }
                Flow::Exit(code) => {
                    let _ = shell.tx.send(Ok(ExecFrame::Exit(code))).await;
                }
                Flow::Disconnect => {}
            }
        });

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|frame| (frame, rx))
        });
        Ok(stream.boxed())
    }
}

enum Flow {
    Continue,
    Exit(i32),
    Disconnect,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Word(String),
    Op(&'static str),
}

struct Interpreter {
    env: BTreeMap<String, String>,
    cwd: String,
    files: SharedFiles,
    last_status: i32,
    tx: mpsc::Sender<Result<ExecFrame>>,
}

enum Redirect {
    Stdout,
    Stderr,
    Truncate(String),
    Append(String),
}

impl Interpreter {
    async fn run(&mut self, script: &str) -> Flow {
        for line in script.lines() {
            let tokens = self.tokenize(line);
            let mut rest: &[Token] = &tokens;
            let mut skip_next = false;

            while !rest.is_empty() {
                let end = rest
                    .iter()
                    .position(|t| matches!(t, Token::Op(";" | "&&" | "||")))
                    .unwrap_or(rest.len());
                let (command, tail) = rest.split_at(end);

                if !skip_next && !command.is_empty() {
                    match self.command(command).await {
                        Flow::Continue => {}
                        other => return other,
                    }
                }

                skip_next = match tail.first() {
                    Some(Token::Op("&&")) => self.last_status != 0,
                    Some(Token::Op("||")) => self.last_status == 0,
                    _ => false,
                };
                rest = tail.get(1..).unwrap_or(&[]);
            }
        }
        Flow::Continue
    }

    async fn command(&mut self, tokens: &[Token]) -> Flow {
        let mut words = Vec::new();
        let mut redirect = Redirect::Stdout;
        let mut iter = tokens.iter();
        while let Some(token) = iter.next() {
            match token {
                Token::Word(w) => words.push(w.clone()),
                Token::Op(">&2") => redirect = Redirect::Stderr,
                Token::Op(op @ (">" | ">>")) => {
                    if let Some(Token::Word(path)) = iter.next() {
                        let path = self.absolute(path);
                        redirect = if *op == ">" {
                            Redirect::Truncate(path)
                        } else {
                            Redirect::Append(path)
                        };
                    }
                }
                Token::Op(_) => {}
            }
        }
        let Some((name, args)) = words.split_first() else {
            return Flow::Continue;
        };

        let mut out = String::new();
        let mut err = String::new();
        let status = match name.as_str() {
            "echo" => {
                let (newline, args) = match args.first().map(String::as_str) {
                    Some("-n") => (false, &args[1..]),
                    _ => (true, args),
                };
                out.push_str(&args.join(" "));
                if newline {
                    out.push('\n');
                }
                0
            }
            "export" => {
                for arg in args {
                    if let Some((key, value)) = arg.split_once('=') {
                        self.env.insert(key.to_string(), value.to_string());
                    }
                }
                0
            }
            "cd" => {
                if let Some(dir) = args.first() {
                    self.cwd = self.absolute(dir);
                }
                0
            }
            "exit" => {
                let code = args
                    .first()
                    .and_then(|c| c.parse().ok())
                    .unwrap_or(self.last_status);
                return Flow::Exit(code);
            }
            "true" | ":" => 0,
            "false" => 1,
            "pwd" => {
                out = format!("{}\n", self.cwd);
                0
            }
            "sleep" => {
                let seconds: f64 = args.first().and_then(|s| s.parse().ok()).unwrap_or(0.0);
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs_f64(seconds.max(0.0))) => 0,
                    _ = self.tx.closed() => return Flow::Disconnect,
                }
            }
            "cat" => {
                let mut status = 0;
                for arg in args {
                    let path = self.absolute(arg);
                    match self.read_file(&path) {
                        Some(content) => out.push_str(&content),
                        None => {
                            err.push_str(&format!("cat: {}: No such file or directory\n", arg));
                            status = 1;
                        }
                    }
                }
                status
            }
            "touch" => {
                for arg in args {
                    let path = self.absolute(arg);
                    if let Ok(mut files) = self.files.lock() {
                        files.entry(path).or_default();
                    }
                }
                0
            }
            "rm" => {
                for arg in args.iter().filter(|a| !a.starts_with('-')) {
                    let path = self.absolute(arg);
                    if let Ok(mut files) = self.files.lock() {
                        files.remove(&path);
                    }
                }
                0
            }
            "printenv" => match args.first() {
                Some(key) => match self.env.get(key) {
                    Some(value) => {
                        out = format!("{}\n", value);
                        0
                    }
                    None => 1,
                },
                None => {
                    for (key, value) in &self.env {
                        out.push_str(&format!("{}={}\n", key, value));
                    }
                    0
                }
            },
            DISCONNECT_COMMAND => return Flow::Disconnect,
            other => {
                err = format!("sh: 1: {}: not found\n", other);
                127
            }
        };
        self.last_status = status;

        if !out.is_empty() {
            match redirect {
                Redirect::Stdout => self.emit(ExecFrame::Stdout(out.into_bytes())).await,
                Redirect::Stderr => self.emit(ExecFrame::Stderr(out.into_bytes())).await,
                Redirect::Truncate(path) => self.write_file(path, out, false),
                Redirect::Append(path) => self.write_file(path, out, true),
            }
        }
        if !err.is_empty() {
            self.emit(ExecFrame::Stderr(err.into_bytes())).await;
        }
        Flow::Continue
    }

    async fn emit(&self, frame: ExecFrame) {
        let _ = self.tx.send(Ok(frame)).await;
    }

    fn absolute(&self, path: &str) -> String {
        if path.starts_with('/') {
            path.to_string()
        } else {
            format!("{}/{}", self.cwd.trim_end_matches('/'), path)
        }
    }

    fn read_file(&self, path: &str) -> Option<String> {
        self.files.lock().ok()?.get(path).cloned()
    }

    fn write_file(&self, path: String, content: String, append: bool) {
        if let Ok(mut files) = self.files.lock() {
            let file = files.entry(path).or_default();
            if !append {
                file.clear();
            }
            file.push_str(&content);
        }
    }

    fn tokenize(&self, line: &str) -> Vec<Token> {
        let mut tokens = Vec::new();
        let mut word = String::new();
        let mut in_word = false;
        let mut chars = line.chars().peekable();

        macro_rules! flush {
            () => {
                if in_word {
                    tokens.push(Token::Word(std::mem::take(&mut word)));
                    in_word = false;
                }
            };
        }

        while let Some(c) = chars.next() {
            match c {
                ' ' | '\t' => flush!(),
                '#' if !in_word => break,
                '\'' => {
                    in_word = true;
                    for q in chars.by_ref() {
                        if q == '\'' {
                            break;
                        }
                        word.push(q);
                    }
                }
                '"' => {
                    in_word = true;
                    while let Some(q) = chars.next() {
                        match q {
                            '"' => break,
                            '\\' => {
                                if let Some(escaped) = chars.next() {
                                    word.push(escaped);
                                }
                            }
                            '$' => word.push_str(&self.expand(&mut chars)),
                            _ => word.push(q),
                        }
                    }
                }
                '\\' => {
                    in_word = true;
                    if let Some(escaped) = chars.next() {
                        word.push(escaped);
                    }
                }
                '$' => {
                    in_word = true;
                    word.push_str(&self.expand(&mut chars));
                }
                ';' => {
                    flush!();
                    tokens.push(Token::Op(";"));
                }
                '&' if chars.peek() == Some(&'&') => {
                    chars.next();
                    flush!();
                    tokens.push(Token::Op("&&"));
                }
                '|' if chars.peek() == Some(&'|') => {
                    chars.next();
                    flush!();
                    tokens.push(Token::Op("||"));
                }
                '>' => {
                    flush!();
                    match chars.peek() {
                        Some('>') => {
                            chars.next();
                            tokens.push(Token::Op(">>"));
                        }
                        Some('&') => {
                            chars.next();
                            chars.next();
                            tokens.push(Token::Op(">&2"));
                        }
                        _ => tokens.push(Token::Op(">")),
                    }
                }
                _ => {
                    in_word = true;
                    word.push(c);
                }
            }
        }
        flush!();
        tokens
    }

    fn expand(&self, chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> String {
        let name: String = match chars.peek() {
            Some('?') => {
                chars.next();
                return self.last_status.to_string();
            }
            Some('{') => {
                chars.next();
                chars.by_ref().take_while(|c| *c != '}').collect()
            }
            _ => {
                let mut name = String::new();
                while let Some(c) = chars.peek() {
                    if c.is_ascii_alphanumeric() || *c == '_' {
                        name.push(*c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                if name.is_empty() {
                    return "$".to_string();
                }
                name
            }
        };
        self.env.get(&name).cloned().unwrap_or_default()
    }
}

/// Collect a whole exec stream into (stdout, stderr, exit status).
pub async fn collect(mut stream: ExecStream) -> Result<(String, String, i32)> {
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    while let Some(frame) = stream.next().await {
        match frame? {
            ExecFrame::Stdout(bytes) => stdout.extend(bytes),
            ExecFrame::Stderr(bytes) => stderr.extend(bytes),
            ExecFrame::Exit(code) => {
                return Ok((
                    String::from_utf8_lossy(&stdout).into_owned(),
                    String::from_utf8_lossy(&stderr).into_owned(),
                    code,
                ));
            }
        }
    }
    Err(Error::Channel("stream ended without exit status".to_string()))
}
