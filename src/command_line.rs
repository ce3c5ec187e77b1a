use crate::error::RunnerError;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::collections::BTreeMap;

/// Console port the board mock listens on unless `--tcp-port` says otherwise.
pub const DEFAULT_CONSOLE_PORT: u16 = 1105;

static TCP_PORT_FLAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"--tcp-port\s+(\d+)").expect("valid --tcp-port pattern"));

/// A program plus its arguments, ready to hand to `tokio::process::Command`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandLine {
    /// Parses a shell-like command string into words.
    pub fn parse(raw: &str) -> Result<Self, RunnerError> {
        let mut words = split_words(raw)?.into_iter();
        let program = words
            .next()
            .ok_or_else(|| RunnerError::InvalidConfig("empty command line".to_string()))?;
        Ok(Self {
            program,
            args: words.collect(),
        })
    }

    pub fn extend<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// The command as a single printable string.
    pub fn display(&self) -> String {
        std::iter::once(&self.program)
            .chain(self.args.iter())
            .map(|w| {
                if w.is_empty() || w.contains(char::is_whitespace) {
                    format!("'{}'", w)
                } else {
                    w.clone()
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Splits a command string on whitespace honoring single quotes, double quotes and
/// backslash escapes (outside single quotes).
pub fn split_words(raw: &str) -> Result<Vec<String>, RunnerError> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = raw.chars();

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(ch) => current.push(ch),
                        None => return Err(unterminated(raw)),
                    }
                }
            }
            '"' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(ch @ ('"' | '\\')) => current.push(ch),
                            Some(ch) => {
                                current.push('\\');
                                current.push(ch);
                            }
                            None => return Err(unterminated(raw)),
                        },
                        Some(ch) => current.push(ch),
                        None => return Err(unterminated(raw)),
                    }
                }
            }
            '\\' => {
                in_word = true;
                if let Some(ch) = chars.next() {
                    current.push(ch);
                }
            }
            c if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            c => {
                in_word = true;
                current.push(c);
            }
        }
    }

    if in_word {
        words.push(current);
    }
    Ok(words)
}

fn unterminated(raw: &str) -> RunnerError {
    RunnerError::InvalidConfig(format!("unterminated quote in command: {}", raw))
}

/// Substitutes `{uuid}` and `{port}` in an argument template.
pub fn expand_placeholders(template: &str, uuid: &str, port: u16) -> String {
    template
        .replace("{uuid}", uuid)
        .replace("{port}", &port.to_string())
}

/// Extracts the `--tcp-port N` value from mock arguments.
pub fn console_port(args: &str) -> u16 {
    TCP_PORT_FLAG
        .captures(args)
        .and_then(|caps| caps[1].parse().ok())
        .unwrap_or(DEFAULT_CONSOLE_PORT)
}

/// Turns a stressor argument map into command-line flags.
///
/// `true` becomes a bare flag, `false`, `null` and empty strings are dropped, lists
/// repeat the flag per item and everything else becomes `--flag value`. Underscores
/// in keys become dashes.
pub fn flatten_args(args: &BTreeMap<String, Value>) -> Vec<String> {
    let mut out = Vec::new();
    for (key, value) in args {
        let flag = format!("--{}", key.replace('_', "-"));
        match value {
            Value::Bool(true) => out.push(flag),
            Value::Bool(false) | Value::Null => {}
            Value::String(s) if s.is_empty() => {}
            Value::Array(items) => {
                for item in items {
                    out.push(flag.clone());
                    out.push(scalar(item));
                }
            }
            other => {
                out.push(flag);
                out.push(scalar(other));
            }
        }
    }
    out
}

fn scalar(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
