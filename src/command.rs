//! Parsing of node command lines emitted by the launch evaluator.
//!
//! The evaluator prints one shell command per node. On Unix this is a plain
//! `KEY=VALUE ... /path/to/exe args` line; on Windows the real command is
//! wrapped in `cmd /c "set KEY=VALUE && ... exe args"` and paths contain
//! unescaped backslashes.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;
use thiserror::Error;

/// Host platform flavour, which decides quoting and wrapper handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Unix,
    Windows,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(windows) {
            Platform::Windows
        } else {
            Platform::Unix
        }
    }
}

/// A node command split into its parts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ParsedCommand {
    /// Executable path, as written in the command line.
    pub executable: String,
    /// Arguments following the executable.
    pub args: Vec<String>,
    /// Leading `KEY=VALUE` assignments, in key order.
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("invalid shell quoting: {0}")]
    Quoting(#[from] shell_words::ParseError),
    #[error("command line contains no executable")]
    Empty,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Word(String),
    Operator(String),
}

impl Token {
    fn into_text(self) -> String {
        match self {
            Token::Word(text) | Token::Operator(text) => text,
        }
    }
}

fn assignment_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\w+)=(.*)$").expect("assignment regex is valid"))
}

/// Parses a single command line into executable, arguments and environment.
pub fn parse_command(line: &str, platform: Platform) -> Result<ParsedCommand, CommandError> {
    let tokens = tokenize(line, platform)?;
    let mut tokens = tokens.into_iter().peekable();
    let mut env = BTreeMap::new();

    while let Some(token) = tokens.peek() {
        match token {
            Token::Operator(_) if platform == Platform::Windows => {
                tokens.next();
            }
            Token::Word(word)
                if platform == Platform::Windows && word.eq_ignore_ascii_case("set") =>
            {
                tokens.next();
            }
            Token::Word(word) => {
                let Some(caps) = assignment_regex().captures(word) else {
                    break;
                };
                env.insert(caps[1].to_string(), caps[2].to_string());
                tokens.next();
            }
            Token::Operator(_) => break,
        }
    }

    let executable = tokens.next().ok_or(CommandError::Empty)?.into_text();
    let args = tokens.map(Token::into_text).collect();
    Ok(ParsedCommand {
        executable,
        args,
        env,
    })
}

fn tokenize(line: &str, platform: Platform) -> Result<Vec<Token>, CommandError> {
    let words = match platform {
        Platform::Unix => shell_words::split(line)?,
        // Backslashes are path separators here, not escapes.
        Platform::Windows => shell_words::split(&line.replace('\\', "\\\\"))?,
    };

    if platform == Platform::Windows && is_cmd_wrapper(&words) {
        return tokenize(&words[2], platform);
    }

    if platform == Platform::Unix {
        return Ok(words.into_iter().map(Token::Word).collect());
    }

    let mut tokens = Vec::with_capacity(words.len());
    for word in words {
        if word == "&&" {
            tokens.push(Token::Operator(word));
        } else if let Some(head) = word.strip_suffix("&&") {
            tokens.push(Token::Word(head.to_string()));
            tokens.push(Token::Operator("&&".to_string()));
        } else {
            tokens.push(Token::Word(word));
        }
    }
    Ok(tokens)
}

fn is_cmd_wrapper(words: &[String]) -> bool {
    if words.len() < 3 {
        return false;
    }
    let shell = words[0].to_ascii_lowercase();
    let is_cmd = shell == "cmd" || shell == "cmd.exe" || shell.ends_with("\\cmd.exe");
    is_cmd && words[1].eq_ignore_ascii_case("/c")
}

/// Renders a command back into a single shell-quoted line.
pub fn render(command: &ParsedCommand) -> String {
    let env = command.env.iter().map(|(k, v)| format!("{k}={v}"));
    let parts: Vec<String> = env
        .chain(std::iter::once(command.executable.clone()))
        .chain(command.args.iter().cloned())
        .collect();
    shell_words::join(parts)
}
