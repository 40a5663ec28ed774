//! Shell-style multi-command parser (4.A).
//!
//! `split` tokenizes a line the way a POSIX shell would, with `;` promoted to
//! a command separator and an extended word-character set so IRC-flavoured
//! punctuation (nicks, hostmasks, glob masks) doesn't need quoting. This is a
//! hand-rolled state machine, not a wrapper around `clap`'s own tokenizer or
//! any `shlex`-alike crate: only the per-command flag schema below reuses
//! `clap`.

use crate::error::CommandError;
use std::collections::HashMap;

/// Characters that are never "special" and may appear unquoted in a word,
/// beyond the default alphanumeric/`-`/`_` set shlex would already allow.
const EXTRA_WORD_CHARS: &str = "!#$%&()*+,-./:<=>?@[]^_`{|}~";

/// Splits `text` into one or more commands, each a list of tokens, following
/// POSIX shell quoting rules with `;` as an additional (unquoted) separator.
pub fn split(text: &str) -> Result<Vec<Vec<String>>, CommandError> {
    let mut commands = Vec::new();
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;

    #[derive(PartialEq)]
    enum State {
        Normal,
        Single,
        Double,
    }
    let mut state = State::Normal;

    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        match state {
            State::Normal => match c {
                '\'' => {
                    state = State::Single;
                    in_word = true;
                }
                '"' => {
                    state = State::Double;
                    in_word = true;
                }
                '\\' => {
                    if let Some(next) = chars.next() {
                        current.push(next);
                        in_word = true;
                    }
                }
                ';' => {
                    if in_word {
                        words.push(std::mem::take(&mut current));
                        in_word = false;
                    }
                    commands.push(std::mem::take(&mut words));
                }
                c if c.is_whitespace() => {
                    if in_word {
                        words.push(std::mem::take(&mut current));
                        in_word = false;
                    }
                }
                c if c.is_alphanumeric() || EXTRA_WORD_CHARS.contains(c) || c == '_' => {
                    current.push(c);
                    in_word = true;
                }
                c => {
                    // anything else is still accepted as a bare word character;
                    // this parser only special-cases quotes, backslash, `;` and
                    // whitespace, matching the extended word-character intent.
                    current.push(c);
                    in_word = true;
                }
            },
            State::Single => {
                if c == '\'' {
                    state = State::Normal;
                } else {
                    current.push(c);
                }
            }
            State::Double => match c {
                '"' => state = State::Normal,
                '\\' => {
                    if let Some(&next) = chars.peek() {
                        if matches!(next, '"' | '\\' | '$' | '`') {
                            current.push(next);
                            chars.next();
                        } else {
                            current.push(c);
                        }
                    } else {
                        current.push(c);
                    }
                }
                c => current.push(c),
            },
        }
    }

    if state != State::Normal {
        return Err(CommandError::new("unterminated quote"));
    }
    if in_word {
        words.push(current);
    }
    if !words.is_empty() {
        commands.push(words);
    }

    Ok(commands)
}

/// Registry of `clap` schemas keyed by uppercased command name, used both to
/// validate/parse a command's arguments and to render `HELP`.
#[derive(Default)]
pub struct CommandTable {
    order: Vec<String>,
    schemas: HashMap<String, clap::Command>,
}

impl CommandTable {
    pub fn new() -> Self {
        CommandTable::default()
    }

    /// Registers a command schema. `cmd.get_name()` becomes the command name
    /// (case-insensitively matched, stored uppercased) and `cmd.get_about()`
    /// becomes its one-line HELP description.
    pub fn register(&mut self, cmd: clap::Command) {
        let name = cmd.get_name().to_uppercase();
        self.order.push(name.clone());
        self.schemas.insert(name, cmd);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.schemas.contains_key(name)
    }

    /// Parses `tokens` (first token already consumed as the command name)
    /// against the registered schema for `name`.
    pub fn parse(&self, name: &str, tokens: Vec<String>) -> Result<clap::ArgMatches, CommandError> {
        let schema = self
            .schemas
            .get(name)
            .ok_or_else(|| CommandError::new(format!("Unknown command \"{name}\", type HELP for list")))?;
        let mut schema = schema.clone();
        let argv = std::iter::once(name.to_string()).chain(tokens);
        schema
            .try_get_matches_from_mut(argv)
            .map_err(|e| CommandError::new(render_clap_error(&e)))
    }

    /// Renders the built-in `HELP` listing, in registration order.
    pub fn help(&self) -> String {
        let mut out = vec!["Following commands are supported:".to_string(), String::new()];
        for name in &self.order {
            let cmd = &self.schemas[name];
            let about = cmd
                .get_about()
                .map(|s| s.to_string())
                .unwrap_or_default();
            out.push(format!("\t{name} - {about}"));
        }
        out.push(String::new());
        out.push("To get more help, add -h to any command without arguments.".to_string());
        out.join("\n")
    }
}

fn render_clap_error(e: &clap::Error) -> String {
    // clap renders its own multi-line usage/help text; strip the trailing
    // newline clap always adds so callers get a single notice body.
    e.render().to_string().trim_end().to_string()
}

/// Splits `text` and, for the first resulting command only, returns its
/// uppercased name plus the remaining tokens. Callers that support multiple
/// `;`-separated commands should call `split` directly and loop.
pub fn first_command(text: &str) -> Result<Option<(String, Vec<String>)>, CommandError> {
    let commands = split(text)?;
    let Some(mut tokens) = commands.into_iter().next() else {
        return Ok(None);
    };
    if tokens.is_empty() {
        return Ok(None);
    }
    let name = tokens.remove(0).to_uppercase();
    Ok(Some((name, tokens)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_unquoted_semicolon() {
        let commands = split("NICK foo; JOIN #bar").unwrap();
        assert_eq!(commands, vec![vec!["NICK", "foo"], vec!["JOIN", "#bar"]]);
    }

    #[test]
    fn semicolon_inside_quotes_is_literal() {
        let commands = split("MSG bob 'see you; later'").unwrap();
        assert_eq!(commands, vec![vec!["MSG", "bob", "see you; later"]]);
    }

    #[test]
    fn extended_word_chars_need_no_quoting() {
        let commands = split("ADDMASK @friend:contoso.com --admin").unwrap();
        assert_eq!(
            commands,
            vec![vec!["ADDMASK", "@friend:contoso.com", "--admin"]]
        );
    }

    #[test]
    fn double_quote_backslash_escapes() {
        let commands = split(r#"RAW "say \"hi\"""#).unwrap();
        assert_eq!(commands, vec![vec!["RAW", "say \"hi\""]]);
    }

    #[test]
    fn unterminated_quote_is_a_command_error() {
        assert!(split("MSG bob 'oops").is_err());
    }

    #[test]
    fn table_help_lists_registered_commands_in_order() {
        let mut table = CommandTable::new();
        table.register(clap::Command::new("nick").about("Change nickname"));
        table.register(clap::Command::new("join").about("Join a channel"));
        let help = table.help();
        assert!(help.find("NICK").unwrap() < help.find("JOIN").unwrap());
    }

    #[test]
    fn unknown_command_is_a_parser_error() {
        let table = CommandTable::new();
        let err = table.parse("NICK", vec![]).unwrap_err();
        assert!(err.0.contains("Unknown command"));
    }
}
