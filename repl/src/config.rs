//! REPL configuration record.
//!
//! The startup script returns a record configuring the shell:
//! `builtin-commands` (the only builtin is `cd`), `aliased-commands`
//! (globals equivalent to `ex <name> ...`) and `prompt` (a list of parts,
//! each a string, a lazy zero-argument function, or a `[part, color]`
//! pair).

use std::sync::Arc;

use crossterm::style::Color;

use tern_engine::{FuncValue, State, Value, Verb, VerbFut};
use tern_runtime::{Context, RtError};
use tern_verbs::ex::AliasVerb;

#[derive(Clone)]
pub enum PromptLeaf {
    Text(String),
    Lazy(Arc<FuncValue>),
}

#[derive(Clone)]
pub struct PromptPart {
    pub leaf: PromptLeaf,
    pub color: Option<Color>,
}

#[derive(Clone)]
pub struct ReplConfig {
    pub builtin_commands: Vec<String>,
    pub aliased_commands: Vec<String>,
    pub prompt: Vec<PromptPart>,
}

impl Default for ReplConfig {
    fn default() -> Self {
        Self {
            builtin_commands: Vec::new(),
            aliased_commands: Vec::new(),
            prompt: vec![PromptPart {
                leaf: PromptLeaf::Text("> ".to_string()),
                color: None,
            }],
        }
    }
}

fn string_list(value: Option<Value>, key: &str) -> Result<Vec<String>, RtError> {
    let Some(value) = value else {
        return Ok(Vec::new());
    };
    let Value::List(items) = value else {
        return Err(RtError::invalid_args(format!("'{key}' must be a list")));
    };
    let items = items
        .read()
        .map_err(|_| RtError::Eval("poisoned list lock".into()))?;
    items
        .iter()
        .map(|item| match item {
            Value::Str(s) => Ok(s.clone()),
            other => Err(RtError::invalid_args(format!(
                "'{key}' entries must be identifiers, got {}",
                other.type_name()
            ))),
        })
        .collect()
}

fn prompt_part(value: &Value) -> Result<PromptPart, RtError> {
    match value {
        Value::Str(s) => Ok(PromptPart {
            leaf: PromptLeaf::Text(s.clone()),
            color: None,
        }),
        Value::Func(f) => Ok(PromptPart {
            leaf: PromptLeaf::Lazy(Arc::clone(f)),
            color: None,
        }),
        Value::List(pair) => {
            let pair = pair
                .read()
                .map_err(|_| RtError::Eval("poisoned list lock".into()))?;
            if pair.len() != 2 {
                return Err(RtError::invalid_args(
                    "colored prompt parts are [part, color] pairs",
                ));
            }
            let mut part = prompt_part(&pair[0])?;
            if let Value::Str(name) = &pair[1] {
                // Unrecognized color identifiers fall back to the default.
                part.color = color_by_name(name);
            }
            Ok(part)
        }
        other => Err(RtError::invalid_args(format!(
            "prompt parts are strings, functions or pairs, got {}",
            other.type_name()
        ))),
    }
}

impl ReplConfig {
    /// Read the configuration record returned by the startup script.
    pub fn from_value(value: &Value) -> Result<Self, RtError> {
        if !matches!(value, Value::Object(_)) {
            return Err(RtError::invalid_args(format!(
                "the startup script must return a record, got {}",
                value.type_name()
            )));
        }
        let builtin_commands = string_list(value.memb("builtin-commands"), "builtin-commands")?;
        for builtin in &builtin_commands {
            if builtin != "cd" {
                return Err(RtError::invalid_args(format!(
                    "unknown builtin command '{builtin}'"
                )));
            }
        }
        let aliased_commands = string_list(value.memb("aliased-commands"), "aliased-commands")?;
        let prompt = match value.memb("prompt") {
            None => ReplConfig::default().prompt,
            Some(Value::List(parts)) => {
                let parts = parts
                    .read()
                    .map_err(|_| RtError::Eval("poisoned list lock".into()))?;
                parts.iter().map(prompt_part).collect::<Result<_, _>>()?
            }
            Some(other) => {
                return Err(RtError::invalid_args(format!(
                    "'prompt' must be a list, got {}",
                    other.type_name()
                )));
            }
        };
        Ok(Self {
            builtin_commands,
            aliased_commands,
            prompt,
        })
    }

    /// Install aliases and builtins into the global scope. A collision
    /// with an existing global is fatal.
    pub fn install(&self, state: &mut State) -> Result<(), RtError> {
        for name in &self.aliased_commands {
            state.declare_unique(name, Value::native(Arc::new(AliasVerb::new(name.clone()))))?;
        }
        for builtin in &self.builtin_commands {
            if builtin == "cd" {
                state.declare_unique("cd", Value::native(Arc::new(CdVerb)))?;
            }
        }
        Ok(())
    }
}

#[must_use]
pub fn color_by_name(name: &str) -> Option<Color> {
    Some(match name {
        "black" => Color::Black,
        "red" => Color::DarkRed,
        "green" => Color::DarkGreen,
        "yellow" => Color::DarkYellow,
        "blue" => Color::DarkBlue,
        "magenta" => Color::DarkMagenta,
        "cyan" => Color::DarkCyan,
        "white" => Color::Grey,
        "bright-red" => Color::Red,
        "bright-green" => Color::Green,
        "bright-yellow" => Color::Yellow,
        "bright-blue" => Color::Blue,
        "bright-magenta" => Color::Magenta,
        "bright-cyan" => Color::Cyan,
        "bright-white" => Color::White,
        _ => return None,
    })
}

/// `cd <dir-path/>`: changes the process working directory. The cwd is
/// process-global shared state; this is not task-safe.
struct CdVerb;

impl Verb for CdVerb {
    fn name(&self) -> &'static str {
        "cd"
    }
    fn call<'a>(&'a self, _ctx: &'a Context, args: Vec<Value>) -> VerbFut<'a> {
        Box::pin(async move {
            let mut iter = args.into_iter();
            let dir = match (iter.next(), iter.next()) {
                (Some(Value::Path(p)), None) if p.is_dir() => p,
                _ => {
                    return Err(RtError::invalid_args(
                        "cd takes a single directory path ending in '/'",
                    ));
                }
            };
            std::env::set_current_dir(dir.as_str())?;
            Ok(Value::Nil)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{color_by_name, PromptLeaf, ReplConfig};
    use crossterm::style::Color;
    use tern_engine::{State, Value};

    fn config_record() -> Value {
        Value::object([
            (
                "builtin-commands".into(),
                Value::list([Value::Str("cd".into())]),
            ),
            (
                "aliased-commands".into(),
                Value::list([Value::Str("echo".into())]),
            ),
            (
                "prompt".into(),
                Value::list([
                    Value::Str("tern".into()),
                    Value::list([Value::Str("> ".into()), Value::Str("bright-cyan".into())]),
                ]),
            ),
        ])
    }

    #[test]
    fn parses_a_full_record() {
        let cfg = ReplConfig::from_value(&config_record()).unwrap();
        assert_eq!(cfg.builtin_commands, vec!["cd"]);
        assert_eq!(cfg.aliased_commands, vec!["echo"]);
        assert_eq!(cfg.prompt.len(), 2);
        assert!(matches!(cfg.prompt[0].leaf, PromptLeaf::Text(ref s) if s == "tern"));
        assert_eq!(cfg.prompt[1].color, Some(Color::Cyan));
    }

    #[test]
    fn unknown_color_falls_back_to_default() {
        let record = Value::object([(
            "prompt".into(),
            Value::list([Value::list([
                Value::Str("> ".into()),
                Value::Str("chartreuse".into()),
            ])]),
        )]);
        let cfg = ReplConfig::from_value(&record).unwrap();
        assert_eq!(cfg.prompt[0].color, None);
    }

    #[test]
    fn unknown_builtin_is_rejected() {
        let record = Value::object([(
            "builtin-commands".into(),
            Value::list([Value::Str("rm".into())]),
        )]);
        assert!(ReplConfig::from_value(&record).is_err());
    }

    #[test]
    fn alias_collision_is_fatal() {
        let cfg = ReplConfig {
            aliased_commands: vec!["ls".into()],
            ..ReplConfig::default()
        };
        let mut state = State::new();
        state.set("ls", Value::Int(1));
        assert!(cfg.install(&mut state).is_err());
    }

    #[test]
    fn install_adds_alias_and_cd() {
        let cfg = ReplConfig::from_value(&config_record()).unwrap();
        let mut state = State::new();
        cfg.install(&mut state).unwrap();
        assert!(matches!(state.get("echo"), Some(Value::Func(_))));
        assert!(matches!(state.get("cd"), Some(Value::Func(_))));
    }

    #[test]
    fn color_names() {
        assert_eq!(color_by_name("bright-magenta"), Some(Color::Magenta));
        assert_eq!(color_by_name("nope"), None);
    }
}
