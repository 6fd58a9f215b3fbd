//! Structured device actions and the call syntax the model emits them in:
//! `do(action="Tap", element=[500, 300])` or `finish(message="done")`.
//!
//! Coordinates are relative, on a 0..1000 grid in both axes; executors scale
//! them to the captured frame.

use serde_json::{json, Map, Value};

use crate::error::AgentError;

pub const FINISH_MARKER: &str = "finish(message=";
pub const DO_MARKER: &str = "do(action=";

#[derive(Clone, Debug, PartialEq)]
pub enum Action {
    Launch { app: String },
    /// `message` is set when the model flags the tap as sensitive (payment, deletion).
    Tap { element: [i32; 2], message: Option<String> },
    DoubleTap { element: [i32; 2] },
    LongPress { element: [i32; 2] },
    Type { text: String },
    Swipe { start: [i32; 2], end: [i32; 2] },
    Back,
    Home,
    Wait { seconds: f64 },
    TakeOver { message: Option<String> },
    Finish { message: Option<String> },
    /// A `do(...)` call naming an action this crate does not know.
    Unknown { name: String, params: Map<String, Value> },
}

impl Action {
    pub fn is_finish(&self) -> bool {
        matches!(self, Action::Finish { .. })
    }

    /// The `action` tag as it appears in the call syntax. `None` for `finish`.
    pub fn action_type(&self) -> Option<&str> {
        let name = match self {
            Action::Launch { .. } => "Launch",
            Action::Tap { .. } => "Tap",
            Action::DoubleTap { .. } => "Double Tap",
            Action::LongPress { .. } => "Long Press",
            Action::Type { .. } => "Type",
            Action::Swipe { .. } => "Swipe",
            Action::Back => "Back",
            Action::Home => "Home",
            Action::Wait { .. } => "Wait",
            Action::TakeOver { .. } => "Take_over",
            Action::Finish { .. } => return None,
            Action::Unknown { name, .. } => name.as_str(),
        };
        Some(name)
    }

    pub fn message(&self) -> Option<&str> {
        match self {
            Action::Tap { message, .. }
            | Action::TakeOver { message }
            | Action::Finish { message } => message.as_deref(),
            _ => None,
        }
    }

    /// Dict-shaped view used for recording: `_metadata` is `do`/`finish`, the
    /// remaining keys mirror the call arguments.
    pub fn to_payload(&self) -> Value {
        let mut map = Map::new();
        if let Action::Finish { message } = self {
            map.insert("_metadata".into(), json!("finish"));
            map.insert("message".into(), json!(message));
            return Value::Object(map);
        }
        map.insert("_metadata".into(), json!("do"));
        if let Some(name) = self.action_type() {
            map.insert("action".into(), json!(name));
        }
        match self {
            Action::Launch { app } => {
                map.insert("app".into(), json!(app));
            }
            Action::Tap { element, message } => {
                map.insert("element".into(), json!(element));
                if let Some(message) = message {
                    map.insert("message".into(), json!(message));
                }
            }
            Action::DoubleTap { element } | Action::LongPress { element } => {
                map.insert("element".into(), json!(element));
            }
            Action::Type { text } => {
                map.insert("text".into(), json!(text));
            }
            Action::Swipe { start, end } => {
                map.insert("start".into(), json!(start));
                map.insert("end".into(), json!(end));
            }
            Action::Wait { seconds } => {
                map.insert("duration".into(), json!(format!("{seconds} seconds")));
            }
            Action::TakeOver { message } => {
                map.insert("message".into(), json!(message));
            }
            Action::Unknown { params, .. } => {
                for (key, value) in params {
                    if key != "action" {
                        map.insert(key.clone(), value.clone());
                    }
                }
            }
            Action::Back | Action::Home | Action::Finish { .. } => {}
        }
        Value::Object(map)
    }
}

/// Parses one model action call. Errors when the text is not a well-formed
/// `do(...)`/`finish(...)` call or lacks a required argument.
pub fn parse_action(text: &str) -> Result<Action, AgentError> {
    let text = text.trim();
    if text.starts_with("finish(") {
        let message = match parse_call(text) {
            Ok((_, mut args)) => args.remove("message").map(value_to_text),
            Err(_) => Some(loose_finish_message(text)),
        };
        return Ok(Action::Finish { message });
    }
    if !text.starts_with("do(") {
        return Err(AgentError::Action(format!("unrecognized action call: {text}")));
    }
    let (_, args) = parse_call(text).map_err(AgentError::Action)?;
    build_do_action(args)
}

fn build_do_action(mut args: Map<String, Value>) -> Result<Action, AgentError> {
    let name = match args.get("action") {
        Some(Value::String(name)) => name.clone(),
        _ => return Err(AgentError::Action("do() call without an action name".into())),
    };
    let action = match name.as_str() {
        "Launch" => Action::Launch {
            app: required_text(&args, "app")?,
        },
        "Tap" => Action::Tap {
            element: point(&args, "element")?,
            message: args.remove("message").map(value_to_text),
        },
        "Double Tap" => Action::DoubleTap {
            element: point(&args, "element")?,
        },
        "Long Press" => Action::LongPress {
            element: point(&args, "element")?,
        },
        "Type" | "Type_Name" => Action::Type {
            text: required_text(&args, "text")?,
        },
        "Swipe" => Action::Swipe {
            start: point(&args, "start")?,
            end: point(&args, "end")?,
        },
        "Back" => Action::Back,
        "Home" => Action::Home,
        "Wait" => Action::Wait {
            seconds: args.get("duration").map(parse_seconds).unwrap_or(1.0),
        },
        "Take_over" => Action::TakeOver {
            message: args.remove("message").map(value_to_text),
        },
        _ => {
            args.remove("action");
            Action::Unknown { name, params: args }
        }
    };
    Ok(action)
}

fn required_text(args: &Map<String, Value>, key: &str) -> Result<String, AgentError> {
    args.get(key)
        .cloned()
        .map(value_to_text)
        .ok_or_else(|| AgentError::Action(format!("missing argument `{key}`")))
}

fn point(args: &Map<String, Value>, key: &str) -> Result<[i32; 2], AgentError> {
    let coords = args
        .get(key)
        .and_then(Value::as_array)
        .ok_or_else(|| AgentError::Action(format!("missing coordinate `{key}`")))?;
    let axis = |idx: usize| {
        coords
            .get(idx)
            .and_then(Value::as_f64)
            .map(|v| v.round() as i32)
            .ok_or_else(|| AgentError::Action(format!("malformed coordinate `{key}`")))
    };
    Ok([axis(0)?, axis(1)?])
}

fn parse_seconds(value: &Value) -> f64 {
    match value {
        Value::Number(n) => n.as_f64().unwrap_or(1.0),
        Value::String(s) => s
            .trim()
            .trim_end_matches("seconds")
            .trim_end_matches("second")
            .trim_end_matches('s')
            .trim()
            .parse()
            .unwrap_or(1.0),
        _ => 1.0,
    }
}

fn value_to_text(value: Value) -> String {
    match value {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

/// Last-resort extraction for `finish(message=...)` whose quoting is broken.
fn loose_finish_message(text: &str) -> String {
    let body = text.strip_prefix(FINISH_MARKER).unwrap_or(text);
    let body = body.trim_end().strip_suffix(')').unwrap_or(body);
    body.trim()
        .trim_matches(|c| c == '"' || c == '\'')
        .to_string()
}

fn parse_call(text: &str) -> Result<(String, Map<String, Value>), String> {
    let open = text.find('(').ok_or("missing `(`")?;
    let close = text.rfind(')').ok_or("missing `)`")?;
    if close < open {
        return Err("unbalanced call".into());
    }
    let name = text[..open].trim().to_string();
    let mut parser = ArgParser::new(&text[open + 1..close]);
    let args = parser.arguments()?;
    Ok((name, args))
}

struct ArgParser {
    chars: Vec<char>,
    pos: usize,
}

impl ArgParser {
    fn new(src: &str) -> Self {
        Self {
            chars: src.chars().collect(),
            pos: 0,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        Some(c)
    }

    fn skip_ws(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.pos += 1;
        }
    }

    fn expect(&mut self, want: char) -> Result<(), String> {
        self.skip_ws();
        match self.bump() {
            Some(c) if c == want => Ok(()),
            Some(c) => Err(format!("expected `{want}`, found `{c}`")),
            None => Err(format!("expected `{want}`, found end of input")),
        }
    }

    fn arguments(&mut self) -> Result<Map<String, Value>, String> {
        let mut args = Map::new();
        loop {
            self.skip_ws();
            if self.peek().is_none() {
                return Ok(args);
            }
            let key = self.identifier()?;
            self.expect('=')?;
            let value = self.value()?;
            args.insert(key, value);
            self.skip_ws();
            match self.bump() {
                None => return Ok(args),
                Some(',') => continue,
                Some(c) => return Err(format!("unexpected `{c}` after argument")),
            }
        }
    }

    fn identifier(&mut self) -> Result<String, String> {
        self.skip_ws();
        let start = self.pos;
        while self.peek().is_some_and(|c| c.is_alphanumeric() || c == '_') {
            self.pos += 1;
        }
        if start == self.pos {
            return Err("expected argument name".into());
        }
        Ok(self.chars[start..self.pos].iter().collect())
    }

    fn value(&mut self) -> Result<Value, String> {
        self.skip_ws();
        match self.peek() {
            Some(q @ ('"' | '\'')) => self.string(q).map(Value::String),
            Some('[') => self.list(),
            Some(c) if c == '-' || c.is_ascii_digit() => self.number(),
            Some(_) => {
                let word = self.identifier()?;
                Ok(match word.as_str() {
                    "True" | "true" => Value::Bool(true),
                    "False" | "false" => Value::Bool(false),
                    "None" | "null" => Value::Null,
                    _ => Value::String(word),
                })
            }
            None => Err("expected value, found end of input".into()),
        }
    }

    fn string(&mut self, quote: char) -> Result<String, String> {
        self.bump();
        let mut out = String::new();
        loop {
            match self.bump() {
                None => return Err("unterminated string".into()),
                Some('\\') => match self.bump() {
                    Some('n') => out.push('\n'),
                    Some('t') => out.push('\t'),
                    Some(c) => out.push(c),
                    None => return Err("unterminated escape".into()),
                },
                Some(c) if c == quote => return Ok(out),
                Some(c) => out.push(c),
            }
        }
    }

    fn list(&mut self) -> Result<Value, String> {
        self.bump();
        let mut items = Vec::new();
        loop {
            self.skip_ws();
            if self.peek() == Some(']') {
                self.bump();
                return Ok(Value::Array(items));
            }
            items.push(self.value()?);
            self.skip_ws();
            match self.bump() {
                Some(',') => continue,
                Some(']') => return Ok(Value::Array(items)),
                Some(c) => return Err(format!("unexpected `{c}` in list")),
                None => return Err("unterminated list".into()),
            }
        }
    }

    fn number(&mut self) -> Result<Value, String> {
        let start = self.pos;
        while self
            .peek()
            .is_some_and(|c| c == '-' || c == '.' || c.is_ascii_digit())
        {
            self.pos += 1;
        }
        let raw: String = self.chars[start..self.pos].iter().collect();
        if let Ok(n) = raw.parse::<i64>() {
            return Ok(json!(n));
        }
        raw.parse::<f64>()
            .map(|f| json!(f))
            .map_err(|_| format!("malformed number `{raw}`"))
    }
}
