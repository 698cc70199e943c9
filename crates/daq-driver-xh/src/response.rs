//! Classification of control-channel lines.
//!
//! Every line the server sends starts with a sentinel:
//!
//! | Sentinel | Meaning |
//! |----------|---------|
//! | `>`      | prompt, ready for the next command |
//! | `!`      | error message, kept as the last error |
//! | `#`      | debug message |
//! | `@`      | progress / time-bar message |
//! | `*`      | return value of the pending command |

/// Value carried by a `*` line.
#[derive(Debug, Clone, PartialEq)]
pub enum ReturnValue {
    /// `(null)`: a string command failed
    Null,
    /// Quoted string
    Text(String),
    /// Bare numeric token (integer, float or `nan`)
    Number(String),
}

impl ReturnValue {
    /// Integer value; a finite float token is truncated.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            ReturnValue::Number(token) => token.parse().ok().or_else(|| {
                token
                    .parse::<f64>()
                    .ok()
                    .filter(|v| v.is_finite())
                    .map(|v| v.trunc() as i64)
            }),
            _ => None,
        }
    }

    /// Floating value; `nan` is accepted.
    pub fn as_double(&self) -> Option<f64> {
        match self {
            ReturnValue::Number(token) if token.eq_ignore_ascii_case("nan") => Some(f64::NAN),
            ReturnValue::Number(token) => token.parse().ok(),
            _ => None,
        }
    }

    /// Short description used in mismatch errors.
    pub fn describe(&self) -> String {
        match self {
            ReturnValue::Null => "(null)".to_string(),
            ReturnValue::Text(s) => format!("string \"{}\"", s),
            ReturnValue::Number(n) => format!("number {}", n),
        }
    }
}

/// One classified line from the control channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerLine {
    /// `>`
    Prompt,
    /// `! text`
    Error(String),
    /// `# text`
    Debug(String),
    /// `@ done total 'text'`
    Progress {
        /// Completed units
        done: u64,
        /// Total units
        total: u64,
        /// Label
        message: String,
    },
    /// `* value`
    Return(ReturnValue),
    /// Anything else
    Unknown(String),
}

impl ServerLine {
    /// Classify a line without its terminator.
    pub fn parse(line: &str) -> Self {
        let mut chars = line.chars();
        match chars.next() {
            Some('>') => ServerLine::Prompt,
            Some('!') => ServerLine::Error(chars.as_str().trim().to_string()),
            Some('#') => ServerLine::Debug(chars.as_str().trim().to_string()),
            Some('@') => parse_progress(chars.as_str()),
            Some('*') => ServerLine::Return(parse_return(chars.as_str())),
            _ => ServerLine::Unknown(line.to_string()),
        }
    }
}

fn parse_return(body: &str) -> ReturnValue {
    let body = body.trim_start();
    if body.starts_with('(') {
        return ReturnValue::Null;
    }
    if let Some(quoted) = body.strip_prefix('"') {
        let text = match quoted.find('"') {
            Some(end) => &quoted[..end],
            None => quoted,
        };
        return ReturnValue::Text(text.to_string());
    }
    let token = body.split_whitespace().next().unwrap_or_default();
    ReturnValue::Number(token.to_string())
}

fn parse_progress(body: &str) -> ServerLine {
    let mut parts = body.trim().splitn(3, char::is_whitespace);
    let done = parts.next().and_then(|t| t.parse().ok()).unwrap_or(0);
    let total = parts.next().and_then(|t| t.parse().ok()).unwrap_or(0);
    let message = parts
        .next()
        .unwrap_or_default()
        .trim()
        .trim_matches(|c| c == '\'' || c == '"')
        .to_string();
    ServerLine::Progress {
        done,
        total,
        message,
    }
}
