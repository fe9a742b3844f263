//! Unsolicited event parsing.
//!
//! Modems report asynchronous occurrences (new SMS, USSD replies, network
//! registration changes) as lines of the form:
//!
//! ```text
//! +NAME: arg1,arg2,...
//! ```
//!
//! Each argument is typed on parse:
//! - `"text"` (double-quoted) becomes [`EventArg::Str`] with the quotes stripped
//! - an integer literal becomes [`EventArg::Int`]; one outside the `i64`
//!   range does not fit and falls through to [`EventArg::Float`]
//! - a floating-point literal becomes [`EventArg::Float`]
//! - anything else is kept verbatim as [`EventArg::Str`]
//!
//! A line with nothing after the colon still carries one empty-string
//! argument; callers index arguments positionally and rely on this.

use std::fmt;

use crate::error::{AtError, AtResult};

/// Prefix that marks a line as an unsolicited event.
pub const EVENT_PREFIX: char = '+';

/// A single typed event argument.
#[derive(Debug, Clone, PartialEq)]
pub enum EventArg {
    /// Integer argument.
    Int(i64),
    /// Floating-point argument.
    Float(f64),
    /// Quoted or raw string argument.
    Str(String),
}

impl EventArg {
    /// Classify one trimmed argument token.
    pub fn parse(token: &str) -> EventArg {
        if token.len() >= 2 && token.starts_with('"') && token.ends_with('"') {
            return EventArg::Str(token[1..token.len() - 1].to_string());
        }
        if let Ok(value) = token.parse::<i64>() {
            return EventArg::Int(value);
        }
        if let Ok(value) = token.parse::<f64>() {
            return EventArg::Float(value);
        }
        EventArg::Str(token.to_string())
    }

    /// Get the integer value, if this is an integer.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            EventArg::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Get the float value, if this is a float.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            EventArg::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// Get the string value, if this is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            EventArg::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for EventArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventArg::Int(v) => write!(f, "{}", v),
            EventArg::Float(v) => write!(f, "{}", v),
            EventArg::Str(s) => write!(f, "\"{}\"", s),
        }
    }
}

/// A parsed unsolicited event.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    name: String,
    args: Vec<EventArg>,
}

impl Event {
    /// Build an event from its parts.
    pub fn new(name: impl Into<String>, args: Vec<EventArg>) -> Self {
        Event {
            name: name.into(),
            args,
        }
    }

    /// Parse a raw unsolicited line.
    pub fn parse(line: &str) -> AtResult<Event> {
        let line = line.trim();
        let (name, args_str) = line
            .split_once(':')
            .ok_or_else(|| AtError::MalformedEvent(line.to_string()))?;

        let args = split_args(args_str)
            .into_iter()
            .map(|token| EventArg::parse(token.trim()))
            .collect();

        Ok(Event {
            name: name.trim().to_string(),
            args,
        })
    }

    /// Event name including the leading `+`, e.g. `+CMTI`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// All arguments in order.
    pub fn args(&self) -> &[EventArg] {
        &self.args
    }

    /// Get an argument by index.
    pub fn arg(&self, index: usize) -> AtResult<&EventArg> {
        self.args.get(index).ok_or_else(|| self.mismatch(index, "any"))
    }

    /// Get an integer argument.
    pub fn expect_int(&self, index: usize) -> AtResult<i64> {
        self.args
            .get(index)
            .and_then(EventArg::as_int)
            .ok_or_else(|| self.mismatch(index, "int"))
    }

    /// Get a floating-point argument.
    pub fn expect_float(&self, index: usize) -> AtResult<f64> {
        self.args
            .get(index)
            .and_then(EventArg::as_float)
            .ok_or_else(|| self.mismatch(index, "float"))
    }

    /// Get a string argument.
    pub fn expect_str(&self, index: usize) -> AtResult<&str> {
        self.args
            .get(index)
            .and_then(EventArg::as_str)
            .ok_or_else(|| self.mismatch(index, "string"))
    }

    fn mismatch(&self, index: usize, expected: &'static str) -> AtError {
        AtError::ArgumentMismatch {
            index,
            expected,
            event: self.to_string(),
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.name)?;
        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}", arg)?;
        }
        Ok(())
    }
}

/// Split on commas that are not inside double quotes.
fn split_args(s: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut quoted = false;

    for (i, c) in s.char_indices() {
        match c {
            '"' => quoted = !quoted,
            ',' if !quoted => {
                parts.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&s[start..]);
    parts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cmti() {
        let event = Event::parse("+CMTI: \"ME\",3").unwrap();
        assert_eq!(event.name(), "+CMTI");
        assert_eq!(event.expect_str(0).unwrap(), "ME");
        assert_eq!(event.expect_int(1).unwrap(), 3);
    }

    #[test]
    fn test_argument_typing() {
        let event = Event::parse("+TEST:\"quoted\",42,2.5,raw,-7").unwrap();
        assert_eq!(
            event.args(),
            &[
                EventArg::Str("quoted".to_string()),
                EventArg::Int(42),
                EventArg::Float(2.5),
                EventArg::Str("raw".to_string()),
                EventArg::Int(-7),
            ]
        );
    }

    #[test]
    fn test_integer_beyond_i64_becomes_float() {
        let event = Event::parse("+X:99999999999999999999").unwrap();
        assert_eq!(event.args(), &[EventArg::Float(1e20)]);
    }

    #[test]
    fn test_quoted_number_stays_string() {
        let event = Event::parse("+X:\"42\"").unwrap();
        assert_eq!(event.expect_str(0).unwrap(), "42");
        assert!(event.expect_int(0).is_err());
    }

    #[test]
    fn test_arguments_are_trimmed() {
        let event = Event::parse("+CUSD:  0 , \"Balance\" , 15 ").unwrap();
        assert_eq!(event.expect_int(0).unwrap(), 0);
        assert_eq!(event.expect_str(1).unwrap(), "Balance");
        assert_eq!(event.expect_int(2).unwrap(), 15);
    }

    #[test]
    fn test_no_arguments_yields_single_empty_string() {
        // Positional access downstream depends on this shape.
        let event = Event::parse("+CMS READY:").unwrap();
        assert_eq!(event.name(), "+CMS READY");
        assert_eq!(event.args(), &[EventArg::Str(String::new())]);
    }

    #[test]
    fn test_missing_colon_is_malformed() {
        let err = Event::parse("+CMTI \"ME\",3").unwrap_err();
        assert!(matches!(err, AtError::MalformedEvent(_)));
    }

    #[test]
    fn test_quoted_comma_is_one_argument() {
        let event = Event::parse("+CUSD: 0,\"Balance: 10,50 EUR\",15").unwrap();
        assert_eq!(event.args().len(), 3);
        assert_eq!(event.expect_str(1).unwrap(), "Balance: 10,50 EUR");
    }

    #[test]
    fn test_colon_inside_argument_kept() {
        let event = Event::parse("+CUSD:0,\"Balance: 10\",15").unwrap();
        assert_eq!(event.name(), "+CUSD");
        assert_eq!(event.expect_str(1).unwrap(), "Balance: 10");
    }

    #[test]
    fn test_accessor_errors() {
        let event = Event::parse("+CMTI:\"SM\",1").unwrap();
        assert!(matches!(
            event.expect_int(5),
            Err(AtError::ArgumentMismatch { index: 5, .. })
        ));
        assert!(matches!(
            event.expect_int(0),
            Err(AtError::ArgumentMismatch { index: 0, expected: "int", .. })
        ));
        assert!(event.expect_float(1).is_err());
        assert!(event.arg(1).is_ok());
        assert!(event.arg(2).is_err());
    }

    #[test]
    fn test_display() {
        let event = Event::parse("+CMTI: \"ME\", 3").unwrap();
        assert_eq!(event.to_string(), "+CMTI:\"ME\",3");
    }
}
