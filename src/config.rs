//! Line-based config file format.
//!
//! One `name: value` field per line, `#` starts a comment. Values are
//! either quoted strings or bare integers. Unknown field names are
//! errors, so a typo in a config never passes silently.

use std::fmt;
use std::path::Path;

use tracing::Level;

/// Parse error with optional file/line position, rendered like
/// `path:line: message`.
#[derive(Debug)]
pub struct ConfigError {
    pub text: String,
    pub file: Option<String>,
    /// Zero means the error does not correspond to any particular line.
    pub line: usize,
}

impl ConfigError {
    fn at(line: usize, text: String) -> Self {
        ConfigError {
            text,
            file: None,
            line,
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.line == 0 {
            return f.write_str(&self.text);
        }
        match &self.file {
            Some(file) => write!(f, "{file}:{}: {}", self.line, self.text),
            None => write!(f, "line {}: {}", self.line, self.text),
        }
    }
}

impl std::error::Error for ConfigError {}

/// A config struct that can accept raw field values and validate the
/// final result.
pub trait Settings {
    /// Apply a raw value to the field with the given name.
    fn apply(&mut self, name: &str, raw: &str) -> Result<(), String>;

    /// Check that all required fields ended up populated.
    fn validate(&self) -> Result<(), String>;
}

/// Read and parse a config from the file at `path`.
pub fn load<C: Settings>(c: &mut C, path: &Path) -> Result<(), ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|err| ConfigError {
        text: format!("read {}: {err}", path.display()),
        file: None,
        line: 0,
    })?;
    parse(c, &text).map_err(|mut err| {
        err.file = Some(path.display().to_string());
        err
    })
}

/// Populate a config from raw text.
pub fn parse<C: Settings>(c: &mut C, text: &str) -> Result<(), ConfigError> {
    for (i, raw_line) in text.lines().enumerate() {
        let ln = i + 1;
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((name, raw)) = line.split_once(':') else {
            return Err(ConfigError::at(ln, "invalid field format".into()));
        };
        let name = name.trim();
        if name.is_empty() {
            return Err(ConfigError::at(ln, "empty field name".into()));
        }
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(ConfigError::at(ln, "empty field raw value".into()));
        }

        c.apply(name, raw).map_err(|err| {
            ConfigError::at(ln, format!("apply field \"{name}\" value (={raw}): {err}"))
        })?;
    }

    c.validate().map_err(|err| ConfigError {
        text: format!("check config: {err}"),
        file: None,
        line: 0,
    })
}

/// Strip the surrounding quotes off a string value.
pub fn parse_string(raw: &str) -> Result<String, String> {
    let b = raw.as_bytes();
    if b.len() < 2 || b[0] != b'"' || b[b.len() - 1] != b'"' {
        return Err("invalid string".into());
    }
    Ok(raw[1..raw.len() - 1].to_owned())
}

pub fn parse_u16(raw: &str) -> Result<u16, String> {
    let n: u64 = raw
        .parse()
        .map_err(|_| format!("value \"{raw}\" is not a number"))?;
    if n > 0xFFFF {
        return Err("number cannot be greater than 65535".into());
    }
    Ok(n as u16)
}

pub fn parse_level(raw: &str) -> Result<Level, String> {
    let level = parse_string(raw)?;
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err("unknown log level".into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct TestConfig {
        name: String,
        port: u16,
    }

    impl Settings for TestConfig {
        fn apply(&mut self, name: &str, raw: &str) -> Result<(), String> {
            match name {
                "name" => self.name = parse_string(raw)?,
                "port" => self.port = parse_u16(raw)?,
                _ => return Err("unknown field".into()),
            }
            Ok(())
        }

        fn validate(&self) -> Result<(), String> {
            if self.name.is_empty() {
                return Err("empty name".into());
            }
            if self.port == 0 {
                return Err("empty or zero port".into());
            }
            Ok(())
        }
    }

    #[test]
    fn parses_fields_comments_and_blank_lines() {
        let text = "\n# comment\nname: \"alpha\"\n\nport: 8080\n";
        let mut c = TestConfig::default();
        parse(&mut c, text).unwrap();
        assert_eq!(c.name, "alpha");
        assert_eq!(c.port, 8080);
    }

    #[test]
    fn unknown_field_is_an_error() {
        let mut c = TestConfig::default();
        let err = parse(&mut c, "name: \"a\"\nport: 1\nbogus: 2\n").unwrap_err();
        assert_eq!(err.line, 3);
        assert!(err.to_string().contains("unknown field"), "{err}");
    }

    #[test]
    fn missing_required_field_is_an_error() {
        let mut c = TestConfig::default();
        let err = parse(&mut c, "name: \"a\"\n").unwrap_err();
        assert!(err.to_string().contains("empty or zero port"), "{err}");
    }

    #[test]
    fn bad_line_format() {
        let mut c = TestConfig::default();
        let err = parse(&mut c, "just some text\n").unwrap_err();
        assert_eq!(err.line, 1);
        assert!(err.to_string().contains("invalid field format"), "{err}");
    }

    #[test]
    fn unquoted_string_is_rejected() {
        assert!(parse_string("bare").is_err());
        assert!(parse_string("\"unterminated").is_err());
        assert_eq!(parse_string("\"ok\"").unwrap(), "ok");
    }

    #[test]
    fn u16_range() {
        assert_eq!(parse_u16("65535").unwrap(), 65535);
        assert!(parse_u16("65536").is_err());
        assert!(parse_u16("-1").is_err());
        assert!(parse_u16("12x").is_err());
    }

    #[test]
    fn levels() {
        assert_eq!(parse_level("\"debug\"").unwrap(), Level::DEBUG);
        assert_eq!(parse_level("\"WARN\"").unwrap(), Level::WARN);
        assert!(parse_level("\"loud\"").is_err());
        assert!(parse_level("debug").is_err());
    }

    #[test]
    fn error_rendering_includes_position() {
        let err = ConfigError {
            text: "boom".into(),
            file: Some("client.scf".into()),
            line: 4,
        };
        assert_eq!(err.to_string(), "client.scf:4: boom");
    }
}
