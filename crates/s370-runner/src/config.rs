//! Line-oriented configuration file parsing (§6.1).
//!
//! Each non-blank, non-`#` line is either a device line (`<model-name>
//! <device-address-hex> <options>`), a bare switch name, or an
//! `<option-name> <value>` pair. A trailing backslash continues a
//! logical line onto the next. Hand-rolled, in the style of
//! `format-adf::AdfError` for the error type and the amiga-runner's
//! token-at-a-time argument parsing for the parser itself.

use std::fmt;

/// One option attached to a device line: a bare flag or a `key=value`
/// pair. Quoted values may contain spaces or commas.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigOption {
    Flag(String),
    KeyValue(String, String),
}

/// One parsed, non-blank configuration line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigLine {
    Device {
        model: String,
        address: u16,
        options: Vec<ConfigOption>,
    },
    Switch(String),
    Option(String, String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    EmptyLine,
    InvalidAddress(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyLine => write!(f, "empty configuration line"),
            Self::InvalidAddress(addr) => write!(f, "invalid device address: {addr:?}"),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Join trailing-backslash continuation lines into logical lines (§6.1).
fn join_continuations(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    for raw in text.lines() {
        let line = raw.trim_end();
        if let Some(stripped) = line.strip_suffix('\\') {
            current.push_str(stripped.trim_end());
            current.push(' ');
        } else {
            current.push_str(line);
            out.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

fn unquote(s: &str) -> String {
    let s = s.trim();
    if s.len() >= 2 && s.starts_with('"') && s.ends_with('"') {
        s[1..s.len() - 1].to_string()
    } else {
        s.to_string()
    }
}

/// Split on commas that aren't inside a quoted span, so a quoted option
/// value may itself contain a comma (§6.1).
fn split_commas_outside_quotes(s: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    for c in s.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            ',' if !in_quotes => parts.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    parts.push(current);
    parts
}

fn parse_options(s: &str) -> Vec<ConfigOption> {
    let mut options = Vec::new();
    for raw in split_commas_outside_quotes(s) {
        let token = raw.trim();
        if token.is_empty() {
            continue;
        }
        if let Some((key, value)) = token.split_once('=') {
            options.push(ConfigOption::KeyValue(key.trim().to_string(), unquote(value)));
        } else {
            options.push(ConfigOption::Flag(unquote(token)));
        }
    }
    options
}

fn parse_address(token: &str) -> Option<u16> {
    u16::from_str_radix(token, 16).ok()
}

/// Parse one already-trimmed, non-blank, non-comment logical line.
pub fn parse_line(line: &str) -> Result<ConfigLine, ConfigError> {
    let line = line.trim();
    if line.is_empty() {
        return Err(ConfigError::EmptyLine);
    }
    let mut parts = line.splitn(3, char::is_whitespace);
    let first = parts.next().unwrap_or("").trim();
    let Some(second_raw) = parts.next() else {
        return Ok(ConfigLine::Switch(first.to_string()));
    };
    let second = second_raw.trim();
    let rest = parts.next().unwrap_or("").trim();

    if let Some(address) = parse_address(second) {
        let options = if rest.is_empty() { Vec::new() } else { parse_options(rest) };
        return Ok(ConfigLine::Device {
            model: first.to_string(),
            address,
            options,
        });
    }

    let value = if rest.is_empty() {
        second.to_string()
    } else {
        format!("{second} {rest}")
    };
    Ok(ConfigLine::Option(first.to_string(), unquote(&value)))
}

/// Parse a whole configuration file, skipping blank and `#`-comment
/// lines and honoring trailing-backslash continuations.
pub fn parse_config(text: &str) -> Result<Vec<ConfigLine>, ConfigError> {
    let mut out = Vec::new();
    for logical in join_continuations(text) {
        let trimmed = logical.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        out.push(parse_line(trimmed)?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_line_parses_model_address_and_options() {
        let line = parse_line("3420 0C0 density=1600,rewind").unwrap();
        assert_eq!(
            line,
            ConfigLine::Device {
                model: "3420".to_string(),
                address: 0x0C0,
                options: vec![
                    ConfigOption::KeyValue("density".to_string(), "1600".to_string()),
                    ConfigOption::Flag("rewind".to_string()),
                ],
            }
        );
    }

    #[test]
    fn quoted_option_value_may_contain_spaces_and_commas() {
        let line = parse_line(r#"1052 01F label="line printer, main hall""#).unwrap();
        let ConfigLine::Device { options, .. } = line else {
            panic!("expected device line");
        };
        assert_eq!(
            options,
            vec![ConfigOption::KeyValue(
                "label".to_string(),
                "line printer, main hall".to_string()
            )]
        );
    }

    #[test]
    fn bare_token_is_a_switch() {
        assert_eq!(parse_line("TIMER_ASSIST").unwrap(), ConfigLine::Switch("TIMER_ASSIST".to_string()));
    }

    #[test]
    fn two_tokens_with_non_hex_second_are_an_option() {
        assert_eq!(
            parse_line("STORAGE 2048K").unwrap(),
            ConfigLine::Option("STORAGE".to_string(), "2048K".to_string())
        );
    }

    #[test]
    fn continuations_join_before_parsing() {
        let text = "3420 0C0 density=1600,\\\n  rewind\n";
        let lines = parse_config(text).unwrap();
        assert_eq!(lines.len(), 1);
        let ConfigLine::Device { options, .. } = &lines[0] else {
            panic!("expected device line");
        };
        assert_eq!(options.len(), 2);
    }

    #[test]
    fn comments_and_blank_lines_are_skipped() {
        let text = "# a comment\n\n3420 0C0\n";
        let lines = parse_config(text).unwrap();
        assert_eq!(lines.len(), 1);
    }
}
