//! Display templates applied after decode
//!
//! Placeholders:
//! - `{value}` / `{value:.N}` - the decoded value, optionally with N decimals
//! - `{d}` `{h}` `{m}` `{s}` - the value read as seconds, split into days,
//!   hours, minutes and seconds
//! - `{upper}` / `{lower}` - the value as text, case-folded
//!
//! `{{` and `}}` produce literal braces. Rendering never fails from the
//! caller's point of view: a bad template falls back to the plain value.

use tracing::debug;

use crate::core::types::ProtocolValue;

/// Largest `{value:.N}` precision; an f64 carries no more significant digits
pub const MAX_PRECISION: usize = 17;

/// Render `template`, falling back to the unformatted value on any error
pub fn apply(template: &str, value: &ProtocolValue) -> String {
    match render(template, value) {
        Ok(text) => text,
        Err(reason) => {
            debug!("Format '{}' not applied: {}", template, reason);
            value.to_string()
        },
    }
}

/// Structural check for configuration time: unknown placeholders, bad
/// precision and unbalanced braces are reported without a live value
pub fn check(template: &str) -> Result<(), String> {
    render(template, &ProtocolValue::Integer(0)).map(|_| ())
}

/// Render `template` strictly
pub fn render(template: &str, value: &ProtocolValue) -> Result<String, String> {
    let mut out = String::with_capacity(template.len() + 8);
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            },
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            },
            '{' => {
                let mut spec = String::new();
                let mut closed = false;
                for n in chars.by_ref() {
                    if n == '}' {
                        closed = true;
                        break;
                    }
                    spec.push(n);
                }
                if !closed {
                    return Err("unterminated placeholder".to_string());
                }
                out.push_str(&placeholder(spec.trim(), value)?);
            },
            '}' => return Err("unmatched '}'".to_string()),
            other => out.push(other),
        }
    }
    Ok(out)
}

fn placeholder(spec: &str, value: &ProtocolValue) -> Result<String, String> {
    match spec {
        "value" => Ok(value.to_string()),
        "upper" => Ok(value.to_string().to_uppercase()),
        "lower" => Ok(value.to_string().to_lowercase()),
        "d" | "h" | "m" | "s" => {
            let total = seconds(value)?;
            let part = match spec {
                "d" => total / 86_400,
                "h" => (total % 86_400) / 3_600,
                "m" => (total % 3_600) / 60,
                _ => total % 60,
            };
            Ok(part.to_string())
        },
        _ => {
            let precision = spec
                .strip_prefix("value:.")
                .ok_or_else(|| format!("unknown placeholder '{{{spec}}}'"))?;
            let digits: usize = precision
                .parse()
                .map_err(|_| format!("bad precision '{precision}'"))?;
            if digits > MAX_PRECISION {
                return Err(format!("precision {digits} exceeds {MAX_PRECISION}"));
            }
            let number = value
                .as_f64()
                .ok_or_else(|| "precision needs a numeric value".to_string())?;
            Ok(format!("{:.*}", digits, number))
        },
    }
}

fn seconds(value: &ProtocolValue) -> Result<u64, String> {
    let v = value
        .as_f64()
        .ok_or_else(|| "duration needs a numeric value".to_string())?;
    if !v.is_finite() || v < 0.0 {
        return Err(format!("duration out of range: {v}"));
    }
    Ok(v.floor() as u64)
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_value_placeholders() {
        let v = ProtocolValue::Float(21.456);
        assert_eq!(apply("{value} °C", &v), "21.456 °C");
        assert_eq!(apply("{value:.1} °C", &v), "21.5 °C");
        assert_eq!(apply("{value:.0}", &ProtocolValue::Integer(7)), "7");
    }

    #[test]
    fn test_duration_decomposition() {
        // 1 day, 2 hours, 3 minutes, 4 seconds
        let v = ProtocolValue::Integer(86_400 + 2 * 3_600 + 3 * 60 + 4);
        assert_eq!(apply("{d}d {h}h {m}m {s}s", &v), "1d 2h 3m 4s");
    }

    #[test]
    fn test_case_placeholders() {
        let v = ProtocolValue::from("Running");
        assert_eq!(apply("{upper}", &v), "RUNNING");
        assert_eq!(apply("state={lower}", &v), "state=running");
    }

    #[test]
    fn test_escaped_braces() {
        let v = ProtocolValue::Integer(3);
        assert_eq!(apply("{{{value}}}", &v), "{3}");
    }

    #[test]
    fn test_errors_fall_back_to_plain_value() {
        let v = ProtocolValue::Float(1.5);
        assert_eq!(apply("{bogus}", &v), "1.5");
        assert_eq!(apply("{value", &v), "1.5");
        assert_eq!(apply("{value:.x}", &v), "1.5");
        assert_eq!(apply("{d}", &ProtocolValue::from("abc")), "abc");
        assert_eq!(apply("{s}", &ProtocolValue::Integer(-5)), "-5");
    }

    #[test]
    fn test_oversized_precision_falls_back() {
        let v = ProtocolValue::Float(1.5);
        assert_eq!(apply("{value:.70000}", &v), "1.5");
        assert_eq!(apply("{value:.18}", &v), "1.5");
        assert_eq!(apply("{value:.17}", &v), format!("{:.17}", 1.5));
    }

    #[test]
    fn test_check_templates() {
        assert!(check("{value:.2} kWh").is_ok());
        assert!(check("{d}d {h}h").is_ok());
        assert!(check("{value:.70000}").is_err());
        assert!(check("{bogus}").is_err());
        assert!(check("{value").is_err());
    }

    #[test]
    fn test_render_reports_errors() {
        assert!(render("}", &ProtocolValue::Null).is_err());
        assert!(render("{nope}", &ProtocolValue::Null).is_err());
    }
}
