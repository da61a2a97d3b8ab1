use std::str::FromStr;

use reqwest::header::{HeaderName, HeaderValue};
use tokio::time::Duration;

/// Parses a duration string in the format "30s", "10m", "5h", "3d".
///
/// Supported units:
/// - `s` for seconds
/// - `m` for minutes
/// - `h` for hours
/// - `d` for days
pub fn parse_duration_string(s: &str) -> Result<Duration, String> {
    let s = s.trim();

    if s.is_empty() {
        return Err("Duration string cannot be empty".to_string());
    }

    let unit_char = s.chars().last().unwrap();
    let value_str = &s[0..s.len() - 1];

    let value = match u64::from_str(value_str) {
        Ok(v) => v,
        Err(_) => return Err(format!("Invalid numeric value in duration: '{}'", value_str)),
    };

    match unit_char {
        's' => Ok(Duration::from_secs(value)),
        'm' => Ok(Duration::from_secs(value * 60)),
        'h' => Ok(Duration::from_secs(value * 60 * 60)),
        'd' => Ok(Duration::from_secs(value * 24 * 60 * 60)),
        _ => Err(format!(
            "Unknown duration unit: '{}'. Use 's', 'm', 'h', or 'd'.",
            unit_char
        )),
    }
}

/// Parses a comma-separated header string into validated name/value pairs.
///
/// Entries are `Name:Value`; use `\,` for a literal comma inside a value.
/// Example: "Connection:keep-alive,Keep-Alive:timeout=5\,max=200"
pub fn parse_header_pairs(headers_str: &str) -> Result<Vec<(HeaderName, HeaderValue)>, String> {
    let mut pairs = Vec::new();
    let mut current_entry = String::new();
    let mut chars = headers_str.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            // Escaped comma stays inside the current value.
            '\\' if chars.peek() == Some(&',') => {
                current_entry.push(',');
                chars.next();
            }
            ',' => {
                if !current_entry.trim().is_empty() {
                    pairs.push(parse_header_entry(&current_entry)?);
                }
                current_entry.clear();
            }
            _ => current_entry.push(ch),
        }
    }
    if !current_entry.trim().is_empty() {
        pairs.push(parse_header_entry(&current_entry)?);
    }

    Ok(pairs)
}

/// Splits one `Name:Value` entry and validates both halves.
fn parse_header_entry(entry: &str) -> Result<(HeaderName, HeaderValue), String> {
    let (name, value) = entry
        .split_once(':')
        .ok_or_else(|| format!("header entry '{}' is not 'Name:Value'", entry.trim()))?;
    let name = HeaderName::from_bytes(name.trim().as_bytes())
        .map_err(|e| format!("invalid header name '{}': {}", name.trim(), e))?;
    let value = HeaderValue::from_str(value.trim())
        .map_err(|e| format!("invalid value for header '{}': {}", name, e))?;
    Ok((name, value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration_seconds() {
        assert_eq!(parse_duration_string("45s").unwrap(), Duration::from_secs(45));
    }

    #[test]
    fn test_parse_duration_minutes() {
        assert_eq!(parse_duration_string("10m").unwrap(), Duration::from_secs(600));
    }

    #[test]
    fn test_parse_duration_hours_and_days() {
        assert_eq!(parse_duration_string("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(
            parse_duration_string("1d").unwrap(),
            Duration::from_secs(86400)
        );
    }

    #[test]
    fn test_parse_duration_rejects_garbage() {
        assert!(parse_duration_string("").is_err());
        assert!(parse_duration_string("10x").is_err());
        assert!(parse_duration_string("abcm").is_err());
    }

    #[test]
    fn test_parse_headers_simple() {
        let headers_str = "Content-Type:application/json,Authorization:Bearer token";
        let result = parse_header_pairs(headers_str).unwrap();

        assert_eq!(result.len(), 2);
        assert_eq!(result[0].0.as_str(), "content-type");
        assert_eq!(result[0].1.to_str().unwrap(), "application/json");
        assert_eq!(result[1].0.as_str(), "authorization");
        assert_eq!(result[1].1.to_str().unwrap(), "Bearer token");
    }

    #[test]
    fn test_parse_headers_with_escaped_comma() {
        let headers_str = "Connection:keep-alive,Keep-Alive:timeout=5\\,max=200";
        let result = parse_header_pairs(headers_str).unwrap();

        assert_eq!(result.len(), 2);
        assert_eq!(result[0].0.as_str(), "connection");
        assert_eq!(result[1].0.as_str(), "keep-alive");
        assert_eq!(result[1].1.to_str().unwrap(), "timeout=5,max=200");
    }

    #[test]
    fn test_parse_headers_value_keeps_later_colons() {
        let headers_str = "Path:C:\\Users\\test,Host:example.com";
        let result = parse_header_pairs(headers_str).unwrap();

        assert_eq!(result.len(), 2);
        assert_eq!(result[0].0.as_str(), "path");
        assert_eq!(result[0].1.to_str().unwrap(), "C:\\Users\\test");
        assert_eq!(result[1].1.to_str().unwrap(), "example.com");
    }

    #[test]
    fn test_parse_headers_empty() {
        assert!(parse_header_pairs("").unwrap().is_empty());
        // Blank entries between separators are skipped, not rejected.
        assert!(parse_header_pairs(" , ,").unwrap().is_empty());
    }

    #[test]
    fn test_parse_headers_rejects_malformed_entries() {
        assert!(parse_header_pairs("NoColonHere").is_err());
        let err = parse_header_pairs("Bad Name!:value").unwrap_err();
        assert!(err.contains("invalid header name"));
    }
}
