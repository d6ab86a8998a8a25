//! Metric line protocol.
//!
//! One data point per line:
//!
//! ```text
//! metric.key[,dim1="value1",dim2="value2"] gauge,<value> [timestamp]
//! metric.key[,dim1="value1"] count,delta=<value> [timestamp]
//! ```
//!
//! Dimension values are always quoted; embedded `"` and `\` are escaped with
//! a backslash. The timestamp is epoch milliseconds and may be omitted.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use chrono::{DateTime, Utc};

use crate::error::{LineParseError, MetricError};
use crate::metric::{Metric, MetricKind, MetricValue, SummaryStat, LIMIT_LINE_LENGTH};

/// Encode a metric into a single line. Pure; never performs I/O.
pub fn encode(metric: &Metric) -> Result<String, MetricError> {
    metric.validate()?;

    let mut line = series_prefix(&metric.key, &metric.dimensions);
    line.push(' ');
    match (metric.kind, &metric.value) {
        (MetricKind::Gauge, MetricValue::Number(v)) => {
            let _ = write!(line, "gauge,{}", format_number(*v));
        }
        (MetricKind::Gauge, MetricValue::Summary(s)) => {
            let _ = write!(
                line,
                "gauge,min={},max={},sum={},count={}",
                format_number(s.min),
                format_number(s.max),
                format_number(s.sum),
                format_number(s.count)
            );
        }
        (MetricKind::Count, MetricValue::Number(v)) => {
            let _ = write!(line, "count,{}", format_number(*v));
        }
        (MetricKind::Delta, MetricValue::Number(v)) => {
            let _ = write!(line, "count,delta={}", format_number(*v));
        }
        // Rejected by validate().
        (_, MetricValue::Summary(_)) => return Err(MetricError::SummaryNotGauge(metric.key.clone())),
    }

    if let Some(ts) = metric.timestamp {
        let _ = write!(line, " {}", ts.timestamp_millis());
    }

    if line.len() > LIMIT_LINE_LENGTH {
        return Err(MetricError::LineTooLong {
            key: metric.key.clone(),
            length: line.len(),
            limit: LIMIT_LINE_LENGTH,
        });
    }
    Ok(line)
}

/// The `key,dim="v",...` part of a line, shared by encoder and coalescing.
pub fn series_prefix(key: &str, dimensions: &BTreeMap<String, String>) -> String {
    let mut out = String::with_capacity(key.len() + dimensions.len() * 16);
    out.push_str(key);
    for (k, v) in dimensions {
        out.push(',');
        out.push_str(k);
        out.push_str("=\"");
        escape_into(&mut out, v);
        out.push('"');
    }
    out
}

fn escape_into(out: &mut String, value: &str) {
    for c in value.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
}

/// Format a finite number without a trailing `.0` for integral values.
pub fn format_number(v: f64) -> String {
    if v == v.trunc() && v.abs() < 1e15 {
        format!("{}", v as i64)
    } else {
        format!("{}", v)
    }
}

/// Parse a line produced by [`encode`] (or any conforming producer).
pub fn parse_line(line: &str) -> Result<Metric, LineParseError> {
    let line = line.trim();
    if line.is_empty() {
        return Err(LineParseError::Empty);
    }

    let split = series_end(line)?;
    let (series, rest) = line.split_at(split);
    let (key, dimensions) = parse_series(series)?;

    let mut parts = rest.split_whitespace();
    let payload = parts
        .next()
        .ok_or_else(|| LineParseError::MissingPayload(line.to_string()))?;
    let (kind, value) = parse_payload(payload)?;

    let timestamp = match parts.next() {
        Some(raw) => Some(parse_timestamp(raw)?),
        None => None,
    };

    Ok(Metric {
        key,
        value,
        kind,
        dimensions,
        timestamp,
    })
}

/// Index of the first unquoted space, i.e. the end of the series section.
fn series_end(line: &str) -> Result<usize, LineParseError> {
    let mut in_quotes = false;
    let mut escaped = false;
    for (i, c) in line.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_quotes => escaped = true,
            '"' => in_quotes = !in_quotes,
            ' ' if !in_quotes => return Ok(i),
            _ => {}
        }
    }
    if in_quotes {
        Err(LineParseError::UnterminatedQuote(line.to_string()))
    } else {
        Err(LineParseError::MissingPayload(line.to_string()))
    }
}

fn parse_series(series: &str) -> Result<(String, BTreeMap<String, String>), LineParseError> {
    let (key, mut rest) = match series.find(',') {
        Some(idx) => (&series[..idx], &series[idx + 1..]),
        None => (series, ""),
    };
    let mut dimensions = BTreeMap::new();

    while !rest.is_empty() {
        let eq = rest
            .find('=')
            .ok_or_else(|| LineParseError::MalformedDimension(rest.to_string()))?;
        let dim = &rest[..eq];
        if dim.is_empty() {
            return Err(LineParseError::MalformedDimension(rest.to_string()));
        }
        let after = &rest[eq + 1..];

        let (value, remaining) = if let Some(quoted) = after.strip_prefix('"') {
            read_quoted(quoted).ok_or_else(|| LineParseError::UnterminatedQuote(rest.to_string()))?
        } else {
            match after.find(',') {
                Some(idx) => (after[..idx].to_string(), &after[idx..]),
                None => (after.to_string(), ""),
            }
        };

        dimensions.insert(dim.to_string(), value);
        rest = match remaining.strip_prefix(',') {
            Some(r) => r,
            None if remaining.is_empty() => "",
            None => return Err(LineParseError::MalformedDimension(remaining.to_string())),
        };
    }

    Ok((key.to_string(), dimensions))
}

/// Read an escaped value up to its closing quote. Returns value and the remainder.
fn read_quoted(s: &str) -> Option<(String, &str)> {
    let mut value = String::new();
    let mut escaped = false;
    for (i, c) in s.char_indices() {
        if escaped {
            value.push(c);
            escaped = false;
            continue;
        }
        match c {
            '\\' => escaped = true,
            '"' => return Some((value, &s[i + 1..])),
            _ => value.push(c),
        }
    }
    None
}

fn parse_payload(payload: &str) -> Result<(MetricKind, MetricValue), LineParseError> {
    if let Some(v) = payload.strip_prefix("count,delta=") {
        return Ok((MetricKind::Delta, MetricValue::Number(parse_number(v)?)));
    }
    if let Some(v) = payload.strip_prefix("count,") {
        return Ok((MetricKind::Count, MetricValue::Number(parse_number(v)?)));
    }
    if let Some(v) = payload.strip_prefix("gauge,") {
        if v.contains('=') {
            return Ok((MetricKind::Gauge, MetricValue::Summary(parse_summary(v)?)));
        }
        return Ok((MetricKind::Gauge, MetricValue::Number(parse_number(v)?)));
    }
    Err(LineParseError::UnknownKind(payload.to_string()))
}

fn parse_summary(s: &str) -> Result<SummaryStat, LineParseError> {
    let mut stat = SummaryStat::new(0.0, 0.0, 0.0, 0.0);
    for field in s.split(',') {
        let (name, raw) = field
            .split_once('=')
            .ok_or_else(|| LineParseError::InvalidNumber(field.to_string()))?;
        let v = parse_number(raw)?;
        match name {
            "min" => stat.min = v,
            "max" => stat.max = v,
            "sum" => stat.sum = v,
            "count" => stat.count = v,
            other => return Err(LineParseError::UnknownKind(other.to_string())),
        }
    }
    Ok(stat)
}

fn parse_number(s: &str) -> Result<f64, LineParseError> {
    s.parse::<f64>()
        .map_err(|_| LineParseError::InvalidNumber(s.to_string()))
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, LineParseError> {
    s.parse::<i64>()
        .ok()
        .and_then(DateTime::from_timestamp_millis)
        .ok_or_else(|| LineParseError::InvalidTimestamp(s.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_gauge_with_dimension() {
        let m = Metric::gauge("cpu.usage", 42.5).with_dimension("host", "a");
        assert_eq!(encode(&m).unwrap(), r#"cpu.usage,host="a" gauge,42.5"#);
    }

    #[test]
    fn encode_delta_and_count() {
        let d = Metric::delta("requests", 3.0);
        assert_eq!(encode(&d).unwrap(), "requests count,delta=3");
        let c = Metric::count("requests.total", 120u64);
        assert_eq!(encode(&c).unwrap(), "requests.total count,120");
    }

    #[test]
    fn encode_timestamp_millis() {
        let ts = DateTime::from_timestamp_millis(1_700_000_000_123).unwrap();
        let m = Metric::gauge("k", 1.0).with_timestamp(ts);
        assert_eq!(encode(&m).unwrap(), "k gauge,1 1700000000123");
    }

    #[test]
    fn encode_summary() {
        let m = Metric::gauge("latency", SummaryStat::new(1.0, 5.5, 10.0, 4.0));
        assert_eq!(encode(&m).unwrap(), "latency gauge,min=1,max=5.5,sum=10,count=4");
    }

    #[test]
    fn encode_escapes_quotes_and_backslashes() {
        let m = Metric::gauge("k", 1.0).with_dimension("p", r#"a"b\c"#);
        assert_eq!(encode(&m).unwrap(), r#"k,p="a\"b\\c" gauge,1"#);
    }

    #[test]
    fn encode_is_deterministic_across_insertion_order() {
        let a = Metric::gauge("k", 1.0).with_dimension("x", "1").with_dimension("b", "2");
        let b = Metric::gauge("k", 1.0).with_dimension("b", "2").with_dimension("x", "1");
        assert_eq!(encode(&a).unwrap(), encode(&b).unwrap());
    }

    #[test]
    fn encode_rejects_long_line() {
        let m = Metric::gauge("k", 1.0).with_dimension("d", "x".repeat(LIMIT_LINE_LENGTH));
        assert!(matches!(encode(&m), Err(MetricError::LineTooLong { .. })));
    }

    #[test]
    fn parse_recovers_gauge() {
        let m = Metric::gauge("cpu.usage", 42.5).with_dimension("host", "a");
        let parsed = parse_line(&encode(&m).unwrap()).unwrap();
        assert_eq!(parsed.key, "cpu.usage");
        assert_eq!(parsed.value, MetricValue::Number(42.5));
        assert_eq!(parsed.kind, MetricKind::Gauge);
        assert_eq!(parsed.dimensions.get("host").map(String::as_str), Some("a"));
        assert_eq!(parsed.dimensions.len(), 1);
        assert!(parsed.timestamp.is_none());
    }

    #[test]
    fn parse_handles_escaped_space_and_comma_in_value() {
        let m = Metric::delta("k", 2.0).with_dimension("name", r#"a, "b" c\"#);
        let parsed = parse_line(&encode(&m).unwrap()).unwrap();
        assert_eq!(parsed.dimensions["name"], r#"a, "b" c\"#);
        assert_eq!(parsed.kind, MetricKind::Delta);
    }

    #[test]
    fn parse_accepts_unquoted_dimension_values() {
        let parsed = parse_line("k,a=1,b=two gauge,3 1700000000000").unwrap();
        assert_eq!(parsed.dimensions["a"], "1");
        assert_eq!(parsed.dimensions["b"], "two");
        assert_eq!(parsed.timestamp.unwrap().timestamp_millis(), 1_700_000_000_000);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert_eq!(parse_line(""), Err(LineParseError::Empty));
        assert!(matches!(parse_line("just_a_key"), Err(LineParseError::MissingPayload(_))));
        assert!(matches!(parse_line("k histogram,1"), Err(LineParseError::UnknownKind(_))));
        assert!(matches!(parse_line("k gauge,abc"), Err(LineParseError::InvalidNumber(_))));
        assert!(matches!(parse_line(r#"k,a="open gauge,1"#), Err(LineParseError::UnterminatedQuote(_))));
    }

    #[test]
    fn format_number_drops_integral_fraction() {
        assert_eq!(format_number(5.0), "5");
        assert_eq!(format_number(-2.0), "-2");
        assert_eq!(format_number(0.25), "0.25");
    }
}
