use std::time::Duration;

use super::{Phase, ScheduleSpec};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseErrorKind {
    #[error("unknown phase (expected rate, arrivals_count, random_arrivals, even_arrivals, pause)")]
    UnknownPhase,

    #[error("malformed number")]
    MalformedNumber,

    #[error("missing unit (expected `/sec`, `/min` or `/hour`)")]
    MissingUnit,

    #[error("unknown unit `{0}`")]
    UnknownUnit(String),

    #[error("{0}")]
    Syntax(&'static str),

    #[error("`arrivals_count` must directly follow a `rate` phase")]
    MisplacedArrivalsCount,

    #[error("negative values are not allowed")]
    Negative,
}

/// Malformed schedule text; `token` is the offending fragment of the input.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("`{token}`: {kind}")]
pub struct ScheduleParseError {
    pub token: String,
    pub kind: ParseErrorKind,
}

impl ScheduleParseError {
    fn new(token: &str, kind: ParseErrorKind) -> Self {
        Self {
            token: token.to_string(),
            kind,
        }
    }
}

type ParseResult<T> = std::result::Result<T, ScheduleParseError>;

pub fn parse_schedule(input: &str) -> ParseResult<ScheduleSpec> {
    let mut phases: Vec<Phase> = Vec::new();
    // Index of the last phase when it is a `rate` still open for `arrivals_count`.
    let mut open_rate: Option<usize> = None;

    for token in tokenize(input)? {
        let args = split_args(token.args);
        let phase = match token.name {
            "rate" => {
                expect_args(&token, &args, 1, 2)?;
                let rate_per_second = parse_rate(args[0])?;
                let duration = args.get(1).map(|s| parse_duration(s)).transpose()?;
                phases.push(Phase::RateArrival {
                    rate_per_second,
                    duration,
                    max_arrivals: None,
                });
                open_rate = Some(phases.len() - 1);
                continue;
            }
            "arrivals_count" => {
                expect_args(&token, &args, 1, 1)?;
                let n = parse_count(args[0])?;
                let Some(idx) = open_rate.take() else {
                    return Err(ScheduleParseError::new(
                        token.text,
                        ParseErrorKind::MisplacedArrivalsCount,
                    ));
                };
                if let Some(Phase::RateArrival { max_arrivals, .. }) = phases.get_mut(idx) {
                    *max_arrivals = Some(n);
                }
                continue;
            }
            "random_arrivals" => {
                expect_args(&token, &args, 1, 2)?;
                Phase::RandomArrival {
                    window: parse_duration(args[0])?,
                    duration: args.get(1).map(|s| parse_duration(s)).transpose()?,
                }
            }
            "even_arrivals" => {
                expect_args(&token, &args, 1, 1)?;
                Phase::EvenArrival {
                    duration: parse_duration(args[0])?,
                }
            }
            "pause" => {
                expect_args(&token, &args, 1, 1)?;
                Phase::Pause {
                    duration: parse_duration(args[0])?,
                }
            }
            _ => {
                return Err(ScheduleParseError::new(
                    token.text,
                    ParseErrorKind::UnknownPhase,
                ));
            }
        };
        phases.push(phase);
        open_rate = None;
    }

    Ok(ScheduleSpec::new(phases))
}

/// Parses `250ms`, `1.5s`, `2min`, `1h` or a bare number of seconds.
pub fn parse_duration(input: &str) -> ParseResult<Duration> {
    let s = input.trim();
    let (number, unit) = split_number(s);
    let value = parse_number(input, number)?;

    let nanos_per_unit: f64 = match unit.trim() {
        "" | "s" | "sec" => 1e9,
        "ms" => 1e6,
        "m" | "min" => 60e9,
        "h" | "hour" => 3_600e9,
        other => {
            return Err(ScheduleParseError::new(
                input,
                ParseErrorKind::UnknownUnit(other.to_string()),
            ));
        }
    };

    let nanos = (value * nanos_per_unit).round();
    if !nanos.is_finite() || nanos > u64::MAX as f64 {
        return Err(ScheduleParseError::new(
            input,
            ParseErrorKind::MalformedNumber,
        ));
    }
    Ok(Duration::from_nanos(nanos as u64))
}

/// Returns arrivals per second.
fn parse_rate(input: &str) -> ParseResult<f64> {
    let Some((number, unit)) = input.split_once('/') else {
        // Still report a bad number before the missing unit.
        parse_number(input, input.trim())?;
        return Err(ScheduleParseError::new(input, ParseErrorKind::MissingUnit));
    };
    let value = parse_number(input, number.trim())?;
    let per_seconds = match unit.trim() {
        "s" | "sec" | "second" => 1.0,
        "m" | "min" | "minute" => 60.0,
        "h" | "hour" => 3_600.0,
        "" => return Err(ScheduleParseError::new(input, ParseErrorKind::MissingUnit)),
        other => {
            return Err(ScheduleParseError::new(
                input,
                ParseErrorKind::UnknownUnit(other.to_string()),
            ));
        }
    };
    Ok(value / per_seconds)
}

fn parse_count(input: &str) -> ParseResult<u64> {
    let s = input.trim();
    if s.starts_with('-') {
        return Err(ScheduleParseError::new(input, ParseErrorKind::Negative));
    }
    s.parse::<u64>()
        .map_err(|_| ScheduleParseError::new(input, ParseErrorKind::MalformedNumber))
}

/// Accepts `12`, `1.5` and `.5`; exponents, signs and `inf`/`nan` are rejected.
fn parse_number(token: &str, number: &str) -> ParseResult<f64> {
    if number.starts_with('-') {
        return Err(ScheduleParseError::new(token, ParseErrorKind::Negative));
    }
    let digits = number.bytes().filter(u8::is_ascii_digit).count();
    let dots = number.bytes().filter(|b| *b == b'.').count();
    if digits == 0 || dots > 1 || digits + dots != number.len() || number.ends_with('.') {
        return Err(ScheduleParseError::new(
            token,
            ParseErrorKind::MalformedNumber,
        ));
    }
    number
        .parse::<f64>()
        .map_err(|_| ScheduleParseError::new(token, ParseErrorKind::MalformedNumber))
}

fn split_number(s: &str) -> (&str, &str) {
    let end = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '-'))
        .unwrap_or(s.len());
    s.split_at(end)
}

struct Token<'a> {
    name: &'a str,
    args: &'a str,
    text: &'a str,
}

fn tokenize(input: &str) -> ParseResult<Vec<Token<'_>>> {
    let mut out = Vec::new();
    let mut rest = input.trim_start();

    while !rest.is_empty() {
        let name_end = rest
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .unwrap_or(rest.len());
        let name = &rest[..name_end];
        let after = &rest[name_end..];

        if name.is_empty() {
            let bad = rest.split_whitespace().next().unwrap_or(rest);
            return Err(ScheduleParseError::new(
                bad,
                ParseErrorKind::Syntax("expected a phase name"),
            ));
        }
        if !after.starts_with('(') {
            let bad_end = rest.find(char::is_whitespace).unwrap_or(rest.len());
            return Err(ScheduleParseError::new(
                &rest[..bad_end],
                ParseErrorKind::Syntax("expected `(` after the phase name"),
            ));
        }
        let Some(close) = after.find(')') else {
            return Err(ScheduleParseError::new(
                rest,
                ParseErrorKind::Syntax("missing `)`"),
            ));
        };

        let text_len = name_end + close + 1;
        out.push(Token {
            name,
            args: &after[1..close],
            text: &rest[..text_len],
        });

        rest = &rest[text_len..];
        if !rest.is_empty() && !rest.starts_with(char::is_whitespace) {
            let bad_end = rest.find(char::is_whitespace).unwrap_or(rest.len());
            return Err(ScheduleParseError::new(
                &rest[..bad_end],
                ParseErrorKind::Syntax("phases must be separated by whitespace"),
            ));
        }
        rest = rest.trim_start();
    }

    Ok(out)
}

fn split_args(args: &str) -> Vec<&str> {
    if args.trim().is_empty() {
        return Vec::new();
    }
    args.split(',').map(str::trim).collect()
}

fn expect_args(token: &Token<'_>, args: &[&str], min: usize, max: usize) -> ParseResult<()> {
    if args.len() < min || args.len() > max {
        let reason = match (min, max) {
            (1, 1) => "expected exactly one argument",
            _ => "expected one or two arguments",
        };
        return Err(ScheduleParseError::new(
            token.text,
            ParseErrorKind::Syntax(reason),
        ));
    }
    if args.iter().any(|a| a.is_empty()) {
        return Err(ScheduleParseError::new(
            token.text,
            ParseErrorKind::Syntax("empty argument"),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn err(input: &str) -> ScheduleParseError {
        match parse_schedule(input) {
            Ok(spec) => panic!("`{input}` should fail, got {spec:?}"),
            Err(e) => e,
        }
    }

    #[test]
    fn parses_reference_schedule() {
        let spec = parse_schedule("rate(50/sec) random_arrivals(100ms) pause(2s)")
            .unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(
            spec.phases(),
            &[
                Phase::RateArrival {
                    rate_per_second: 50.0,
                    duration: None,
                    max_arrivals: None,
                },
                Phase::RandomArrival {
                    window: Duration::from_millis(100),
                    duration: None,
                },
                Phase::Pause {
                    duration: Duration::from_secs(2),
                },
            ]
        );
    }

    #[test]
    fn parses_rate_units_bounds_and_caps() {
        let spec = parse_schedule("rate(120/min, 30s) arrivals_count(10) even_arrivals(1.5)")
            .unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(
            spec.phases(),
            &[
                Phase::RateArrival {
                    rate_per_second: 2.0,
                    duration: Some(Duration::from_secs(30)),
                    max_arrivals: Some(10),
                },
                Phase::EvenArrival {
                    duration: Duration::from_millis(1500),
                },
            ]
        );
    }

    #[test]
    fn duration_units() {
        let cases = [
            ("250ms", Duration::from_millis(250)),
            ("2", Duration::from_secs(2)),
            ("0.5s", Duration::from_millis(500)),
            ("3sec", Duration::from_secs(3)),
            ("2min", Duration::from_secs(120)),
            ("1m", Duration::from_secs(60)),
            ("1h", Duration::from_secs(3600)),
            (".25hour", Duration::from_secs(900)),
        ];
        for (input, expected) in cases {
            assert_eq!(parse_duration(input), Ok(expected), "{input}");
        }
    }

    #[test]
    fn errors_name_the_offending_token() {
        let e = err("rate(50/sec) ramp(10s)");
        assert_eq!(e.token, "ramp(10s)");
        assert_eq!(e.kind, ParseErrorKind::UnknownPhase);

        let e = err("pause(1x5s)");
        assert_eq!(e.token, "1x5s");
        assert_eq!(e.kind, ParseErrorKind::UnknownUnit("x5s".to_string()));

        let e = err("rate(50)");
        assert_eq!(e.token, "50");
        assert_eq!(e.kind, ParseErrorKind::MissingUnit);

        let e = err("rate(fifty/sec)");
        assert_eq!(e.kind, ParseErrorKind::MalformedNumber);

        let e = err("pause(1.2.3s)");
        assert_eq!(e.kind, ParseErrorKind::MalformedNumber);

        let e = err("pause(-1s)");
        assert_eq!(e.kind, ParseErrorKind::Negative);
    }

    #[test]
    fn arrivals_count_must_follow_rate() {
        assert_eq!(
            err("pause(1s) arrivals_count(3)").kind,
            ParseErrorKind::MisplacedArrivalsCount
        );
        assert_eq!(
            err("arrivals_count(3)").kind,
            ParseErrorKind::MisplacedArrivalsCount
        );
        assert_eq!(
            err("rate(1/sec) arrivals_count(3) arrivals_count(4)").kind,
            ParseErrorKind::MisplacedArrivalsCount
        );
    }

    #[test]
    fn syntax_errors() {
        assert!(matches!(err("pause 1s").kind, ParseErrorKind::Syntax(_)));
        assert!(matches!(err("pause(1s").kind, ParseErrorKind::Syntax(_)));
        assert!(matches!(err("pause(1s)pause(2s)").kind, ParseErrorKind::Syntax(_)));
        assert!(matches!(err("pause()").kind, ParseErrorKind::Syntax(_)));
        assert!(matches!(err("pause(1s, 2s)").kind, ParseErrorKind::Syntax(_)));
    }

    #[test]
    fn empty_input_is_an_empty_schedule() {
        let spec = parse_schedule("   ").unwrap_or_else(|e| panic!("{e}"));
        assert!(spec.is_empty());
    }
}
