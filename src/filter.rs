//! Pattern matching for log lines
//!
//! A jail's pattern set is compiled once into ignore and failure rules.
//! Ignore rules always win; failure rules are tried in declaration order and
//! the first hit decides the line. Addresses are named with `<HOST>` (or an
//! explicit `host`/`ip` capture group) and validated as IP literals.
//! Timestamps are parsed with the pattern set's date format, falling back to
//! the time the tailer observed the line.

use chrono::{DateTime, Datelike, Duration, FixedOffset, Local, NaiveDateTime, TimeZone, Utc};
use regex::Regex;
use std::collections::BTreeMap;
use std::net::IpAddr;
use tracing::debug;

use crate::config::{ConfigError, FilterConfig};
use crate::models::{LogRecord, MatchEvent, MatchKind};

/// Expansion of the `<HOST>` token
const HOST_PATTERN: &str = r"\[?(?P<host>[0-9A-Fa-f:.]+)\]?";

/// Capture group names that carry the address
const ADDRESS_GROUPS: [&str; 2] = ["host", "ip"];

/// A single compiled rule
#[derive(Debug, Clone)]
pub struct Rule {
    id: String,
    regex: Regex,
    has_address: bool,
}

/// What a rule found in a line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleHit {
    /// Validated address, if the rule captured one that parses
    pub address: Option<IpAddr>,
    /// Raw captured token, kept so failed validations can be reported
    pub token: Option<String>,
    /// Byte offset of the match in the line
    pub offset: usize,
}

impl Rule {
    pub fn compile(id: String, filter: &str, pattern: &str) -> Result<Self, ConfigError> {
        let expanded = pattern.replace("<HOST>", HOST_PATTERN).replace("<ADDR>", HOST_PATTERN);
        let regex = Regex::new(&expanded).map_err(|source| ConfigError::InvalidRegex {
            filter: filter.to_string(),
            pattern: pattern.to_string(),
            source,
        })?;

        let has_address = regex
            .capture_names()
            .flatten()
            .any(|name| ADDRESS_GROUPS.contains(&name));

        Ok(Self {
            id,
            regex,
            has_address,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Pure function of the line
    pub fn apply(&self, line: &str) -> Option<RuleHit> {
        let captures = self.regex.captures(line)?;
        let offset = captures.get(0).map(|m| m.start()).unwrap_or(0);

        let token = ADDRESS_GROUPS
            .iter()
            .find_map(|name| captures.name(name))
            .map(|m| m.as_str().to_string());

        Some(RuleHit {
            address: token.as_deref().and_then(parse_address),
            token,
            offset,
        })
    }
}

/// Parse an address token, accepting bracketed IPv6 and unmapping
/// IPv4-mapped IPv6 addresses
pub fn parse_address(token: &str) -> Option<IpAddr> {
    let trimmed = token.trim().trim_start_matches('[').trim_end_matches(']');
    match trimmed.parse::<IpAddr>().ok()? {
        IpAddr::V6(v6) => Some(
            v6.to_ipv4_mapped()
                .map(IpAddr::V4)
                .unwrap_or(IpAddr::V6(v6)),
        ),
        v4 => Some(v4),
    }
}

/// Compiled pattern set for one jail
#[derive(Debug, Clone)]
pub struct PatternMatcher {
    jail_id: String,
    ignore_rules: Vec<Rule>,
    failure_rules: Vec<Rule>,
    dates: DateParser,
}

impl PatternMatcher {
    pub fn compile(
        jail_id: &str,
        filter_name: &str,
        filter: &FilterConfig,
    ) -> Result<Self, ConfigError> {
        if filter.failregex.is_empty() {
            return Err(ConfigError::EmptyFilter(filter_name.to_string()));
        }

        let failure_rules = filter
            .failregex
            .iter()
            .enumerate()
            .map(|(i, pattern)| {
                let rule =
                    Rule::compile(format!("{}:fail[{}]", filter_name, i), filter_name, pattern)?;
                if !rule.has_address {
                    return Err(ConfigError::MissingHostGroup {
                        filter: filter_name.to_string(),
                        pattern: pattern.clone(),
                    });
                }
                Ok(rule)
            })
            .collect::<Result<Vec<_>, _>>()?;

        let ignore_rules = filter
            .ignoreregex
            .iter()
            .enumerate()
            .map(|(i, pattern)| {
                Rule::compile(format!("{}:ignore[{}]", filter_name, i), filter_name, pattern)
            })
            .collect::<Result<Vec<_>, _>>()?;

        let dates = DateParser::new(&filter.date_format, filter.date_regex.as_deref()).map_err(
            |reason| ConfigError::InvalidDateFormat {
                filter: filter_name.to_string(),
                reason,
            },
        )?;

        Ok(Self {
            jail_id: jail_id.to_string(),
            ignore_rules,
            failure_rules,
            dates,
        })
    }

    pub fn jail_id(&self) -> &str {
        &self.jail_id
    }

    pub fn failure_rule_ids(&self) -> impl Iterator<Item = &str> {
        self.failure_rules.iter().map(|r| r.id())
    }

    /// Run a record through the rules. Returns at most one event.
    pub fn match_record(&self, record: &LogRecord) -> Option<MatchEvent> {
        let line = record.raw_line.trim_end_matches(['\r', '\n']);

        for rule in &self.ignore_rules {
            if let Some(hit) = rule.apply(line) {
                return Some(MatchEvent {
                    jail_id: self.jail_id.clone(),
                    address: hit.address,
                    matched_at: self.timestamp(line, record.observed_at),
                    rule_id: rule.id.clone(),
                    kind: MatchKind::Ignore,
                });
            }
        }

        let (rule, hit) = self
            .failure_rules
            .iter()
            .find_map(|rule| rule.apply(line).map(|hit| (rule, hit)))?;

        match hit.address {
            Some(address) => Some(MatchEvent {
                jail_id: self.jail_id.clone(),
                address: Some(address),
                matched_at: self.timestamp(line, record.observed_at),
                rule_id: rule.id.clone(),
                kind: MatchKind::Failure,
            }),
            None => {
                debug!(
                    "Rule {} matched in jail {} but '{}' is not an IP address, discarding",
                    rule.id,
                    self.jail_id,
                    hit.token.unwrap_or_default()
                );
                None
            }
        }
    }

    fn timestamp(&self, line: &str, observed_at: DateTime<Utc>) -> DateTime<Utc> {
        self.dates.parse(line, observed_at).unwrap_or_else(|| {
            debug!("No parseable timestamp in line, using observation time");
            observed_at
        })
    }
}

/// Timestamp formats understood by the matcher
#[derive(Debug, Clone)]
enum DateFormat {
    Syslog,
    Iso8601,
    Clf,
    Epoch,
    Custom { format: String },
}

#[derive(Debug, Clone)]
struct DateParser {
    /// Formats tried in order, each with the regex that locates it
    formats: Vec<(DateFormat, Option<Regex>)>,
}

impl DateParser {
    fn new(date_format: &str, date_regex: Option<&str>) -> Result<Self, String> {
        let preset = |format: DateFormat| -> Result<(DateFormat, Option<Regex>), String> {
            let pattern = match &format {
                DateFormat::Syslog => r"\b([A-Z][a-z]{2}\s+\d{1,2}\s+\d{2}:\d{2}:\d{2})\b",
                DateFormat::Iso8601 => {
                    r"(\d{4}[-/]\d{2}[-/]\d{2}[T ]\d{2}:\d{2}:\d{2}(?:[.,]\d+)?(?:Z|[+-]\d{2}:?\d{2})?)"
                }
                DateFormat::Clf => r"(\d{2}/[A-Z][a-z]{2}/\d{4}:\d{2}:\d{2}:\d{2} [+-]\d{4})",
                DateFormat::Epoch => r"^\s*\[?(\d{9,10}(?:\.\d+)?)\]?",
                DateFormat::Custom { .. } => return Ok((format, None)),
            };
            let regex = Regex::new(pattern).map_err(|e| e.to_string())?;
            Ok((format, Some(regex)))
        };

        let formats = match date_format {
            "auto" => vec![
                preset(DateFormat::Iso8601)?,
                preset(DateFormat::Clf)?,
                preset(DateFormat::Syslog)?,
            ],
            "syslog" => vec![preset(DateFormat::Syslog)?],
            "iso8601" => vec![preset(DateFormat::Iso8601)?],
            "clf" => vec![preset(DateFormat::Clf)?],
            "epoch" => vec![preset(DateFormat::Epoch)?],
            custom => {
                if !custom.contains('%') {
                    return Err(format!("'{}' is neither a preset nor a chrono format", custom));
                }
                let regex = date_regex
                    .map(|r| Regex::new(r).map_err(|e| e.to_string()))
                    .transpose()?;
                vec![(
                    DateFormat::Custom {
                        format: custom.to_string(),
                    },
                    regex,
                )]
            }
        };

        Ok(Self { formats })
    }

    fn parse(&self, line: &str, observed_at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.formats.iter().find_map(|(format, regex)| {
            let text = match regex {
                Some(regex) => {
                    let caps = regex.captures(line)?;
                    caps.get(1).or_else(|| caps.get(0))?.as_str()
                }
                None => line,
            };
            parse_with(format, text, observed_at)
        })
    }
}

fn parse_with(format: &DateFormat, text: &str, observed_at: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match format {
        DateFormat::Syslog => parse_syslog(text, observed_at),
        DateFormat::Iso8601 => parse_iso8601(text),
        DateFormat::Clf => DateTime::parse_from_str(text, "%d/%b/%Y:%H:%M:%S %z")
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        DateFormat::Epoch => {
            let secs: f64 = text.parse().ok()?;
            let nanos = (secs.fract() * 1e9) as u32;
            Utc.timestamp_opt(secs.trunc() as i64, nanos).single()
        }
        DateFormat::Custom { format } => parse_custom(text, format),
    }
}

/// Syslog stamps carry no year; take the observation year and step back one
/// when that would put the line in the future (New Year rollover)
fn parse_syslog(text: &str, observed_at: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let normalized = text.split_whitespace().collect::<Vec<_>>().join(" ");
    let year = observed_at.with_timezone(&Local).year();

    let at_year = |year: i32| -> Option<DateTime<Utc>> {
        let naive =
            NaiveDateTime::parse_from_str(&format!("{} {}", normalized, year), "%b %d %H:%M:%S %Y")
                .ok()?;
        local_to_utc(naive)
    };

    let candidate = at_year(year)?;
    if candidate > observed_at + Duration::days(1) {
        at_year(year - 1)
    } else {
        Some(candidate)
    }
}

fn parse_iso8601(text: &str) -> Option<DateTime<Utc>> {
    let mut normalized = text.replacen(' ', "T", 1).replace(',', ".");
    if normalized.len() >= 10 {
        normalized.replace_range(0..10, &normalized[0..10].replace('/', "-"));
    }
    if let Some(stripped) = normalized.strip_suffix('Z') {
        normalized = format!("{}+00:00", stripped);
    }

    if let Ok(dt) = DateTime::<FixedOffset>::parse_from_str(&normalized, "%Y-%m-%dT%H:%M:%S%.f%z") {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(&normalized, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .and_then(local_to_utc)
}

fn parse_custom(text: &str, format: &str) -> Option<DateTime<Utc>> {
    if let Ok((dt, _)) = DateTime::<FixedOffset>::parse_and_remainder(text, format) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_and_remainder(text, format)
        .ok()
        .and_then(|(naive, _)| local_to_utc(naive))
}

fn local_to_utc(naive: NaiveDateTime) -> Option<DateTime<Utc>> {
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
}

fn filter(failregex: &[&str], ignoreregex: &[&str], date_format: &str) -> FilterConfig {
    FilterConfig {
        failregex: failregex.iter().map(|s| s.to_string()).collect(),
        ignoreregex: ignoreregex.iter().map(|s| s.to_string()).collect(),
        date_format: date_format.to_string(),
        date_regex: None,
    }
}

/// Pattern sets shipped with the daemon
pub fn builtin_filters() -> BTreeMap<String, FilterConfig> {
    let mut filters = BTreeMap::new();

    filters.insert(
        "sshd".to_string(),
        filter(
            &[
                r"Failed (?:password|publickey) for (?:invalid user )?\S* from <HOST>(?: port \d+)?",
                r"Invalid user \S* from <HOST>",
                r"Connection closed by (?:authenticating |invalid )?(?:user \S+ )?<HOST> port \d+ \[preauth\]",
                r"error: maximum authentication attempts exceeded for .* from <HOST>",
                r"pam_unix\(sshd:auth\): authentication failure;.*rhost=<HOST>",
                r"Did not receive identification string from <HOST>",
            ],
            &[],
            "auto",
        ),
    );

    filters.insert(
        "nginx-http-auth".to_string(),
        filter(
            &[
                r#"user "[^"]*":? (?:password mismatch|was not found in "[^"]*"), client: <HOST>,"#,
                r"no user/password was provided for basic authentication, client: <HOST>,",
            ],
            &[],
            "auto",
        ),
    );

    filters.insert(
        "nginx-limit-req".to_string(),
        filter(
            &[r#"limiting requests, excess: [\d.]+ by zone "[^"]*", client: <HOST>,"#],
            &[],
            "auto",
        ),
    );

    // Access log in combined format; status code decides
    filters.insert(
        "nginx-access".to_string(),
        filter(
            &[r#"^<HOST> \S+ \S+ \[[^\]]+\] "[^"]*" (?:401|403|404|429|5\d\d) "#],
            &[
                r#"^<HOST> \S+ \S+ \[[^\]]+\] "[^"]*" [23]\d\d "#,
                r#"^\S+ \S+ \S+ \[[^\]]+\] "GET /(?:favicon\.ico|robots\.txt) [^"]*" 404 "#,
            ],
            "clf",
        ),
    );

    filters.insert(
        "postfix-sasl".to_string(),
        filter(
            &[r"warning: [-._\w]+\[<HOST>\]: SASL (?:LOGIN|PLAIN|(?:CRAM|DIGEST)-MD5) authentication failed"],
            &[],
            "auto",
        ),
    );

    filters.insert(
        "dovecot".to_string(),
        filter(
            &[
                r"(?:auth|imap-login|pop3-login|submission-login): .*(?:Authentication failure|authentication failed|\(auth failed).*rip=<HOST>",
                r"auth(?:-worker)?\(\S*\): (?:pam|passwd-file)\([^,]*,<HOST>[,)].*(?:unknown user|Password mismatch)",
            ],
            &[],
            "auto",
        ),
    );

    filters
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    fn matcher(name: &str) -> PatternMatcher {
        let filters = builtin_filters();
        PatternMatcher::compile("test", name, &filters[name]).unwrap()
    }

    fn record(line: &str) -> LogRecord {
        LogRecord::new("test", line)
    }

    #[test]
    fn test_builtin_filters_compile() {
        for (name, filter) in builtin_filters() {
            PatternMatcher::compile("test", &name, &filter)
                .unwrap_or_else(|e| panic!("filter {} failed to compile: {}", name, e));
        }
    }

    #[test]
    fn test_sshd_failed_password() {
        let m = matcher("sshd");
        let line = "Dec  4 10:00:00 server sshd[1234]: Failed password for root from 192.168.1.100 port 22 ssh2";
        let event = m.match_record(&record(line)).unwrap();

        assert_eq!(event.kind, MatchKind::Failure);
        assert_eq!(event.address, Some("192.168.1.100".parse().unwrap()));
        assert_eq!(event.rule_id, "sshd:fail[0]");
        assert_eq!(event.jail_id, "test");
    }

    #[test]
    fn test_sshd_ipv6() {
        let m = matcher("sshd");
        let line = "Dec  4 10:00:00 server sshd[1234]: Invalid user admin from 2001:db8::17 port 50022";
        let event = m.match_record(&record(line)).unwrap();
        assert_eq!(event.address, Some("2001:db8::17".parse().unwrap()));
    }

    #[test]
    fn test_first_failure_rule_wins() {
        let f = filter(&[r"auth failed from <HOST>", r"failed from <HOST>"], &[], "auto");
        let m = PatternMatcher::compile("j", "f", &f).unwrap();
        let event = m.match_record(&record("auth failed from 203.0.113.7")).unwrap();
        assert_eq!(event.rule_id, "f:fail[0]");
    }

    #[test]
    fn test_ignore_dominates_failure() {
        let f = filter(
            &[r"login failed from <HOST>"],
            &[r"from <HOST> \(monitoring\)"],
            "auto",
        );
        let m = PatternMatcher::compile("j", "f", &f).unwrap();

        let event = m
            .match_record(&record("login failed from 203.0.113.7 (monitoring)"))
            .unwrap();
        assert_eq!(event.kind, MatchKind::Ignore);
        assert_eq!(event.rule_id, "f:ignore[0]");

        let event = m.match_record(&record("login failed from 203.0.113.7")).unwrap();
        assert_eq!(event.kind, MatchKind::Failure);
    }

    #[test]
    fn test_invalid_address_discarded() {
        let m = matcher("sshd");
        let line = "Dec  4 10:00:00 server sshd[1234]: Invalid user bob from 999.1.2.3 port 22";
        assert!(m.match_record(&record(line)).is_none());

        let line = "Dec  4 10:00:00 server sshd[1234]: Invalid user bob from cafe port 22";
        assert!(m.match_record(&record(line)).is_none());
    }

    #[test]
    fn test_unmatched_line() {
        let m = matcher("sshd");
        let line = "Dec  4 10:00:00 server sshd[1234]: Accepted publickey for alice from 10.0.0.5";
        assert!(m.match_record(&record(line)).is_none());
    }

    #[test]
    fn test_missing_host_group_rejected() {
        let f = filter(&[r"login failed"], &[], "auto");
        assert!(matches!(
            PatternMatcher::compile("j", "f", &f),
            Err(ConfigError::MissingHostGroup { .. })
        ));
    }

    #[test]
    fn test_explicit_ip_group() {
        let f = filter(&[r"client=(?P<ip>\S+) rejected"], &[], "auto");
        let m = PatternMatcher::compile("j", "f", &f).unwrap();
        let event = m.match_record(&record("client=198.51.100.2 rejected")).unwrap();
        assert_eq!(event.address, Some("198.51.100.2".parse().unwrap()));
    }

    #[test]
    fn test_invalid_regex_rejected() {
        let f = filter(&[r"failed from <HOST> ("], &[], "auto");
        assert!(matches!(
            PatternMatcher::compile("j", "f", &f),
            Err(ConfigError::InvalidRegex { .. })
        ));
    }

    #[test]
    fn test_parse_address_forms() {
        assert_eq!(parse_address("[2001:db8::1]"), Some("2001:db8::1".parse().unwrap()));
        assert_eq!(parse_address("::ffff:192.0.2.1"), Some("192.0.2.1".parse().unwrap()));
        assert_eq!(parse_address("10.0.0.256"), None);
    }

    #[test]
    fn test_nginx_access_status_codes() {
        let m = matcher("nginx-access");
        let fail = r#"203.0.113.7 - - [10/Oct/2023:13:55:36 +0000] "GET /wp-login.php HTTP/1.1" 404 153 "-" "curl/8.0""#;
        let ok = r#"203.0.113.7 - - [10/Oct/2023:13:55:36 +0000] "GET / HTTP/1.1" 200 512 "-" "curl/8.0""#;
        let favicon = r#"203.0.113.7 - - [10/Oct/2023:13:55:36 +0000] "GET /favicon.ico HTTP/1.1" 404 0 "-" "Firefox""#;

        let event = m.match_record(&record(fail)).unwrap();
        assert_eq!(event.kind, MatchKind::Failure);
        assert_eq!(
            event.matched_at,
            Utc.with_ymd_and_hms(2023, 10, 10, 13, 55, 36).unwrap()
        );

        assert_eq!(m.match_record(&record(ok)).unwrap().kind, MatchKind::Ignore);
        assert_eq!(m.match_record(&record(favicon)).unwrap().kind, MatchKind::Ignore);
    }

    #[test]
    fn test_postfix_and_dovecot() {
        let postfix = matcher("postfix-sasl");
        let line = "Jan 12 08:15:02 mx postfix/smtpd[991]: warning: unknown[198.51.100.23]: SASL LOGIN authentication failed: UGFzc3dvcmQ6";
        assert_eq!(
            postfix.match_record(&record(line)).unwrap().address,
            Some("198.51.100.23".parse().unwrap())
        );

        let dovecot = matcher("dovecot");
        let line = "Jan 12 08:15:02 mx dovecot: imap-login: Disconnected (auth failed, 1 attempts in 2 secs): user=<bob>, method=PLAIN, rip=198.51.100.24, lip=192.0.2.10, TLS";
        assert_eq!(
            dovecot.match_record(&record(line)).unwrap().address,
            Some("198.51.100.24".parse().unwrap())
        );
    }

    #[test]
    fn test_timestamp_fallback_to_observed() {
        let f = filter(&[r"failed from <HOST>"], &[], "auto");
        let m = PatternMatcher::compile("j", "f", &f).unwrap();
        let observed = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let event = m
            .match_record(&record("no stamp here, failed from 203.0.113.7").observed(observed))
            .unwrap();
        assert_eq!(event.matched_at, observed);
    }

    #[test]
    fn test_iso8601_with_offset() {
        let f = filter(&[r"failed from <HOST>"], &[], "iso8601");
        let m = PatternMatcher::compile("j", "f", &f).unwrap();
        let event = m
            .match_record(&record("2024-03-01T10:00:00+02:00 failed from 203.0.113.7"))
            .unwrap();
        assert_eq!(
            event.matched_at,
            Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap()
        );

        let event = m
            .match_record(&record("2024-03-01T10:00:00Z failed from 203.0.113.7"))
            .unwrap();
        assert_eq!(event.matched_at.hour(), 10);
    }

    #[test]
    fn test_epoch_timestamps() {
        let f = filter(&[r"failed from <HOST>"], &[], "epoch");
        let m = PatternMatcher::compile("j", "f", &f).unwrap();
        let event = m
            .match_record(&record("1700000000.5 failed from 203.0.113.7"))
            .unwrap();
        assert_eq!(event.matched_at.timestamp(), 1_700_000_000);
    }

    #[test]
    fn test_syslog_year_rollover() {
        let observed = Local
            .with_ymd_and_hms(2024, 1, 1, 0, 0, 30)
            .unwrap()
            .with_timezone(&Utc);
        let parsed = parse_syslog("Dec 31 23:59:50", observed).unwrap();
        assert_eq!(parsed.with_timezone(&Local).year(), 2023);

        let parsed = parse_syslog("Jan  1 00:00:10", observed).unwrap();
        assert_eq!(parsed.with_timezone(&Local).year(), 2024);
    }

    #[test]
    fn test_custom_date_format() {
        let mut f = filter(&[r"failed from <HOST>"], &[], "%d.%m.%Y %H:%M:%S %z");
        f.date_regex = Some(r"^\[([^\]]+)\]".to_string());
        let m = PatternMatcher::compile("j", "f", &f).unwrap();
        let event = m
            .match_record(&record("[05.06.2024 07:08:09 +0000] failed from 203.0.113.7"))
            .unwrap();
        assert_eq!(
            event.matched_at,
            Utc.with_ymd_and_hms(2024, 6, 5, 7, 8, 9).unwrap()
        );

        let bad = filter(&[r"failed from <HOST>"], &[], "sometimes");
        assert!(matches!(
            PatternMatcher::compile("j", "f", &bad),
            Err(ConfigError::InvalidDateFormat { .. })
        ));
    }
}
