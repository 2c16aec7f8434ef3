//! Typed fact values and value parsing

use chrono::{Datelike, NaiveDate};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{ContextError, Result};

/// Typed value of a fact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FactValue {
    Money { amount: f64, currency: String },
    Percent { value: f64 },
    Number { value: f64, unit: Option<String> },
    Date { date: NaiveDate },
    DateRange { start: NaiveDate, end: NaiveDate },
    Text { text: String },
}

impl FactValue {
    pub fn text(text: impl Into<String>) -> Self {
        FactValue::Text { text: text.into() }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            FactValue::Money { .. } => "money",
            FactValue::Percent { .. } => "percent",
            FactValue::Number { .. } => "number",
            FactValue::Date { .. } => "date",
            FactValue::DateRange { .. } => "date_range",
            FactValue::Text { .. } => "text",
        }
    }

    pub fn is_typed(&self) -> bool {
        !matches!(self, FactValue::Text { .. })
    }

    /// Numeric magnitude for money, percent and number values
    pub fn numeric(&self) -> Option<f64> {
        match self {
            FactValue::Money { amount, .. } => Some(*amount),
            FactValue::Percent { value } => Some(*value),
            FactValue::Number { value, .. } => Some(*value),
            _ => None,
        }
    }

    /// Canonical string used for fact ids and text comparison
    pub fn normalized(&self) -> String {
        match self {
            FactValue::Money { amount, currency } => format!("money:{}:{}", currency, amount),
            FactValue::Percent { value } => format!("percent:{}", value),
            FactValue::Number { value, unit } => {
                format!("number:{}:{}", value, unit.as_deref().unwrap_or(""))
            }
            FactValue::Date { date } => format!("date:{}", date),
            FactValue::DateRange { start, end } => format!("date_range:{}..{}", start, end),
            FactValue::Text { text } => format!("text:{}", normalize_text(text)),
        }
    }
}

impl fmt::Display for FactValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FactValue::Money { amount, currency } => {
                let symbol = match currency.as_str() {
                    "USD" => "$",
                    "EUR" => "€",
                    "GBP" => "£",
                    _ => "",
                };
                let (scaled, suffix) = scale_for_display(*amount);
                if symbol.is_empty() {
                    write!(f, "{}{} {}", fmt_number(scaled), suffix, currency)
                } else {
                    write!(f, "{}{}{}", symbol, fmt_number(scaled), suffix)
                }
            }
            FactValue::Percent { value } => write!(f, "{}%", fmt_number(*value)),
            FactValue::Number { value, unit } => match unit {
                Some(u) => write!(f, "{} {}", fmt_number(*value), u),
                None => write!(f, "{}", fmt_number(*value)),
            },
            FactValue::Date { date } => write!(f, "{}", date),
            FactValue::DateRange { start, end } => write!(f, "{} to {}", start, end),
            FactValue::Text { text } => write!(f, "{}", text),
        }
    }
}

fn scale_for_display(amount: f64) -> (f64, &'static str) {
    let abs = amount.abs();
    if abs >= 1e9 {
        (amount / 1e9, "B")
    } else if abs >= 1e6 {
        (amount / 1e6, "M")
    } else if abs >= 1e3 {
        (amount / 1e3, "K")
    } else {
        (amount, "")
    }
}

fn fmt_number(v: f64) -> String {
    if (v - v.round()).abs() < 1e-9 {
        format!("{}", v.round() as i64)
    } else {
        let s = format!("{:.2}", v);
        s.trim_end_matches('0').trim_end_matches('.').to_string()
    }
}

/// Lowercase, strip punctuation, collapse whitespace
pub fn normalize_text(text: &str) -> String {
    text.chars()
        .map(|c| {
            if c.is_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                ' '
            }
        })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn scale_factor(word: &str) -> Option<f64> {
    match word.to_lowercase().as_str() {
        "k" | "thousand" => Some(1e3),
        "m" | "mm" | "mn" | "million" | "millions" => Some(1e6),
        "b" | "bn" | "billion" | "billions" => Some(1e9),
        "t" | "tn" | "trillion" => Some(1e12),
        _ => None,
    }
}

fn currency_code(token: &str) -> Option<&'static str> {
    match token.to_lowercase().as_str() {
        "$" | "usd" | "dollars" | "dollar" => Some("USD"),
        "€" | "eur" | "euros" | "euro" => Some("EUR"),
        "£" | "gbp" | "pounds" | "pound" => Some("GBP"),
        "¥" | "jpy" | "yen" => Some("JPY"),
        _ => None,
    }
}

fn parse_amount(raw: &str) -> Option<f64> {
    raw.replace(',', "").parse::<f64>().ok()
}

fn month_number(name: &str) -> Option<u32> {
    let lower = name.to_lowercase();
    let months = [
        "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
    ];
    months
        .iter()
        .position(|m| lower.starts_with(m))
        .map(|i| i as u32 + 1)
}

fn last_day_of_month(year: i32, month: u32) -> Option<NaiveDate> {
    let (ny, nm) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    NaiveDate::from_ymd_opt(ny, nm, 1).and_then(|d| d.pred_opt())
}

/// Parses the leading value of a phrase into a [`FactValue`].
///
/// Only the prefix is inspected, so "$10M, up 5% on Q2" parses as money.
pub struct ValueParser {
    money_prefix: Regex,
    money_suffix: Regex,
    percent: Regex,
    quarter: Regex,
    iso_range: Regex,
    iso_date: Regex,
    long_date: Regex,
    month_year: Regex,
    number: Regex,
}

impl ValueParser {
    pub fn new() -> Result<Self> {
        let build = |pattern: &str| {
            Regex::new(pattern)
                .map_err(|e| ContextError::Internal(format!("invalid value pattern: {}", e)))
        };
        Ok(Self {
            money_prefix: build(
                r"(?i)^(?P<cur>[$€£¥])\s?(?P<num>\d[\d,]*(?:\.\d+)?)\s*(?P<scale>thousand|million|billion|trillion|bn|mn|mm|k|m|b|t)?\b",
            )?,
            money_suffix: build(
                r"(?i)^(?P<num>\d[\d,]*(?:\.\d+)?)\s*(?P<scale>thousand|million|billion|trillion|bn|mn|k|m|b)?\s*(?P<cur>usd|eur|gbp|jpy|dollars?|euros?|pounds?|yen)\b",
            )?,
            percent: build(r"(?i)^(?P<num>-?\d[\d,]*(?:\.\d+)?)\s*(?:%|percent\b|per cent\b)")?,
            quarter: build(r"(?i)^q(?P<q>[1-4])\s*(?:fy\s*)?(?P<year>\d{4})\b")?,
            iso_range: build(
                r"^(?P<start>\d{4}-\d{2}-\d{2})\s*(?:to|through|until|-|–)\s*(?P<end>\d{4}-\d{2}-\d{2})\b",
            )?,
            iso_date: build(r"^(?P<date>\d{4}-\d{2}-\d{2})\b")?,
            long_date: build(
                r"(?i)^(?P<month>jan(?:uary)?|feb(?:ruary)?|mar(?:ch)?|apr(?:il)?|may|june?|july?|aug(?:ust)?|sep(?:t(?:ember)?)?|oct(?:ober)?|nov(?:ember)?|dec(?:ember)?)\.?\s+(?P<day>\d{1,2})(?:st|nd|rd|th)?,?\s+(?P<year>\d{4})\b",
            )?,
            month_year: build(
                r"(?i)^(?P<month>jan(?:uary)?|feb(?:ruary)?|mar(?:ch)?|apr(?:il)?|may|june?|july?|aug(?:ust)?|sep(?:t(?:ember)?)?|oct(?:ober)?|nov(?:ember)?|dec(?:ember)?)\s+(?P<year>\d{4})\b",
            )?,
            number: build(
                r"(?i)^(?P<num>-?\d[\d,]*(?:\.\d+)?)(?:\s*(?P<scale>thousand|million|billion|trillion|k|m|b)\b)?(?:\s+(?P<unit>[a-z][a-z\-]*))?",
            )?,
        })
    }

    /// Parse a value phrase. Falls back to [`FactValue::Text`].
    pub fn parse(&self, raw: &str) -> FactValue {
        let phrase = raw.trim().trim_end_matches(['.', ';', ',']).trim();

        if let Some(v) = self.parse_money(phrase) {
            return v;
        }
        if let Some(c) = self.percent.captures(phrase) {
            if let Some(value) = parse_amount(&c["num"]) {
                return FactValue::Percent { value };
            }
        }
        if let Some(v) = self.parse_dates(phrase) {
            return v;
        }
        if let Some(c) = self.number.captures(phrase) {
            if let Some(mut value) = parse_amount(&c["num"]) {
                if let Some(scale) = c.name("scale").and_then(|m| scale_factor(m.as_str())) {
                    value *= scale;
                }
                let unit = c
                    .name("unit")
                    .map(|m| m.as_str().to_lowercase())
                    .filter(|u| !is_connective(u));
                return FactValue::Number { value, unit };
            }
        }

        FactValue::text(text_value(phrase))
    }

    fn parse_money(&self, phrase: &str) -> Option<FactValue> {
        let c = self
            .money_prefix
            .captures(phrase)
            .or_else(|| self.money_suffix.captures(phrase))?;
        let mut amount = parse_amount(&c["num"])?;
        if let Some(scale) = c.name("scale").and_then(|m| scale_factor(m.as_str())) {
            amount *= scale;
        }
        let currency = currency_code(&c["cur"])?.to_string();
        Some(FactValue::Money { amount, currency })
    }

    fn parse_dates(&self, phrase: &str) -> Option<FactValue> {
        if let Some(c) = self.quarter.captures(phrase) {
            let q: u32 = c["q"].parse().ok()?;
            let year: i32 = c["year"].parse().ok()?;
            let start = NaiveDate::from_ymd_opt(year, (q - 1) * 3 + 1, 1)?;
            let end = last_day_of_month(year, q * 3)?;
            return Some(FactValue::DateRange { start, end });
        }
        if let Some(c) = self.iso_range.captures(phrase) {
            let start = NaiveDate::parse_from_str(&c["start"], "%Y-%m-%d").ok()?;
            let end = NaiveDate::parse_from_str(&c["end"], "%Y-%m-%d").ok()?;
            return Some(FactValue::DateRange { start, end });
        }
        if let Some(c) = self.iso_date.captures(phrase) {
            let date = NaiveDate::parse_from_str(&c["date"], "%Y-%m-%d").ok()?;
            return Some(FactValue::Date { date });
        }
        if let Some(c) = self.long_date.captures(phrase) {
            let month = month_number(&c["month"])?;
            let day: u32 = c["day"].parse().ok()?;
            let year: i32 = c["year"].parse().ok()?;
            let date = NaiveDate::from_ymd_opt(year, month, day)?;
            return Some(FactValue::Date { date });
        }
        if let Some(c) = self.month_year.captures(phrase) {
            let month = month_number(&c["month"])?;
            let year: i32 = c["year"].parse().ok()?;
            let start = NaiveDate::from_ymd_opt(year, month, 1)?;
            let end = last_day_of_month(start.year(), start.month())?;
            return Some(FactValue::DateRange { start, end });
        }
        None
    }
}

fn is_connective(word: &str) -> bool {
    matches!(
        word,
        "and" | "or" | "in" | "on" | "at" | "for" | "by" | "to" | "from" | "with" | "up" | "down"
            | "compared" | "versus" | "vs" | "year" | "per"
    )
}

/// Text values stop at the first clause break and are capped at 12 words
fn text_value(phrase: &str) -> String {
    let clause = phrase
        .split([',', ';', '(', '—'])
        .next()
        .unwrap_or(phrase)
        .trim();
    clause.split_whitespace().take(12).collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parser() -> ValueParser {
        ValueParser::new().unwrap()
    }

    #[test]
    fn test_money_with_scale() {
        assert_eq!(
            parser().parse("$10M, up from Q2"),
            FactValue::Money {
                amount: 10_000_000.0,
                currency: "USD".to_string()
            }
        );
        assert_eq!(
            parser().parse("2.5 billion euros"),
            FactValue::Money {
                amount: 2_500_000_000.0,
                currency: "EUR".to_string()
            }
        );
        assert_eq!(
            parser().parse("€2.5 billion"),
            FactValue::Money {
                amount: 2_500_000_000.0,
                currency: "EUR".to_string()
            }
        );
    }

    #[test]
    fn test_percent_and_number() {
        assert_eq!(parser().parse("12.5%"), FactValue::Percent { value: 12.5 });
        assert_eq!(
            parser().parse("1,200 employees"),
            FactValue::Number {
                value: 1200.0,
                unit: Some("employees".to_string())
            }
        );
        assert_eq!(
            parser().parse("42 in total"),
            FactValue::Number {
                value: 42.0,
                unit: None
            }
        );
    }

    #[test]
    fn test_dates() {
        let p = parser();
        assert_eq!(
            p.parse("Q3 2024"),
            FactValue::DateRange {
                start: NaiveDate::from_ymd_opt(2024, 7, 1).unwrap(),
                end: NaiveDate::from_ymd_opt(2024, 9, 30).unwrap(),
            }
        );
        assert_eq!(
            p.parse("March 5, 2024"),
            FactValue::Date {
                date: NaiveDate::from_ymd_opt(2024, 3, 5).unwrap()
            }
        );
        assert_eq!(
            p.parse("2024-02-01"),
            FactValue::Date {
                date: NaiveDate::from_ymd_opt(2024, 2, 1).unwrap()
            }
        );
        assert!(matches!(p.parse("February 2024"), FactValue::DateRange { .. }));
    }

    #[test]
    fn test_text_fallback_truncates_clause() {
        assert_eq!(
            parser().parse("Jane Doe, who joined in 2019."),
            FactValue::text("Jane Doe")
        );
    }

    #[test]
    fn test_display_round_trips_common_forms() {
        assert_eq!(parser().parse("$10M").to_string(), "$10M");
        assert_eq!(parser().parse("12.5%").to_string(), "12.5%");
    }

    #[test]
    fn test_normalize_text() {
        assert_eq!(normalize_text("  Jane   DOE. "), "jane doe");
    }
}
