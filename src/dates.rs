//! Natural-language date and time normalization.
//!
//! Callers state dates the way people speak ("March 22, 1978", "3/22/78");
//! verification compares against stored ISO dates, so everything funnels
//! through [`parse_natural_date`] / [`parse_natural_time`].

use chrono::{Datelike, NaiveDate, NaiveTime, Utc};

const MONTHS: [(&str, u32); 12] = [
    ("january", 1),
    ("february", 2),
    ("march", 3),
    ("april", 4),
    ("may", 5),
    ("june", 6),
    ("july", 7),
    ("august", 8),
    ("september", 9),
    ("october", 10),
    ("november", 11),
    ("december", 12),
];

fn month_number(word: &str) -> Option<u32> {
    let word = word.to_ascii_lowercase();
    MONTHS
        .iter()
        .find(|(name, _)| *name == word || (word.len() >= 3 && name.starts_with(&word)))
        .map(|(_, n)| *n)
}

fn strip_ordinal(word: &str) -> &str {
    word.trim_end_matches(|c: char| c.is_ascii_alphabetic())
}

fn expand_two_digit_year(year: i32) -> i32 {
    if year >= 100 {
        return year;
    }
    // Pivot consistent with how callers state birth years.
    let current_two = Utc::now().year() % 100;
    if year <= current_two {
        2000 + year
    } else {
        1900 + year
    }
}

/// Parse a natural-language date into ISO `YYYY-MM-DD`.
///
/// Accepts ISO dates, `Month D[, ]YYYY`, `D Month YYYY`, and numeric
/// `M/D/YYYY` forms. Dates without a year default to `default_year`
/// (current year when `None`). Returns `None` when nothing parses.
pub fn parse_natural_date(input: &str, default_year: Option<i32>) -> Option<String> {
    let input = input.trim();
    if input.is_empty() {
        return None;
    }

    // Already ISO.
    if let Ok(date) = NaiveDate::parse_from_str(input, "%Y-%m-%d") {
        return Some(date.format("%Y-%m-%d").to_string());
    }

    // Numeric M/D/Y or M-D-Y.
    let numeric: Vec<&str> = input
        .split(|c| c == '/' || c == '-')
        .map(str::trim)
        .collect();
    if numeric.len() == 3
        && let (Ok(m), Ok(d), Ok(y)) = (
            numeric[0].parse::<u32>(),
            numeric[1].parse::<u32>(),
            numeric[2].parse::<i32>(),
        )
    {
        return NaiveDate::from_ymd_opt(expand_two_digit_year(y), m, d)
            .map(|date| date.format("%Y-%m-%d").to_string());
    }

    // Worded forms: "March 22, 1978", "22 March 1978", "December 3rd".
    let cleaned = input.replace(',', " ");
    let words: Vec<&str> = cleaned.split_whitespace().collect();
    let mut month = None;
    let mut day = None;
    let mut year = None;
    for word in &words {
        if month.is_none()
            && let Some(m) = month_number(word)
        {
            month = Some(m);
            continue;
        }
        let bare = strip_ordinal(word);
        if let Ok(n) = bare.parse::<i64>() {
            if (1..=31).contains(&n) && day.is_none() {
                day = Some(n as u32);
            } else if n >= 32 {
                year = Some(n as i32);
            }
        }
    }

    let month = month?;
    let day = day?;
    let year = year
        .map(expand_two_digit_year)
        .or(default_year)
        .unwrap_or_else(|| Utc::now().year());
    NaiveDate::from_ymd_opt(year, month, day).map(|date| date.format("%Y-%m-%d").to_string())
}

/// Parse a natural-language time into 24-hour `HH:MM`.
///
/// Accepts `HH:MM`, `H:MM AM/PM`, and bare `H AM/PM`. Returns `None` when
/// nothing parses.
pub fn parse_natural_time(input: &str) -> Option<String> {
    let input = input.trim();
    if input.is_empty() {
        return None;
    }

    if let Ok(t) = NaiveTime::parse_from_str(input, "%H:%M") {
        return Some(t.format("%H:%M").to_string());
    }

    let upper = input.to_ascii_uppercase();
    for fmt in ["%I:%M %p", "%I:%M%p", "%I %p", "%I%p"] {
        if let Ok(t) = NaiveTime::parse_from_str(&upper, fmt) {
            return Some(t.format("%H:%M").to_string());
        }
    }
    None
}
