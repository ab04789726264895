use std::fmt;

/// Credits are represented as integer hundredths to avoid floating-point drift.
/// One credit is one hour of service, so 1 credit = 100 units and 1.50 credits = 150.
pub type Credits = i64;

/// Units per whole credit.
pub const UNITS_PER_CREDIT: Credits = 100;

/// Format credits as a human-readable string.
/// Example: 500 -> "5.00", -1234 -> "-12.34"
pub fn format_credits(credits: Credits) -> String {
    let sign = if credits < 0 { "-" } else { "" };
    let abs = credits.abs();
    let whole = abs / UNITS_PER_CREDIT;
    let remainder = abs % UNITS_PER_CREDIT;
    format!("{}{}.{:02}", sign, whole, remainder)
}

/// Format credits as the amount of service time they stand for.
/// Example: 150 -> "1h 30m", 25 -> "0h 15m"
pub fn format_duration(credits: Credits) -> String {
    let sign = if credits < 0 { "-" } else { "" };
    let abs = credits.abs();
    let hours = abs / UNITS_PER_CREDIT;
    let minutes = (abs % UNITS_PER_CREDIT) * 60 / UNITS_PER_CREDIT;
    format!("{}{}h {}m", sign, hours, minutes)
}

/// Parse a decimal string into credit units.
/// Example: "5.00" -> 500, "1.5" -> 150, "2" -> 200
pub fn parse_credits(input: &str) -> Result<Credits, ParseCreditsError> {
    let input = input.trim();
    let negative = input.starts_with('-');
    let input = input.trim_start_matches('-');

    let parts: Vec<&str> = input.split('.').collect();
    let units = match parts.as_slice() {
        [whole] => to_units(parse_whole(whole)?, 0)?,
        [whole, fraction] => {
            let whole = if whole.is_empty() {
                0
            } else {
                parse_whole(whole)?
            };
            let fraction: Credits = match fraction.len() {
                0 => 0,
                1 => parse_whole(fraction)? * 10,
                2 => parse_whole(fraction)?,
                // More than 2 decimal places - truncate
                _ => parse_whole(&fraction[..2])?,
            };
            to_units(whole, fraction)?
        }
        _ => return Err(ParseCreditsError::InvalidFormat),
    };

    Ok(if negative { -units } else { units })
}

fn to_units(whole: Credits, fraction: Credits) -> Result<Credits, ParseCreditsError> {
    whole
        .checked_mul(UNITS_PER_CREDIT)
        .and_then(|units| units.checked_add(fraction))
        .ok_or(ParseCreditsError::Overflow)
}

fn parse_whole(digits: &str) -> Result<Credits, ParseCreditsError> {
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(ParseCreditsError::InvalidFormat);
    }
    // Only ASCII digits remain, so parsing can fail on size alone.
    digits.parse().map_err(|_| ParseCreditsError::Overflow)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseCreditsError {
    InvalidFormat,
    Overflow,
}

impl fmt::Display for ParseCreditsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseCreditsError::InvalidFormat => write!(f, "invalid credit amount"),
            ParseCreditsError::Overflow => write!(f, "credit amount is too large"),
        }
    }
}

impl std::error::Error for ParseCreditsError {}
