use thiserror::Error;

/// Decimals assumed when a token does not report its own.
pub const DEFAULT_DECIMALS: u8 = 18;

/// Largest power of ten that fits in a `u128`.
const MAX_DECIMALS: u8 = 38;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UnitsError {
    #[error("amount is empty")]
    Empty,

    #[error("'{0}' is not a decimal number")]
    Malformed(String),

    #[error("{digits} fractional digits exceed the token's {decimals} decimals")]
    TooPrecise { digits: usize, decimals: u8 },

    #[error("amount does not fit in 128 bits")]
    Overflow,
}

/// Convert a decimal string such as `"1.5"` into integer units at `decimals`.
///
/// Fractional digits beyond `decimals` are rejected rather than truncated.
pub fn parse_units(raw: &str, decimals: u8) -> Result<u128, UnitsError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(UnitsError::Empty);
    }
    if decimals > MAX_DECIMALS {
        return Err(UnitsError::Overflow);
    }

    let (whole, fraction) = match raw.split_once('.') {
        Some((w, f)) => (w, f),
        None => (raw, ""),
    };
    let all_digits = |s: &str| s.bytes().all(|b| b.is_ascii_digit());
    if (whole.is_empty() && fraction.is_empty()) || !all_digits(whole) || !all_digits(fraction) {
        return Err(UnitsError::Malformed(raw.to_string()));
    }

    let fraction = fraction.trim_end_matches('0');
    if fraction.len() > decimals as usize {
        return Err(UnitsError::TooPrecise {
            digits: fraction.len(),
            decimals,
        });
    }

    let scale = 10u128.pow(decimals as u32);
    let whole_units = if whole.is_empty() {
        0
    } else {
        whole
            .parse::<u128>()
            .map_err(|_| UnitsError::Overflow)?
            .checked_mul(scale)
            .ok_or(UnitsError::Overflow)?
    };
    let fraction_units = if fraction.is_empty() {
        0
    } else {
        let padding = decimals as u32 - fraction.len() as u32;
        fraction
            .parse::<u128>()
            .map_err(|_| UnitsError::Overflow)?
            * 10u128.pow(padding)
    };
    whole_units
        .checked_add(fraction_units)
        .ok_or(UnitsError::Overflow)
}

/// Render integer units as a decimal string without trailing zeros.
pub fn format_units(units: u128, decimals: u8) -> String {
    if decimals == 0 || decimals > MAX_DECIMALS {
        return units.to_string();
    }
    let scale = 10u128.pow(decimals as u32);
    let whole = units / scale;
    let fraction = units % scale;
    if fraction == 0 {
        return whole.to_string();
    }
    let padded = format!("{fraction:0width$}", width = decimals as usize);
    format!("{whole}.{}", padded.trim_end_matches('0'))
}
