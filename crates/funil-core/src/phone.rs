//! Phone normalization for the tier-3 contact dedup index.

/// Country-code prefix stripped before storing the normalized form.
const BR_COUNTRY_CODE: &str = "55";

/// Normalize a raw phone string for index storage: digits only, with the
/// Brazilian country prefix removed when the length says it is one (12 or 13
/// digits covers DDD + 8/9-digit numbers). Too-short inputs are not
/// indexable.
pub fn normalize_phone(raw: &str) -> Option<String> {
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    if digits.len() < 8 {
        return None;
    }
    if (digits.len() == 12 || digits.len() == 13) && digits.starts_with(BR_COUNTRY_CODE) {
        return Some(digits[BR_COUNTRY_CODE.len()..].to_string());
    }
    Some(digits)
}
