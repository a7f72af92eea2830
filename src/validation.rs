use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Deserializer};

use crate::error::ApiError;

/// Accepts `9876543210`, `+91 98765 43210`, `09876543210`; returns the
/// bare 10-digit mobile number.
pub fn normalize_phone(raw: &str) -> Result<String, ApiError> {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    let national = match digits.len() {
        10 => digits.as_str(),
        11 if digits.starts_with('0') => &digits[1..],
        12 if digits.starts_with("91") => &digits[2..],
        _ => return Err(ApiError::validation("phone must be a 10 digit mobile number")),
    };
    if !national.starts_with(&['6', '7', '8', '9'][..]) {
        return Err(ApiError::validation("phone must be a 10 digit mobile number"));
    }
    Ok(national.to_string())
}

/// `98******10`
pub fn mask_phone(phone: &str) -> String {
    if phone.len() < 4 {
        return "*".repeat(phone.len());
    }
    format!("{}{}{}", &phone[..2], "*".repeat(phone.len() - 4), &phone[phone.len() - 2..])
}

pub fn validate_pincode(pincode: &str) -> Result<(), ApiError> {
    let p = pincode.trim();
    if p.len() == 6 && p.chars().all(|c| c.is_ascii_digit()) && !p.starts_with('0') {
        Ok(())
    } else {
        Err(ApiError::validation("pincode must be 6 digits"))
    }
}

/// Completed years between `dob` and `today`.
pub fn age_in_years(dob: NaiveDate, today: NaiveDate) -> i32 {
    let mut years = today.year() - dob.year();
    if (today.month(), today.day()) < (dob.month(), dob.day()) {
        years -= 1;
    }
    years
}

pub fn ensure_min_age(dob: NaiveDate, today: NaiveDate, min_years: u32) -> Result<(), ApiError> {
    if dob > today {
        return Err(ApiError::validation("date_of_birth cannot be in the future"));
    }
    if age_in_years(dob, today) < min_years as i32 {
        return Err(ApiError::BadRequest(
            "PATIENT_TOO_YOUNG",
            format!("patient must be at least {min_years} years old"),
        ));
    }
    Ok(())
}

pub fn required<'a>(value: &'a str, field: &str) -> Result<&'a str, ApiError> {
    let v = value.trim();
    if v.is_empty() {
        Err(ApiError::validation(format!("{field} is required")))
    } else {
        Ok(v)
    }
}

/// Lowercase ASCII slug: `"Thyroid Profile (T3)"` -> `"thyroid-profile-t3"`.
pub fn slugify(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut dash = false;
    for c in s.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
            dash = false;
        } else if !dash && !out.is_empty() {
            out.push('-');
            dash = true;
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    out
}

/// For PATCH bodies: absent => None, `null` => Some(None), value => Some(Some(v)).
/// Use with `#[serde(default, deserialize_with = "double_option")]`.
pub fn double_option<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    let inner = Option::<T>::deserialize(deserializer)?;
    Ok(Some(inner))
}

pub fn ensure_gender(g: i16) -> Result<(), ApiError> {
    if (0..=2).contains(&g) {
        Ok(())
    } else {
        Err(ApiError::validation("gender must be 0,1,2"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn phone_variants_normalize() {
        assert_eq!(normalize_phone("9876543210").unwrap(), "9876543210");
        assert_eq!(normalize_phone("+91 98765 43210").unwrap(), "9876543210");
        assert_eq!(normalize_phone("09876543210").unwrap(), "9876543210");
        assert!(normalize_phone("12345").is_err());
        assert!(normalize_phone("1234567890").is_err());
    }

    #[test]
    fn phone_mask_keeps_edges() {
        assert_eq!(mask_phone("9876543210"), "98******10");
        assert_eq!(mask_phone("12"), "**");
    }

    #[test]
    fn pincode_rules() {
        assert!(validate_pincode("560001").is_ok());
        assert!(validate_pincode("060001").is_err());
        assert!(validate_pincode("56001").is_err());
        assert!(validate_pincode("56000a").is_err());
    }

    #[test]
    fn age_counts_completed_years() {
        assert_eq!(age_in_years(d(2000, 6, 15), d(2020, 6, 14)), 19);
        assert_eq!(age_in_years(d(2000, 6, 15), d(2020, 6, 15)), 20);
        assert_eq!(age_in_years(d(2000, 2, 29), d(2021, 2, 28)), 20);
    }

    #[test]
    fn min_age_is_enforced() {
        let today = d(2026, 1, 10);
        assert!(ensure_min_age(d(2021, 1, 10), today, 5).is_ok());
        let err = ensure_min_age(d(2021, 1, 11), today, 5).unwrap_err();
        assert_eq!(err.code(), "PATIENT_TOO_YOUNG");
        assert!(ensure_min_age(d(2027, 1, 1), today, 0).is_err());
    }

    #[test]
    fn slugs_collapse_punctuation() {
        assert_eq!(slugify("Thyroid Profile (T3)"), "thyroid-profile-t3");
        assert_eq!(slugify("  --CBC--  "), "cbc");
        assert_eq!(slugify("Vitamin B12 & D3"), "vitamin-b12-d3");
    }

    #[test]
    fn required_trims() {
        assert_eq!(required("  Home ", "label").unwrap(), "Home");
        assert!(required("   ", "label").is_err());
    }
}
