//! TTL strings: `<N><unit>` with unit one of `s`, `m`, `h`, `d`, `w`.

use crate::error::GroxError;

/// Parse a TTL string into seconds.
///
/// Absent or blank input means "no expiry" and yields `Ok(None)`.
/// Surrounding whitespace and unit case are ignored (`" 5M "` is 300).
pub fn parse_ttl(ttl: Option<&str>) -> Result<Option<u64>, GroxError> {
    let raw = match ttl {
        Some(s) if !s.trim().is_empty() => s,
        _ => return Ok(None),
    };
    let invalid = || GroxError::InvalidTtl(raw.to_string());

    let normalized = raw.trim().to_ascii_lowercase();
    let unit = normalized.chars().last().ok_or_else(invalid)?;
    let digits = &normalized[..normalized.len() - unit.len_utf8()];
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }

    let multiplier: u64 = match unit {
        's' => 1,
        'm' => 60,
        'h' => 3_600,
        'd' => 86_400,
        'w' => 604_800,
        _ => return Err(invalid()),
    };

    let value: u64 = digits.parse().map_err(|_| invalid())?;
    value
        .checked_mul(multiplier)
        .map(Some)
        .ok_or_else(invalid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_units() {
        assert_eq!(parse_ttl(Some("30s")).unwrap(), Some(30));
        assert_eq!(parse_ttl(Some("5m")).unwrap(), Some(300));
        assert_eq!(parse_ttl(Some("2h")).unwrap(), Some(7_200));
        assert_eq!(parse_ttl(Some("1d")).unwrap(), Some(86_400));
        assert_eq!(parse_ttl(Some("1w")).unwrap(), Some(604_800));
    }

    #[test]
    fn test_absent_means_no_expiry() {
        assert_eq!(parse_ttl(None).unwrap(), None);
        assert_eq!(parse_ttl(Some("")).unwrap(), None);
        assert_eq!(parse_ttl(Some("   ")).unwrap(), None);
    }

    #[test]
    fn test_case_and_whitespace_tolerated() {
        assert_eq!(parse_ttl(Some(" 5M ")).unwrap(), Some(300));
    }

    #[test]
    fn test_malformed_echoes_input() {
        for bad in ["3x", "abc", "m", "-5m", "1.5h", "5 m", "h5"] {
            match parse_ttl(Some(bad)) {
                Err(GroxError::InvalidTtl(v)) => assert_eq!(v, bad),
                other => panic!("expected InvalidTtl for {bad:?}, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_overflow_is_invalid() {
        assert!(matches!(
            parse_ttl(Some("99999999999999999999w")),
            Err(GroxError::InvalidTtl(_))
        ));
    }
}
