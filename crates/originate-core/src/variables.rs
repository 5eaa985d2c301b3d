//! Channel variable store and the variable names the engine understands

use indexmap::IndexMap;

/// Ordered, unique-key variable mapping.
pub type Variables = IndexMap<String, String>;

pub mod names {
    pub const GROUP_CONFIRM_KEY: &str = "group_confirm_key";
    pub const GROUP_CONFIRM_FILE: &str = "group_confirm_file";
    pub const GROUP_CONFIRM_ERROR_FILE: &str = "group_confirm_error_file";
    pub const GROUP_CONFIRM_READ_TIMEOUT: &str = "group_confirm_read_timeout";
    pub const FORKED_DIAL: &str = "forked_dial";
    pub const FAIL_ON_SINGLE_REJECT: &str = "fail_on_single_reject";
    pub const IGNORE_EARLY_MEDIA: &str = "ignore_early_media";
    pub const IGNORE_RING_READY: &str = "ignore_ring_ready";
    pub const RETURN_RING_READY: &str = "return_ring_ready";
    pub const INSTANT_RINGBACK: &str = "instant_ringback";
    pub const ORIGINATE_TIMEOUT: &str = "originate_timeout";
    pub const PROGRESS_TIMEOUT: &str = "progress_timeout";
    pub const CALL_TIMEOUT: &str = "call_timeout";
    pub const ORIGINATE_RETRIES: &str = "originate_retries";
    pub const ORIGINATE_RETRY_SLEEP_MS: &str = "originate_retry_sleep_ms";
    pub const ORIGINATION_CALLER_ID_NAME: &str = "origination_caller_id_name";
    pub const ORIGINATION_CALLER_ID_NUMBER: &str = "origination_caller_id_number";
    pub const ORIGINATION_PRIVACY: &str = "origination_privacy";
    pub const ORIGINATE_EARLY_MEDIA: &str = "originate_early_media";
    pub const LOCAL_VAR_CLOBBER: &str = "local_var_clobber";
    pub const LEG_TIMEOUT: &str = "leg_timeout";
    pub const LEG_PROGRESS_TIMEOUT: &str = "leg_progress_timeout";
    pub const LEG_REQUIRED: &str = "leg_required";
    pub const RINGBACK: &str = "ringback";
    pub const TRANSFER_RINGBACK: &str = "transfer_ringback";
    pub const SEND_SILENCE_WHEN_IDLE: &str = "send_silence_when_idle";
    pub const IMPORT: &str = "import";
    pub const EXPORT_VARS: &str = "export_vars";
    pub const ORIGINATE_DISPOSITION: &str = "originate_disposition";
    pub const FAILED_XML_CDR_PREFIX: &str = "failed_xml_cdr_prefix";
    pub const SOFT_HOLDING_UUID: &str = "soft_holding_uuid";
    pub const LANGUAGE: &str = "language";

    /// Originator variables inherited by the dial when the dial string does
    /// not set them itself.
    pub const INHERITED: &[&str] = &[
        GROUP_CONFIRM_KEY,
        GROUP_CONFIRM_FILE,
        GROUP_CONFIRM_ERROR_FILE,
        GROUP_CONFIRM_READ_TIMEOUT,
        FORKED_DIAL,
        FAIL_ON_SINGLE_REJECT,
        IGNORE_EARLY_MEDIA,
        IGNORE_RING_READY,
        RETURN_RING_READY,
        INSTANT_RINGBACK,
        PROGRESS_TIMEOUT,
        LANGUAGE,
    ];
}

/// Truth test for variable values: `yes`, `on`, `true`, `t`, `enabled`,
/// `active`, `allow` or any non-zero integer.
pub fn is_true(value: &str) -> bool {
    let v = value.trim();
    if ["yes", "on", "true", "t", "enabled", "active", "allow"]
        .iter()
        .any(|t| v.eq_ignore_ascii_case(t))
    {
        return true;
    }
    matches!(parse_int(v), Some(n) if n != 0)
}

pub fn var_true(vars: &Variables, name: &str) -> bool {
    vars.get(name).map(|v| is_true(v)).unwrap_or(false)
}

/// Leading-integer parse: optional sign then digits, trailing garbage ignored.
/// Returns `None` when no digit leads the value.
pub fn parse_int(value: &str) -> Option<i64> {
    let v = value.trim_start();
    let (neg, digits) = match v.as_bytes().first() {
        Some(b'-') => (true, &v[1..]),
        Some(b'+') => (false, &v[1..]),
        _ => (false, v),
    };
    let end = digits
        .bytes()
        .position(|b| !b.is_ascii_digit())
        .unwrap_or(digits.len());
    if end == 0 {
        return None;
    }
    let n: i64 = digits[..end].parse().ok()?;
    Some(if neg { -n } else { n })
}

/// Non-empty value lookup; `"undef"` counts as unset.
pub fn non_empty<'a>(vars: &'a Variables, name: &str) -> Option<&'a str> {
    vars.get(name)
        .map(|s| s.as_str())
        .filter(|s| !s.is_empty() && !s.eq_ignore_ascii_case("undef"))
}

/// Split a comma separated name list, skipping blanks.
pub fn split_list(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truthy_values() {
        for v in ["true", "YES", "on", "t", "1", "50", "-1", "enabled"] {
            assert!(is_true(v), "{} should be true", v);
        }
        for v in ["false", "no", "0", "", "ring_ready", "abc"] {
            assert!(!is_true(v), "{} should be false", v);
        }
    }

    #[test]
    fn test_parse_int_is_lenient_on_trailing_text() {
        assert_eq!(parse_int("30"), Some(30));
        assert_eq!(parse_int(" -1"), Some(-1));
        assert_eq!(parse_int("1500ms"), Some(1500));
        assert_eq!(parse_int("ms"), None);
        assert_eq!(parse_int(""), None);
    }

    #[test]
    fn test_non_empty_treats_undef_as_unset() {
        let mut vars = Variables::new();
        vars.insert("a".into(), "undef".into());
        vars.insert("b".into(), "".into());
        vars.insert("c".into(), "prompt.wav".into());
        assert_eq!(non_empty(&vars, "a"), None);
        assert_eq!(non_empty(&vars, "b"), None);
        assert_eq!(non_empty(&vars, "c"), Some("prompt.wav"));
    }
}
