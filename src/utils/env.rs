/// Get environment variable with SUBSYNC_ prefix, falling back to unprefixed version
///
/// Checks `SUBSYNC_{key}` first, then `{key}`.
///
/// # Examples
///
/// ```rust
/// use stripe_subsync::utils::get_env_with_prefix;
///
/// // Checks SUBSYNC_PRICE_INCLUDES_TAX first, then PRICE_INCLUDES_TAX
/// let includes_tax = get_env_with_prefix("PRICE_INCLUDES_TAX");
/// ```
pub fn get_env_with_prefix(key: &str) -> Option<String> {
    std::env::var(format!("SUBSYNC_{}", key))
        .or_else(|_| std::env::var(key))
        .ok()
}

/// Parse a boolean flag the way shell users write them.
///
/// Accepts `1/0`, `true/false`, `yes/no` and `on/off` in any case.
pub fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Read a boolean flag through [`get_env_with_prefix`].
pub fn get_env_flag(key: &str) -> Option<bool> {
    get_env_with_prefix(key).and_then(|v| parse_flag(&v))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_env_with_prefix() {
        unsafe {
            std::env::set_var("SUBSYNC_TEST_VAR", "prefixed_value");
        }
        assert_eq!(get_env_with_prefix("TEST_VAR"), Some("prefixed_value".to_string()));
        unsafe {
            std::env::remove_var("SUBSYNC_TEST_VAR");
        }

        unsafe {
            std::env::set_var("SUBSYNC_FALLBACK_ONLY_VAR_X", "ignored");
            std::env::remove_var("SUBSYNC_FALLBACK_ONLY_VAR_X");
            std::env::set_var("FALLBACK_ONLY_VAR_X", "unprefixed_value");
        }
        assert_eq!(
            get_env_with_prefix("FALLBACK_ONLY_VAR_X"),
            Some("unprefixed_value".to_string())
        );
        unsafe {
            std::env::remove_var("FALLBACK_ONLY_VAR_X");
        }

        assert_eq!(get_env_with_prefix("NON_EXISTENT_SUBSYNC_VAR"), None);
    }

    #[test]
    fn test_parse_flag() {
        assert_eq!(parse_flag("YES"), Some(true));
        assert_eq!(parse_flag(" 0 "), Some(false));
        assert_eq!(parse_flag("off"), Some(false));
        assert_eq!(parse_flag("maybe"), None);
    }
}
