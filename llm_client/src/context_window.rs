//! How the context window is split between what the conversation already
//! uses, what we keep free for the model's answer and what is still available.

/// Reserved for the answer when the model does not report a max output
pub const DEFAULT_RESERVED_OUTPUT_TOKENS: u64 = 8192;

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct TokenDistribution {
    pub current_percent: f64,
    pub reserved_percent: f64,
    pub available_percent: f64,
    pub reserved_for_output: u64,
    pub available_size: u64,
    pub current_tokens: u64,
}

pub fn calculate_token_distribution(
    context_window: i64,
    context_tokens: i64,
    max_tokens: Option<i64>,
) -> TokenDistribution {
    let context_window = context_window.max(0) as u64;
    let current_tokens = context_tokens.max(0) as u64;
    let reserved_for_output = match max_tokens {
        Some(max_tokens) if max_tokens > 0 => max_tokens as u64,
        _ => DEFAULT_RESERVED_OUTPUT_TOKENS,
    };
    let available_size = context_window
        .saturating_sub(current_tokens)
        .saturating_sub(reserved_for_output);

    let total = current_tokens + reserved_for_output + available_size;
    if total == 0 {
        return TokenDistribution {
            current_percent: 0.0,
            reserved_percent: 0.0,
            available_percent: 0.0,
            reserved_for_output,
            available_size,
            current_tokens,
        };
    }

    let percent_of = |value: u64| (value as f64 / total as f64) * 100.0;
    TokenDistribution {
        current_percent: percent_of(current_tokens),
        reserved_percent: percent_of(reserved_for_output),
        available_percent: percent_of(available_size),
        reserved_for_output,
        available_size,
        current_tokens,
    }
}

/// 1234 -> "1.2k", 5_600_000 -> "5.6m"
pub fn format_large_number(value: u64) -> String {
    let value_f = value as f64;
    if value >= 1_000_000_000 {
        format!("{:.1}b", value_f / 1e9)
    } else if value >= 1_000_000 {
        format!("{:.1}m", value_f / 1e6)
    } else if value >= 1_000 {
        format!("{:.1}k", value_f / 1e3)
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::{calculate_token_distribution, format_large_number};

    #[test]
    fn splits_window_between_used_reserved_and_available() {
        let distribution = calculate_token_distribution(10_000, 1_000, Some(2_000));
        assert_eq!(distribution.reserved_for_output, 2_000);
        assert_eq!(distribution.available_size, 7_000);
        assert!((distribution.current_percent - 10.0).abs() < 1e-9);
        assert!((distribution.reserved_percent - 20.0).abs() < 1e-9);
        assert!((distribution.available_percent - 70.0).abs() < 1e-9);
    }

    #[test]
    fn uses_default_reservation_without_max_tokens() {
        let distribution = calculate_token_distribution(32_768, 0, Some(-1));
        assert_eq!(distribution.reserved_for_output, 8_192);
        assert_eq!(distribution.available_size, 32_768 - 8_192);
    }

    #[test]
    fn overflowing_context_has_no_available_space() {
        let distribution = calculate_token_distribution(10_000, 9_000, Some(4_000));
        assert_eq!(distribution.available_size, 0);
        assert_eq!(distribution.available_percent, 0.0);
        let sum = distribution.current_percent + distribution.reserved_percent;
        assert!((sum - 100.0).abs() < 1e-9);
    }

    #[test]
    fn negative_inputs_are_clamped() {
        let distribution = calculate_token_distribution(-5, -10, None);
        assert_eq!(distribution.current_tokens, 0);
        assert_eq!(distribution.available_size, 0);
        assert!((distribution.reserved_percent - 100.0).abs() < 1e-9);
    }

    #[test]
    fn formats_large_numbers() {
        assert_eq!(format_large_number(999), "999");
        assert_eq!(format_large_number(1_234), "1.2k");
        assert_eq!(format_large_number(128_000), "128.0k");
        assert_eq!(format_large_number(5_600_000), "5.6m");
        assert_eq!(format_large_number(2_000_000_000), "2.0b");
    }
}
