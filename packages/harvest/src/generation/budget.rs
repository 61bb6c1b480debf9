//! Output token budgets.

/// Prompts above this size get an estimated budget instead of the default.
const LARGE_PROMPT: usize = 200_000;

const CHARS_PER_PAGE: usize = 50_000;
const RECORDS_PER_PAGE: usize = 6;
// 800 tokens per record with 50% headroom
const TOKENS_PER_RECORD: usize = 1_200;

const MIN_LARGE_BUDGET: u32 = 20_000;

/// Initial output budget for a prompt of `prompt_len` bytes.
///
/// Large prompts get `pages * 6 records * 800 tokens * 1.5`, clamped to
/// `[12000, max_budget]` and never below 20000. Everything else uses
/// `default_budget`.
pub fn initial_token_budget(prompt_len: usize, default_budget: u32, max_budget: u32) -> u32 {
    if prompt_len <= LARGE_PROMPT {
        return default_budget;
    }

    let estimated = prompt_len.saturating_mul(RECORDS_PER_PAGE * TOKENS_PER_RECORD) / CHARS_PER_PAGE;
    let estimated = u32::try_from(estimated).unwrap_or(u32::MAX);

    estimated
        .clamp(12_000, max_budget.max(12_000))
        .max(MIN_LARGE_BUDGET.min(max_budget))
}

/// Budget after one truncation: double, capped.
pub fn escalate(budget: u32, max_budget: u32) -> u32 {
    budget.saturating_mul(2).min(max_budget)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_prompt_uses_default() {
        assert_eq!(initial_token_budget(10_000, 8000, 32_000), 8000);
        assert_eq!(initial_token_budget(200_000, 8000, 32_000), 8000);
    }

    #[test]
    fn test_large_prompt_estimate() {
        // 4.2 pages * 6 * 1200 = 30240
        assert_eq!(initial_token_budget(210_000, 8000, 32_000), 30_240);
        // capped
        assert_eq!(initial_token_budget(1_000_000, 8000, 32_000), 32_000);
    }

    #[test]
    fn test_escalate_is_bounded() {
        assert_eq!(escalate(8000, 32_000), 16_000);
        assert_eq!(escalate(20_000, 32_000), 32_000);
        assert_eq!(escalate(32_000, 32_000), 32_000);
    }
}
