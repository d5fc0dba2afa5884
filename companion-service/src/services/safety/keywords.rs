//! Local keyword heuristic.
//!
//! A zero-latency screen that runs alongside the AI risk classifier. Two
//! independent severity tiers: high-risk terms (self-harm indicators) and
//! medium-risk terms (bullying, family conflict, persistent sadness). Each
//! tier short-circuits on its first match. ASCII terms are matched
//! case-insensitively.

use crate::models::RiskLevel;

const HIGH_RISK_TERMS: &[&str] = &[
    "自殺",
    "想死",
    "不想活",
    "自殘",
    "傷害自己",
    "結束生命",
    "活不下去",
    "kill myself",
    "suicide",
    "self-harm",
    "self harm",
    "want to die",
    "end my life",
    "hurt myself",
];

const MEDIUM_RISK_TERMS: &[&str] = &[
    "霸凌",
    "欺負我",
    "排擠",
    "打我",
    "罵我",
    "吵架",
    "離婚",
    "好難過",
    "一直哭",
    "好孤單",
    "沒有朋友",
    "討厭自己",
    "沒有人喜歡我",
    "bully",
    "bullied",
    "hate myself",
    "so lonely",
    "no friends",
    "always sad",
    "nobody likes me",
];

/// Scan raw message text and return the heuristic risk with the matched
/// terms (used as flag concerns).
pub fn scan(message: &str) -> (RiskLevel, Vec<String>) {
    let lowered = message.to_lowercase();

    for term in HIGH_RISK_TERMS {
        if lowered.contains(term) {
            return (RiskLevel::High, vec![term.to_string()]);
        }
    }

    for term in MEDIUM_RISK_TERMS {
        if lowered.contains(term) {
            return (RiskLevel::Medium, vec![term.to_string()]);
        }
    }

    (RiskLevel::None, Vec::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn self_harm_terms_are_high_risk() {
        let (level, terms) = scan("我最近一直想死");
        assert_eq!(level, RiskLevel::High);
        assert_eq!(terms, vec!["想死".to_string()]);

        let (level, _) = scan("I want to DIE");
        assert_eq!(level, RiskLevel::High);
    }

    #[test]
    fn bullying_and_sadness_are_medium_risk() {
        let (level, terms) = scan("同學一直欺負我");
        assert_eq!(level, RiskLevel::Medium);
        assert_eq!(terms, vec!["欺負我".to_string()]);

        let (level, _) = scan("I feel SO LONELY at school");
        assert_eq!(level, RiskLevel::Medium);
    }

    #[test]
    fn high_tier_wins_over_medium() {
        let (level, _) = scan("同學欺負我，我不想活了");
        assert_eq!(level, RiskLevel::High);
    }

    #[test]
    fn benign_text_is_clean() {
        let (level, terms) = scan("我今天去公園玩，好開心");
        assert_eq!(level, RiskLevel::None);
        assert!(terms.is_empty());
    }
}
