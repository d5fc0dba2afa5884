//! Local fallback content.
//!
//! Every consumer of the gateway degrades to one of these hand-written
//! pools when the provider is blocked or failing: the child always sees
//! warm text, never an error or a blank. Conversational picks are random;
//! periodic content is indexed by day-of-year so a retried job lands on
//! the same phrase.

use crate::models::PeriodStats;
use rand::Rng;

const CHAT_FALLBACKS: &[&str] = &[
    "謝謝你跟我分享！我現在有點累，但我一直都在你身邊喔。",
    "小星聽到你說的話了！等我休息一下，再陪你多聊聊好嗎？",
    "你願意跟我說話，我好開心！我們等一下再繼續聊喔。",
    "我收到你的訊息了！不管怎麼樣，小星都支持你。",
];

const DAILY_FALLBACK_TEMPLATES: &[&str] = &[
    "今天完成了 {completed} 件任務，真的很棒！明天也一起加油吧！",
    "你今天的努力小星都看到了：完成 {completed} 件任務！繼續保持喔！",
    "完成 {completed} 件任務的一天！每一步都算數，為你拍拍手！",
];

const WEEKLY_FALLBACK_TEMPLATES: &[&str] = &[
    "這一週你完成了 {completed} 件任務，比上週{trend}！小星為你驕傲！",
    "一週回顧：完成 {completed} 件任務，最喜歡的類別是{top_category}。下週也一起努力！",
];

/// Random warm phrase for a degraded conversational reply.
pub fn conversational_fallback() -> &'static str {
    let index = rand::thread_rng().gen_range(0..CHAT_FALLBACKS.len());
    CHAT_FALLBACKS[index]
}

/// Deterministic daily-summary fallback, interpolated from the same stats
/// the provider prompt would have carried.
pub fn daily_summary_fallback(stats: &PeriodStats, day_of_year: u32) -> String {
    let template = DAILY_FALLBACK_TEMPLATES[day_of_year as usize % DAILY_FALLBACK_TEMPLATES.len()];
    interpolate(template, stats)
}

/// Deterministic weekly-report fallback.
pub fn weekly_report_fallback(stats: &PeriodStats, week: u32) -> String {
    let template = WEEKLY_FALLBACK_TEMPLATES[week as usize % WEEKLY_FALLBACK_TEMPLATES.len()];
    interpolate(template, stats)
}

fn interpolate(template: &str, stats: &PeriodStats) -> String {
    let trend = if stats.delta > 0 {
        format!("多了 {} 件", stats.delta)
    } else if stats.delta < 0 {
        "少了一點，沒關係".to_string()
    } else {
        "一樣穩定".to_string()
    };
    template
        .replace("{completed}", &stats.completed.to_string())
        .replace("{trend}", &trend)
        .replace(
            "{top_category}",
            stats.top_category().unwrap_or("休息"),
        )
}
