//! Prompt templates for the two pipeline stages.
//!
//! Only the selection contract matters to the rest of the crate: the risk
//! screen always gets the classification prompt, and the reply prompt is
//! chosen by the merged risk level.

use crate::models::RiskLevel;

/// JSON schema the risk screen must answer with. Passed to the provider as
/// a structured-output constraint and enforced again on our side when the
/// answer is parsed.
pub const RISK_SCREEN_SCHEMA: &str = r#"{
  "type": "object",
  "properties": {
    "risk_level": { "type": "string", "enum": ["none", "low", "medium", "high"] },
    "detected_topics": { "type": "array", "items": { "type": "string" } },
    "concerns": { "type": "array", "items": { "type": "string" } }
  },
  "required": ["risk_level"]
}"#;

/// Stage 1: fast risk classification of a child's message.
pub fn risk_screen_prompt(message: &str) -> String {
    format!(
        "你是兒童陪伴應用程式的安全審查員。請評估以下兒童訊息的風險程度，\
         只回傳 JSON：risk_level 為 none、low、medium 或 high；\
         detected_topics 列出偵測到的主題（如 self_harm、bullying、family_conflict、sadness）；\
         concerns 簡短說明疑慮。\
         自我傷害相關內容一律為 high；霸凌、家庭衝突或持續的難過為 medium 以上。\n\
         兒童訊息：「{}」",
        message
    )
}

/// Stage 2: reply generation, template selected by the merged risk level.
pub fn reply_prompt(risk: RiskLevel, message: &str) -> String {
    match risk {
        RiskLevel::None => format!(
            "你是溫暖的兒童陪伴夥伴「小星」。請用親切、簡短（50 字以內）、\
             適合兒童的語氣回應，給予鼓勵與肯定。\n兒童說：「{}」",
            message
        ),
        RiskLevel::Low | RiskLevel::Medium => format!(
            "你是溫暖的兒童陪伴夥伴「小星」。這位小朋友可能心情不好。\
             請先同理並肯定他的感受，再溫柔地建議他找信任的大人（像爸爸媽媽或老師）聊聊。\
             語氣溫暖、不說教，80 字以內。\n兒童說：「{}」",
            message
        ),
        RiskLevel::High => format!(
            "你是溫暖的兒童陪伴夥伴「小星」。這位小朋友現在非常需要幫助。\
             請溫柔而明確地告訴他：這不是你的錯，你很重要，\
             請現在就找一位信任的大人（爸爸媽媽、老師或輔導老師）說說你的感受。\
             語氣溫暖堅定，100 字以內。\n兒童說：「{}」",
            message
        ),
    }
}
