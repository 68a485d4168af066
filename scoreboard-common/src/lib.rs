// Copyright (C) 2026 StarHuntingGames
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

pub const RANKING_COMMAND: &str = "/ranking";
pub const RANKING_HEADER: &str = "🏆 合計得点ランキング 🏆";

pub const REGISTER_NAME_REQUIRED: &str = "名前を入力してください。\n例: /register A";
pub const REGISTER_FIRST: &str = "まず名前を登録してください。\n例: /register A";
pub const SCORE_OUT_OF_RANGE: &str = "合計点が扱える範囲を超えるため、この得点は登録できません。";
pub const NO_SCORES_YET: &str = "まだ得点が登録されていません。";
pub const NO_REGISTERED_USERS: &str = "名前登録されたユーザーがいません。";

static REGISTER_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^/register\s+(.+)$").expect("register pattern is valid"));
static SCORE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([+-])([0-9,]+)$").expect("score pattern is valid"));

pub type UserId = String;

/// A chat command recognised from a text message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Register { name: String },
    ScoreSubmission { delta: i64 },
    Ranking,
    /// Anything else. Produces no reply.
    Ignore,
}

/// Per-user ledger document.
///
/// `scores` is append-only and `total` always equals its sum once a write
/// has gone through. Missing fields in a stored document read as empty.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserRecord {
    pub user_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub scores: Vec<i64>,
    #[serde(default)]
    pub total: i64,
}

impl UserRecord {
    pub fn new(user_id: impl Into<UserId>) -> Self {
        Self {
            user_id: user_id.into(),
            ..Self::default()
        }
    }

    /// The display name, if the user has registered a non-empty one.
    pub fn registered_name(&self) -> Option<&str> {
        self.name.as_deref().filter(|name| !name.is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookRequest {
    #[serde(default)]
    pub destination: Option<String>,
    #[serde(default)]
    pub events: Vec<WebhookEvent>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub reply_token: Option<String>,
    #[serde(default)]
    pub source: Option<EventSource>,
    #[serde(default)]
    pub message: Option<EventMessage>,
}

impl WebhookEvent {
    /// Text of a `message` event carrying a `text` message, otherwise `None`.
    pub fn text_message(&self) -> Option<&str> {
        if self.event_type != "message" {
            return None;
        }
        self.message
            .as_ref()
            .filter(|message| message.message_type == "text")
            .and_then(|message| message.text.as_deref())
    }

    pub fn user_id(&self) -> Option<&str> {
        self.source
            .as_ref()
            .and_then(|source| source.user_id.as_deref())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventSource {
    #[serde(rename = "type", default)]
    pub source_type: Option<String>,
    #[serde(default)]
    pub user_id: Option<UserId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMessage {
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyMessageRequest {
    pub reply_token: String,
    pub messages: Vec<TextMessage>,
}

impl ReplyMessageRequest {
    pub fn text(reply_token: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            reply_token: reply_token.into(),
            messages: vec![TextMessage {
                message_type: "text".to_string(),
                text: text.into(),
            }],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextMessage {
    #[serde(rename = "type")]
    pub message_type: String,
    pub text: String,
}

/// Classify a message text. Never fails: anything unrecognised is
/// [`Command::Ignore`].
pub fn parse_command(text: &str) -> Command {
    let text = text.trim();
    if text.contains(['\n', '\r']) {
        return Command::Ignore;
    }

    if text == RANKING_COMMAND {
        return Command::Ranking;
    }

    if let Some(caps) = REGISTER_PATTERN.captures(text) {
        return Command::Register {
            name: caps[1].trim().to_string(),
        };
    }

    if let Some(caps) = SCORE_PATTERN.captures(text) {
        return parse_score(&caps[1], &caps[2])
            .map(|delta| Command::ScoreSubmission { delta })
            .unwrap_or(Command::Ignore);
    }

    Command::Ignore
}

/// Digit runs made only of separators, or values outside `i64`, yield `None`.
fn parse_score(sign: &str, digit_run: &str) -> Option<i64> {
    let digits: String = digit_run.chars().filter(|c| *c != ',').collect();
    if digits.is_empty() {
        return None;
    }
    format!("{sign}{digits}").parse::<i64>().ok()
}

/// Render the leaderboard for every registered user, highest total first.
///
/// Equal totals keep their input order. Returns `None` when no record has a
/// name, leaving the wording of that case to the caller.
pub fn format_ranking(records: &[UserRecord]) -> Option<String> {
    let mut ranked: Vec<(&str, i64)> = records
        .iter()
        .filter_map(|record| record.registered_name().map(|name| (name, record.total)))
        .collect();
    if ranked.is_empty() {
        return None;
    }

    ranked.sort_by(|a, b| b.1.cmp(&a.1));

    let mut message = format!("{RANKING_HEADER}\n");
    for (index, (name, total)) in ranked.iter().enumerate() {
        message.push_str(&format!("{}. {}: {}点\n", index + 1, name, total));
    }
    Some(message)
}

pub fn registered_reply(name: &str) -> String {
    format!("名前を「{name}」に登録しました！")
}

pub fn total_reply(name: &str, total: i64) -> String {
    format!("{name}さんの合計: {total}点")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(user_id: &str, name: Option<&str>, total: i64) -> UserRecord {
        UserRecord {
            user_id: user_id.to_string(),
            name: name.map(str::to_string),
            scores: vec![total],
            total,
        }
    }

    #[test]
    fn parse_command_recognises_register_with_trimmed_name() {
        assert_eq!(
            parse_command("  /register   Yuki  "),
            Command::Register {
                name: "Yuki".to_string()
            }
        );
        assert_eq!(
            parse_command("/register 山田 太郎"),
            Command::Register {
                name: "山田 太郎".to_string()
            }
        );
    }

    #[test]
    fn parse_command_ignores_register_without_name() {
        assert_eq!(parse_command("/register"), Command::Ignore);
        assert_eq!(parse_command("/register   "), Command::Ignore);
        assert_eq!(parse_command("/registerYuki"), Command::Ignore);
    }

    #[test]
    fn parse_command_requires_exact_ranking() {
        assert_eq!(parse_command("/ranking"), Command::Ranking);
        assert_eq!(parse_command(" /ranking\t"), Command::Ranking);
        assert_eq!(parse_command("/ranking now"), Command::Ignore);
        assert_eq!(parse_command("/Ranking"), Command::Ignore);
    }

    #[test]
    fn parse_command_reads_signed_scores_with_separators() {
        assert_eq!(
            parse_command("+2,000"),
            Command::ScoreSubmission { delta: 2000 }
        );
        assert_eq!(
            parse_command("-1500"),
            Command::ScoreSubmission { delta: -1500 }
        );
        assert_eq!(parse_command("+0"), Command::ScoreSubmission { delta: 0 });
        assert_eq!(
            parse_command("+1,,2"),
            Command::ScoreSubmission { delta: 12 }
        );
    }

    #[test]
    fn parse_command_rejects_malformed_scores() {
        for text in ["2000", "+", "+,,", "+1.5", "+1 000", "++1", "+１２", "-abc"] {
            assert_eq!(parse_command(text), Command::Ignore, "input {text:?}");
        }
    }

    #[test]
    fn parse_command_rejects_scores_outside_i64() {
        assert_eq!(parse_command("+9223372036854775808"), Command::Ignore);
        assert_eq!(
            parse_command("-9,223,372,036,854,775,808"),
            Command::ScoreSubmission { delta: i64::MIN }
        );
    }

    #[test]
    fn parse_command_ignores_multi_line_and_empty_text() {
        assert_eq!(parse_command(""), Command::Ignore);
        assert_eq!(parse_command("   "), Command::Ignore);
        assert_eq!(parse_command("/register\nYuki"), Command::Ignore);
        assert_eq!(parse_command("+100\n+200"), Command::Ignore);
        assert_eq!(parse_command("hello"), Command::Ignore);
    }

    #[test]
    fn format_ranking_orders_by_total_and_keeps_ties_stable() {
        let records = vec![
            record("u1", Some("A"), 50),
            record("u2", Some("B"), 200),
            record("u3", Some("C"), 200),
            record("u4", Some("D"), 10),
        ];

        let message = format_ranking(&records).unwrap();

        assert_eq!(
            message,
            "🏆 合計得点ランキング 🏆\n1. B: 200点\n2. C: 200点\n3. A: 50点\n4. D: 10点\n"
        );
    }

    #[test]
    fn format_ranking_skips_unregistered_and_defaults_missing_total() {
        let records = vec![
            record("u1", None, 900),
            record("u2", Some(""), 800),
            UserRecord {
                name: Some("Newbie".to_string()),
                ..UserRecord::new("u3")
            },
            record("u4", Some("Neg"), -30),
        ];

        let message = format_ranking(&records).unwrap();

        assert_eq!(
            message,
            "🏆 合計得点ランキング 🏆\n1. Newbie: 0点\n2. Neg: -30点\n"
        );
    }

    #[test]
    fn format_ranking_returns_none_without_registered_users() {
        assert!(format_ranking(&[]).is_none());
        assert!(format_ranking(&[record("u1", None, 10)]).is_none());
    }

    #[test]
    fn user_record_reads_partial_documents() {
        let record: UserRecord = serde_json::from_str(r#"{"user_id":"u1"}"#).unwrap();
        assert_eq!(record, UserRecord::new("u1"));
        assert!(record.registered_name().is_none());

        let record: UserRecord =
            serde_json::from_str(r#"{"user_id":"u2","name":"Yuki","total":5}"#).unwrap();
        assert_eq!(record.registered_name(), Some("Yuki"));
        assert!(record.scores.is_empty());
        assert_eq!(record.total, 5);
    }

    #[test]
    fn webhook_event_exposes_text_messages_only() {
        let body = r#"{
            "destination": "U0000",
            "events": [
                {
                    "type": "message",
                    "replyToken": "token-1",
                    "source": {"type": "user", "userId": "U123"},
                    "message": {"type": "text", "id": "1", "text": "+100"},
                    "timestamp": 1700000000000,
                    "mode": "active"
                },
                {
                    "type": "message",
                    "replyToken": "token-2",
                    "source": {"type": "user", "userId": "U123"},
                    "message": {"type": "sticker", "id": "2"}
                },
                {
                    "type": "follow",
                    "replyToken": "token-3",
                    "source": {"type": "user", "userId": "U456"}
                }
            ]
        }"#;

        let request: WebhookRequest = serde_json::from_str(body).unwrap();

        assert_eq!(request.events.len(), 3);
        assert_eq!(request.events[0].text_message(), Some("+100"));
        assert_eq!(request.events[0].user_id(), Some("U123"));
        assert_eq!(request.events[0].reply_token.as_deref(), Some("token-1"));
        assert!(request.events[1].text_message().is_none());
        assert!(request.events[2].text_message().is_none());
    }

    #[test]
    fn reply_message_request_uses_line_field_names() {
        let request = ReplyMessageRequest::text("token-1", "hello");
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "replyToken": "token-1",
                "messages": [{"type": "text", "text": "hello"}]
            })
        );
    }
}
