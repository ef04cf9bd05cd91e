//! Group chat transcript builder.
//!
//! Storage can be very full (the archive keeps everything); what goes to
//! the LLM is a controlled working set rendered as one compact text block
//! with speaker identity and relative-time hints.

use std::collections::HashMap;

use regex::Regex;
use std::sync::OnceLock;

use mika_core::media::placeholder;
use mika_core::message::{ChatMessage, MessageContent, Role};

pub const TRANSCRIPT_HEADER: &str = "[Chatroom Transcript]";
pub const TRANSCRIPT_FOOTER: &str = "[End Transcript]";
const EMPTY_BODY: &str = "(无最近记录)";
const DISPLAY_NAME_MAX_CHARS: usize = 24;

#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptResult {
    pub text: String,
    pub lines_used: usize,
    pub chars_used: usize,
}

fn speaker_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)^\[(.*?)\]:\s*(.*)$").unwrap())
}

fn speaker_tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(?P<nick>.*)\((?P<uid>[^()]+)\)$").unwrap())
}

fn rendered_speaker_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(?:\[[^\]]+\]\s+)?(?P<speaker>[^:]{1,80}):\s+").unwrap())
}

fn name_char_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^一-龥a-zA-Z0-9\-_ ]").unwrap())
}

fn squash_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Render one message's content as a transcript line body; media parts
/// become their stable placeholder.
pub fn render_transcript_content(content: &MessageContent) -> String {
    match content {
        MessageContent::Text(text) => squash_whitespace(text),
        MessageContent::Parts(parts) => {
            let mut chunks: Vec<String> = Vec::new();
            for part in parts {
                match part {
                    mika_core::message::ContentPart::Text { text } => {
                        let cleaned = squash_whitespace(text);
                        if !cleaned.is_empty() {
                            chunks.push(cleaned);
                        }
                    }
                    mika_core::message::ContentPart::ImageUrl { media_semantic, .. } => {
                        chunks.push(placeholder(media_semantic.as_ref()));
                    }
                }
            }
            chunks.join(" ").trim().to_string()
        }
    }
}

fn clip_line(text: &str, max_chars: usize) -> String {
    let resolved_max = max_chars.max(40);
    let cleaned = squash_whitespace(text);
    if cleaned.chars().count() <= resolved_max {
        return cleaned;
    }
    let head: String = cleaned.chars().take(resolved_max - 1).collect();
    format!("{}…", head.trim_end())
}

/// Keep names name-like: CJK/ASCII letters, digits, `-_ `; 24 chars max.
fn sanitize_display_name(name: &str) -> String {
    let cleaned = squash_whitespace(name);
    if cleaned.is_empty() {
        return String::new();
    }
    let cleaned = name_char_re().replace_all(&cleaned, "").trim().to_string();
    if cleaned.chars().count() > DISPLAY_NAME_MAX_CHARS {
        cleaned
            .chars()
            .take(DISPLAY_NAME_MAX_CHARS)
            .collect::<String>()
            .trim_end()
            .to_string()
    } else {
        cleaned
    }
}

/// `[刚刚]` / `[N分钟前]` / `[N小时前]` / `[N天前]` relative to the newest
/// message, so hints are deterministic regardless of server clock.
fn format_time_hint(ts: f64, baseline_ts: f64) -> String {
    if ts <= 0.0 || baseline_ts <= 0.0 {
        return String::new();
    }
    let delta = (baseline_ts - ts.min(baseline_ts)).max(0.0);
    if delta < 60.0 {
        "[刚刚]".to_string()
    } else if delta < 3600.0 {
        format!("[{}分钟前]", ((delta / 60.0) as u64).max(1))
    } else if delta < 86400.0 {
        format!("[{}小时前]", ((delta / 3600.0) as u64).max(1))
    } else {
        format!("[{}天前]", ((delta / 86400.0) as u64).max(1))
    }
}

struct Entry {
    time_hint: String,
    role: Role,
    uid: String,
    speaker: String,
    speaker_raw: String,
    said: String,
}

/// Render user/assistant history into transcript lines. Display names are
/// stable per user_id; colliding names get a `(user_id)` suffix.
pub fn build_transcript_lines(
    history: &[ChatMessage],
    bot_name: &str,
    max_lines: usize,
    line_max_chars: usize,
) -> Vec<String> {
    if max_lines == 0 {
        return Vec::new();
    }

    // Only user/assistant messages are chatroom lines.
    let chat_msgs: Vec<&ChatMessage> = history
        .iter()
        .filter(|m| matches!(m.role, Role::User | Role::Assistant))
        .collect();
    if chat_msgs.is_empty() {
        return Vec::new();
    }

    let baseline_ts = chat_msgs
        .iter()
        .rev()
        .filter_map(|m| m.timestamp)
        .find(|ts| *ts > 0.0)
        .unwrap_or_else(|| chrono::Utc::now().timestamp() as f64);

    let start = chat_msgs.len().saturating_sub(max_lines);
    let mut entries: Vec<Entry> = Vec::new();
    let mut display_by_uid: HashMap<String, String> = HashMap::new();

    for msg in &chat_msgs[start..] {
        let mut content = clip_line(&render_transcript_content(&msg.content), line_max_chars);
        if content.is_empty() {
            continue;
        }

        // Keep stable msg_id anchors for lines carrying media placeholders.
        if let Some(msg_id) = msg.message_id.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            if !content.contains("<msg_id:") && (content.contains("[图片") || content.contains("[表情")) {
                content = format!("{} <msg_id:{}>", content, msg_id);
            }
        }

        let time_hint = format_time_hint(msg.timestamp.unwrap_or(0.0), baseline_ts);

        if msg.role == Role::Assistant {
            let (speaker, said) = match speaker_re().captures(&content) {
                Some(caps) => (
                    sanitize_display_name(caps.get(1).map(|m| m.as_str()).unwrap_or("")),
                    caps.get(2).map(|m| m.as_str().trim()).unwrap_or("").to_string(),
                ),
                None => (String::new(), String::new()),
            };
            let speaker = if speaker.is_empty() {
                let fallback = bot_name.trim();
                if fallback.is_empty() { "Assistant" } else { fallback }.to_string()
            } else {
                speaker
            };
            let said = if said.is_empty() { content.clone() } else { said };
            entries.push(Entry {
                time_hint,
                role: Role::Assistant,
                uid: String::new(),
                speaker,
                speaker_raw: String::new(),
                said,
            });
            continue;
        }

        let (speaker_raw, said) = match speaker_re().captures(&content) {
            Some(caps) => (
                caps.get(1).map(|m| m.as_str().trim()).unwrap_or("").to_string(),
                caps.get(2).map(|m| m.as_str().trim()).unwrap_or("").to_string(),
            ),
            None => (String::new(), String::new()),
        };
        let said = if said.is_empty() { content.clone() } else { said };

        let mut uid = msg.user_id.clone().unwrap_or_default().trim().to_string();
        let mut nick = String::new();
        if !speaker_raw.is_empty() {
            if let Some(caps) = speaker_tag_re().captures(&speaker_raw) {
                nick = caps.name("nick").map(|m| m.as_str().trim()).unwrap_or("").to_string();
                let tag_uid = caps.name("uid").map(|m| m.as_str().trim()).unwrap_or("");
                if uid.is_empty() && !tag_uid.is_empty() {
                    uid = tag_uid.to_string();
                }
            } else {
                nick = speaker_raw.clone();
            }
        }
        let nick = sanitize_display_name(&nick);
        if !uid.is_empty() && !nick.is_empty() {
            // Newest nickname wins for each user_id.
            display_by_uid.insert(uid.clone(), nick);
        }

        entries.push(Entry {
            time_hint,
            role: Role::User,
            uid,
            speaker: String::new(),
            speaker_raw,
            said,
        });
    }

    // Count collisions; only colliding names carry the uid suffix.
    let mut name_counts: HashMap<&str, usize> = HashMap::new();
    for name in display_by_uid.values() {
        *name_counts.entry(name.as_str()).or_insert(0) += 1;
    }

    let mut lines: Vec<String> = Vec::new();
    for entry in &entries {
        if entry.said.is_empty() {
            continue;
        }
        let prefix = if entry.time_hint.is_empty() {
            String::new()
        } else {
            format!("{} ", entry.time_hint)
        };

        if entry.role == Role::Assistant {
            lines.push(format!("{}{}: {}", prefix, entry.speaker, entry.said));
            continue;
        }

        let mut speaker = display_by_uid
            .get(entry.uid.as_str())
            .cloned()
            .unwrap_or_default();
        if speaker.is_empty() {
            speaker = sanitize_display_name(&entry.speaker_raw);
        }
        if speaker.is_empty() {
            speaker = "User".to_string();
        }
        if !entry.uid.is_empty() && name_counts.get(speaker.as_str()).copied().unwrap_or(0) > 1 {
            speaker = format!("{}({})", speaker, entry.uid);
        }
        lines.push(format!("{}{}: {}", prefix, speaker, entry.said));
    }

    lines
}

/// `[Participants] active: A, B | last: A` from already-rendered lines,
/// scanning the newest `window_lines`, excluding the bot.
pub fn build_participants_line(
    lines: &[String],
    bot_name: &str,
    max_names: usize,
    window_lines: usize,
) -> String {
    let bot = bot_name.trim();
    let max_names = max_names.max(1);
    let window = window_lines.max(1);

    let mut active: Vec<String> = Vec::new();
    let mut last_speaker = String::new();

    let start = lines.len().saturating_sub(window);
    for line in lines[start..].iter().rev() {
        let text = line.trim();
        if text.is_empty() {
            continue;
        }
        let Some(caps) = rendered_speaker_re().captures(text) else {
            continue;
        };
        let speaker = caps
            .name("speaker")
            .map(|m| m.as_str().trim())
            .unwrap_or("");
        if speaker.is_empty() {
            continue;
        }
        if !bot.is_empty() && (speaker == bot || speaker.starts_with(&format!("{}(", bot))) {
            continue;
        }
        if last_speaker.is_empty() {
            last_speaker = speaker.to_string();
        }
        if active.iter().any(|s| s == speaker) {
            continue;
        }
        active.push(speaker.to_string());
        if active.len() >= max_names {
            break;
        }
    }

    if active.is_empty() {
        return String::new();
    }
    let joined = active.join(", ");
    if last_speaker.is_empty() {
        format!("[Participants] active: {}", joined)
    } else {
        format!("[Participants] active: {} | last: {}", joined, last_speaker)
    }
}

pub fn build_transcript_block(lines: &[String]) -> TranscriptResult {
    let cleaned: Vec<&str> = lines
        .iter()
        .map(|l| l.trim())
        .filter(|l| !l.is_empty())
        .collect();
    if cleaned.is_empty() {
        let text = format!("{}\n{}\n{}", TRANSCRIPT_HEADER, EMPTY_BODY, TRANSCRIPT_FOOTER);
        let chars_used = text.chars().count();
        return TranscriptResult {
            text,
            lines_used: 0,
            chars_used,
        };
    }
    let body = cleaned.join("\n");
    let text = format!("{}\n{}\n{}", TRANSCRIPT_HEADER, body, TRANSCRIPT_FOOTER);
    let chars_used = text.chars().count();
    TranscriptResult {
        text,
        lines_used: cleaned.len(),
        chars_used,
    }
}

/// Shrink an existing transcript block by dropping its oldest lines.
/// `keep_ratio` is clamped to [0.1, 1.0]; at least one line survives.
pub fn shrink_transcript_block(text: &str, keep_ratio: f64) -> TranscriptResult {
    let (Some(start), Some(end)) = (text.find(TRANSCRIPT_HEADER), text.find(TRANSCRIPT_FOOTER))
    else {
        return TranscriptResult {
            text: text.to_string(),
            lines_used: 0,
            chars_used: text.chars().count(),
        };
    };
    let middle = &text[start + TRANSCRIPT_HEADER.len()..end];
    let lines: Vec<String> = middle
        .lines()
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty() && l != EMPTY_BODY)
        .collect();
    if lines.is_empty() {
        return build_transcript_block(&[]);
    }
    let ratio = keep_ratio.clamp(0.1, 1.0);
    let keep = ((lines.len() as f64 * ratio) as usize).max(1);
    build_transcript_block(&lines[lines.len() - keep..])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user_msg(uid: &str, tag: &str, text: &str, ts: f64, msg_id: &str) -> ChatMessage {
        let mut msg = ChatMessage::user(format!("[{}]: {}", tag, text));
        msg.user_id = Some(uid.to_string());
        msg.timestamp = Some(ts);
        if !msg_id.is_empty() {
            msg.message_id = Some(msg_id.to_string());
        }
        msg
    }

    #[test]
    fn identical_inputs_produce_identical_blocks() {
        let history = vec![
            user_msg("1", "Alice(1)", "早上好", 1000.0, "m1"),
            user_msg("2", "Bob(2)", "吃了吗", 1030.0, "m2"),
        ];
        let a = build_transcript_lines(&history, "Mika", 50, 240);
        let b = build_transcript_lines(&history, "Mika", 50, 240);
        assert_eq!(build_transcript_block(&a), build_transcript_block(&b));
    }

    #[test]
    fn time_hints_are_relative_to_newest_message() {
        let history = vec![
            user_msg("1", "Alice(1)", "old", 1000.0, ""),
            user_msg("2", "Bob(2)", "new", 1000.0 + 3700.0, ""),
        ];
        let lines = build_transcript_lines(&history, "Mika", 50, 240);
        assert!(lines[0].starts_with("[1小时前]"), "got: {}", lines[0]);
        assert!(lines[1].starts_with("[刚刚]"), "got: {}", lines[1]);
    }

    #[test]
    fn colliding_display_names_get_uid_suffix() {
        let history = vec![
            user_msg("1", "Neko(1)", "hi", 100.0, ""),
            user_msg("2", "Neko(2)", "yo", 110.0, ""),
        ];
        let lines = build_transcript_lines(&history, "Mika", 50, 240);
        assert!(lines[0].contains("Neko(1):"), "got: {}", lines[0]);
        assert!(lines[1].contains("Neko(2):"), "got: {}", lines[1]);
    }

    #[test]
    fn assistant_lines_use_bot_name() {
        let mut reply = ChatMessage::assistant("[Mika]: 在呢");
        reply.timestamp = Some(100.0);
        let lines = build_transcript_lines(&[reply], "Mika", 50, 240);
        assert_eq!(lines[0], "[刚刚] Mika: 在呢");
    }

    #[test]
    fn participants_header_excludes_bot_and_dedupes() {
        let lines = vec![
            "[刚刚] Alice: a".to_string(),
            "[刚刚] Mika: reply".to_string(),
            "[刚刚] Bob: b".to_string(),
            "[刚刚] Alice: again".to_string(),
        ];
        let header = build_participants_line(&lines, "Mika", 8, 60);
        assert_eq!(header, "[Participants] active: Alice, Bob | last: Alice");
    }

    #[test]
    fn media_lines_keep_msg_id_anchor() {
        let mut msg = ChatMessage {
            content: MessageContent::Parts(vec![mika_core::message::ContentPart::ImageUrl {
                image_url: mika_core::message::ImageUrl {
                    url: "https://x/a.png".into(),
                },
                media_semantic: Some(mika_core::media::build_media_semantic(
                    "image",
                    "",
                    "https://x/a.png",
                    "",
                    "",
                )),
            }]),
            ..ChatMessage::user("")
        };
        msg.message_id = Some("m42".into());
        msg.user_id = Some("1".into());
        msg.timestamp = Some(10.0);
        let lines = build_transcript_lines(&[msg], "Mika", 50, 240);
        assert!(lines[0].contains("<msg_id:m42>"), "got: {}", lines[0]);
        assert!(lines[0].contains("[图片][picid:"));
    }

    #[test]
    fn shrink_drops_oldest_lines() {
        let lines: Vec<String> = (0..10).map(|i| format!("User{}: line {}", i, i)).collect();
        let block = build_transcript_block(&lines);
        let shrunk = shrink_transcript_block(&block.text, 0.3);
        assert_eq!(shrunk.lines_used, 3);
        assert!(shrunk.text.contains("line 9"));
        assert!(!shrunk.text.contains("line 0"));
        assert!(shrunk.text.starts_with(TRANSCRIPT_HEADER));
        assert!(shrunk.text.ends_with(TRANSCRIPT_FOOTER));
    }

    #[test]
    fn empty_history_renders_placeholder_body() {
        let block = build_transcript_block(&[]);
        assert!(block.text.contains("(无最近记录)"));
        assert_eq!(block.lines_used, 0);
    }

    #[test]
    fn long_lines_are_clipped_with_ellipsis() {
        let history = vec![user_msg("1", "Alice(1)", &"x".repeat(500), 10.0, "")];
        let lines = build_transcript_lines(&history, "Mika", 50, 100);
        assert!(lines[0].chars().count() < 130);
        assert!(lines[0].contains('…'));
    }
}
