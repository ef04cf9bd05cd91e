//! Reply cleanup before delivery to a chat platform.
//!
//! Strips thinking markers, search-exposure prefixes, markdown, residual
//! role tags, and invisible unicode; chat platforms render plain text.

use regex::Regex;
use std::sync::OnceLock;

/// Regex passes skip inputs beyond this length per line to bound work.
const REGEX_INPUT_MAX_CHARS: usize = 4000;

macro_rules! static_re {
    ($name:ident, $pattern:expr) => {
        fn $name() -> &'static Regex {
            static RE: OnceLock<Regex> = OnceLock::new();
            RE.get_or_init(|| Regex::new($pattern).unwrap())
        }
    };
}

static_re!(re_thinking_label, r"(?im)\*[A-Za-z\s]+(?:\([^)]*\))?:\*\s*");
static_re!(re_thinking_line, r"(?im)^\*(?:Thinking|Drafting|Planning|Response|Actual)[^*]*\*:?\s*");
static_re!(re_thinking_underscore, r"(?im)_(?:Thinking|Drafting|Planning)[^_]*_:?\s*");
static_re!(
    re_search_exposure_a,
    r"(?im)^(?:根据|通过|我?查到了?|我?搜索到了?|从|在)(?:最新)?(?:的)?(?:搜索|网络|资料|结果|信息|数据).*?[，。,.]\s*"
);
static_re!(re_search_exposure_b, r"(?im)^我查到.*?[，。,.]\s*");
static_re!(
    re_search_exposure_c,
    r"(?im)^(?:人家|我)(?:刚才|特意)?(?:去|有)?(?:确认|查|搜)(?:了|过)?一下.*?。"
);
static_re!(re_search_exposure_d, r"(?im)^(?:从|根据)搜索结果(?:来看)?.*?[，。,.]");
static_re!(re_code_block, r"(?s)```[a-zA-Z0-9_-]*\n?(.*?)```");
static_re!(re_inline_code, r"`([^`]*)`");
static_re!(re_bold, r"\*\*([^*]+)\*\*");
static_re!(re_bold_underscore, r"__([^_]+)__");
static_re!(re_italic, r"\*([^*\n]+)\*");
static_re!(re_italic_underscore, r"\b_([^_\n]+)_\b");
static_re!(re_heading, r"(?m)^#{1,6}\s*(.+)$");
static_re!(re_blockquote, r"(?m)^>\s*(.+)$");
static_re!(re_ordered_list, r"(?m)^(\d+)\.\s+");
static_re!(re_unordered_list, r"(?m)^[-*+]\s+");
static_re!(re_latex_block, r"(?s)\$\$(.*?)\$\$");
static_re!(re_latex_inline, r"\$([^$\n]+)\$");
static_re!(re_link, r"\[([^\]]*)\]\([^)]*\)");
static_re!(re_zero_width, "[\u{200B}\u{200C}\u{200D}\u{200E}\u{200F}\u{202A}-\u{202E}\u{2066}-\u{2069}\u{FEFF}]");
static_re!(re_role_tag, r"(?m)^\[[^\[\]]{1,32}\(\d{1,20}\)\]:\s*");
static_re!(re_bot_label, r"(?m)^\[[^\[\]]{1,24}\]:\s*");
static_re!(re_blank_lines, r"\n{3,}");

fn apply_bounded(re: &Regex, text: &str, replacement: &str) -> String {
    if text.chars().count() <= REGEX_INPUT_MAX_CHARS {
        return re.replace_all(text, replacement).into_owned();
    }
    // Long outputs are processed per line; oversize lines pass through.
    text.lines()
        .map(|line| {
            if line.chars().count() <= REGEX_INPUT_MAX_CHARS {
                re.replace_all(line, replacement).into_owned()
            } else {
                line.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Remove `*Thinking:*` style markers and "I searched..." prefixes.
pub fn clean_thinking_markers(text: &str) -> String {
    if text.is_empty() {
        return String::new();
    }
    let mut cleaned = text.to_string();
    for re in [re_thinking_line(), re_thinking_underscore(), re_thinking_label()] {
        cleaned = apply_bounded(re, &cleaned, "");
    }
    for re in [
        re_search_exposure_a(),
        re_search_exposure_b(),
        re_search_exposure_c(),
        re_search_exposure_d(),
    ] {
        cleaned = apply_bounded(re, &cleaned, "");
    }
    cleaned = re_blank_lines().replace_all(&cleaned, "\n\n").into_owned();
    cleaned.trim().to_string()
}

/// Flatten markdown to chat-friendly plain text:
/// headings → 【】, quotes → 「」, `1.` → `1、`, `-` → `·`.
pub fn strip_markdown(text: &str) -> String {
    if text.is_empty() {
        return String::new();
    }
    let mut out = text.to_string();
    out = re_code_block().replace_all(&out, "$1").into_owned();
    out = re_inline_code().replace_all(&out, "$1").into_owned();
    out = re_heading().replace_all(&out, "【$1】").into_owned();
    out = re_blockquote().replace_all(&out, "「$1」").into_owned();
    out = re_bold().replace_all(&out, "$1").into_owned();
    out = re_bold_underscore().replace_all(&out, "$1").into_owned();
    out = re_italic().replace_all(&out, "$1").into_owned();
    out = re_italic_underscore().replace_all(&out, "$1").into_owned();
    out = re_ordered_list().replace_all(&out, "$1、").into_owned();
    out = re_unordered_list().replace_all(&out, "· ").into_owned();
    out = re_latex_block().replace_all(&out, "$1").into_owned();
    out = re_latex_inline().replace_all(&out, "$1").into_owned();
    out = re_link().replace_all(&out, "$1").into_owned();
    out = re_zero_width().replace_all(&out, "").into_owned();
    out = re_blank_lines().replace_all(&out, "\n\n").into_owned();
    out.trim().to_string()
}

/// Drop leading `[Nickname(12345)]:` and `[Name]:` role labels the model
/// sometimes copies from the transcript.
pub fn strip_role_tags(text: &str) -> String {
    let mut out = apply_bounded(re_role_tag(), text, "");
    out = apply_bounded(re_bot_label(), &out, "");
    out.trim().to_string()
}

/// Full reply pipeline. Returns an empty string when the result matches a
/// configured proxy fallback sentinel (relay-substituted filler counts as
/// an empty reply).
pub fn sanitize_reply(text: &str, proxy_fallback_sentinels: &[String]) -> String {
    let cleaned = clean_thinking_markers(text);
    let cleaned = strip_markdown(&cleaned);
    let cleaned = strip_role_tags(&cleaned);
    let cleaned = cleaned.trim().to_string();

    if proxy_fallback_sentinels
        .iter()
        .any(|sentinel| !sentinel.trim().is_empty() && cleaned == sentinel.trim())
    {
        return String::new();
    }
    cleaned
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thinking_markers_are_removed() {
        let input = "*Thinking: user asked about cats*\n猫猫当然可爱啦";
        assert_eq!(clean_thinking_markers(input), "猫猫当然可爱啦");
    }

    #[test]
    fn search_exposure_prefix_is_removed() {
        let input = "根据最新的搜索结果，今天的天气是晴天";
        assert_eq!(clean_thinking_markers(input), "今天的天气是晴天");
    }

    #[test]
    fn markdown_flattens_to_chat_text() {
        let input = "# 标题\n> 引用内容\n1. 第一项\n- 第二项\n**加粗**和`代码`与[链接](https://x)";
        let out = strip_markdown(input);
        assert!(out.contains("【标题】"));
        assert!(out.contains("「引用内容」"));
        assert!(out.contains("1、第一项"));
        assert!(out.contains("· 第二项"));
        assert!(out.contains("加粗和代码与链接"));
        assert!(!out.contains('*'));
        assert!(!out.contains('`'));
    }

    #[test]
    fn latex_and_zero_width_stripped() {
        let input = "结果是 $x^2$ 哦\u{200B}\u{202E}";
        let out = strip_markdown(input);
        assert_eq!(out, "结果是 x^2 哦");
    }

    #[test]
    fn role_tags_are_removed() {
        assert_eq!(strip_role_tags("[Mika]: 在呢在呢"), "在呢在呢");
        assert_eq!(strip_role_tags("[Alice(10001)]: 你好"), "你好");
    }

    #[test]
    fn proxy_sentinel_counts_as_empty() {
        let sentinels = vec!["(no content)".to_string()];
        assert_eq!(sanitize_reply("(no content)", &sentinels), "");
        assert_eq!(sanitize_reply("real reply", &sentinels), "real reply");
    }

    #[test]
    fn blank_runs_collapse() {
        let out = clean_thinking_markers("a\n\n\n\n\nb");
        assert_eq!(out, "a\n\nb");
    }
}
