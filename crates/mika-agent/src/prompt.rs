//! Request-scoped prompt variables.
//!
//! A plain value object passed down the pipeline; nothing here is global.

use chrono::Utc;

use mika_core::types::SessionKey;

#[derive(Debug, Clone)]
pub struct PromptContext {
    pub bot_name: String,
    pub master_id: String,
    pub session_key: SessionKey,
    pub user_id: String,
    pub user_nickname: String,
    pub group_id: Option<String>,
    pub now_iso: String,
    pub user_profile_summary: Option<String>,
    /// Accumulated system-injection blocks (retrieval, captions, guards).
    pub injections: Vec<String>,
}

impl PromptContext {
    pub fn new(
        bot_name: &str,
        master_id: &str,
        session_key: SessionKey,
        user_id: &str,
        user_nickname: &str,
        group_id: Option<String>,
    ) -> Self {
        Self {
            bot_name: bot_name.to_string(),
            master_id: master_id.to_string(),
            session_key,
            user_id: user_id.to_string(),
            user_nickname: user_nickname.to_string(),
            group_id,
            now_iso: Utc::now().to_rfc3339(),
            user_profile_summary: None,
            injections: Vec::new(),
        }
    }

    pub fn push_injection(&mut self, block: impl Into<String>) {
        let block = block.into();
        if !block.trim().is_empty() {
            self.injections.push(block);
        }
    }

    /// Substitute `{bot_name}`-style variables into a prompt template.
    pub fn render(&self, template: &str) -> String {
        template
            .replace("{bot_name}", &self.bot_name)
            .replace("{master_id}", &self.master_id)
            .replace("{session_key}", self.session_key.as_str())
            .replace("{user_id}", &self.user_id)
            .replace("{user_nickname}", &self.user_nickname)
            .replace("{now}", &self.now_iso)
            .replace(
                "{user_profile}",
                self.user_profile_summary.as_deref().unwrap_or(""),
            )
    }

    /// Full system prompt: rendered persona plus injection blocks.
    pub fn build_system_prompt(&self, persona_template: &str) -> String {
        let mut sections = vec![self.render(persona_template)];
        for block in &self.injections {
            sections.push(block.clone());
        }
        sections.join("\n\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variables_substitute() {
        let ctx = PromptContext::new(
            "Mika",
            "1",
            SessionKey::for_group("7"),
            "42",
            "Alice",
            Some("7".into()),
        );
        let out = ctx.render("你是{bot_name}，正在和{user_nickname}({user_id})聊天。");
        assert_eq!(out, "你是Mika，正在和Alice(42)聊天。");
    }

    #[test]
    fn injections_append_after_persona() {
        let mut ctx = PromptContext::new(
            "Mika",
            "1",
            SessionKey::for_private("42"),
            "42",
            "Alice",
            None,
        );
        ctx.push_injection("[Memory]\nfacts here");
        ctx.push_injection("   ");
        let prompt = ctx.build_system_prompt("persona of {bot_name}");
        assert!(prompt.starts_with("persona of Mika"));
        assert!(prompt.contains("[Memory]"));
        assert_eq!(prompt.matches("\n\n").count(), 1);
    }
}
