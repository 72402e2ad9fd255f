use crate::config::TextConfig;
use crate::errors::FeedbotError;
use crate::item_identity::{ContentItem, ReplyTarget};
use sha2::{Digest, Sha256};

/// Produces the text for comments and replies. The controller treats this as
/// a pure function of its inputs.
pub trait TextGenerator: Send + Sync {
    fn comment_for(&self, item: &ContentItem) -> Result<String, FeedbotError>;
    fn reply_for(&self, item: &ContentItem, target: &ReplyTarget) -> Result<String, FeedbotError>;
}

#[derive(Debug, Clone)]
pub struct TemplateTextGenerator {
    comment_templates: Vec<String>,
    reply_templates: Vec<String>,
}

impl TemplateTextGenerator {
    pub fn new(comment_templates: Vec<String>, reply_templates: Vec<String>) -> Self {
        Self {
            comment_templates,
            reply_templates,
        }
    }

    pub fn from_config(config: &TextConfig) -> Self {
        Self::new(config.comment_templates.clone(), config.reply_templates.clone())
    }
}

impl TextGenerator for TemplateTextGenerator {
    fn comment_for(&self, item: &ContentItem) -> Result<String, FeedbotError> {
        let template = pick(&self.comment_templates, &item.id)
            .ok_or_else(|| FeedbotError::TextGeneration("no comment templates".to_string()))?;
        Ok(render(template, &item.author))
    }

    fn reply_for(&self, item: &ContentItem, target: &ReplyTarget) -> Result<String, FeedbotError> {
        let key = format!("{}/{}", item.id, target.id);
        let template = pick(&self.reply_templates, &key)
            .ok_or_else(|| FeedbotError::TextGeneration("no reply templates".to_string()))?;
        Ok(render(template, &target.author))
    }
}

// Same key, same template, so a replayed run writes the same text.
fn pick<'a>(templates: &'a [String], key: &str) -> Option<&'a String> {
    if templates.is_empty() {
        return None;
    }
    let digest = Sha256::digest(key.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    let index = (u64::from_be_bytes(prefix) % templates.len() as u64) as usize;
    templates.get(index)
}

fn render(template: &str, author: &str) -> String {
    template.replace("{author}", author.trim())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(author: &str, content: &str) -> ContentItem {
        ContentItem::new(author, content, None, 0)
    }

    #[test]
    fn template_choice_is_stable_per_item() {
        let generator = TemplateTextGenerator::new(
            vec!["one".to_string(), "two".to_string(), "three".to_string()],
            vec!["r".to_string()],
        );
        let post = item("alice", "hello");
        let first = generator.comment_for(&post).expect("comment");
        for _ in 0..5 {
            assert_eq!(generator.comment_for(&post).expect("comment"), first);
        }
    }

    #[test]
    fn author_placeholder_is_substituted() {
        let generator =
            TemplateTextGenerator::new(vec!["Nice, {author}!".to_string()], vec!["@{author} yes".to_string()]);
        let post = item(" alice ", "hello");
        assert_eq!(generator.comment_for(&post).expect("comment"), "Nice, alice!");
        let target = ReplyTarget {
            id: "r1".to_string(),
            author: "bob".to_string(),
            content: "hm".to_string(),
        };
        assert_eq!(generator.reply_for(&post, &target).expect("reply"), "@bob yes");
    }

    #[test]
    fn empty_template_lists_fail() {
        let generator = TemplateTextGenerator::new(Vec::new(), Vec::new());
        let err = generator.comment_for(&item("a", "b")).expect_err("no templates");
        assert!(matches!(err, FeedbotError::TextGeneration(_)));
    }
}
