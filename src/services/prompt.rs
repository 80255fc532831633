//! Prompt text building blocks shared by the story and image stages.

use crate::core::state::{DerivedPromptSet, ReferenceImage};
use crate::services::generation_config::GenerationConfig;

pub const FALLBACK_IMAGE_DESCRIPTION: &str =
    "Children's storybook illustration that matches the page text.";

const OUTFIT_CHANGE_ALLOWED: &str =
    "Allow outfit change only as explicitly described; keep identity and key accessories consistent.";
const OUTFIT_CHANGE_FORBIDDEN: &str =
    "Do not change clothing across pages unless the page text explicitly states an outfit change.";
const STYLE_STABILITY: &str = "Maintain IDENTICAL art style, rendering technique, color palette, lighting style, and visual aesthetic across ALL pages. Do not change from digital illustration to cartoon or vice versa.";
const POSE_VARIETY: &str = "IMPORTANT: Create dynamic, varied poses for characters that match the specific action and narrative of this page. Avoid static or repetitive poses. Show characters engaged in the specific action described, with expressive body language, gestures, and movements that tell the story.";

/// One line per reference image, in input order:
/// `- {description or "Person N"}{ (role)}`.
pub fn summarize_references(references: &[ReferenceImage]) -> String {
    references
        .iter()
        .enumerate()
        .map(|(index, reference)| {
            let description = reference.description.trim();
            let label = if description.is_empty() {
                format!("Person {}", index + 1)
            } else {
                description.to_string()
            };
            let role = reference.role.trim();
            if role.is_empty() {
                format!("- {}", label)
            } else {
                format!("- {} ({})", label, role)
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn identity_rule(config: &GenerationConfig) -> &str {
    &config.prompts.character_identity_rule
}

/// Replaces `{{KEY}}` tokens. Tokens without a value are left as-is.
pub fn render_template(template: &str, values: &[(&str, &str)]) -> String {
    let mut rendered = template.to_string();
    for (key, value) in values {
        rendered = rendered.replace(&format!("{{{{{}}}}}", key), value);
    }
    rendered
}

/// Final prompt for one page illustration. Block order is fixed.
pub fn compose_page_prompt(
    description: &str,
    derived: Option<&DerivedPromptSet>,
    identity_rule: &str,
    allow_outfit_change: bool,
) -> String {
    let description = description.trim();
    let mut parts: Vec<String> = Vec::new();

    parts.push(if description.is_empty() {
        FALLBACK_IMAGE_DESCRIPTION.to_string()
    } else {
        description.to_string()
    });

    if let Some(derived) = derived {
        if !derived.character_prompt.trim().is_empty() {
            parts.push(format!("Character details: {}", derived.character_prompt.trim()));
        }
        if !derived.style_prompt.trim().is_empty() {
            parts.push(format!("Visual style: {}", derived.style_prompt.trim()));
        }
        if !derived.character_bible.trim().is_empty() {
            parts.push(format!(
                "Character bible (follow exactly): {}",
                derived.character_bible.trim()
            ));
        }
    }

    if !identity_rule.trim().is_empty() {
        parts.push(identity_rule.trim().to_string());
    }
    parts.push(
        if allow_outfit_change {
            OUTFIT_CHANGE_ALLOWED
        } else {
            OUTFIT_CHANGE_FORBIDDEN
        }
        .to_string(),
    );
    parts.push(STYLE_STABILITY.to_string());
    parts.push(POSE_VARIETY.to_string());

    parts.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference(description: &str, role: &str) -> ReferenceImage {
        ReferenceImage {
            file_name: "ref.png".to_string(),
            data: Vec::new(),
            description: description.to_string(),
            role: role.to_string(),
        }
    }

    #[test]
    fn test_summary_uses_fallback_label_and_omits_empty_role() {
        let refs = vec![reference("Ana", "mãe"), reference("", "")];
        assert_eq!(summarize_references(&refs), "- Ana (mãe)\n- Person 2");
    }

    #[test]
    fn test_summary_trims_fields() {
        let refs = vec![reference("  Leo ", "  "), reference(" ", " avô ")];
        assert_eq!(summarize_references(&refs), "- Leo\n- Person 2 (avô)");
    }

    #[test]
    fn test_identity_rule_comes_from_config() {
        let mut config = GenerationConfig::default();
        assert!(identity_rule(&config).starts_with("Preserve the exact facial identity"));
        config.prompts.character_identity_rule = "Custom rule.".to_string();
        assert_eq!(identity_rule(&config), "Custom rule.");
    }

    #[test]
    fn test_render_template_replaces_known_tokens_only() {
        let rendered = render_template(
            "{{HISTORIA}} / {{LINGUAGEM}} / {{HISTORIA}} / {{OTHER}}",
            &[("HISTORIA", "era uma vez"), ("LINGUAGEM", "pt")],
        );
        assert_eq!(rendered, "era uma vez / pt / era uma vez / {{OTHER}}");
    }

    #[test]
    fn test_compose_without_derived_context() {
        let prompt = compose_page_prompt("Ana jumps over a puddle", None, "RULE", false);
        let lines: Vec<&str> = prompt.lines().collect();
        assert_eq!(lines[0], "Ana jumps over a puddle");
        assert_eq!(lines[1], "RULE");
        assert_eq!(lines[2], OUTFIT_CHANGE_FORBIDDEN);
        assert_eq!(lines[3], STYLE_STABILITY);
        assert_eq!(lines[4], POSE_VARIETY);
        assert!(!prompt.contains("Character details"));
    }

    #[test]
    fn test_compose_with_derived_context_and_fallback_description() {
        let derived = DerivedPromptSet {
            character_prompt: "girl with red curls".to_string(),
            style_prompt: "soft watercolor".to_string(),
            character_bible: "Ana: yellow raincoat".to_string(),
        };
        let prompt = compose_page_prompt("   ", Some(&derived), "RULE", true);
        let lines: Vec<&str> = prompt.lines().collect();
        assert_eq!(lines[0], FALLBACK_IMAGE_DESCRIPTION);
        assert_eq!(lines[1], "Character details: girl with red curls");
        assert_eq!(lines[2], "Visual style: soft watercolor");
        assert_eq!(lines[3], "Character bible (follow exactly): Ana: yellow raincoat");
        assert_eq!(lines[4], "RULE");
        assert_eq!(lines[5], OUTFIT_CHANGE_ALLOWED);
    }
}
