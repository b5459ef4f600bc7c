//! Chat templates for visual instruction turns.
//!
//! A template turns one question into the instruction string that precedes an answer and
//! supplies the end-of-turn marker appended to every answer. Image placement is expressed
//! through the template's placeholder token, which the merger later expands.

use vlpo_core::ChatTemplateKind;

/// System preamble prepended to the first message of a conversation.
pub const DEFAULT_SYSTEM_MESSAGE: &str = "You are a helpful language and vision assistant. \
You are able to understand the visual content that the user provides, \
and assist the user with a variety of tasks using natural language.";

/// Placeholder marking where image features go.
pub const DEFAULT_IMAGE_TOKEN: &str = "<image>";

/// Placeholder used by Llama 3.2 Vision.
pub const MLLAMA_IMAGE_TOKEN: &str = "<|image|>";

/// Formats questions and answers for one template family.
#[derive(Debug, Clone)]
pub struct ChatTemplate {
    kind: ChatTemplateKind,
    system_message: String,
}

impl ChatTemplate {
    /// Create a template with the default system message.
    pub fn new(kind: ChatTemplateKind) -> Self {
        Self {
            kind,
            system_message: DEFAULT_SYSTEM_MESSAGE.to_string(),
        }
    }

    /// Replace the system preamble.
    pub fn with_system_message(mut self, message: impl Into<String>) -> Self {
        self.system_message = message.into();
        self
    }

    /// Template family.
    pub fn kind(&self) -> ChatTemplateKind {
        self.kind
    }

    /// Marker appended to every answer.
    pub fn end_of_turn(&self) -> &'static str {
        match self.kind {
            ChatTemplateKind::Llama3 => "<|eot_id|>",
            ChatTemplateKind::Llama2 | ChatTemplateKind::Vicuna => "</s>",
            _ => "",
        }
    }

    /// Placeholder token the template emits for an image.
    pub fn image_token(&self) -> &'static str {
        match self.kind {
            ChatTemplateKind::Llama32Vision => MLLAMA_IMAGE_TOKEN,
            _ => DEFAULT_IMAGE_TOKEN,
        }
    }

    /// Build the instruction preceding an answer.
    ///
    /// The image placeholder is emitted iff `with_image`; the system preamble iff `first_message`.
    pub fn prompt(&self, question: &str, with_image: bool, first_message: bool) -> String {
        let image = if with_image {
            format!("{}\n", self.image_token())
        } else {
            String::new()
        };
        let sys = &self.system_message;

        match self.kind {
            ChatTemplateKind::Default => {
                let mut out = String::new();
                if first_message {
                    out.push_str(&format!("{sys}\n\n"));
                }
                if with_image {
                    out.push_str(&format!("### Image:\n{image}"));
                }
                out.push_str(&format!("### Question:\n{question}\n### Answer:\n"));
                out
            }
            ChatTemplateKind::Llama2 => {
                let system = if first_message {
                    format!("<<SYS>>\n{sys}\n<</SYS>>\n\n")
                } else {
                    String::new()
                };
                format!("[INST] {system}{image}{question} [/INST] ")
            }
            ChatTemplateKind::Llama3 | ChatTemplateKind::Llama32Vision => {
                let system = if first_message {
                    format!("<|start_header_id|>system<|end_header_id|>\n\n{sys}<|eot_id|>")
                } else {
                    String::new()
                };
                format!(
                    "{system}<|start_header_id|>user<|end_header_id|>\n\n{image}{question}<|eot_id|>\
                     <|start_header_id|>assistant<|end_header_id|>\n\n"
                )
            }
            ChatTemplateKind::Vicuna => {
                let system = if first_message {
                    format!("{sys} ")
                } else {
                    String::new()
                };
                format!("{system}USER: {image}{question} ASSISTANT: ")
            }
            ChatTemplateKind::Llava => format!("USER: {image}{question} ASSISTANT:"),
            ChatTemplateKind::LlavaNext => format!("[INST] {image}{question} [/INST]"),
        }
    }
}

/// Strip the raw `<image>` tag and surrounding newlines from an annotated question.
pub fn clean_question(question: &str) -> String {
    question
        .replace(DEFAULT_IMAGE_TOKEN, "")
        .trim_matches('\n')
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_end_of_turn_markers() {
        assert_eq!(ChatTemplate::new(ChatTemplateKind::Llama3).end_of_turn(), "<|eot_id|>");
        assert_eq!(ChatTemplate::new(ChatTemplateKind::Llama2).end_of_turn(), "</s>");
        assert_eq!(ChatTemplate::new(ChatTemplateKind::Vicuna).end_of_turn(), "</s>");
        assert_eq!(ChatTemplate::new(ChatTemplateKind::Default).end_of_turn(), "");
        assert_eq!(ChatTemplate::new(ChatTemplateKind::LlavaNext).end_of_turn(), "");
    }

    #[test]
    fn test_image_placeholder_only_when_requested() {
        for kind in [
            ChatTemplateKind::Default,
            ChatTemplateKind::Llama2,
            ChatTemplateKind::Llama3,
            ChatTemplateKind::Vicuna,
            ChatTemplateKind::Llava,
            ChatTemplateKind::LlavaNext,
            ChatTemplateKind::Llama32Vision,
        ] {
            let template = ChatTemplate::new(kind);
            let token = template.image_token();
            assert!(template.prompt("what", true, false).contains(token));
            assert!(!template.prompt("what", false, false).contains(token));
        }
    }

    #[test]
    fn test_system_message_on_first_message() {
        let template = ChatTemplate::new(ChatTemplateKind::Llama2).with_system_message("be brief");
        assert!(template.prompt("q", true, true).contains("be brief"));
        assert!(!template.prompt("q", true, false).contains("be brief"));
    }

    #[test]
    fn test_mllama_placeholder() {
        let template = ChatTemplate::new(ChatTemplateKind::Llama32Vision);
        assert_eq!(template.image_token(), "<|image|>");
    }

    #[test]
    fn test_clean_question() {
        assert_eq!(clean_question("<image>\nWhat is this?\n"), "What is this?");
        assert_eq!(clean_question("What is this?\n<image>"), "What is this?");
        assert_eq!(clean_question("no image"), "no image");
    }
}
