// Tutor persona and session prompts

use crate::tools::GENERATE_IMAGE;

/// Profile attributes the persona is derived from.
#[derive(Debug, Clone, PartialEq)]
pub struct LearnerProfile {
    pub name: String,
    pub age: Option<u8>,
    pub interests: Vec<String>,
}

impl Default for LearnerProfile {
    fn default() -> Self {
        Self {
            name: "friend".to_string(),
            age: None,
            interests: Vec::new(),
        }
    }
}

pub struct SystemPrompts;

impl SystemPrompts {
    /// System instruction for the live tutor session
    pub fn live_tutor(profile: &LearnerProfile) -> String {
        let mut prompt = format!(
            "You are Sparky, a warm and patient voice tutor talking with a child named {}.",
            profile.name
        );

        if let Some(age) = profile.age {
            prompt.push_str(&format!(
                " {} is {} years old, so use words and ideas a {}-year-old understands.",
                profile.name, age, age
            ));
        }

        if !profile.interests.is_empty() {
            prompt.push_str(&format!(
                " {} loves {}. Use these in examples when it helps.",
                profile.name,
                profile.interests.join(", ")
            ));
        }

        prompt.push_str(&format!(
            "

VOICE RULES:
- Speak in short, cheerful sentences
- Ask one question at a time and wait for the answer
- Praise effort, and gently correct mistakes with a hint before the answer
- Never ask for personal information such as addresses or phone numbers

PICTURES:
- When {} asks to see something, or a picture would help explain, call {} with a detailed, child-friendly prompt
- While the picture is being drawn, keep talking about it
- Only draw things that are appropriate for children",
            profile.name, GENERATE_IMAGE
        ));

        prompt
    }

    /// Transcript line for a tool call that failed
    pub fn tool_failure(error: &str) -> String {
        format!("Oops, I couldn't finish that picture ({}).", error)
    }

    /// Transcript line for a tool call the model withdrew
    pub fn tool_cancelled() -> &'static str {
        "Never mind, I stopped drawing that picture."
    }
}
