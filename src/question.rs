// src/question.rs
// Survey questions: the primary intent question always runs first, followed by
// any additional questions in request order.

use serde::{Deserialize, Serialize};

use crate::error::{Result, SsrError};

pub const PRIMARY_QUESTION_ID: &str = "primary";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Question {
    pub id: String,
    pub text: String,
    /// Selects the anchor bank used to map rationales.
    pub intent: String,
}

/// Additional question as supplied by callers: either bare text (inherits the
/// request intent) or an object with its own intent.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QuestionInput {
    Text(String),
    Detailed {
        text: String,
        #[serde(default)]
        intent: Option<String>,
        #[serde(default)]
        id: Option<String>,
    },
}

pub fn default_question_text(intent: &str) -> &'static str {
    match intent {
        "purchase_intent" => "How likely would you be to purchase this product?",
        "relevance" => "How relevant is this concept to your needs?",
        _ => "How do you feel about this offering?",
    }
}

/// Ordered question list: primary first, then de-duplicated extras.
pub fn build_questions(
    intent: &str,
    primary_text: Option<&str>,
    extra: &[QuestionInput],
) -> Result<Vec<Question>> {
    let intent = intent.trim();
    if intent.is_empty() {
        return Err(SsrError::validation("intent must not be empty"));
    }

    let primary = Question {
        id: PRIMARY_QUESTION_ID.to_string(),
        text: primary_text
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| default_question_text(intent))
            .to_string(),
        intent: intent.to_string(),
    };

    let mut seen = vec![primary.text.to_lowercase()];
    let mut questions = vec![primary];

    for input in extra {
        let (text, question_intent, id) = match input {
            QuestionInput::Text(text) => (text.as_str(), None, None),
            QuestionInput::Detailed { text, intent, id } => {
                (text.as_str(), intent.as_deref(), id.as_deref())
            }
        };
        let text = text.trim();
        if text.is_empty() || seen.contains(&text.to_lowercase()) {
            continue;
        }
        seen.push(text.to_lowercase());

        let id = id
            .map(str::to_string)
            .unwrap_or_else(|| format!("q{}", questions.len()));
        if questions.iter().any(|q| q.id == id) {
            return Err(SsrError::validation(format!("duplicate question id '{}'", id)));
        }
        questions.push(Question {
            id,
            text: text.to_string(),
            intent: question_intent.unwrap_or(intent).to_string(),
        });
    }

    Ok(questions)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primary_question_is_first_with_default_text() {
        let questions = build_questions("purchase_intent", None, &[]).unwrap();
        assert_eq!(questions.len(), 1);
        assert_eq!(questions[0].id, PRIMARY_QUESTION_ID);
        assert_eq!(questions[0].text, "How likely would you be to purchase this product?");
    }

    #[test]
    fn extras_are_deduplicated_and_numbered() {
        let extra = vec![
            QuestionInput::Text("How likely would you be to purchase this product?".into()),
            QuestionInput::Text("Would you recommend it?".into()),
            QuestionInput::Text("  ".into()),
            QuestionInput::Detailed {
                text: "Does it fit your needs?".into(),
                intent: Some("relevance".into()),
                id: None,
            },
        ];
        let questions = build_questions("purchase_intent", None, &extra).unwrap();
        let ids: Vec<&str> = questions.iter().map(|q| q.id.as_str()).collect();
        assert_eq!(ids, ["primary", "q1", "q2"]);
        assert_eq!(questions[2].intent, "relevance");
    }

    #[test]
    fn untagged_input_accepts_strings_and_objects() {
        let parsed: Vec<QuestionInput> =
            serde_json::from_str(r#"["plain", {"text": "rich", "intent": "relevance"}]"#).unwrap();
        assert!(matches!(parsed[0], QuestionInput::Text(_)));
        assert!(matches!(parsed[1], QuestionInput::Detailed { .. }));
    }
}
