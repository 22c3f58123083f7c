//! Heuristic NLU provider for the chat REPL
//!
//! A deliberately small, model-free provider so the CLI can drive a spec end
//! to end out of the box. It is a *demo* collaborator: production deployments
//! implement [`NluProvider`] over a real understanding model.
//!
//! Heuristics, in order:
//!
//! 1. cancel phrases ("cancel", "never mind", "stop") - cancellation
//! 2. handoff phrases ("agent", "human", "representative") - handoff
//! 3. bare yes/no - confirmation (true/false); "maybe"-ish - unclear
//! 4. trigger-example word overlap against the declared flows - interruption
//!    naming the best-matching flow
//! 5. an expected slot - slot_value filling it with the raw utterance
//! 6. otherwise - chitchat

use async_trait::async_trait;
use serde_json::json;
use std::collections::HashSet;

use colloquy_core::nlu::{NluError, SlotAction};
use colloquy_core::{
    DialogueSpec, MessageType, NluInterpretation, NluProvider, NluRequest, SlotValue,
};

const CANCEL_PHRASES: &[&str] = &["cancel", "never mind", "nevermind", "forget it", "stop"];
const HANDOFF_PHRASES: &[&str] = &["agent", "human", "representative", "someone real"];
const YES_WORDS: &[&str] = &["yes", "yep", "yeah", "sure", "correct", "confirm", "ok", "okay"];
const NO_WORDS: &[&str] = &["no", "nope", "nah", "wrong", "don't"];
const UNCLEAR_WORDS: &[&str] = &["maybe", "hmm", "dunno", "not sure", "perhaps"];

/// Keyword-matching provider over the spec's trigger examples
pub struct HeuristicNlu {
    triggers: Vec<(String, HashSet<String>)>,
}

impl HeuristicNlu {
    /// Index the spec's flows by their trigger-example vocabulary
    pub fn new(spec: &DialogueSpec) -> Self {
        let triggers = spec
            .flows
            .iter()
            .map(|flow| {
                let mut vocab = HashSet::new();
                for example in &flow.trigger_examples {
                    vocab.extend(words(example));
                }
                vocab.extend(words(&flow.name.replace('_', " ")));
                (flow.name.clone(), vocab)
            })
            .collect();
        Self { triggers }
    }

    fn best_flow(&self, utterance: &str) -> Option<(String, usize)> {
        let utterance_words = words(utterance);
        self.triggers
            .iter()
            .map(|(name, vocab)| {
                (
                    name.clone(),
                    utterance_words.iter().filter(|w| vocab.contains(*w)).count(),
                )
            })
            .max_by_key(|(_, overlap)| *overlap)
            .filter(|(_, overlap)| *overlap >= 1)
    }
}

fn words(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 2)
        .map(str::to_string)
        .collect()
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

#[async_trait]
impl NluProvider for HeuristicNlu {
    async fn interpret(&self, request: &NluRequest) -> Result<NluInterpretation, NluError> {
        let text = request.utterance.trim().to_lowercase();

        if contains_any(&text, CANCEL_PHRASES) {
            return Ok(NluInterpretation::of(MessageType::Cancellation));
        }
        if contains_any(&text, HANDOFF_PHRASES) {
            return Ok(NluInterpretation::of(MessageType::Handoff));
        }

        let word_list: Vec<&str> = text.split_whitespace().collect();
        if word_list.len() <= 2 {
            if word_list.iter().any(|w| YES_WORDS.contains(w)) {
                return Ok(NluInterpretation::of(MessageType::Confirmation)
                    .with_confirmation(Some(true)));
            }
            if word_list.iter().any(|w| NO_WORDS.contains(w)) {
                return Ok(NluInterpretation::of(MessageType::Confirmation)
                    .with_confirmation(Some(false)));
            }
            if contains_any(&text, UNCLEAR_WORDS) {
                return Ok(NluInterpretation::of(MessageType::Confirmation)
                    .with_confirmation(None));
            }
        }

        if let Some((flow, _)) = self.best_flow(&text) {
            let message_type = if request.active_flow.is_some() {
                MessageType::Digression
            } else {
                MessageType::Interruption
            };
            return Ok(NluInterpretation::of(message_type).with_command(flow));
        }

        if let Some(slot) = request.expected_slots.first() {
            return Ok(NluInterpretation::of(MessageType::SlotValue).with_slots(vec![
                SlotValue {
                    name: slot.clone(),
                    value: json!(request.utterance.trim()),
                    action: SlotAction::Provide,
                    confidence: 0.9,
                },
            ]));
        }

        Ok(NluInterpretation::of(MessageType::Chitchat))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn spec() -> DialogueSpec {
        DialogueSpec::from_yaml(
            r#"
flows:
  - name: book_flight
    trigger_examples: ["I want to book a flight"]
    steps:
      - {step: a, type: collect, slot: origin, prompt: "From?"}
"#,
        )
        .unwrap()
    }

    fn request(utterance: &str, expected: Vec<String>, active: Option<String>) -> NluRequest {
        NluRequest {
            utterance: utterance.to_string(),
            history: vec![],
            active_flow: active,
            current_slots: HashMap::new(),
            available_flows: vec!["book_flight".to_string()],
            available_actions: vec![],
            expected_slots: expected,
        }
    }

    #[tokio::test]
    async fn test_trigger_match_starts_a_flow() {
        let nlu = HeuristicNlu::new(&spec());
        let interp = nlu
            .interpret(&request("I'd like to book a flight please", vec![], None))
            .await
            .unwrap();
        assert_eq!(interp.message_type, MessageType::Interruption);
        assert_eq!(interp.command.as_deref(), Some("book_flight"));
    }

    #[tokio::test]
    async fn test_expected_slot_is_filled_with_the_utterance() {
        let nlu = HeuristicNlu::new(&spec());
        let interp = nlu
            .interpret(&request(
                "Madrid",
                vec!["origin".to_string()],
                Some("book_flight".to_string()),
            ))
            .await
            .unwrap();
        assert_eq!(interp.message_type, MessageType::SlotValue);
        assert_eq!(interp.slots[0].name, "origin");
        assert_eq!(interp.slots[0].value, json!("Madrid"));
    }

    #[tokio::test]
    async fn test_yes_no_and_unclear() {
        let nlu = HeuristicNlu::new(&spec());
        let yes = nlu.interpret(&request("yes", vec![], None)).await.unwrap();
        assert_eq!(yes.confirmation_value, Some(true));
        let no = nlu.interpret(&request("nope", vec![], None)).await.unwrap();
        assert_eq!(no.confirmation_value, Some(false));
        let unclear = nlu.interpret(&request("hmm", vec![], None)).await.unwrap();
        assert_eq!(unclear.message_type, MessageType::Confirmation);
        assert_eq!(unclear.confirmation_value, None);
    }

    #[tokio::test]
    async fn test_cancel_phrase() {
        let nlu = HeuristicNlu::new(&spec());
        let interp = nlu
            .interpret(&request("cancel that", vec![], Some("book_flight".to_string())))
            .await
            .unwrap();
        assert_eq!(interp.message_type, MessageType::Cancellation);
    }
}
