//! Fixed sales-training persona scripts.
//!
//! The hosted model performs one of two fixed roles against a trainee
//! salesperson selling a sheetfed press on an equipment-as-a-service
//! subscription. Both variants carry the identical scripted question list in
//! the same order; the relay treats that order as conversational policy.
//! Assembly is pure data: the same variant always renders byte-identical
//! output.

use std::fmt::Write as _;

use thiserror::Error;

/// The two fixed script variants.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoleVariant {
    /// A prospective customer who asks the scripted questions and answers
    /// nothing beyond them.
    Customer,
    /// A sales coach playing the customer; same questions, evaluator framing,
    /// and freedom to step outside the script.
    Evaluator,
}

#[derive(Debug, Error)]
#[error("unknown persona variant `{0}` (expected customer|evaluator)")]
pub struct UnknownVariant(pub String);

impl std::str::FromStr for RoleVariant {
    type Err = UnknownVariant;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "customer" => Ok(Self::Customer),
            "evaluator" => Ok(Self::Evaluator),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

/// After this many questions the persona stops asking and requests a
/// follow-up meeting instead.
pub const TURN_LIMIT: u32 = 3;

/// The scripted questions, in the order the persona must ask them.
pub const QUESTIONS: [&str; 8] = [
    "Can you give me an overview of the main features of the press and how it differs from earlier models?",
    "How does the automated push-to-stop changeover work in practice, and how much operator intervention does it remove?",
    "I have heard the press can run up to 21,000 sheets per hour. How does it sustain that output without sacrificing quality?",
    "What are the environmental and cost-saving benefits of the combination eco dryer?",
    "How adaptable is the press to different job requirements, such as UV coating or thin substrates?",
    "What kind of maintenance is required to keep it at peak performance, and how does the machine make servicing easier?",
    "How does the air-transfer system keep sheets travelling smoothly at high speed?",
    "How does the press integrate into the prepress workflow? Does it really make job changeovers simpler and faster?",
];

/// One fully assembled persona script. Immutable once built.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PersonaScript {
    variant: RoleVariant,
    persona_name: &'static str,
    questions: &'static [&'static str],
    turn_limit: u32,
}

impl PersonaScript {
    pub fn for_variant(variant: RoleVariant) -> Self {
        let persona_name = match variant {
            RoleVariant::Customer => "Thomas",
            RoleVariant::Evaluator => "Petra",
        };
        Self { variant, persona_name, questions: &QUESTIONS, turn_limit: TURN_LIMIT }
    }

    pub fn variant(&self) -> RoleVariant {
        self.variant
    }

    pub fn persona_name(&self) -> &'static str {
        self.persona_name
    }

    pub fn questions(&self) -> &'static [&'static str] {
        self.questions
    }

    pub fn turn_limit(&self) -> u32 {
        self.turn_limit
    }

    /// Renders the instruction string handed to the realtime relay.
    pub fn render(&self) -> String {
        let mut script = String::new();

        match self.variant {
            RoleVariant::Customer => {
                let _ = write!(
                    script,
                    "<Role>You are {name}, a print-shop customer looking to acquire a sheetfed \
                     press on an equipment-as-a-service subscription. You do not answer questions \
                     about the product; you ask them.</Role> ",
                    name = self.persona_name
                );
            }
            RoleVariant::Evaluator => {
                let _ = write!(
                    script,
                    "<Role>You are {name}, an experienced sales coach sitting in as a print-shop \
                     customer acquiring a sheetfed press on an equipment-as-a-service \
                     subscription. You observe the seller's technique throughout and will be \
                     asked to judge it.</Role> ",
                    name = self.persona_name
                );
            }
        }

        script.push_str("Introduce yourself first. ");

        match self.variant {
            RoleVariant::Customer => {
                script.push_str("Ask only the following questions, in this order:\n")
            }
            RoleVariant::Evaluator => {
                script.push_str("Work through the following questions, in this order:\n")
            }
        }

        for (position, question) in self.questions.iter().enumerate() {
            let _ = writeln!(script, "{}. {question}", position + 1);
        }

        let _ = write!(
            script,
            "After {limit} questions you have enough information; stop asking and request a \
             follow-up meeting instead. ",
            limit = self.turn_limit
        );

        script.push_str(
            "If the seller explicitly asks you for an evaluation: assess how the conversation \
             went with regard to factual accuracy, fluency, and completeness. Assess how well \
             the seller responded to your questions and whether they encouraged you to ask \
             further ones. Assess how smoothly the conversation flowed and whether the seller \
             kept control of it.",
        );

        script
    }
}

/// Convenience for callers that only need the rendered string.
pub fn instructions(variant: RoleVariant) -> String {
    PersonaScript::for_variant(variant).render()
}

#[cfg(test)]
mod tests {
    use super::{instructions, PersonaScript, RoleVariant, QUESTIONS, TURN_LIMIT};

    fn ordered_positions(script: &str) -> Vec<usize> {
        QUESTIONS
            .iter()
            .map(|question| script.find(question).expect("every scripted question must appear"))
            .collect()
    }

    #[test]
    fn customer_script_contains_all_questions_in_order() {
        let script = instructions(RoleVariant::Customer);
        let positions = ordered_positions(&script);
        assert!(positions.windows(2).all(|pair| pair[0] < pair[1]), "question order must hold");
    }

    #[test]
    fn evaluator_script_carries_the_identical_question_list() {
        let customer = PersonaScript::for_variant(RoleVariant::Customer);
        let evaluator = PersonaScript::for_variant(RoleVariant::Evaluator);
        assert_eq!(customer.questions(), evaluator.questions());

        let script = instructions(RoleVariant::Evaluator);
        let positions = ordered_positions(&script);
        assert!(positions.windows(2).all(|pair| pair[0] < pair[1]), "question order must hold");
    }

    #[test]
    fn variants_differ_in_name_and_framing() {
        let customer = instructions(RoleVariant::Customer);
        let evaluator = instructions(RoleVariant::Evaluator);

        assert_ne!(customer, evaluator);
        assert!(customer.contains("Thomas"));
        assert!(evaluator.contains("Petra"));
        assert!(evaluator.contains("sales coach"), "evaluator script adds coach framing");
        assert!(customer.contains("Ask only the following questions"));
        assert!(
            !evaluator.contains("Ask only the following questions"),
            "evaluator script drops the ask-nothing-else constraint"
        );
    }

    #[test]
    fn both_variants_carry_turn_limit_and_evaluation_branch() {
        for variant in [RoleVariant::Customer, RoleVariant::Evaluator] {
            let script = instructions(variant);
            assert!(script.contains("After 3 questions"));
            assert!(script.contains("request a follow-up meeting"));
            assert!(script.contains("explicitly asks you for an evaluation"));
            assert!(script.contains("factual accuracy"));
            assert!(script.contains("kept control"));
        }
    }

    #[test]
    fn rendering_is_deterministic() {
        assert_eq!(instructions(RoleVariant::Customer), instructions(RoleVariant::Customer));
        assert_eq!(instructions(RoleVariant::Evaluator), instructions(RoleVariant::Evaluator));
    }

    #[test]
    fn turn_limit_is_at_least_one() {
        assert!(TURN_LIMIT >= 1);
        assert_eq!(PersonaScript::for_variant(RoleVariant::Customer).turn_limit(), TURN_LIMIT);
    }

    #[test]
    fn variant_parses_case_insensitively() {
        assert_eq!("Customer".parse::<RoleVariant>().unwrap(), RoleVariant::Customer);
        assert_eq!(" evaluator ".parse::<RoleVariant>().unwrap(), RoleVariant::Evaluator);
        assert!("narrator".parse::<RoleVariant>().is_err());
    }
}
