use crate::data::Example;

/// Field-level description of the task a program implements.
///
/// Callers with a real signature implementation supply one directly; when all
/// that is available is a trainset, [`SignatureInfo::from_examples`] derives
/// the field names from the first example.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignatureInfo {
    pub input_fields: Vec<String>,
    pub output_fields: Vec<String>,
    pub description: Option<String>,
}

impl SignatureInfo {
    pub fn new(
        input_fields: Vec<String>,
        output_fields: Vec<String>,
        description: Option<String>,
    ) -> Self {
        Self {
            input_fields,
            output_fields,
            description,
        }
    }

    pub fn from_examples(examples: &[Example]) -> Self {
        let Some(first) = examples.first() else {
            return Self::default();
        };
        Self {
            input_fields: first.input_keys.clone(),
            output_fields: first.outputs().keys().cloned().collect(),
            description: None,
        }
    }
}
