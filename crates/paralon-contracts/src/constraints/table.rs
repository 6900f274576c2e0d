use std::ops::RangeInclusive;

use indexmap::IndexMap;

use crate::requests::Operation;

pub const DEFAULT_SIZE: &str = "1024x1024";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelRule {
    pub model: String,
    pub sizes: Vec<String>,
    /// Empty when the model takes no `quality` field at all.
    pub qualities: Vec<String>,
    pub default_quality: Option<String>,
    pub n_range: RangeInclusive<u32>,
}

impl ModelRule {
    pub fn accepts_size(&self, size: &str) -> bool {
        self.sizes.iter().any(|item| item == size)
    }

    pub fn accepts_quality(&self, quality: &str) -> bool {
        self.qualities.iter().any(|item| item == quality)
    }

    pub fn takes_quality(&self) -> bool {
        !self.qualities.is_empty()
    }
}

/// Per-(operation, model) parameter rules. Rows are kept in insertion order
/// so violation messages list models the same way every time.
#[derive(Debug, Clone)]
pub struct ConstraintTable {
    rules: IndexMap<(Operation, String), ModelRule>,
    default_models: IndexMap<Operation, String>,
}

impl Default for ConstraintTable {
    fn default() -> Self {
        Self::new(None)
    }
}

impl ConstraintTable {
    pub fn new(rules: Option<Vec<(Operation, ModelRule)>>) -> Self {
        let Some(rows) = rules else {
            return default_table();
        };
        let mut table = Self {
            rules: IndexMap::new(),
            default_models: IndexMap::new(),
        };
        for (operation, rule) in rows {
            table.insert(operation, rule);
        }
        table
    }

    /// The first model registered for an operation becomes its default.
    pub fn insert(&mut self, operation: Operation, rule: ModelRule) {
        self.default_models
            .entry(operation)
            .or_insert_with(|| rule.model.clone());
        self.rules.insert((operation, rule.model.clone()), rule);
    }

    pub fn get(&self, operation: Operation, model: &str) -> Option<&ModelRule> {
        self.rules.get(&(operation, model.to_string()))
    }

    pub fn default_model(&self, operation: Operation) -> Option<&str> {
        self.default_models.get(&operation).map(String::as_str)
    }

    pub fn models_for(&self, operation: Operation) -> Vec<&str> {
        self.rules
            .iter()
            .filter(|((op, _), _)| *op == operation)
            .map(|((_, model), _)| model.as_str())
            .collect()
    }

    pub fn knows_model(&self, model: &str) -> bool {
        self.rules.keys().any(|(_, name)| name == model)
    }
}

fn default_table() -> ConstraintTable {
    let mut table = ConstraintTable {
        rules: IndexMap::new(),
        default_models: IndexMap::new(),
    };

    let dall_e_3 = ModelRule {
        model: "dall-e-3".to_string(),
        sizes: ["1024x1024", "1792x1024", "1024x1792"]
            .iter()
            .map(|item| (*item).to_string())
            .collect(),
        qualities: vec!["standard".to_string(), "hd".to_string()],
        default_quality: Some("standard".to_string()),
        n_range: 1..=1,
    };
    let dall_e_2 = ModelRule {
        model: "dall-e-2".to_string(),
        sizes: ["256x256", "512x512", "1024x1024"]
            .iter()
            .map(|item| (*item).to_string())
            .collect(),
        qualities: Vec::new(),
        default_quality: None,
        n_range: 1..=10,
    };

    table.insert(Operation::Generate, dall_e_3);
    table.insert(Operation::Generate, dall_e_2.clone());
    table.insert(Operation::Edit, dall_e_2.clone());
    table.insert(Operation::Variation, dall_e_2);

    table
}
