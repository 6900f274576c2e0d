use serde::{Deserialize, Serialize};

use super::table::{ConstraintTable, ModelRule, DEFAULT_SIZE};
use crate::errors::{ConstraintError, Violation};
use crate::requests::{GenerationRequest, Operation, RemoteOperation, RequestImages, RequestParams};

pub const DEFAULT_ALPHA: f32 = 0.5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteParams {
    pub operation: RemoteOperation,
    pub model: String,
    pub size: String,
    pub quality: Option<String>,
    pub n: u32,
    pub prompt: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BlendParams {
    pub alpha: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ResolvedParams {
    Remote(RemoteParams),
    StyleTransfer(BlendParams),
}

pub type ValidationResult = Result<ResolvedParams, ConstraintError>;

#[derive(Debug, Clone, Default)]
pub struct ConstraintResolver {
    pub table: ConstraintTable,
}

impl ConstraintResolver {
    pub fn new(table: Option<ConstraintTable>) -> Self {
        Self {
            table: table.unwrap_or_default(),
        }
    }

    pub fn resolve_request(&self, request: &GenerationRequest) -> ValidationResult {
        self.resolve(request.operation(), request.params(), request.images())
    }

    /// Pure: looks only at the submitted fields and which image slots are
    /// filled. Collects every violation before failing.
    pub fn resolve(
        &self,
        operation: Operation,
        params: &RequestParams,
        images: &RequestImages,
    ) -> ValidationResult {
        let mut violations = Vec::new();
        check_image_slots(operation, images, &mut violations);

        let resolved = match operation.remote() {
            Some(remote) => self
                .resolve_remote(operation, remote, params, &mut violations)
                .map(ResolvedParams::Remote),
            None => resolve_blend(params, &mut violations).map(ResolvedParams::StyleTransfer),
        };

        match resolved {
            Some(params) if violations.is_empty() => Ok(params),
            _ => Err(ConstraintError::new(violations)),
        }
    }

    fn resolve_remote(
        &self,
        operation: Operation,
        remote: RemoteOperation,
        params: &RequestParams,
        violations: &mut Vec<Violation>,
    ) -> Option<RemoteParams> {
        let prompt_required = matches!(operation, Operation::Generate | Operation::Edit);
        if prompt_required && params.prompt.is_none() {
            violations.push(Violation::new(
                "prompt",
                format!("prompt is required for {operation}"),
            ));
        }
        if params.alpha.is_some() {
            violations.push(not_accepted("alpha", operation));
        }

        let model = match params.model.as_deref() {
            Some(model) => model.to_string(),
            None => match self.table.default_model(operation) {
                Some(model) => model.to_string(),
                None => {
                    violations.push(Violation::new(
                        "model",
                        format!("no model is configured for {operation}"),
                    ));
                    return None;
                }
            },
        };

        let Some(rule) = self.table.get(operation, &model) else {
            violations.push(self.model_violation(operation, &model));
            return None;
        };

        let size = params
            .size
            .clone()
            .unwrap_or_else(|| DEFAULT_SIZE.to_string());
        if !rule.accepts_size(&size) {
            violations.push(Violation::new(
                "size",
                format!(
                    "size '{size}' is not supported by {model}; expected one of {}",
                    rule.sizes.join(", ")
                ),
            ));
        }

        let quality = resolve_quality(rule, params.quality.as_deref(), violations);
        let n = resolve_n(rule, params.n.as_deref(), violations);

        Some(RemoteParams {
            operation: remote,
            model,
            size,
            quality,
            n: n.unwrap_or(*rule.n_range.start()),
            prompt: params.prompt.clone(),
        })
    }

    fn model_violation(&self, operation: Operation, model: &str) -> Violation {
        let supported = self.table.models_for(operation).join(", ");
        if self.table.knows_model(model) {
            return Violation::new(
                "model",
                format!("{operation} supports only {supported}; got '{model}'"),
            );
        }
        Violation::new(
            "model",
            format!("unknown model '{model}'; {operation} supports {supported}"),
        )
    }
}

fn resolve_quality(
    rule: &ModelRule,
    requested: Option<&str>,
    violations: &mut Vec<Violation>,
) -> Option<String> {
    let Some(quality) = requested else {
        return rule.default_quality.clone();
    };
    if !rule.takes_quality() {
        violations.push(Violation::new(
            "quality",
            format!("quality is not accepted by {}", rule.model),
        ));
        return None;
    }
    if !rule.accepts_quality(quality) {
        violations.push(Violation::new(
            "quality",
            format!(
                "quality '{quality}' is not supported by {}; expected one of {}",
                rule.model,
                rule.qualities.join(", ")
            ),
        ));
        return None;
    }
    Some(quality.to_string())
}

fn resolve_n(
    rule: &ModelRule,
    requested: Option<&str>,
    violations: &mut Vec<Violation>,
) -> Option<u32> {
    let Some(raw) = requested else {
        return Some(*rule.n_range.start());
    };
    let Ok(parsed) = raw.parse::<i64>() else {
        violations.push(Violation::new(
            "n",
            format!("n must be an integer; got '{raw}'"),
        ));
        return None;
    };
    let in_range = u32::try_from(parsed)
        .ok()
        .filter(|value| rule.n_range.contains(value));
    if in_range.is_none() {
        let (low, high) = (*rule.n_range.start(), *rule.n_range.end());
        let message = if low == high {
            format!("n must equal {low} for {}; got {parsed}", rule.model)
        } else {
            format!(
                "n must be between {low} and {high} for {}; got {parsed}",
                rule.model
            )
        };
        violations.push(Violation::new("n", message));
    }
    in_range
}

fn resolve_blend(params: &RequestParams, violations: &mut Vec<Violation>) -> Option<BlendParams> {
    let op = Operation::StyleTransfer;
    if params.model.is_some() {
        violations.push(not_accepted("model", op));
    }
    if params.size.is_some() {
        violations.push(not_accepted("size", op));
    }
    if params.quality.is_some() {
        violations.push(not_accepted("quality", op));
    }
    if params.n.is_some() {
        violations.push(not_accepted("n", op));
    }

    let Some(raw) = params.alpha.as_deref() else {
        return Some(BlendParams {
            alpha: DEFAULT_ALPHA,
        });
    };
    match parse_alpha(raw) {
        Ok(alpha) => Some(BlendParams { alpha }),
        Err(message) => {
            violations.push(Violation::new("alpha", message));
            None
        }
    }
}

/// Accepts any finite number in [0.0, 1.0], inclusive at both ends.
pub fn parse_alpha(raw: &str) -> Result<f32, String> {
    let Ok(alpha) = raw.trim().parse::<f32>() else {
        return Err(format!("alpha must be a number; got '{raw}'"));
    };
    if !alpha.is_finite() || !(0.0..=1.0).contains(&alpha) {
        return Err(format!("alpha must be between 0.0 and 1.0; got {raw}"));
    }
    Ok(alpha)
}

fn check_image_slots(
    operation: Operation,
    images: &RequestImages,
    violations: &mut Vec<Violation>,
) {
    let slots = [
        ("image", images.image.is_some()),
        ("mask", images.mask.is_some()),
        ("base_image", images.base_image.is_some()),
        ("style_image", images.style_image.is_some()),
    ];
    let (required, optional): (&[&str], &[&str]) = match operation {
        Operation::Generate => (&[], &[]),
        Operation::Edit => (&["image"], &["mask"]),
        Operation::Variation => (&["image"], &[]),
        Operation::StyleTransfer => (&["base_image", "style_image"], &[]),
    };
    for (field, present) in slots {
        let expected = required.contains(&field) || optional.contains(&field);
        if required.contains(&field) && !present {
            violations.push(Violation::new(
                field,
                format!("{field} is required for {operation}"),
            ));
        } else if present && !expected {
            violations.push(not_accepted(field, operation));
        }
    }
}

fn not_accepted(field: &str, operation: Operation) -> Violation {
    Violation::new(field, format!("{field} is not accepted for {operation}"))
}
