mod resolver;
mod table;

pub use resolver::{
    parse_alpha, BlendParams, ConstraintResolver, RemoteParams, ResolvedParams, ValidationResult,
    DEFAULT_ALPHA,
};
pub use table::{ConstraintTable, ModelRule, DEFAULT_SIZE};
