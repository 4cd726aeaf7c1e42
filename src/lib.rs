pub mod assembler;
pub mod error;
pub mod executor;
pub mod intent;
pub mod orchestrator;
pub mod reasoner;
pub mod relationship;
pub mod schema;
pub mod term_index;
pub mod value_expr;
