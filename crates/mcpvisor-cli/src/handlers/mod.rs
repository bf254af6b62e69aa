//! Command handlers.
//!
//! Handlers follow the canonical pattern:
//! - Signature: `pub async fn execute(ctx: &CliContext, ...) -> Result<()>`
//! - Thin wrappers that validate CLI input, call the store or supervisor,
//!   and format output for the terminal.

pub mod call;
pub mod run;
pub mod status;
pub mod toggle;
pub mod validate;
