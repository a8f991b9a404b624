//! Random-access nodes: the analysis that decides which data types need
//! auxiliary skip cursors, and the rewrite that adds them.

mod analysis;
mod rewrite;

pub use analysis::needs_ran;
pub use rewrite::add_ran;
