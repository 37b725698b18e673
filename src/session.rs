//! The exam session engine: clock, answer buffer, state machine and results.

pub(crate) mod answers;
pub(crate) mod clock;
pub(crate) mod machine;
pub(crate) mod record;
pub(crate) mod result;
pub(crate) mod types;
