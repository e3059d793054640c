//! Procedure builders: pure functions constructing one reusable,
//! nestable sub-graph each, with a fixed `inputnode`/`outputnode`
//! contract.

pub mod anatomical;
pub mod registration;
pub mod tensor;
pub mod tractography;
