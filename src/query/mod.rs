pub mod engine;
pub mod enumerator;
pub mod options;
pub mod row;

pub use enumerator::QueryEnumerator;
pub use options::{IndexUpdateMode, QueryOptions, RowFilter};
pub use row::{QueryRow, RowLink};
