pub mod convert_counts;
pub mod summary;
pub mod test_dynamic;
