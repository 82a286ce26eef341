pub mod fields;
pub mod persons;

pub use persons::{extract_persons, infer_titular, person_key};
