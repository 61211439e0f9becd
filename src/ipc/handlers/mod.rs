pub mod classes;
pub mod core;
pub mod results;
pub mod sessions;
pub mod students;
pub mod subjects;
pub mod teachers;
