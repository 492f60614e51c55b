pub mod backup;
pub mod classrooms;
pub mod core;
pub mod deliveries;
pub mod grades;
pub mod projects;
pub mod students;
pub mod subjects;
pub mod teachers;
pub mod teams;
