pub mod job;
pub mod page;
pub mod submission;
