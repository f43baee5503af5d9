pub mod errors;
pub mod history;
pub mod lazy;
pub mod program;
pub mod result;
pub mod runner;
pub mod target;
pub mod task;
pub mod template;
