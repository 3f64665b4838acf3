pub mod decision;
pub mod expense;
pub mod flow;
pub mod rule;
pub mod user;
