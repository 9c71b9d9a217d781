pub mod breakpoints;
pub mod control;
pub mod evaluate;
pub mod setup;
pub mod symbols;
pub mod variables;
