pub mod rehome;
mod report;
