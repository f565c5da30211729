mod common;
mod history;
mod orchestrator;
mod process;
