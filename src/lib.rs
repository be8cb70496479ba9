pub mod app;
pub mod bar;
pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod frame;
pub mod glyphs;
pub mod history;
pub mod humanize;
pub mod interrupt;
pub mod job;
pub mod poll;
pub mod screen;
pub mod sparkline;
pub mod swarm;
