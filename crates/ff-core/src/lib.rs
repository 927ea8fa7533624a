pub mod config;
pub mod db;
pub mod roadmap;
pub mod types;
