pub mod dump;
pub mod felica;
pub mod reader;
pub mod tag;
pub mod utils;
pub mod write;
