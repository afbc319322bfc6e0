pub mod archive;
pub mod health;
pub mod runs;
pub mod status;
