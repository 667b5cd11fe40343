pub mod cancel;
pub mod describe;
pub mod list;
pub mod purge;
pub mod retry;
pub mod status;
