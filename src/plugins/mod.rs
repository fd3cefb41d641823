pub mod history;
pub mod storage;
