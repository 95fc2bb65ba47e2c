//! Transport backend

pub mod reqwest;
pub mod types;

pub(crate) use self::reqwest::ReqwestBackend;
