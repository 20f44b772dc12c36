pub mod cfg;
pub mod constants;
pub mod crypto;
pub mod destination;
pub mod epoch;
pub mod error;
pub mod health;
pub mod listener;
pub mod message;
pub mod network;
pub mod retry;
pub mod serde_util;
pub mod source;
pub mod subscriber;
pub mod validators;
