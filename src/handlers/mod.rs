mod demo;
mod health;

pub use demo::{data, slow, trigger_panic, whoami};
pub use health::{health_check, ping};
