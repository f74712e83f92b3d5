pub mod analysis;
pub mod broker;
pub mod codec;
pub mod dispatcher;
pub mod gemini;
pub mod pending;
pub mod vision;
pub mod worker;
pub mod workers_ai;
