pub mod chat;
pub mod consultation;
pub mod health;
