pub mod engine;
pub mod link;
pub mod manual_resend;
pub mod rx;
pub mod sink;
