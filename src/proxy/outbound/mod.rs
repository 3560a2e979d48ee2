pub mod direct;
pub mod reject;
