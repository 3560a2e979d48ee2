pub mod outbound_manager;

pub use outbound_manager::OutboundManager;
