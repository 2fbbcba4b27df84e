pub mod health_handlers;
pub mod move_handlers;
pub mod object_handlers;
