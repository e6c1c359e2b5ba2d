pub mod health_handlers;
pub mod internal_handlers;
pub mod object_handlers;
