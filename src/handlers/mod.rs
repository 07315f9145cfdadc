pub mod tenant_handlers;
